//! Starts and tears down the per-fight forkserver container (spec.md §6
//! "Container contract"). Grounded on the `docker_client.containers.run`
//! / `fs_container.top()` calls in `simulator/entry.py`; no crate in
//! this pack talks to a container runtime's API directly, so this
//! shells out to the `docker` CLI the same way the original's
//! deployment scripts and its own `Dockerfile`-driven workflow do.

use crate::config::GlobalConfig;
use anyhow::{bail, Context};
use nix::unistd::Pid;
use std::process::Command;

/// A running forkserver container, detached, with no stdio attached.
/// Dropping this does not stop the container — callers must call
/// [`ForkserverContainer::stop`] explicitly once the fight using it is
/// over, mirroring the original's one-container-per-fight lifecycle.
pub struct ForkserverContainer {
    id: String,
}

impl ForkserverContainer {
    /// `docker run --detach --read-only --user <username> --security-opt
    /// apparmor=<profile> <image>`, matching the original's hardened
    /// container contract word for word (spec.md §6).
    pub fn start(cfg: &GlobalConfig) -> anyhow::Result<ForkserverContainer> {
        let output = Command::new("docker")
            .args([
                "run",
                "--detach",
                "--read-only",
                "--user",
                &cfg.coderunner_username,
                "--security-opt",
                &format!("apparmor={}", cfg.coderunner_apparmor_profile),
                &cfg.coderunner_docker_image,
            ])
            .output()
            .context("failed to spawn `docker run`")?;

        if !output.status.success() {
            bail!("docker run failed: {}", String::from_utf8_lossy(&output.stderr));
        }

        let id = String::from_utf8(output.stdout).context("docker run printed non-UTF-8 container id")?.trim().to_string();
        Ok(ForkserverContainer { id })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The forkserver's PID in the host's own PID namespace — it must
    /// be the container's one and only process (PID 1 inside the
    /// container), found the same way the original does: inspecting
    /// the running container rather than trusting anything it says
    /// about itself (spec.md §6 "the supervisor acquires the
    /// container's PID via the container-runtime's inspection API").
    pub fn host_pid(&self) -> anyhow::Result<Pid> {
        let output = Command::new("docker")
            .args(["top", &self.id, "-o", "pid"])
            .output()
            .context("failed to spawn `docker top`")?;
        if !output.status.success() {
            bail!("docker top failed: {}", String::from_utf8_lossy(&output.stderr));
        }

        let text = String::from_utf8(output.stdout).context("docker top printed non-UTF-8 output")?;
        let mut lines = text.lines();
        lines.next(); // header: "PID"
        let pid_line = lines.next().context("docker top reported no processes for forkserver container")?;
        let raw: i32 = pid_line.trim().parse().with_context(|| format!("malformed pid from docker top: {pid_line:?}"))?;
        Ok(Pid::from_raw(raw))
    }

    /// Force-remove the container. The forkserver and every forked
    /// child inside it are already dead by the time this runs (either
    /// `PTRACE_O_EXITKILL` took them down with the worker, or the
    /// fight's own teardown reaped them) — this just reclaims the
    /// container's own resources.
    pub fn stop(self) -> anyhow::Result<()> {
        let output = Command::new("docker").args(["rm", "--force", &self.id]).output().context("failed to spawn `docker rm`")?;
        if !output.status.success() {
            bail!("docker rm failed: {}", String::from_utf8_lossy(&output.stderr));
        }
        Ok(())
    }
}
