//! Deployment configuration, reified out of the original's two
//! importable Python modules (`GLOBAL_CONFIG_MODULE`,
//! `SIMULATOR_SETTINGS_MODULE`, spec.md §6) into plain `serde`-deserialized
//! structs loaded once at startup and threaded through as a
//! `WorkerContext` value (REDESIGN FLAGS, spec.md §9).

use crate::protocol::{PipeFdQuad, CHILD_MAX_WRITE_SIZE, CHILD_PIPE_SIZE, FORKED_PIPE_FDS, FORKSERVER_PIPE_FDS};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Settings specific to the simulator subsystem: fd numbers, allowed
/// syscalls, control codes, the CPU-exceed signal. Corresponds to
/// `simulator/settings.py`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimulatorSettings {
    pub child_max_write_size: usize,
    pub child_pipe_size: i32,
    /// Syscall names allowed through both the ptrace policy and the
    /// seccomp backstop (must be a superset: `read`/`write` are added
    /// automatically for the seccomp filter only, never for the
    /// ptrace allowlist, per spec.md §4.B step 5).
    pub allowed_syscalls: Vec<String>,
    /// The real-time signal used for `ITIMER_PROF` expiry
    /// (`CPU_TIME_EXCEED_SIGNAL` in the original).
    pub cpu_time_exceed_signal: i32,
}

impl Default for SimulatorSettings {
    fn default() -> Self {
        SimulatorSettings {
            child_max_write_size: CHILD_MAX_WRITE_SIZE,
            child_pipe_size: CHILD_PIPE_SIZE,
            allowed_syscalls: vec!["mmap".into(), "munmap".into(), "brk".into()],
            cpu_time_exceed_signal: libc::SIGUSR1,
        }
    }
}

/// Deployment-wide settings: container image, Redis endpoints, media
/// root. Corresponds to `config_dev.py` / `django_project/settings.py`
/// as read through `global_config` in the original.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    pub redis_url: String,
    pub simulator_stream: String,
    pub simulator_group: String,
    pub result_stream: String,
    pub coderunner_docker_image: String,
    pub coderunner_username: String,
    pub coderunner_apparmor_profile: String,
    pub media_root: PathBuf,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        GlobalConfig {
            redis_url: "redis://127.0.0.1/".into(),
            simulator_stream: "simulator".into(),
            simulator_group: "simulator-workers".into(),
            result_stream: "simulation-results".into(),
            coderunner_docker_image: "codefights/coderunner:latest".into(),
            coderunner_username: "coderunner".into(),
            coderunner_apparmor_profile: "codefights-coderunner".into(),
            media_root: PathBuf::from("/media"),
        }
    }
}

fn load_toml_or_default<T: Default + for<'de> Deserialize<'de>>(path: Option<&Path>) -> anyhow::Result<T> {
    match path {
        Some(p) => {
            let text = std::fs::read_to_string(p)?;
            Ok(toml::from_str(&text)?)
        }
        None => Ok(T::default()),
    }
}

/// The reified "global module-level state" of the original: a single
/// value, constructed once in `main`, passed by reference into the
/// orchestrator rather than reached for as ambient globals.
pub struct WorkerContext {
    pub global: GlobalConfig,
    pub simulator: SimulatorSettings,
    pub worker_name: String,
}

impl WorkerContext {
    /// Loads `GlobalConfig` from `GLOBAL_CONFIG_PATH` and
    /// `SimulatorSettings` from `SIMULATOR_SETTINGS_PATH`, both env
    /// vars being optional paths to TOML files; falls back to the
    /// built-in defaults (which reproduce `simulator/settings.py`'s
    /// constants) when unset. This mirrors the original's
    /// `os.environ.setdefault(...)` + `importlib.import_module(...)`
    /// pair, minus dynamic import, which Rust doesn't have.
    pub fn load(worker_name: String) -> anyhow::Result<WorkerContext> {
        let global_path = std::env::var_os("GLOBAL_CONFIG_PATH").map(PathBuf::from);
        let settings_path = std::env::var_os("SIMULATOR_SETTINGS_PATH").map(PathBuf::from);

        Ok(WorkerContext {
            global: load_toml_or_default(global_path.as_deref())?,
            simulator: load_toml_or_default(settings_path.as_deref())?,
            worker_name,
        })
    }

    pub fn forkserver_fds(&self) -> PipeFdQuad {
        FORKSERVER_PIPE_FDS
    }

    pub fn forked_fds(&self) -> PipeFdQuad {
        FORKED_PIPE_FDS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_reproduce_original_settings_constants() {
        let s = SimulatorSettings::default();
        assert_eq!(s.child_max_write_size, 2048);
        assert_eq!(s.child_pipe_size, 4096);
        assert_eq!(s.allowed_syscalls, vec!["mmap", "munmap", "brk"]);
    }

    #[test]
    fn loads_toml_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sim.toml");
        std::fs::write(&path, "child_max_write_size = 1024\ncpu_time_exceed_signal = 10\n").unwrap();
        let s: SimulatorSettings = load_toml_or_default(Some(&path)).unwrap();
        assert_eq!(s.child_max_write_size, 1024);
        // untouched fields keep their defaults
        assert_eq!(s.child_pipe_size, 4096);
    }
}
