//! Host-side handle to one fight's forkserver process (spec.md §4.B
//! "Forkserver protocol"): a PID-1-like process, seized under ptrace,
//! that forks a fresh child on request and hands the pid back over its
//! own control pipe.

use crate::protocol::{forkserver_tokens, LineTalker, PipeFdQuad};
use crate::tracer::{pidfd_getfd, pidfd_open, StopKind, Tracer};
use anyhow::{bail, Context as _};
use nix::unistd::Pid;
use std::fs::File;
use std::io::BufReader;
use std::os::unix::io::FromRawFd;

/// The forkserver's own control pipe, stolen via `pidfd_getfd` at
/// attach time. Distinct from the ptrace relationship: fork requests
/// and pid replies cross this pipe, while fork *events* are observed
/// independently through `waitpid`.
pub struct ForkServerLink {
    pid: Pid,
    talker: LineTalker<BufReader<File>, File>,
}

impl ForkServerLink {
    /// Seize the freshly-started forkserver process and steal the far
    /// end of its control pipe (spec.md §4.B bootstrap, steps 1-2).
    pub fn attach(tracer: &mut Tracer, pid: Pid, fds: PipeFdQuad) -> anyhow::Result<ForkServerLink> {
        tracer.attach_seize(pid).context("ptrace seize of forkserver failed")?;
        match tracer.wait_initial_stop(pid)? {
            StopKind::ChildSignalled | StopKind::Signalled(_) => {}
            other => bail!("unexpected initial stop for forkserver: {other:?}"),
        }
        tracer.forkserver_resume(pid)?;

        let pidfd = pidfd_open(pid).context("pidfd_open(forkserver) failed")?;
        let write_raw = pidfd_getfd(pidfd, fds._w).context("steal forkserver read-pipe (write end) failed")?;
        let read_raw = pidfd_getfd(pidfd, fds._r).context("steal forkserver write-pipe (read end) failed")?;
        let _ = unsafe { libc::close(pidfd) };

        let reader = unsafe { File::from_raw_fd(read_raw) };
        let writer = unsafe { File::from_raw_fd(write_raw) };
        let mut talker = LineTalker::new(BufReader::new(reader), writer);

        // Tell the forkserver it can drop out of its own startup wait
        // and enter its request loop now that we hold its pipe fds
        // (spec.md §4.B bootstrap step 2).
        talker.send(forkserver_tokens::CONTINUE).context("sending CC_F_CONTINUE failed")?;

        Ok(ForkServerLink { pid, talker })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Ask the forkserver to fork a new child (spec.md §4.B step: send
    /// `FORK_CHILD`). The caller drives the tracer through the
    /// resulting `PTRACE_EVENT_FORK` stop and resume themselves, since
    /// that requires `&mut Tracer` alongside this link.
    pub fn request_fork(&mut self) -> anyhow::Result<()> {
        self.talker.send(forkserver_tokens::FORK_CHILD)?;
        Ok(())
    }

    /// Read the decimal pid of the just-forked child back over the
    /// control pipe, in the pid namespace of the *container* (icns:
    /// in-container namespace). This is a different number space than
    /// the host-namespace `Pid` the `PTRACE_EVENT_FORK` stop already
    /// gave the caller via `PTRACE_GETEVENTMSG` — the two are never
    /// compared against each other in the original (`self.icns_pid_str`
    /// in `simulator/entry.py` is kept purely as opaque text, stored
    /// only to be handed back unparsed to the forkserver's reap
    /// protocol once the child is gone). This returns it as a plain
    /// `String` rather than re-parsing it into a `Pid` that nothing may
    /// legitimately compare against the host one.
    pub fn recv_child_pid(&mut self) -> anyhow::Result<String> {
        self.talker.recv()?.ok_or_else(|| anyhow::anyhow!("forkserver control pipe closed unexpectedly"))
    }

    /// Tell the forkserver the child it just reported is dead, by
    /// sending back the same in-container-namespace pid text
    /// `recv_child_pid` handed us. The forkserver is the child's real
    /// parent once we stop tracing it, so only the forkserver can
    /// actually reap the zombie away (spec.md §4.D "tear down both
    /// sandboxes"; mirrors `finish_after_simulation`/`finish_after_error`
    /// in the original).
    pub fn notify_reap(&mut self, icns_pid_text: &str) -> anyhow::Result<()> {
        self.talker.send(icns_pid_text)?;
        Ok(())
    }
}
