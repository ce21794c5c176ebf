//! Component C: the per-player `SandboxController`. Owns one forked
//! coderunner child end-to-end — startup handshake, the command/reply
//! cycle a referee drives during a fight, and teardown — translating
//! every ptrace/pipe-level event into either a value or a
//! [`ChildFault`] (spec.md §4.C).

use crate::config::WorkerContext;
use crate::forkserver::ForkServerLink;
use crate::protocol::{child_tokens, compact_json, CommandReply, CommandRequest, LineTalker, SetupEnvelope};
use crate::termination::{ChildFault, FinalState};
use crate::tracer::{pidfd_getfd, pidfd_open, ChildPipePolicy, Rw, StopKind, Tracer};
use nix::unistd::Pid;
use serde_json::Value as Json;
use std::fs::File;
use std::io::BufReader;
use std::os::unix::io::FromRawFd;

fn syscall_name_to_nr(name: &str) -> Option<i64> {
    match name {
        "read" => Some(0),
        "write" => Some(1),
        "mmap" => Some(9),
        "munmap" => Some(11),
        "brk" => Some(12),
        _ => None,
    }
}

/// `RLIMIT_AS`, applied to the child directly from the host via
/// `prlimit(2)` rather than from inside the child (spec.md §4.B step
/// "memory limit"): the child itself never runs code it wasn't sent
/// until after this is in place.
fn set_rlimit_as(pid: Pid, bytes: u64) -> nix::Result<()> {
    let limit = libc::rlimit { rlim_cur: bytes, rlim_max: bytes };
    let ret = unsafe { libc::prlimit(pid.as_raw(), libc::RLIMIT_AS, &limit, std::ptr::null_mut()) };
    if ret != 0 {
        return Err(nix::errno::Errno::last());
    }
    Ok(())
}

/// One player's sandboxed process, mid-fight. `talker` speaks the
/// child's own framing (spec.md §6); `policy` is what the tracer
/// checks every syscall against; `cpu_time_exceed_signal` is needed at
/// teardown to tell a stray signal-stop apart from a CPU timeout.
pub struct SandboxController {
    pid: Pid,
    talker: LineTalker<BufReader<File>, File>,
    policy: ChildPipePolicy,
    cpu_time_exceed_signal: i32,
    /// The pid text the forkserver itself gave us for this child, in
    /// its own pid namespace. Handed back verbatim at teardown so the
    /// forkserver can reap its zombie (see
    /// [`ForkServerLink::notify_reap`]).
    icns_pid_text: String,
}

impl SandboxController {
    /// Run the full per-player startup sequence (spec.md §4.C):
    /// request a fork, attach to the new child, steal its pipe fds,
    /// apply the memory limit, hand it its code + context, and drive
    /// it through the `CHILD_READY` handshake that marks the start of
    /// the Zone of Distrust — the point from which every subsequent
    /// syscall is treated as adversarial.
    ///
    /// Once the forked child's pid is known, a failure anywhere in the
    /// rest of setup still owns a live, ptrace-stopped process: it is
    /// killed, reaped, and the forkserver is notified to reap its own
    /// zombie before this returns, exactly as a fault observed later in
    /// the fight is (spec.md §3 "no child is left as a zombie past the
    /// orchestrator's return", §7 `finish_after_error`). Without this,
    /// every failed startup leaks one stopped process for the rest of
    /// the worker's one-container-per-worker lifetime.
    pub fn start(
        tracer: &mut Tracer,
        forkserver: &mut ForkServerLink,
        ctx: &WorkerContext,
        code: String,
        context: Json,
        cpu_sec: u64,
        cpu_nsec: u32,
        mem_limit_bytes: u64,
    ) -> Result<SandboxController, ChildFault> {
        forkserver.request_fork().map_err(|_| ChildFault::UnknownKill(None))?;
        let fork_stop = tracer.wait_for_stop(forkserver.pid()).map_err(|_| ChildFault::UnknownKill(None))?;
        let child_pid = match fork_stop {
            StopKind::ForkEvent(pid) => pid,
            other => return Err(ChildFault::UnexpCont { wanted: "fork event", saw: stop_label(other) }),
        };
        tracer.forkserver_resume(forkserver.pid()).map_err(|_| ChildFault::UnknownKill(None))?;
        let icns_pid_text = forkserver.recv_child_pid().map_err(|_| ChildFault::UnknownKill(None))?;

        let setup = Self::drive_setup(
            tracer,
            forkserver,
            ctx,
            child_pid,
            code,
            context,
            cpu_sec,
            cpu_nsec,
            mem_limit_bytes,
            icns_pid_text.clone(),
        );
        match setup {
            Ok(controller) => Ok(controller),
            Err(fault) => Err(Self::teardown_after_setup_fault(
                tracer,
                forkserver,
                child_pid,
                &icns_pid_text,
                ctx.simulator.cpu_time_exceed_signal,
                fault,
            )),
        }
    }

    /// Everything from the child's first expected stop through the
    /// `CHILD_READY` handshake. Split out of `start` so that the caller
    /// can run one teardown path on any `Err` here, now that `child_pid`
    /// is known to name a real, currently-traced process.
    #[allow(clippy::too_many_arguments)]
    fn drive_setup(
        tracer: &mut Tracer,
        forkserver: &mut ForkServerLink,
        ctx: &WorkerContext,
        child_pid: Pid,
        code: String,
        context: Json,
        cpu_sec: u64,
        cpu_nsec: u32,
        mem_limit_bytes: u64,
        icns_pid_text: String,
    ) -> Result<SandboxController, ChildFault> {
        match tracer.wait_initial_stop(child_pid).map_err(|_| ChildFault::UnknownKill(None))? {
            StopKind::ChildSignalled | StopKind::Signalled(_) => {}
            other => return Err(ChildFault::UnexpCont { wanted: "child initial stop", saw: stop_label(other) }),
        }

        let allowed_syscalls: Vec<i64> =
            ctx.simulator.allowed_syscalls.iter().filter_map(|s| syscall_name_to_nr(s)).collect();
        let fds = ctx.forked_fds();
        let policy = ChildPipePolicy {
            read_fd: fds.r as i64,
            write_fd: fds.w as i64,
            max_write_bytes: ctx.simulator.child_max_write_size as i64,
            allowed_syscalls,
        };

        tracer.resume_until_next_read(child_pid, &policy)?;

        let pidfd = pidfd_open(child_pid).map_err(|_| ChildFault::UnknownKill(None))?;
        let write_raw = pidfd_getfd(pidfd, fds._w).map_err(|_| ChildFault::UnknownKill(None))?;
        let read_raw = pidfd_getfd(pidfd, fds._r).map_err(|_| ChildFault::UnknownKill(None))?;
        let _ = unsafe { libc::close(pidfd) };

        set_rlimit_as(child_pid, mem_limit_bytes).map_err(|_| ChildFault::UnknownKill(None))?;

        let reader = unsafe { File::from_raw_fd(read_raw) };
        let writer = unsafe { File::from_raw_fd(write_raw) };
        let mut talker = LineTalker::new(BufReader::new(reader), writer);

        let envelope = SetupEnvelope { code, context, cpu_sec, cpu_nsec };
        let line = compact_json(&envelope).map_err(|e| ChildFault::Sabotage(e.to_string()))?;
        talker.send(&line).map_err(|e| ChildFault::Sabotage(format!("sending setup envelope failed: {e}")))?;
        tracer.resume_read_se(child_pid, (line.len() + 1) as i64)?;

        tracer.resume_until_next_read(child_pid, &policy)?;
        talker
            .send(child_tokens::START_SIMULATION)
            .map_err(|e| ChildFault::Sabotage(format!("sending START_SIMULATION failed: {e}")))?;
        tracer.resume_read_se(child_pid, (child_tokens::START_SIMULATION.len() + 1) as i64)?;

        // Zone of Distrust: the child now runs player code. The first
        // thing it must do is announce readiness.
        tracer.resume_until_rw(child_pid, Rw::Write, &policy)?;
        tracer.resume_write_se(child_pid, policy.max_write_bytes)?;
        tracer.resume_until_rw(child_pid, Rw::Read, &policy)?;

        let ready = talker
            .recv()
            .map_err(|e| ChildFault::Sabotage(format!("reading CHILD_READY failed: {e}")))?
            .ok_or_else(|| ChildFault::Sabotage("pipe closed before CHILD_READY".into()))?;
        if ready != child_tokens::CHILD_READY {
            return Err(ChildFault::Sabotage(format!("expected CHILD_READY, got {ready:?}")));
        }

        Ok(SandboxController {
            pid: child_pid,
            talker,
            policy,
            cpu_time_exceed_signal: ctx.simulator.cpu_time_exceed_signal,
            icns_pid_text,
        })
    }

    /// Tear down a child that faulted before `start` could hand back a
    /// live `SandboxController`: reclassify the fault, kill/reap the
    /// child, and run the same forkserver notify/reap handshake
    /// `finish`/`into_fault` use once a controller exists. Returns the
    /// reclassified fault for the caller to propagate.
    fn teardown_after_setup_fault(
        tracer: &mut Tracer,
        forkserver: &mut ForkServerLink,
        pid: Pid,
        icns_pid_text: &str,
        cpu_time_exceed_signal: i32,
        fault: ChildFault,
    ) -> ChildFault {
        let reclassified = fault.reclassify(cpu_time_exceed_signal);
        kill_and_forget(tracer, pid);
        notify_forkserver_of_reap(tracer, forkserver, icns_pid_text);
        reclassified
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Call `f(*args)` on the player's object and return its result,
    /// or `None` if the player's code raised (the coderunner replies
    /// with a bare `{}` in that case — spec.md §4.B, §6). Any
    /// violation of the expected read/write alternation, oversized
    /// write, or malformed reply surfaces as a [`ChildFault`] instead.
    pub fn run_command(&mut self, tracer: &mut Tracer, f: &str, args: Vec<Json>) -> Result<Option<Json>, ChildFault> {
        let request = CommandRequest { f: f.to_string(), args };
        let line = compact_json(&request).map_err(|e| ChildFault::Sabotage(e.to_string()))?;

        self.talker.send(&line).map_err(|e| ChildFault::Sabotage(format!("send failed: {e}")))?;
        tracer.resume_read_se(self.pid, (line.len() + 1) as i64)?;

        tracer.resume_until_rw(self.pid, Rw::Write, &self.policy)?;
        tracer.resume_write_se(self.pid, self.policy.max_write_bytes)?;

        // Park at the entry of the *next* command's read, so the next
        // `run_command` call can go straight to `resume_read_se`.
        tracer.resume_until_rw(self.pid, Rw::Read, &self.policy)?;

        let reply_line = self
            .talker
            .recv()
            .map_err(|e| ChildFault::Sabotage(format!("recv failed: {e}")))?
            .ok_or_else(|| ChildFault::Sabotage("pipe closed mid-command".into()))?;

        let reply: CommandReply = serde_json::from_str(&reply_line)
            .map_err(|e| ChildFault::Sabotage(format!("non-JSON reply {reply_line:?}: {e}")))?;
        Ok(reply.result)
    }

    /// Normal end-of-fight teardown (spec.md §4.D "tear down both
    /// sandboxes"): kill and reap the child, then consume the
    /// forkserver's `SIGCHLD` stop from the same death, resume it, and
    /// hand back the in-container pid text so the forkserver — the
    /// child's real parent once we stop tracing it — can reap its own
    /// zombie away. Mirrors the original's `finish_after_simulation`.
    pub fn finish(self, tracer: &mut Tracer, forkserver: &mut ForkServerLink) -> FinalState {
        kill_and_forget(tracer, self.pid);
        notify_forkserver_of_reap(tracer, forkserver, &self.icns_pid_text);
        FinalState::clean()
    }

    /// Teardown after a [`ChildFault`] was observed mid-protocol:
    /// reclassify it against the configured CPU-exceed signal (a raw
    /// `UnknownSignal`/`UnknownKill` may really have been `XCpuTime` or
    /// `Seccomp`), then kill/reap defensively — the fault may already
    /// mean the child is gone, but a kill on an already-dead pid is a
    /// harmless ESRCH — before running the same forkserver
    /// notify/reap sequence as [`SandboxController::finish`]. Mirrors
    /// the original's `finish_after_error`.
    pub fn into_fault(self, tracer: &mut Tracer, forkserver: &mut ForkServerLink, fault: ChildFault) -> FinalState {
        let reclassified = fault.reclassify(self.cpu_time_exceed_signal);
        kill_and_forget(tracer, self.pid);
        notify_forkserver_of_reap(tracer, forkserver, &self.icns_pid_text);
        FinalState::from_fault(&reclassified)
    }
}

/// Kill and reap a child (a harmless ESRCH if it's already gone), then
/// drop its tracked ptrace phase. Shared by every teardown path:
/// normal finish, a fault observed mid-protocol, and a fault observed
/// during `start`'s own setup.
fn kill_and_forget(tracer: &mut Tracer, pid: Pid) {
    let _ = tracer.kill(pid);
    let _ = tracer.reap(pid);
    tracer.forget(pid);
}

/// Consume the forkserver's own `SIGCHLD` stop caused by a child's
/// death, resume it, then send back the in-container pid text so it
/// can reap the zombie. Errors here are swallowed: by this point the
/// child's outcome is already decided, and a forkserver that no longer
/// answers just means its container will be torn down entirely at the
/// end of the fight anyway.
fn notify_forkserver_of_reap(tracer: &mut Tracer, forkserver: &mut ForkServerLink, icns_pid_text: &str) {
    if tracer.wait_for_stop(forkserver.pid()).is_err() {
        return;
    }
    if tracer.forkserver_resume(forkserver.pid()).is_err() {
        return;
    }
    let _ = forkserver.notify_reap(icns_pid_text);
}

fn stop_label(stop: StopKind) -> &'static str {
    match stop {
        StopKind::ChildSignalled => "child-signalled",
        StopKind::ForkEvent(_) => "fork-event",
        StopKind::SyscallEntry(_) => "syscall-entry",
        StopKind::SyscallExit(_) => "syscall-exit",
        StopKind::Gone(_) => "gone",
        StopKind::Signalled(_) => "signalled",
    }
}
