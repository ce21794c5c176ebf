//! `fightsim-coderunner`: runs as PID 1 inside the forkserver container
//! (spec.md §4.B "Forkserver protocol" and "Per-child bootstrap").
//! Grounded closely on `simulator/coderunner/run.py`: the control-pipe
//! handshake, fd remapping, and command loop are a direct port; player
//! code execution goes through `rhai` instead of CPython's `exec()`
//! (see `script.rs`).

use fightsim::config::SimulatorSettings;
use fightsim::protocol::{
    child_tokens, compact_json, forkserver_tokens, CommandReply, CommandRequest, LineTalker, PipeFdQuad,
    SetupEnvelope, CHILD_PIPE_SIZE, FORKED_PIPE_FDS, FORKSERVER_PIPE_FDS,
};
use fightsim::script::{CallOutcome, PlayerScript};
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::{fork, ForkResult, Pid};
use std::fs::File;
use std::io::BufReader;
use std::os::unix::io::{FromRawFd, RawFd};

/// Numeric syscall numbers for the handful of names the simulator's
/// allowlist can name, same mapping `sandbox.rs` uses on the host side
/// for the ptrace policy — kept independent here since the seccomp
/// backstop additionally always allows `read`/`write`, which the
/// ptrace-facing allowlist never does (spec.md §4.B step 5).
fn syscall_name_to_nr(name: &str) -> Option<i64> {
    match name {
        "read" => Some(libc::SYS_read),
        "write" => Some(libc::SYS_write),
        "mmap" => Some(libc::SYS_mmap),
        "munmap" => Some(libc::SYS_munmap),
        "brk" => Some(libc::SYS_brk),
        _ => None,
    }
}

fn pipe2_pair() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        abort_now();
    }
    (fds[0], fds[1])
}

fn dup2_or_die(old: RawFd, new: RawFd) {
    if unsafe { libc::dup2(old, new) } < 0 {
        abort_now();
    }
}

fn close_quiet(fd: RawFd) {
    let _ = unsafe { libc::close(fd) };
}

/// Mirrors the original's unconditional `os._exit(1)`: an attempted
/// `exit_group` is not in any syscall allowlist, so the tracer or the
/// seccomp backstop kills the process before it actually exits. There
/// is no recoverable path past this point in the coderunner, by design
/// (spec.md §4.B: anything the Zone of Distrust can't finish cleanly
/// ends in a termination, never a clean return).
fn abort_now() -> ! {
    std::process::exit(1);
}

fn build_talker(fds: PipeFdQuad) -> LineTalker<BufReader<File>, File> {
    let reader = unsafe { File::from_raw_fd(fds.r) };
    let writer = unsafe { File::from_raw_fd(fds.w) };
    LineTalker::new(BufReader::new(reader), writer)
}

/// Reconfigure the process's CPU-time budget via a `CLOCK_PROCESS_CPUTIME_ID`
/// POSIX timer that delivers `signal` on expiry, rather than the
/// classic `ITIMER_PROF` (whose signal, `SIGPROF`, isn't configurable) —
/// mirrors `tracee.start_cputime_timer` in the original C extension.
fn start_cputime_timer(signal: i32, cpu_sec: u64, cpu_nsec: u32) {
    unsafe {
        let mut sev: libc::sigevent = std::mem::zeroed();
        sev.sigev_notify = libc::SIGEV_SIGNAL;
        sev.sigev_signo = signal;

        let mut timer_id: libc::timer_t = std::ptr::null_mut();
        if libc::timer_create(libc::CLOCK_PROCESS_CPUTIME_ID, &mut sev, &mut timer_id) != 0 {
            abort_now();
        }

        let spec = libc::itimerspec {
            it_interval: libc::timespec { tv_sec: 0, tv_nsec: 0 },
            it_value: libc::timespec { tv_sec: cpu_sec as i64, tv_nsec: cpu_nsec as i64 },
        };
        if libc::timer_settime(timer_id, 0, &spec, std::ptr::null_mut()) != 0 {
            abort_now();
        }
    }
}

fn apply_seccomp(settings: &SimulatorSettings) {
    use seccompiler::{BpfProgram, SeccompAction, SeccompFilter, TargetArch};
    use std::collections::BTreeMap;

    let mut allowed: Vec<i64> = settings.allowed_syscalls.iter().filter_map(|s| syscall_name_to_nr(s)).collect();
    // The seccomp backstop always allows read/write regardless of the
    // configured allowlist; the ptrace layer is what actually restricts
    // them to the sandbox's own fds and the configured length bound
    // (spec.md §4.B step 5).
    for always in ["read", "write"] {
        if let Some(nr) = syscall_name_to_nr(always) {
            if !allowed.contains(&nr) {
                allowed.push(nr);
            }
        }
    }

    let mut rules = BTreeMap::new();
    for nr in allowed {
        rules.insert(nr, vec![]);
    }

    let filter = match SeccompFilter::new(rules, SeccompAction::KillProcess, SeccompAction::Allow, TargetArch::x86_64)
    {
        Ok(f) => f,
        Err(_) => abort_now(),
    };
    let program: BpfProgram = match filter.try_into() {
        Ok(p) => p,
        Err(_) => abort_now(),
    };
    if seccompiler::apply_filter(&program).is_err() {
        abort_now();
    }
}

/// One forked child's whole lifetime, from fd remapping through the
/// command loop (spec.md §4.B steps 3-onward). Never returns normally.
fn child_main(settings: &SimulatorSettings) -> ! {
    close_quiet(FORKSERVER_PIPE_FDS.r);
    close_quiet(FORKSERVER_PIPE_FDS.w);

    let (r, _w) = pipe2_pair();
    let (_r, w) = pipe2_pair();

    dup2_or_die(r, FORKED_PIPE_FDS.r);
    dup2_or_die(_w, FORKED_PIPE_FDS._w);
    dup2_or_die(_r, FORKED_PIPE_FDS._r);
    dup2_or_die(w, FORKED_PIPE_FDS.w);
    for fd in [r, _w, _r, w] {
        close_quiet(fd);
    }

    let mut talker = build_talker(FORKED_PIPE_FDS);

    let setup_line = match talker.recv() {
        Ok(Some(line)) => line,
        _ => abort_now(),
    };
    let envelope: SetupEnvelope = match serde_json::from_str(&setup_line) {
        Ok(e) => e,
        Err(_) => abort_now(),
    };

    if unsafe { libc::fcntl(FORKED_PIPE_FDS.w, libc::F_SETPIPE_SZ, CHILD_PIPE_SIZE) } < 0 {
        abort_now();
    }

    // The host has already stolen these via pidfd_getfd by the time our
    // own recv() above returned (spec.md §4.C startup sequence).
    close_quiet(FORKED_PIPE_FDS._r);
    close_quiet(FORKED_PIPE_FDS._w);

    start_cputime_timer(settings.cpu_time_exceed_signal, envelope.cpu_sec, envelope.cpu_nsec);
    apply_seccomp(settings);

    match talker.recv() {
        Ok(Some(line)) if line == child_tokens::START_SIMULATION => {}
        _ => abort_now(),
    }

    // *** The Zone of Distrust: everything from here on is adversarial. ***
    let mut script = match PlayerScript::compile(&envelope.code) {
        Ok(s) => s,
        Err(_) => abort_now(),
    };

    if talker.send(child_tokens::CHILD_READY).is_err() {
        abort_now();
    }

    loop {
        let line = match talker.recv() {
            Ok(Some(l)) => l,
            _ => abort_now(),
        };
        let request: CommandRequest = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(_) => abort_now(),
        };

        let reply = match script.call(&request.f, request.args) {
            CallOutcome::Value(v) => CommandReply { result: Some(v) },
            CallOutcome::Errored => CommandReply { result: None },
            // No such function: the original treats this exactly like
            // any other unexpected condition in the Zone of Distrust —
            // an attempted exit, which the tracer/seccomp turn into a
            // termination rather than a graceful reply.
            CallOutcome::Eliminated => abort_now(),
        };

        let line = match compact_json(&reply) {
            Ok(l) => l,
            Err(_) => abort_now(),
        };
        if talker.send(&line).is_err() {
            abort_now();
        }
    }
}

/// Same `SIMULATOR_SETTINGS_PATH` env var `WorkerContext::load` reads
/// on the host side, re-read here since the coderunner is its own
/// binary with no worker identity of its own to load a full context
/// around.
fn load_simulator_settings() -> SimulatorSettings {
    let path = match std::env::var_os("SIMULATOR_SETTINGS_PATH") {
        Some(p) => p,
        None => return SimulatorSettings::default(),
    };
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(_) => return SimulatorSettings::default(),
    };
    toml::from_str(&text).unwrap_or_default()
}

/// The forkserver must never run as root -- it is PID 1 inside a
/// container whose whole defense-in-depth rests on being an
/// unprivileged, seccomp/AppArmor-confined process (spec.md §4.B
/// bootstrap, §6 "unprivileged user"). Checked before anything else.
fn refuse_to_run_as_root() {
    if unsafe { libc::getuid() } == 0 {
        abort_now();
    }
}

fn main() {
    refuse_to_run_as_root();

    for fd in [0, 1, 2] {
        close_quiet(fd);
    }

    let (r, _w) = pipe2_pair();
    let (_r, w) = pipe2_pair();

    dup2_or_die(r, FORKSERVER_PIPE_FDS.r);
    dup2_or_die(_w, FORKSERVER_PIPE_FDS._w);
    dup2_or_die(_r, FORKSERVER_PIPE_FDS._r);
    dup2_or_die(w, FORKSERVER_PIPE_FDS.w);
    for fd in [r, _w, _r, w] {
        close_quiet(fd);
    }

    let mut talker = build_talker(FORKSERVER_PIPE_FDS);

    match talker.recv() {
        Ok(Some(ref line)) if line == forkserver_tokens::CONTINUE => {}
        _ => abort_now(),
    }

    // Only `FORKSERVER_PIPE_FDS.r`/`.w` are meant to survive into every
    // forked child from here on; the host has already stolen the far
    // ends via pidfd_getfd (spec.md §4.B bootstrap step 2).
    close_quiet(FORKSERVER_PIPE_FDS._r);
    close_quiet(FORKSERVER_PIPE_FDS._w);

    let settings = load_simulator_settings();

    loop {
        let cmd = match talker.recv() {
            Ok(Some(c)) => c,
            _ => abort_now(),
        };

        if cmd == forkserver_tokens::FORK_CHILD {
            match unsafe { fork() } {
                Ok(ForkResult::Child) => {
                    child_main(&settings);
                }
                Ok(ForkResult::Parent { child }) => {
                    if talker.send(&child.as_raw().to_string()).is_err() {
                        abort_now();
                    }
                }
                Err(_) => abort_now(),
            }
        } else {
            let pid: i32 = match cmd.trim().parse() {
                Ok(p) => p,
                Err(_) => continue,
            };
            let _ = waitpid(Pid::from_raw(pid), Some(WaitPidFlag::empty()));
        }
    }
}
