//! Thin, typed wrapper around ptrace/waitpid/pidfd (spec.md §4.A,
//! Component A: "Tracer primitives").
//!
//! Linux-only, x86_64-only, same as the rest of this crate (spec.md §1
//! Non-goals: "support for non-Linux hosts").

pub mod stop;

use crate::termination::{ChildFault, IllegalSyscallInfo};
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::os::unix::io::RawFd;

pub use stop::{StopKind, SyscallRegs};

/// `SIGSYS`, the signal seccomp delivers on a kill-process violation.
pub const SIGSYS: i32 = libc::SIGSYS;

/// x86_64 syscall numbers for `read`/`write`. The original hardcodes
/// these same two literals ("write() with syscall code 1", "read()
/// with syscall code 0" in `simulator/entry.py`).
pub const SYS_READ: i64 = 0;
pub const SYS_WRITE: i64 = 1;

/// Which of read/write the controller currently expects next, used by
/// `resume_until_rw` (spec.md §4.A).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Rw {
    Read,
    Write,
}

impl Rw {
    fn label(self) -> &'static str {
        match self {
            Rw::Read => "read",
            Rw::Write => "write",
        }
    }
}

/// The per-child facts the tracer needs to tell a legitimate
/// read()/write() from an illegal syscall: which fds are this child's
/// own pipe ends, the write-size cap (`CHILD_MAX_WRITE_SIZE`), and the
/// general syscall allowlist that isn't `read`/`write` (`mmap`,
/// `munmap`, `brk` by default — spec.md §4.B step 5, §6).
#[derive(Clone, Debug)]
pub struct ChildPipePolicy {
    pub read_fd: i64,
    pub write_fd: i64,
    pub max_write_bytes: i64,
    pub allowed_syscalls: Vec<i64>,
}

/// Whether the next syscall-stop for a given pid is expected to be an
/// entry or an exit. ptrace itself carries no such information in the
/// status word; a tracer relying on `PTRACE_SYSCALL` alone must track
/// it by counting, since stops alternate strictly between entry and
/// exit for a single `PTRACE_SYSCALL`-resumed thread.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Phase {
    Entry,
    Exit,
}

/// Owns the ptrace relationship with one fight's forkserver and all of
/// its forked children. Per spec.md §4.D, the orchestrator is strictly
/// single-threaded per fight, and this type is not `Send`/`Sync` on
/// purpose: ptrace requires the tracer *thread* that issued `attach`/
/// `seize` to be the one observing `waitpid` on that tracee.
pub struct Tracer {
    phase: HashMap<i32, Phase>,
    /// The registers observed at the most recent syscall-entry-stop
    /// for each pid, so that `resume_read_SE`/`resume_write_SE` can
    /// check the length bound against the syscall we're already
    /// parked at, without re-reading registers mid-flight.
    last_entry: HashMap<i32, SyscallRegs>,
}

impl Tracer {
    pub fn new() -> Tracer {
        Tracer { phase: HashMap::new(), last_entry: HashMap::new() }
    }

    fn phase_of(&mut self, pid: Pid) -> &mut Phase {
        self.phase.entry(pid.as_raw()).or_insert(Phase::Entry)
    }

    fn flip(&mut self, pid: Pid) {
        let p = self.phase_of(pid);
        *p = match *p {
            Phase::Entry => Phase::Exit,
            Phase::Exit => Phase::Entry,
        };
    }

    /// `attach_seize(pid)` — attach without stopping, with
    /// `TRACESYSGOOD | TRACEFORK | EXITKILL` (spec.md §4.A).
    pub fn attach_seize(&mut self, pid: Pid) -> nix::Result<()> {
        let options = ptrace::Options::PTRACE_O_TRACESYSGOOD
            | ptrace::Options::PTRACE_O_TRACEFORK
            | ptrace::Options::PTRACE_O_EXITKILL;
        ptrace::seize(pid, options)?;
        self.phase.insert(pid.as_raw(), Phase::Entry);
        Ok(())
    }

    /// Read the three relevant registers (syscall number + first three
    /// args) at whatever stop we're currently at.
    fn read_syscall_regs(pid: Pid) -> nix::Result<SyscallRegs> {
        let regs = ptrace::getregs(pid)?;
        Ok(SyscallRegs {
            nr: regs.orig_rax as i64,
            arg0: regs.rdi as i64,
            arg1: regs.rsi as i64,
            arg2: regs.rdx as i64,
            retval: regs.rax as i64,
        })
    }

    /// Block for a waitpid status on `pid` and classify it (spec.md §4.A).
    pub fn wait_for_stop(&mut self, pid: Pid) -> nix::Result<StopKind> {
        let status = waitpid(pid, Some(WaitPidFlag::__WALL))?;
        self.classify(pid, status)
    }

    fn classify(&mut self, pid: Pid, status: WaitStatus) -> nix::Result<StopKind> {
        match status {
            WaitStatus::Exited(_, code) => Ok(StopKind::Gone(code << 8)),
            WaitStatus::Signaled(_, sig, _) => Ok(StopKind::Gone(sig as i32)),
            WaitStatus::PtraceEvent(_, _, event) if event == libc::PTRACE_EVENT_FORK => {
                let child_raw = ptrace::getevent(pid)? as libc::pid_t;
                Ok(StopKind::ForkEvent(Pid::from_raw(child_raw)))
            }
            WaitStatus::PtraceSyscall(_) => {
                let regs = Tracer::read_syscall_regs(pid)?;
                let kind = match *self.phase_of(pid) {
                    Phase::Entry => {
                        self.last_entry.insert(pid.as_raw(), regs);
                        StopKind::SyscallEntry(regs)
                    }
                    Phase::Exit => StopKind::SyscallExit(regs),
                };
                self.flip(pid);
                Ok(kind)
            }
            WaitStatus::Stopped(_, Signal::SIGCHLD) => Ok(StopKind::ChildSignalled),
            WaitStatus::Stopped(_, sig) => Ok(StopKind::Signalled(sig as i32)),
            WaitStatus::PtraceEvent(_, sig, _) => Ok(StopKind::Signalled(sig as i32)),
            WaitStatus::Continued(_) | WaitStatus::StillAlive => {
                // Shouldn't occur with blocking waitpid and no WCONTINUED/WNOHANG,
                // but handle it rather than panic.
                self.wait_for_stop(pid)
            }
        }
    }

    /// Consume the first mandatory stop of a freshly-forked child
    /// (spec.md §4.A `wait_initial_stop`).
    pub fn wait_initial_stop(&mut self, pid: Pid) -> nix::Result<StopKind> {
        self.wait_for_stop(pid)
    }

    /// `PTRACE_SYSCALL` then wait; return the next syscall-stop.
    pub fn resume_syscall(&mut self, pid: Pid) -> nix::Result<StopKind> {
        ptrace::syscall(pid, None)?;
        self.wait_for_stop(pid)
    }

    /// `PTRACE_CONT`, no wait.
    pub fn resume_plain(&mut self, pid: Pid) -> nix::Result<()> {
        ptrace::cont(pid, None)
    }

    /// Resume the forkserver from its SIGCHLD group-stop (also used as
    /// "resume after FORK event", since both are plain continuations).
    pub fn forkserver_resume(&mut self, pid: Pid) -> nix::Result<()> {
        ptrace::cont(pid, None)
    }

    pub fn kill(&mut self, pid: Pid) -> nix::Result<()> {
        nix::sys::signal::kill(pid, Signal::SIGKILL)
    }

    pub fn reap(&mut self, pid: Pid) -> nix::Result<WaitStatus> {
        waitpid(pid, Some(WaitPidFlag::__WALL))
    }

    pub fn forget(&mut self, pid: Pid) {
        self.phase.remove(&pid.as_raw());
        self.last_entry.remove(&pid.as_raw());
    }

    fn fault_from_stop(&self, stop: StopKind) -> ChildFault {
        match stop {
            StopKind::Gone(status) => ChildFault::UnknownKill(Some(status)),
            StopKind::Signalled(sig) => ChildFault::UnknownSignal(sig),
            // Neither should occur for a forked child's own pid; treat
            // as an unknown kill rather than panicking.
            StopKind::ChildSignalled | StopKind::ForkEvent(_) => ChildFault::UnknownKill(None),
            StopKind::SyscallEntry(_) | StopKind::SyscallExit(_) => {
                ChildFault::UnexpCont { wanted: "stop", saw: "syscall-stop" }
            }
        }
    }

    fn illegal(regs: SyscallRegs) -> ChildFault {
        let (arg0, arg2) = if regs.nr == SYS_READ || regs.nr == SYS_WRITE {
            (regs.arg0, regs.arg2)
        } else {
            (-1, -1)
        };
        ChildFault::IllegalSyscall(IllegalSyscallInfo { syscall_nr: regs.nr, arg0, arg2 })
    }

    /// A syscall the tracer has already decided to let through can
    /// still legitimately fail (e.g. ENOMEM from `RLIMIT_AS` during an
    /// `mmap`/`brk`); if it does, that's a termination, not "keep
    /// looping". Shared by the setup-phase and Zone-of-Distrust resume
    /// loops below.
    fn consume_exit(&mut self, pid: Pid) -> Result<(), ChildFault> {
        match self.resume_syscall(pid).map_err(|_| ChildFault::UnknownKill(None))? {
            StopKind::SyscallExit(regs) => {
                if regs.retval == -(libc::ENOMEM as i64) {
                    return Err(ChildFault::Enomem(None));
                }
                Ok(())
            }
            other => Err(self.fault_from_stop(other)),
        }
    }

    /// Setup-phase wait for the child's next read on its own read fd
    /// (spec.md §4.C steps 6/10). Unlike `resume_until_rw`, this does
    /// **not** apply `policy.allowed_syscalls`/illegal-syscall
    /// classification to every other syscall: before the Zone of
    /// Distrust begins, the child's own bootstrap issues syscalls no
    /// allowlist names (`close`, `pipe`, `dup2`, `fcntl`, `timer_create`,
    /// `timer_settime`, `seccomp`, ...) on its way to each read, and the
    /// original's `forked_resume_until_read` tolerates exactly these by
    /// letting every non-matching syscall run to completion rather than
    /// killing the child for issuing one. Parks at the **syscall-entry-stop**
    /// of the next legitimate read (the read only actually executes, and
    /// reaches its exit-stop, once the controller has sent the
    /// corresponding data and called `resume_read_SE`).
    pub fn resume_until_next_read(&mut self, pid: Pid, policy: &ChildPipePolicy) -> Result<(), ChildFault> {
        loop {
            let stop = self.resume_syscall(pid).map_err(|_| ChildFault::UnknownKill(None))?;
            match stop {
                StopKind::SyscallEntry(regs) => {
                    if regs.nr == SYS_READ && regs.arg0 == policy.read_fd {
                        return Ok(());
                    }
                    self.consume_exit(pid)?;
                }
                other => return Err(self.fault_from_stop(other)),
            }
        }
    }

    /// Zone-of-Distrust wait: asserts the next legitimate syscall is
    /// exactly `expected` (read or write on the child's own pipe fd).
    /// Once the child has announced `CHILD_READY` it is adversarial —
    /// any entry that is neither the expected read/write nor one of
    /// `policy.allowed_syscalls` is an illegal syscall, and a
    /// legitimate-but-wrong-order r/w classifies as `UNEXP_CONT`
    /// (spec.md §4.A, §4.C command loop).
    pub fn resume_until_rw(&mut self, pid: Pid, expected: Rw, policy: &ChildPipePolicy) -> Result<(), ChildFault> {
        loop {
            let stop = self.resume_syscall(pid).map_err(|_| ChildFault::UnknownKill(None))?;
            match stop {
                StopKind::SyscallEntry(regs) => {
                    let is_read = regs.nr == SYS_READ && regs.arg0 == policy.read_fd;
                    let is_write = regs.nr == SYS_WRITE && regs.arg0 == policy.write_fd;

                    match (expected, is_read, is_write) {
                        (Rw::Read, true, _) => return Ok(()),
                        (Rw::Write, _, true) => return Ok(()),
                        (_, true, _) => {
                            return Err(ChildFault::UnexpCont { wanted: expected.label(), saw: "read" })
                        }
                        (_, _, true) => {
                            return Err(ChildFault::UnexpCont { wanted: expected.label(), saw: "write" })
                        }
                        _ if policy.allowed_syscalls.contains(&regs.nr) => {
                            self.consume_exit(pid)?;
                        }
                        _ => return Err(Tracer::illegal(regs)),
                    }
                }
                other => return Err(self.fault_from_stop(other)),
            }
        }
    }

    /// Advance from the syscall-entry-stop we're already parked at
    /// (via `resume_until_next_read`/`resume_until_rw`) to its
    /// syscall-exit-stop. `max_bytes < 0` disables the upper bound on
    /// the read's requested length (spec.md §4.A).
    pub fn resume_read_se(&mut self, pid: Pid, max_bytes: i64) -> Result<SyscallRegs, ChildFault> {
        self.bounded_se(pid, max_bytes)
    }

    /// As `resume_read_se`, for the write side; bound is always
    /// `policy.max_write_bytes` (testable property 4, spec.md §8).
    pub fn resume_write_se(&mut self, pid: Pid, max_write_bytes: i64) -> Result<SyscallRegs, ChildFault> {
        self.bounded_se(pid, max_write_bytes)
    }

    fn bounded_se(&mut self, pid: Pid, max_bytes: i64) -> Result<SyscallRegs, ChildFault> {
        let entry = *self
            .last_entry
            .get(&pid.as_raw())
            .expect("bounded_se called without a preceding parked syscall-entry");

        if max_bytes >= 0 && entry.arg2 > max_bytes {
            return Err(Tracer::illegal(entry));
        }

        match self.resume_syscall(pid).map_err(|_| ChildFault::UnknownKill(None))? {
            StopKind::SyscallExit(regs) => Ok(regs),
            other => Err(self.fault_from_stop(other)),
        }
    }
}

impl Default for Tracer {
    fn default() -> Self {
        Tracer::new()
    }
}

/// `pidfd_open(pid)`, via the raw syscall (nix has no stable wrapper
/// for this on the crate's target nix version).
pub fn pidfd_open(pid: Pid) -> nix::Result<RawFd> {
    let ret = unsafe { libc::syscall(libc::SYS_pidfd_open, pid.as_raw(), 0) };
    if ret < 0 {
        return Err(Errno::last());
    }
    Ok(ret as RawFd)
}

/// `pidfd_getfd(pidfd, remote_fd) -> local_fd` — acquire a handle to a
/// file descriptor held by another process, possibly in a different
/// PID namespace (spec.md §4.A, GLOSSARY "Stolen fd").
pub fn pidfd_getfd(pidfd: RawFd, remote_fd: RawFd) -> nix::Result<RawFd> {
    let ret = unsafe { libc::syscall(libc::SYS_pidfd_getfd, pidfd, remote_fd, 0) };
    if ret < 0 {
        return Err(Errno::last());
    }
    Ok(ret as RawFd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_alternates_starting_from_entry() {
        let mut tracer = Tracer::new();
        let pid = Pid::from_raw(4242);
        assert_eq!(*tracer.phase_of(pid), Phase::Entry);
        tracer.flip(pid);
        assert_eq!(*tracer.phase_of(pid), Phase::Exit);
        tracer.flip(pid);
        assert_eq!(*tracer.phase_of(pid), Phase::Entry);
    }

    #[test]
    fn forget_clears_tracked_phase_and_last_entry() {
        let mut tracer = Tracer::new();
        let pid = Pid::from_raw(777);
        tracer.flip(pid);
        tracer.last_entry.insert(pid.as_raw(), SyscallRegs { nr: 0, arg0: 0, arg1: 0, arg2: 0, retval: 0 });
        tracer.forget(pid);
        assert_eq!(*tracer.phase_of(pid), Phase::Entry);
        assert!(tracer.last_entry.get(&pid.as_raw()).is_none());
    }

    #[test]
    fn illegal_syscall_blanks_args_for_non_rw_syscalls() {
        let regs = SyscallRegs { nr: 59 /* execve */, arg0: 5, arg1: 0, arg2: 9, retval: 0 };
        let fault = Tracer::illegal(regs);
        match fault {
            ChildFault::IllegalSyscall(info) => {
                assert_eq!(info.syscall_nr, 59);
                assert_eq!(info.arg0, -1);
                assert_eq!(info.arg2, -1);
            }
            _ => panic!("expected IllegalSyscall"),
        }
    }

    #[test]
    fn illegal_syscall_keeps_args_for_read_and_write() {
        let regs = SyscallRegs { nr: SYS_WRITE, arg0: 33, arg1: 0, arg2: 4096, retval: 0 };
        let fault = Tracer::illegal(regs);
        match fault {
            ChildFault::IllegalSyscall(info) => {
                assert_eq!(info.arg0, 33);
                assert_eq!(info.arg2, 4096);
            }
            _ => panic!("expected IllegalSyscall"),
        }
    }
}
