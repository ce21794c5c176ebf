//! The typed classification of a single `waitpid()` stop, replacing
//! the "catch one of eight exception types" control flow of the
//! original's C extension (spec.md §4.A, §9 REDESIGN FLAGS).

use nix::unistd::Pid;

/// The syscall number and the first three argument registers, read at
/// either a syscall-entry-stop or a syscall-exit-stop.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SyscallRegs {
    pub nr: i64,
    pub arg0: i64,
    pub arg1: i64,
    pub arg2: i64,
    /// Only meaningful at a syscall-exit-stop: the return value.
    pub retval: i64,
}

/// One ptrace-observed stop, classified the way `wait_for_stop` in
/// spec.md §4.A does:
///
/// - a group-stop by SIGCHLD on the forkserver is `ChildSignalled`
/// - a `PTRACE_EVENT_FORK` stop is `ForkEvent`, carrying the child pid
///   read via `PTRACE_GETEVENTMSG`
/// - a syscall-stop is `SyscallEntry`/`SyscallExit`
/// - exit or kill is `Gone`
/// - any other signal-delivery stop is `Signalled`
#[derive(Copy, Clone, Debug)]
pub enum StopKind {
    ChildSignalled,
    ForkEvent(Pid),
    SyscallEntry(SyscallRegs),
    SyscallExit(SyscallRegs),
    /// Raw wait status, for exited/killed processes.
    Gone(i32),
    Signalled(i32),
}
