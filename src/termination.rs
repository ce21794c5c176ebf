//! The closed set of ways a forked coderunner child can end up not
//! finishing a fight cleanly, and the explanation payload that goes
//! with each. See spec.md §3 and §7.
//!
//! This is the Rust-native replacement for the flat exception
//! hierarchy in `simulator/entry.py` (`Forked_IllegalSyscall`,
//! `Forked_ENOMEM`, ..., plus the locally-raised `Forked_CodeSabotage`).
//! All eight become variants of one tagged union instead of distinct
//! exception types, per the REDESIGN FLAGS in spec.md §9.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// The three relevant fields of an illegal syscall attempt: the
/// syscall number, and, for `read`/`write`, their first and third
/// arguments (fd and length). -1 for both when the syscall isn't
/// `read`/`write`. Encoded on the wire as a bare 3-element array
/// (`[syscall_nr, arg0, arg2]`), matching `termination_explanation` in
/// `result_processor/entry.py` ("a list of 3 numbers") and the S5
/// fixture in spec.md §8 (`["IS", [<exit_syscall_nr>, -1, -1]]`) —
/// not a keyed object.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct IllegalSyscallInfo {
    pub syscall_nr: i64,
    pub arg0: i64,
    pub arg2: i64,
}

impl Serialize for IllegalSyscallInfo {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (self.syscall_nr, self.arg0, self.arg2).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for IllegalSyscallInfo {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (syscall_nr, arg0, arg2) = <(i64, i64, i64)>::deserialize(deserializer)?;
        Ok(IllegalSyscallInfo { syscall_nr, arg0, arg2 })
    }
}

/// Whatever accompanies a termination reason, if anything. Carried in
/// the result record as the second element of the
/// `[reason_tag, explanation]` pair (spec.md §3, §6 "Queue records").
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Explanation {
    IllegalSyscall(IllegalSyscallInfo),
    /// A raw waitpid status word, when one was available.
    RawStatus(i32),
    None,
}

/// The closed set of terminal reasons a coderunner child's lifecycle
/// can end in, other than a clean finish (spec.md §3).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationReason {
    /// The tracer saw a syscall-entry outside the whitelist, or one
    /// that violates the per-syscall constraint (read/write to the
    /// wrong fd, or over the length bound).
    IllegalSyscall,
    /// The child was killed by SIGSYS: the seccomp backstop fired.
    /// Should be unreachable if the ptrace layer is correct.
    Seccomp,
    /// Signal-stop carrying the configured CPU-time-exceeded signal.
    XCpuTime,
    /// An unexpected waitpid status consistent with RLIMIT_AS
    /// enforcement during syscall emulation.
    Enomem,
    /// Signal-stop with a signal not otherwise classified.
    UnknownSignal,
    /// The child disappeared (exited/killed) unexpectedly.
    UnknownKill,
    /// The tracee continued past the expected stop, e.g. produced a
    /// `read` when a `write` was expected.
    UnexpCont,
    /// Protocol-layer misbehavior that cannot be explained by a
    /// classified syscall/signal event: non-JSON or non-object reply,
    /// missing `CHILD_READY`, oversized response, etc.
    Sabotage,
}

impl TerminationReason {
    /// The two-letter tag used on the wire (`common.values.TerminationReasons`
    /// in the original).
    pub fn tag(self) -> &'static str {
        match self {
            TerminationReason::IllegalSyscall => "IS",
            TerminationReason::Enomem => "EM",
            TerminationReason::UnknownKill => "UK",
            TerminationReason::UnknownSignal => "US",
            TerminationReason::UnexpCont => "UC",
            TerminationReason::Sabotage => "CS",
            TerminationReason::XCpuTime => "XT",
            TerminationReason::Seccomp => "SP",
        }
    }
}

/// Error type propagated through the tracer and sandbox controller
/// while a player's child process is being set up or driven. Each
/// variant maps 1:1 onto a `TerminationReason`; the explanation is
/// carried alongside so `SandboxController` can build the final
/// `(reason, explanation)` pair without re-deriving it.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ChildFault {
    #[error("illegal syscall {0:?}")]
    IllegalSyscall(IllegalSyscallInfo),
    #[error("killed by seccomp (SIGSYS)")]
    Seccomp,
    #[error("cpu time limit exceeded")]
    XCpuTime,
    #[error("out of memory")]
    Enomem(Option<i32>),
    #[error("unknown signal {0}")]
    UnknownSignal(i32),
    #[error("unknown kill, raw status = {0:?}")]
    UnknownKill(Option<i32>),
    #[error("unexpected continuation, wanted {wanted}, saw {saw}")]
    UnexpCont { wanted: &'static str, saw: &'static str },
    #[error("sabotage: {0}")]
    Sabotage(String),
}

impl ChildFault {
    pub fn reason(&self) -> TerminationReason {
        match self {
            ChildFault::IllegalSyscall(_) => TerminationReason::IllegalSyscall,
            ChildFault::Seccomp => TerminationReason::Seccomp,
            ChildFault::XCpuTime => TerminationReason::XCpuTime,
            ChildFault::Enomem(_) => TerminationReason::Enomem,
            ChildFault::UnknownSignal(_) => TerminationReason::UnknownSignal,
            ChildFault::UnknownKill(_) => TerminationReason::UnknownKill,
            ChildFault::UnexpCont { .. } => TerminationReason::UnexpCont,
            ChildFault::Sabotage(_) => TerminationReason::Sabotage,
        }
    }

    pub fn explanation(&self) -> Explanation {
        match self {
            ChildFault::IllegalSyscall(info) => Explanation::IllegalSyscall(*info),
            ChildFault::Enomem(Some(status)) => Explanation::RawStatus(*status),
            ChildFault::UnknownKill(Some(status)) => Explanation::RawStatus(*status),
            ChildFault::UnknownSignal(sig) => Explanation::RawStatus(*sig),
            _ => Explanation::None,
        }
    }

    /// Reclassify an `UnknownKill`/`UnknownSignal` once the raw
    /// waitpid status is known to actually be a seccomp kill or a CPU
    /// timeout, mirroring `finish_after_error` in the original.
    pub fn reclassify(self, cpu_exceed_signal: i32) -> ChildFault {
        match self {
            ChildFault::UnknownKill(Some(status)) => {
                let wtermsig = status & 0x7f;
                if wtermsig == libc::SIGSYS {
                    return ChildFault::Seccomp;
                }
                ChildFault::UnknownKill(Some(status))
            }
            ChildFault::UnknownSignal(sig) if sig == cpu_exceed_signal => ChildFault::XCpuTime,
            other => other,
        }
    }
}

/// The per-player termination record sent out in the result record:
/// either `0` (clean shutdown) or `[reason_tag, explanation]`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FinalState {
    Clean(u8),
    Terminated(&'static str, Explanation),
}

impl FinalState {
    pub fn clean() -> FinalState {
        FinalState::Clean(0)
    }

    pub fn from_fault(fault: &ChildFault) -> FinalState {
        FinalState::Terminated(fault.reason().tag(), fault.explanation())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_match_original_two_letter_codes() {
        assert_eq!(TerminationReason::IllegalSyscall.tag(), "IS");
        assert_eq!(TerminationReason::Enomem.tag(), "EM");
        assert_eq!(TerminationReason::UnknownKill.tag(), "UK");
        assert_eq!(TerminationReason::UnknownSignal.tag(), "US");
        assert_eq!(TerminationReason::UnexpCont.tag(), "UC");
        assert_eq!(TerminationReason::Sabotage.tag(), "CS");
        assert_eq!(TerminationReason::XCpuTime.tag(), "XT");
        assert_eq!(TerminationReason::Seccomp.tag(), "SP");
    }

    #[test]
    fn unknown_kill_with_sigsys_status_reclassifies_to_seccomp() {
        let status = libc::SIGSYS; // WIFSIGNALED low byte == SIGSYS, WTERMSIG == SIGSYS
        let fault = ChildFault::UnknownKill(Some(status)).reclassify(libc::SIGUSR1);
        assert!(matches!(fault, ChildFault::Seccomp));
    }

    #[test]
    fn unknown_signal_matching_cpu_exceed_signal_reclassifies() {
        let fault = ChildFault::UnknownSignal(libc::SIGUSR1).reclassify(libc::SIGUSR1);
        assert!(matches!(fault, ChildFault::XCpuTime));
    }

    #[test]
    fn clean_final_state_serializes_as_bare_zero() {
        let s = serde_json::to_string(&FinalState::clean()).unwrap();
        assert_eq!(s, "0");
    }

    #[test]
    fn terminated_final_state_serializes_as_pair() {
        let fault = ChildFault::IllegalSyscall(IllegalSyscallInfo { syscall_nr: 60, arg0: -1, arg2: -1 });
        let s = serde_json::to_string(&FinalState::from_fault(&fault)).unwrap();
        assert_eq!(s, r#"["IS",[60,-1,-1]]"#);
    }
}
