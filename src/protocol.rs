//! Wire-level constants and framing shared between the host-side
//! sandbox controller (`sandbox.rs`) and the coderunner binary
//! (`bin/coderunner.rs`): control tokens, fixed fd numbers, and the
//! line-delimited JSON envelopes described in spec.md §6.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::io::{self, BufRead, Write};

/// Forkserver control tokens (§6).
pub mod forkserver_tokens {
    pub const FORK_CHILD: &str = "f";
    pub const CONTINUE: &str = "0";
}

/// Coderunner child control tokens (§6).
pub mod child_tokens {
    pub const CHILD_READY: &str = "3";
    pub const START_SIMULATION: &str = "4";
}

/// The fixed, pre-agreed fd quad a process dup2()s its pipe ends onto.
/// `r`/`w` are this process's own read/write ends; `_r`/`_w` are the far
/// ends, meant to be stolen by the supervisor via `pidfd_getfd` (§4.B
/// bootstrap step 2, §4.A `pidfd_getfd`).
#[derive(Copy, Clone, Debug)]
pub struct PipeFdQuad {
    pub r: i32,
    pub _w: i32,
    pub _r: i32,
    pub w: i32,
}

/// Default fd numbers from `simulator/settings.py::FORKSERVER_PIPES_FDS`.
pub const FORKSERVER_PIPE_FDS: PipeFdQuad = PipeFdQuad { r: 20, _w: 21, _r: 22, w: 23 };
/// Default fd numbers from `simulator/settings.py::FORKED_PIPES_FDS`.
pub const FORKED_PIPE_FDS: PipeFdQuad = PipeFdQuad { r: 30, _w: 31, _r: 32, w: 33 };

/// Strictly less than `CHILD_PIPE_SIZE`, per spec.md §6.
pub const CHILD_MAX_WRITE_SIZE: usize = 2048;
/// The pipe's own buffer size, set via `F_SETPIPE_SZ` in the child.
pub const CHILD_PIPE_SIZE: i32 = 4096;

/// The JSON envelope a freshly-forked child reads once, before it runs
/// any player code (§4.B bootstrap step 3).
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SetupEnvelope {
    pub code: String,
    pub context: Json,
    pub cpu_sec: u64,
    pub cpu_nsec: u32,
}

/// One command sent to a ready coderunner child: call `f(*args)` on
/// the player's instantiated object (§4.B command loop).
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CommandRequest {
    pub f: String,
    pub args: Vec<Json>,
}

/// The coderunner child's reply to a `CommandRequest`: either
/// `{"result": <json>}` on success, or `{}` on any exception.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct CommandReply {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Json>,
}

/// Line-delimited duplex talker over two already-open file
/// descriptors, mirroring `StreamTalker` in `simulator/entry.py` and
/// `build_talker` in `simulator/coderunner/run.py`: every message is
/// exactly one `\n`-terminated UTF-8 line (spec.md §6 "Pipe framing").
///
/// This type does no ptrace bookkeeping; the caller (`SandboxController`
/// on the host side, the coderunner's command loop on the tracee side)
/// is responsible for driving the tracer around each `send`/`recv` so
/// that the underlying read()/write() syscalls land where the tracer
/// expects them (spec.md §3 "PipeProtocolState" alternation invariant).
pub struct LineTalker<R, W> {
    reader: R,
    writer: W,
}

impl<R: BufRead, W: Write> LineTalker<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        LineTalker { reader, writer }
    }

    /// Write one line, appending the `\n` ourselves, then flush.
    pub fn send(&mut self, msg: &str) -> io::Result<()> {
        self.writer.write_all(msg.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }

    /// Read one line, discarding the trailing `\n`. Returns
    /// `Ok(None)` on EOF (the one and only writer, the coderunner
    /// child, is gone), matching the original's "BrokenPipeError /
    /// empty readline() raises `exc`" behavior, left for the caller to
    /// turn into the right `TerminationReason`.
    pub fn recv(&mut self) -> io::Result<Option<String>> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line)?;
        if n == 0 {
            return Ok(None);
        }
        if line.ends_with('\n') {
            line.pop();
        }
        Ok(Some(line))
    }
}

/// Compact-JSON encode, matching the original's
/// `json.dumps(separators=(',', ':'), ensure_ascii=True)` (spec.md §6:
/// "a compact JSON value").
pub fn compact_json(value: &impl Serialize) -> serde_json::Result<String> {
    serde_json::to_string(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn round_trips_a_single_line() {
        let mut out = Vec::new();
        {
            let mut talker = LineTalker::new(Cursor::new(Vec::<u8>::new()), &mut out);
            talker.send("hello").unwrap();
        }
        assert_eq!(out, b"hello\n");
    }

    #[test]
    fn recv_strips_trailing_newline() {
        let mut talker = LineTalker::new(Cursor::new(b"line one\n".to_vec()), Vec::new());
        assert_eq!(talker.recv().unwrap(), Some("line one".to_string()));
    }

    #[test]
    fn recv_returns_none_on_eof() {
        let mut talker = LineTalker::new(Cursor::new(Vec::<u8>::new()), Vec::new());
        assert_eq!(talker.recv().unwrap(), None);
    }

    #[test]
    fn command_reply_without_result_serializes_to_empty_object() {
        let reply = CommandReply::default();
        assert_eq!(compact_json(&reply).unwrap(), "{}");
    }

    #[test]
    fn command_reply_with_result_round_trips() {
        let reply = CommandReply { result: Some(serde_json::json!({"x": 1})) };
        let s = compact_json(&reply).unwrap();
        let back: CommandReply = serde_json::from_str(&s).unwrap();
        assert_eq!(back.result, Some(serde_json::json!({"x": 1})));
    }
}
