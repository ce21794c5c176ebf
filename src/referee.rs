//! Component E: the `Referee` trait and the shared report/limit types
//! every game plugin produces, replacing the original's
//! dynamically-imported `GAME_CLASSES` dict (spec.md §5, §9 REDESIGN
//! FLAGS: "compile-time registry of referees instead of `getattr`
//! dispatch").

use crate::termination::FinalState;
use serde_json::{json, Value as Json};

/// What a player's `decide_tick`-style call came back as, from the
/// referee's point of view. `Value` covers both a genuine return
/// value and a legitimate `null`; `Errored` is "the player's code
/// raised, but the sandbox protocol is still intact"; `Eliminated` is
/// "the sandbox itself reports this player can no longer continue"
/// (spec.md §4.C; mirrors the original `CRController.run_command`
/// three-way outcome).
pub enum PlayerOutcome {
    Value(Json),
    Errored,
    Eliminated,
}

/// Abstracts over how a referee actually reaches a player's code.
/// `SandboxController` is the real, ptrace-backed implementation; game
/// unit tests use a script-backed fake that skips sandboxing entirely
/// (spec.md "Test tooling").
pub trait PlayerController {
    fn call(&mut self, f: &str, args: Vec<Json>) -> PlayerOutcome;

    /// Tear down whatever resources this player holds once the referee
    /// is done with it, win or lose. The sandbox-backed implementation
    /// kills and reaps its child (if it hasn't already been eliminated)
    /// and reports the resulting [`FinalState`]; test fakes that have
    /// nothing to tear down can leave this at its default.
    fn finish(&mut self) -> FinalState {
        FinalState::clean()
    }
}

/// Resource limits a referee declares for its players, handed to
/// `SandboxController::start` before any player code runs (spec.md
/// §4.B/§4.C, `Game.get_limits` in the original).
#[derive(Copy, Clone, Debug)]
pub struct PlayerLimits {
    pub cpu_sec: u64,
    pub cpu_nsec: u32,
    pub mem_bytes: u64,
}

/// Tags used inside a game's own `result` encoding. §3 describes the
/// generic shape in the abstract (draw sentinel vs. per-player
/// win/loss array vs. integer ranks), but the ground-truth fixtures
/// for Tanks (spec.md §8 S2-S4) show a game-specific two-element
/// `[tag, detail]` pairing instead — e.g. `["D", "X"]` for a
/// tick-limit draw, `["W", 0]` for player 0 winning. Since the two
/// reference versions of this encoding disagree and the fixtures are
/// the named ground truth, `ReportEnvelope::result` is left as plain
/// JSON: each `Referee` builds whatever shape its own fixtures expect
/// rather than being forced through one fixed enum.
pub mod result_tag {
    pub const DRAW: &str = "D";
    pub const WIN: &str = "W";
    /// Draw sub-kind: both players eliminated by damage, no tick limit involved.
    pub const BOTH_LOST: &str = "L";
}

/// What a standard `Referee::simulate` hands back: result, optional
/// per-player scores, a free-form explanation, and the full
/// step-by-step `data`/`flow` the frontend replays (spec.md §3, §5).
/// On the wire this is an ordered JSON array of length 3 or 4 — *not*
/// a JSON object — matching `games/_base/game.py`'s `get_report`
/// docstring ("a game report must be an iterable of length 3 or 4").
/// `ReportEnvelope` is a convenience builder most games use; it is not
/// forced on every `Referee` because the original's own `testgame1`
/// deliberately does not follow it (`get_report` there just returns
/// whatever `run_command` gave back — see `games::testgame`), so
/// `Referee::get_report` returns plain `Json` and each game decides its
/// own shape.
#[derive(Clone, Debug)]
pub struct ReportEnvelope {
    pub result: Json,
    pub scores: Option<Vec<i64>>,
    pub explanation: Json,
    pub data: Json,
}

impl ReportEnvelope {
    /// Encode as the ordered tuple spec.md §3 describes: `[result,
    /// (scores), explanation, data]`.
    pub fn to_json(&self) -> Json {
        let mut items = vec![self.result.clone()];
        if let Some(scores) = &self.scores {
            items.push(json!(scores));
        }
        items.push(self.explanation.clone());
        items.push(self.data.clone());
        Json::Array(items)
    }
}

/// One game plugin. Constructed fresh per fight by the registry in
/// `games::build_referee`; `simulate` drives the whole fight to
/// completion and `get_report` extracts the final, frontend-facing
/// record (spec.md §5).
pub trait Referee {
    fn get_limits(&self) -> PlayerLimits;

    /// Run the fight to completion, calling into `controllers` as
    /// needed. `controllers[i]` is `None` once player `i` has been
    /// removed from play.
    fn simulate(&mut self, controllers: &mut [Option<Box<dyn PlayerController>>]);

    /// The `report` field of the result record (spec.md §3). Most
    /// games build this with [`ReportEnvelope::to_json`]; a handful of
    /// test-only games (spec.md §8 S1) return a narrower shape.
    fn get_report(&self) -> Json;
}
