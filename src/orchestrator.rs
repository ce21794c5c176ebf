//! Component D: the per-fight simulation orchestrator (spec.md §4.D).
//! Resolves the referee, starts one sandbox controller per player,
//! drives `Referee::simulate`, and folds the result back into the
//! `{report, final_states}` shape component F forwards to the result
//! stream. Grounded on `process()` in `simulator/entry.py`.

use crate::config::WorkerContext;
use crate::forkserver::ForkServerLink;
use crate::games;
use crate::referee::{PlayerController, PlayerOutcome};
use crate::sandbox::SandboxController;
use crate::termination::{ChildFault, FinalState};
use crate::tracer::Tracer;
use serde_json::Value as Json;
use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

/// One fight's work order, as handed off by component F after pulling
/// it off the request stream (spec.md §3 `FightRequest`). Player index
/// is position in `code_paths`.
#[derive(Clone, Debug)]
pub struct FightRequest {
    pub fight_id: Json,
    pub game_name: String,
    pub game_settings: Json,
    pub code_paths: Vec<PathBuf>,
}

/// What `run_fight` hands back to component F: the referee's own
/// report (already an ordered JSON tuple/array — see `referee.rs`)
/// plus one `FinalState` per player, in request order (spec.md §3
/// `PerPlayerOutcome`).
#[derive(Debug)]
pub struct FightResult {
    pub report: Json,
    pub final_states: Vec<FinalState>,
}

/// Read a player's code file, mapping any non-UTF-8 content to an
/// empty string rather than failing the fight — the original treats a
/// bytes-formatted upload as "no code" (`get_code` in `simulator/entry.py`),
/// and an empty script simply fails to declare any function, which the
/// sandbox already handles as an ordinary illegal-syscall-at-exit
/// termination (spec.md §8 S5).
fn read_code(path: &std::path::Path) -> anyhow::Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(String::from_utf8(bytes).unwrap_or_default())
}

/// Adapts one player's `SandboxController` to the referee-facing
/// `PlayerController` trait, sharing the fight's single `Tracer` and
/// `ForkServerLink` with every other player's adapter. Both are kept
/// behind `Rc<RefCell<_>>` rather than threaded through as borrows:
/// the orchestrator is strictly single-threaded per fight (spec.md §5),
/// so the `RefCell` is never contended, but the referee trait itself
/// has no way to hand a `&mut Tracer` down through `simulate`.
struct SandboxPlayer {
    controller: Option<SandboxController>,
    tracer: Rc<RefCell<Tracer>>,
    forkserver: Rc<RefCell<ForkServerLink>>,
    final_state: Option<FinalState>,
}

impl SandboxPlayer {
    fn eliminate(&mut self, fault: ChildFault) {
        let Some(controller) = self.controller.take() else { return };
        let mut tracer = self.tracer.borrow_mut();
        let mut forkserver = self.forkserver.borrow_mut();
        self.final_state = Some(controller.into_fault(&mut tracer, &mut forkserver, fault));
    }
}

impl PlayerController for SandboxPlayer {
    fn call(&mut self, f: &str, args: Vec<Json>) -> PlayerOutcome {
        let Some(controller) = self.controller.as_mut() else {
            return PlayerOutcome::Eliminated;
        };

        let outcome = {
            let mut tracer = self.tracer.borrow_mut();
            controller.run_command(&mut tracer, f, args)
        };

        match outcome {
            Ok(Some(v)) => PlayerOutcome::Value(v),
            Ok(None) => PlayerOutcome::Errored,
            Err(fault) => {
                self.eliminate(fault);
                PlayerOutcome::Eliminated
            }
        }
    }

    /// Normal teardown for a player still alive once `simulate`
    /// returns (spec.md §4.D step 5); a player already eliminated
    /// mid-fight just reports the state recorded back then.
    fn finish(&mut self) -> FinalState {
        if let Some(controller) = self.controller.take() {
            let mut tracer = self.tracer.borrow_mut();
            let mut forkserver = self.forkserver.borrow_mut();
            self.final_state = Some(controller.finish(&mut tracer, &mut forkserver));
        }
        self.final_state.clone().unwrap_or_else(FinalState::clean)
    }
}

/// Run one fight to completion (spec.md §4.D steps 1-6). `tracer` and
/// `forkserver` are already attached to a freshly-started forkserver
/// container; the caller (the worker binary) owns their lifecycle
/// across fights.
pub fn run_fight(
    ctx: &WorkerContext,
    tracer: Rc<RefCell<Tracer>>,
    forkserver: Rc<RefCell<ForkServerLink>>,
    request: &FightRequest,
) -> anyhow::Result<FightResult> {
    let player_count = request.code_paths.len();
    let mut referee = games::build_referee(&request.game_name, player_count, &request.game_settings)?;
    let limits = referee.get_limits();

    let mut controllers: Vec<Option<Box<dyn PlayerController>>> = Vec::with_capacity(player_count);
    let mut startup_faults: Vec<Option<FinalState>> = Vec::with_capacity(player_count);

    for path in &request.code_paths {
        let code = read_code(path)?;
        let started = {
            let mut t = tracer.borrow_mut();
            let mut fs = forkserver.borrow_mut();
            SandboxController::start(
                &mut t,
                &mut fs,
                ctx,
                code,
                request.game_settings.clone(),
                limits.cpu_sec,
                limits.cpu_nsec,
                limits.mem_bytes,
            )
        };

        match started {
            Ok(controller) => {
                let player = SandboxPlayer {
                    controller: Some(controller),
                    tracer: Rc::clone(&tracer),
                    forkserver: Rc::clone(&forkserver),
                    final_state: None,
                };
                controllers.push(Some(Box::new(player)));
                startup_faults.push(None);
            }
            Err(fault) => {
                controllers.push(None);
                startup_faults.push(Some(FinalState::from_fault(&fault)));
            }
        }
    }

    referee.simulate(&mut controllers);

    let final_states: Vec<FinalState> = controllers
        .into_iter()
        .zip(startup_faults)
        .map(|(slot, startup_fault)| match slot {
            Some(mut player) => player.finish(),
            None => startup_fault.unwrap_or_else(FinalState::clean),
        })
        .collect();

    Ok(FightResult { report: referee.get_report(), final_states })
}
