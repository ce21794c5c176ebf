//! End-to-end fixtures for the reference referee, `Tanks`, driven
//! through its public `Referee` trait against `rhai`-scripted players
//! rather than a live ptrace sandbox (spec.md "Test tooling": the same
//! split the original draws between `simulator/tests/base.py`'s
//! live-worker harness and `games/tanks/tests/test_report.py`'s
//! in-process fake controller). Reproduces the S2-S4 ground-truth
//! fixtures from spec.md §8, but against the crate's public API rather
//! than reaching into `games::tanks`'s own unit tests, and checks the
//! whole result-record shape a referee hands back to component F, not
//! just the `result` tag.

use fightsim::games::tanks::Tanks;
use fightsim::referee::{PlayerController, PlayerOutcome, Referee};
use fightsim::script::{CallOutcome, PlayerScript};
use fightsim::termination::FinalState;
use serde_json::json;

struct ScriptPlayer(PlayerScript);

impl PlayerController for ScriptPlayer {
    fn call(&mut self, f: &str, args: Vec<serde_json::Value>) -> PlayerOutcome {
        match self.0.call(f, args) {
            CallOutcome::Value(v) => PlayerOutcome::Value(v),
            CallOutcome::Errored => PlayerOutcome::Errored,
            CallOutcome::Eliminated => PlayerOutcome::Eliminated,
        }
    }
}

fn player(code: &str) -> Option<Box<dyn PlayerController>> {
    Some(Box::new(ScriptPlayer(PlayerScript::compile(code).expect("player script must compile"))))
}

/// Moves greedily toward (9, 9) every tick, regardless of which corner
/// the player started in, mirroring spec.md §8 S2's "both players'
/// code moves ... toward the same corner".
const RUSH_TOP_RIGHT: &str = r#"
    fn go_toward(state, x, y) {
        if state.x > x { return "L"; }
        if state.x < x { return "R"; }
        if state.y > y { return "D"; }
        if state.y < y { return "U"; }
        ()
    }
    fn decide_tick(tick, my_state, enemy_state) {
        let dir = go_toward(my_state, 9, 9);
        if dir != () { return ["M", dir]; }
        ()
    }
"#;

const HOLD_POSITION: &str = "fn decide_tick(tick, my_state, enemy_state) { () }";

/// Moves to (0, 9) -- a corner neither starting tank occupies -- so it
/// never crashes into a stationary opponent (spec.md §8 S3).
const MOVE_TO_EMPTY_CORNER: &str = r#"
    fn decide_tick(tick, my_state, enemy_state) {
        if my_state.y < 9 { return ["M", "U"]; }
        if my_state.x > 0 { return ["M", "L"]; }
        ()
    }
"#;

/// A full result-record assembly: the referee's `get_report()` plus a
/// `FinalState::clean()` per surviving player, exactly the shape
/// `orchestrator::run_fight` hands to component F (spec.md §3
/// `PerPlayerOutcome`, universal invariant 1: one entry per player, in
/// request order).
fn assemble_final_states(n: usize) -> Vec<FinalState> {
    (0..n).map(|_| FinalState::clean()).collect()
}

/// Spec.md §8 S2: both players rush the same corner and crash
/// repeatedly until both die in the same tick -> a "both lost" draw.
#[test]
fn s2_both_players_rush_same_corner_draw_by_crash() {
    let mut controllers = [player(RUSH_TOP_RIGHT), player(RUSH_TOP_RIGHT)];
    let mut tanks = Tanks::new(2);
    tanks.simulate(&mut controllers);

    let report = tanks.get_report();
    assert_eq!(report[0], json!(["D", "L"]));
    assert_eq!(report.as_array().unwrap().len(), 3, "has_scores=false report is [result, explanation, data]");

    let final_states = assemble_final_states(2);
    assert_eq!(serde_json::to_value(&final_states).unwrap(), json!([0, 0]));
}

/// Spec.md §8 S3: one player moves to a corner, the other holds;
/// neither dies, so the fight exhausts its tick budget as a draw.
#[test]
fn s3_tick_limit_draw_when_neither_side_dies() {
    let mut controllers = [player(MOVE_TO_EMPTY_CORNER), player(HOLD_POSITION)];
    let mut tanks = Tanks::new(2);
    tanks.simulate(&mut controllers);

    assert_eq!(tanks.get_report()[0], json!(["D", "X"]));
}

/// Spec.md §8 S4: player 0 fires accurately every tick without
/// moving; player 1 never acts and is worn down to zero health.
#[test]
fn s4_accurate_missile_fire_wins_without_moving() {
    let fire_at_enemy_corner = r#"
        fn decide_tick(tick, my_state, enemy_state) { ["F", [9, 9]] }
    "#;
    let mut controllers = [player(fire_at_enemy_corner), player(HOLD_POSITION)];
    let mut tanks = Tanks::new(2);
    tanks.simulate(&mut controllers);

    assert_eq!(tanks.get_report()[0], json!(["W", 0]));
    assert_eq!(serde_json::to_value(&assemble_final_states(2)).unwrap(), json!([0, 0]));
}

/// Spec.md §4.D step 2: a player whose sandbox never reached "ready"
/// arrives at `simulate` as a `None` controller slot; the survivor
/// wins outright without the referee needing to special-case it.
#[test]
fn player_missing_at_simulate_start_loses_by_default() {
    let mut controllers: [Option<Box<dyn PlayerController>>; 2] = [None, player(HOLD_POSITION)];
    let mut tanks = Tanks::new(2);
    tanks.simulate(&mut controllers);

    assert_eq!(tanks.get_report()[0], json!(["W", 1]));
}
