//! `testgame1`: a minimal referee whose only job is to exercise the
//! sandbox/wire protocol end to end, independent of any real game
//! logic. It makes exactly one `run_command` call, against whatever
//! `test_args` the fight request's own `game_settings` carried, and
//! reports back exactly what came back, unpacked and without an
//! envelope of its own (spec.md §8 S1). Not present in the original's
//! own game plugins — the original exercises this path with a Django
//! test fixture and a live Postgres-backed harness, neither of which
//! has a Rust-native equivalent worth carrying over, so this plugs the
//! same gap the pack's own protocol/unit tests do: a deliberately
//! trivial counterpart whose only purpose is wire fidelity.

use crate::referee::{PlayerController, PlayerLimits, PlayerOutcome, Referee};
use serde_json::Value as Json;

/// Matches the original asset's `get_limits` (`simulator/tests/assets/games/testgame1/main.py`).
const CPU_SEC: u64 = 5;
const CPU_NSEC: u32 = 0;
const MEM_BYTES: u64 = 70_000_000;

pub struct TestGame1 {
    test_args: Vec<Json>,
    report: Json,
}

impl TestGame1 {
    pub fn new(test_args: Vec<Json>) -> TestGame1 {
        TestGame1 { test_args, report: Json::Null }
    }
}

impl Referee for TestGame1 {
    fn get_limits(&self) -> PlayerLimits {
        PlayerLimits { cpu_sec: CPU_SEC, cpu_nsec: CPU_NSEC, mem_bytes: MEM_BYTES }
    }

    fn simulate(&mut self, controllers: &mut [Option<Box<dyn PlayerController>>]) {
        let Some(controller) = controllers[0].as_mut() else {
            return;
        };
        self.report = match controller.call("testfunc1", self.test_args.clone()) {
            PlayerOutcome::Value(v) => v,
            // Eliminated/errored both leave no result to report; the
            // controller itself already recorded the real termination
            // reason for `final_states`, and is left in place (not
            // `None`-ed out) so the orchestrator can still retrieve it.
            PlayerOutcome::Errored | PlayerOutcome::Eliminated => Json::Null,
        };
    }

    fn get_report(&self) -> Json {
        Json::Array(vec![self.report.clone()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{CallOutcome, PlayerScript};
    use serde_json::json;

    struct ScriptController(PlayerScript);

    impl PlayerController for ScriptController {
        fn call(&mut self, f: &str, args: Vec<Json>) -> PlayerOutcome {
            match self.0.call(f, args) {
                CallOutcome::Value(v) => PlayerOutcome::Value(v),
                CallOutcome::Errored => PlayerOutcome::Errored,
                CallOutcome::Eliminated => PlayerOutcome::Eliminated,
            }
        }
    }

    /// Spec.md §8 S1: a player echoing every argument back, index-keyed,
    /// round-trips every JSON type through a single call.
    #[test]
    fn echoes_every_json_type_back_index_keyed() {
        const CODE: &str = r#"
            fn testfunc1(a0, a1, a2, a3, a4, a5, a6) {
                #{ "0": a0, "1": a1, "2": a2, "3": a3, "4": a4, "5": a5, "6": a6 }
            }
        "#;
        let script = PlayerScript::compile(CODE).unwrap();
        let mut controllers: [Option<Box<dyn PlayerController>>; 1] = [Some(Box::new(ScriptController(script)))];

        let test_args = vec![
            json!("string"),
            json!(123),
            json!(["list", 321, {"nested": true}, ["yes"]]),
            json!({"key": "value"}),
            json!(true),
            json!(false),
            Json::Null,
        ];
        let mut game = TestGame1::new(test_args.clone());
        game.simulate(&mut controllers);

        let expected: Json = test_args
            .iter()
            .enumerate()
            .map(|(i, v)| (i.to_string(), v.clone()))
            .collect::<serde_json::Map<_, _>>()
            .into();
        assert_eq!(game.get_report(), json!([expected]));
    }

    #[test]
    fn missing_function_reports_null() {
        let script = PlayerScript::compile("fn something_else() { 1 }").unwrap();
        let mut controllers: [Option<Box<dyn PlayerController>>; 1] = [Some(Box::new(ScriptController(script)))];
        let mut game = TestGame1::new(vec![json!(1)]);
        game.simulate(&mut controllers);
        assert_eq!(game.get_report(), json!([Json::Null]));
    }
}
