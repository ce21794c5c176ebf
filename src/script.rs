//! Player-code execution, via the `rhai` scripting engine.
//!
//! The original hands untrusted code to CPython's own `exec()` and
//! looks up a `Main` class's methods with `getattr` (`games/_tests/coderunner.py`,
//! `simulator/coderunner/run.py`). Neither of those exist without a
//! full language runtime sitting inside the sandbox, which is exactly
//! the attack surface ptrace/seccomp are there to shrink. `rhai` is a
//! pure-Rust, allocation-only embeddable script engine: running a
//! script never issues a syscall beyond whatever `malloc` needs, which
//! is precisely the allowlist the sandbox already carries (spec.md §4.B,
//! §9 REDESIGN FLAGS).
//!
//! Player code defines top-level functions (`decide_tick`, etc.)
//! instead of a `Main` class; `context`/state dictionaries cross the
//! boundary as plain rhai maps via `rhai::serde`. Rhai's script-level
//! functions are pure and don't close over outer-scope variables (by
//! design, so a function's behavior never depends on hidden state);
//! player code that wants memory across ticks keeps it in an object
//! map it threads through its own arguments and return values, rather
//! than in a `self`-like instance the way the original's `Main` class
//! could.

use rhai::{Dynamic, Engine, Scope, AST};
use serde_json::Value as Json;

/// What calling a player-declared function came back as.
pub enum CallOutcome {
    Value(Json),
    /// The function body ran but raised/returned something that
    /// doesn't round-trip through JSON.
    Errored,
    /// No function by that name is declared in the script.
    Eliminated,
}

/// One compiled player script. `scope` holds the top-level `let`
/// bindings the script ran at load time (read-only from inside its
/// functions, same as any rhai script).
pub struct PlayerScript {
    engine: Engine,
    ast: AST,
    scope: Scope<'static>,
}

impl PlayerScript {
    /// Compile `code`. Any parse error is surfaced as `Err`, to be
    /// treated exactly like a failed `exec()` in the original: the
    /// player never becomes alive.
    pub fn compile(code: &str) -> Result<PlayerScript, String> {
        let mut engine = Engine::new();
        engine.set_max_operations(50_000_000);
        engine.set_max_expr_depths(64, 64);

        let ast = engine.compile(code).map_err(|e| e.to_string())?;
        let mut scope = Scope::new();
        engine.run_ast_with_scope(&mut scope, &ast).map_err(|e| e.to_string())?;

        Ok(PlayerScript { engine, ast, scope })
    }

    /// Call `name(args...)`. A function that isn't declared at all
    /// eliminates the player (`CallOutcome::Eliminated`); any other
    /// failure (a runtime panic inside the script, or a return value
    /// that isn't JSON-representable) is `CallOutcome::Errored` and
    /// does not eliminate the player, matching
    /// `games/_tests/coderunner.py`'s two-tier exception handling.
    pub fn call(&mut self, name: &str, args: Vec<Json>) -> CallOutcome {
        let dyn_args: Vec<Dynamic> =
            args.into_iter().map(|j| rhai::serde::to_dynamic(&j).unwrap_or(Dynamic::UNIT)).collect();

        match self.engine.call_fn::<Dynamic>(&mut self.scope, &self.ast, name, dyn_args) {
            Ok(value) => match rhai::serde::from_dynamic::<Json>(&value) {
                Ok(json) => CallOutcome::Value(json),
                Err(_) => CallOutcome::Errored,
            },
            Err(err) => {
                if matches!(*err, rhai::EvalAltResult::ErrorFunctionNotFound(..)) {
                    CallOutcome::Eliminated
                } else {
                    CallOutcome::Errored
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calls_a_declared_function() {
        let mut script = PlayerScript::compile("fn double(x) { x * 2 }").unwrap();
        match script.call("double", vec![Json::from(21)]) {
            CallOutcome::Value(v) => assert_eq!(v, Json::from(42)),
            _ => panic!("expected a value"),
        }
    }

    #[test]
    fn missing_function_eliminates() {
        let mut script = PlayerScript::compile("fn foo() { 1 }").unwrap();
        assert!(matches!(script.call("bar", vec![]), CallOutcome::Eliminated));
    }

    #[test]
    fn object_map_argument_threads_state_through_return_value() {
        let mut script =
            PlayerScript::compile("fn bump(state) { state.tt += 1; state }").unwrap();
        let state = Json::from(serde_json::json!({"tt": 0}));
        match script.call("bump", vec![state]) {
            CallOutcome::Value(v) => assert_eq!(v["tt"], Json::from(1)),
            _ => panic!("expected a value"),
        }
    }

    #[test]
    fn runtime_error_does_not_eliminate() {
        let mut script = PlayerScript::compile("fn boom() { throw \"nope\"; }").unwrap();
        assert!(matches!(script.call("boom", vec![]), CallOutcome::Errored));
    }
}
