//! The reference referee: a minimal 10x10 grid tank battle. Ported
//! from `games/tanks/main.py`; constants, damage numbers, and board
//! size are kept byte-for-byte so that existing fight replays/fixtures
//! stay meaningful.

use crate::referee::{result_tag, PlayerController, PlayerLimits, PlayerOutcome, Referee, ReportEnvelope};
use rand::seq::SliceRandom;
use serde_json::{json, Value as Json};

const MAX_GAME_TICKS: u32 = 100;
const BOARD_WIDTH: i32 = 10;
const BOARD_HEIGHT: i32 = 10;

const UP: char = 'U';
const RIGHT: char = 'R';
const DOWN: char = 'D';
const LEFT: char = 'L';

const D_MOVE: &str = "M";
const D_FIRE: &str = "F";
const D_NOTHING: &str = "N";

const MISSILE_1_DAMAGE: i64 = 20;
const MISSILE_2_DAMAGE: i64 = 50;
const CRASH_DAMAGE: i64 = 10;
const MISSILE_RAND_RADIUS: i32 = 1;

const DECIDE_FUNC_NAME: &str = "decide_tick";

/// The tick-limit-exceeded explanation code surfaced to the frontend
/// (`TanksExplanation.X_TICK_LIMIT` in the original).
const X_TICK_LIMIT: &str = "X";

/// A pending missile: the destination the player named, and — only
/// when fired in the same tick as a move — a destination randomized
/// within `MISSILE_RAND_RADIUS` of it.
#[derive(Clone, Debug)]
struct Missile {
    dest: [i32; 2],
    randomized: Option<[i32; 2]>,
}

impl Missile {
    fn to_json(&self) -> Json {
        json!([self.dest, self.randomized])
    }
}

#[derive(Clone, Debug)]
struct PlayerState {
    x: i32,
    y: i32,
    health: i64,
    head: char,
    moved: bool,
    targeted: Option<Missile>,
}

impl PlayerState {
    /// Flow/report form: a positional array (`list(i.values())` in
    /// the original).
    fn to_json(&self) -> Json {
        json!([self.x, self.y, self.health, self.head.to_string(), self.moved, self.targeted.as_ref().map(Missile::to_json)])
    }

    /// Live form handed to player code as `my_state`/`enemy_state`: a
    /// named object, matching the plain dict the original passes
    /// straight from `self.players_states[i]`.
    fn to_live_json(&self) -> Json {
        json!({
            "x": self.x,
            "y": self.y,
            "health": self.health,
            "head": self.head.to_string(),
            "moved": self.moved,
            "targeted": self.targeted.as_ref().map(Missile::to_json),
        })
    }
}

pub struct Tanks {
    player_count: usize,
    players_alive: Vec<usize>,
    board: Vec<Vec<Vec<usize>>>,
    missiles: [Option<Missile>; 2],
    players_states: [PlayerState; 2],
    flow: Vec<Json>,
    /// `[tag, detail]`, e.g. `["D", "L"]` or `["W", 0]` — ground truth
    /// taken directly from the reference fixtures (spec.md §8 S2-S4),
    /// not the generic per-player array §3 describes in the abstract.
    result: Json,
    explanation: Json,
}

fn win_result(winner: usize) -> Json {
    json!([result_tag::WIN, winner])
}

fn draw_both_lost_result() -> Json {
    json!([result_tag::DRAW, result_tag::BOTH_LOST])
}

fn draw_tick_limit_result() -> Json {
    json!([result_tag::DRAW, X_TICK_LIMIT])
}

impl Tanks {
    pub fn new(player_count: usize) -> Tanks {
        assert_eq!(player_count, 2, "tanks is a 2-player game for now");
        Tanks {
            player_count,
            players_alive: vec![0, 1],
            board: vec![vec![Vec::new(); BOARD_HEIGHT as usize]; BOARD_WIDTH as usize],
            missiles: [None, None],
            players_states: [
                PlayerState { x: 0, y: 0, health: 100, head: RIGHT, moved: false, targeted: None },
                PlayerState { x: BOARD_WIDTH - 1, y: BOARD_HEIGHT - 1, health: 100, head: LEFT, moved: false, targeted: None },
            ],
            flow: Vec::new(),
            result: draw_both_lost_result(),
            explanation: json!(""),
        }
    }

    fn snapshot(&self) -> Json {
        json!(self.players_states.iter().map(PlayerState::to_json).collect::<Vec<_>>())
    }

    fn randomize_dest(dest: [i32; 2]) -> [i32; 2] {
        let mut choices = Vec::new();
        for dx in -MISSILE_RAND_RADIUS..=MISSILE_RAND_RADIUS {
            for dy in -MISSILE_RAND_RADIUS..=MISSILE_RAND_RADIUS {
                let x = dest[0] + dx;
                let y = dest[1] + dy;
                if (0..BOARD_WIDTH).contains(&x) && (0..BOARD_HEIGHT).contains(&y) {
                    choices.push([x, y]);
                }
            }
        }
        *choices.choose(&mut rand::thread_rng()).expect("dest itself is always in range")
    }

    fn check_win_or_draw(&mut self) -> bool {
        let p1_died = self.players_states[self.players_alive[0]].health <= 0;
        let p2_died = self.players_states[self.players_alive[1]].health <= 0;

        if p1_died && p2_died {
            self.result = draw_both_lost_result();
            true
        } else if p1_died {
            self.result = win_result(self.players_alive[1]);
            true
        } else if p2_died {
            self.result = win_result(self.players_alive[0]);
            true
        } else {
            false
        }
    }

    /// Must run before decisions are applied for the tick.
    fn apply_damages(&mut self) {
        for pi in 0..2 {
            let Some(missile) = self.missiles[pi].take() else { continue };
            let dest = missile.randomized.unwrap_or(missile.dest);
            let hit_here: Vec<usize> = self.board[dest[0] as usize][dest[1] as usize].clone();
            for tank_pi in hit_here {
                let damage = if self.players_states[pi].moved { MISSILE_1_DAMAGE } else { MISSILE_2_DAMAGE };
                self.players_states[tank_pi].health -= damage;
            }
        }

        for &pi in &self.players_alive.clone() {
            let x = self.players_states[pi].x as usize;
            let y = self.players_states[pi].y as usize;
            if self.board[x][y].len() > 1 {
                self.players_states[pi].health -= CRASH_DAMAGE;
            }
        }
    }

    /// Validates and applies one player's decision for the tick.
    /// Anything malformed is silently ignored, mirroring the
    /// original's untyped, best-effort validation.
    fn apply_decisions(&mut self, i: usize, decision: &Json) {
        if decision.as_str() == Some(D_NOTHING) {
            return;
        }
        let Some(arr) = decision.as_array() else { return };
        if arr.is_empty() {
            return;
        }

        let items: Vec<&Json> = if arr[0].is_array() { arr.iter().collect() } else { vec![decision] };

        for d in items {
            let Some(d) = d.as_array() else { return };
            if d.len() != 2 {
                return;
            }
            let Some(kind) = d[0].as_str() else { return };

            if kind == D_FIRE {
                let Some(dest) = d[1].as_array() else { return };
                if dest.len() != 2 {
                    return;
                }
                let (Some(dx), Some(dy)) = (dest[0].as_i64(), dest[1].as_i64()) else { return };
                self.missiles[i] = Some(Missile { dest: [dx as i32, dy as i32], randomized: None });
            } else if kind == D_MOVE {
                let Some(direction) = d[1].as_str().and_then(|s| s.chars().next()) else { return };
                if !matches!(direction, 'U' | 'R' | 'D' | 'L') {
                    return;
                }

                let prev_x = self.players_states[i].x;
                let prev_y = self.players_states[i].y;
                let mut x = prev_x;
                let mut y = prev_y;
                match direction {
                    'U' => y += 1,
                    'R' => x += 1,
                    'D' => y -= 1,
                    _ => x -= 1,
                }

                if (0..BOARD_WIDTH).contains(&x) && (0..BOARD_HEIGHT).contains(&y) {
                    self.players_states[i].x = x;
                    self.players_states[i].y = y;
                    self.board[prev_x as usize][prev_y as usize].retain(|&p| p != i);
                    self.board[x as usize][y as usize].push(i);
                    self.players_states[i].head = direction;
                    self.players_states[i].moved = true;
                }
            }
        }

        if self.players_states[i].moved {
            if let Some(missile) = self.missiles[i].as_mut() {
                missile.randomized = Some(Tanks::randomize_dest(missile.dest));
            }
        }
        self.players_states[i].targeted = self.missiles[i].clone();
    }

    fn get_decision(
        &mut self,
        controllers: &mut [Option<Box<dyn PlayerController>>],
        i: usize,
        tick: u32,
        my_state: Json,
        enemy_state: Json,
    ) -> Option<Json> {
        let outcome = controllers[i].as_mut().expect("alive player must have a controller").call(
            DECIDE_FUNC_NAME,
            vec![Json::from(tick), my_state, enemy_state],
        );
        match outcome {
            PlayerOutcome::Eliminated => {
                self.players_alive.retain(|&x| x != i);
                None
            }
            PlayerOutcome::Errored => Some(Json::String(D_NOTHING.to_string())),
            PlayerOutcome::Value(Json::Null) => Some(Json::String(D_NOTHING.to_string())),
            PlayerOutcome::Value(v) => Some(v),
        }
    }
}

impl Referee for Tanks {
    fn get_limits(&self) -> PlayerLimits {
        PlayerLimits { cpu_sec: 1, cpu_nsec: 0, mem_bytes: 70_000_000 }
    }

    fn simulate(&mut self, controllers: &mut [Option<Box<dyn PlayerController>>]) {
        // A player whose sandbox never reached "ready" (spec.md §8 S5)
        // arrives here as a `None` slot; treat it as already eliminated
        // rather than the constructor's optimistic default of "both alive".
        self.players_alive = (0..self.player_count).filter(|&i| controllers[i].is_some()).collect();

        self.flow.push(self.snapshot());

        if self.players_alive.is_empty() {
            self.result = draw_both_lost_result();
            return;
        }
        if self.players_alive.len() == 1 {
            self.result = win_result(self.players_alive[0]);
            return;
        }

        self.board[0][0].push(self.players_alive[0]);
        self.board[(BOARD_WIDTH - 1) as usize][(BOARD_HEIGHT - 1) as usize].push(self.players_alive[1]);

        let mut tick = 0;
        loop {
            if tick >= MAX_GAME_TICKS {
                self.result = draw_tick_limit_result();
                return;
            }

            self.apply_damages();
            if self.check_win_or_draw() {
                break;
            }

            let p0 = self.players_alive[0];
            let p1 = self.players_alive[1];
            let s0 = self.players_states[p0].to_live_json();
            let s1 = self.players_states[p1].to_live_json();

            let decision1 = self.get_decision(controllers, p0, tick, s0.clone(), s1.clone());
            let decision2 = self.get_decision(controllers, p1, tick, s1, s0);

            match (decision1, decision2) {
                (None, None) => {
                    self.result = draw_both_lost_result();
                    return;
                }
                (None, Some(_)) => {
                    self.result = win_result(p1);
                    return;
                }
                (Some(_), None) => {
                    self.result = win_result(p0);
                    return;
                }
                (Some(d0), Some(d1)) => {
                    for &pi in &self.players_alive.clone() {
                        self.players_states[pi].moved = false;
                        self.players_states[pi].targeted = None;
                    }
                    self.apply_decisions(p0, &d0);
                    self.apply_decisions(p1, &d1);
                }
            }

            if self.check_win_or_draw() {
                break;
            }

            self.flow.push(self.snapshot());
            tick += 1;
        }

        for &pi in &self.players_alive.clone() {
            self.players_states[pi].moved = false;
            self.players_states[pi].targeted = None;
        }
        self.flow.push(self.snapshot());
    }

    fn get_report(&self) -> Json {
        ReportEnvelope {
            result: self.result.clone(),
            scores: None,
            explanation: self.explanation.clone(),
            data: Json::Array(self.flow.clone()),
        }
        .to_json()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{CallOutcome, PlayerScript};

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

    fn script_player(code: &str) -> Option<Box<dyn PlayerController>> {
        Some(Box::new(ScriptController(PlayerScript::compile(code).unwrap())))
    }

    const MOVE_TO_X9Y9: &str = r#"
        fn go_toward(state, x, y) {
            if state.x > x { return "L"; }
            if state.x < x { return "R"; }
            if state.y > y { return "D"; }
            if state.y < y { return "U"; }
            ()
        }
        fn decide_tick(tick, my_state, enemy_state) {
            let move = go_toward(my_state, 9, 9);
            if move != () {
                return ["M", move];
            }
            ()
        }
    "#;

    #[test]
    fn both_players_run_into_the_wall_and_draw() {
        let mut controllers = [script_player(MOVE_TO_X9Y9), script_player(MOVE_TO_X9Y9)];
        let mut tanks = Tanks::new(2);
        tanks.simulate(&mut controllers);
        assert_eq!(tanks.get_report()[0], json!(["D", "L"]));
    }

    #[test]
    fn tick_limit_is_reported_when_one_side_never_converges() {
        // Neither player ever moves or fires, so neither dies; the
        // fight runs out the clock at MAX_GAME_TICKS.
        const STAY: &str = "fn decide_tick(tick, my_state, enemy_state) { () }";
        let mut controllers = [script_player(STAY), script_player(STAY)];
        let mut tanks = Tanks::new(2);
        tanks.simulate(&mut controllers);
        assert_eq!(tanks.get_report()[0], json!(["D", "X"]));
    }

    #[test]
    fn accurate_fire_without_moving_wins() {
        const FIRE_9_9: &str = r#"
            fn decide_tick(tick, my_state, enemy_state) { ["F", [9, 9]] }
        "#;
        const STAY: &str = "fn decide_tick(tick, my_state, enemy_state) { () }";
        let mut controllers = [script_player(FIRE_9_9), script_player(STAY)];
        let mut tanks = Tanks::new(2);
        tanks.simulate(&mut controllers);
        assert_eq!(tanks.get_report()[0], json!(["W", 0]));
    }
}
