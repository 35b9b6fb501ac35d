//! The per-level point transform pipeline.
//!
//! Each card level carries an ordered action list. Normalization folds
//! literal/static actions (a constant-rate spin, a scripted one-liner that is
//! equivalent to a native op) into native operations so only genuinely
//! dynamic expressions pay for sandboxed evaluation each tick — a pure
//! optimization with no observable effect.
//!
//! Evaluation maintains a running "current axis":
//! - `orient(d)` rotates the point so the current axis maps onto `d` and
//!   sets the axis to `d`;
//! - `spin(rate)` rotates about the current axis by `rate × elapsed`,
//!   where elapsed re-bases after a gating gap (see
//!   `SPIN_REBASE_GAP_TICKS`) so a gate re-opening never causes a
//!   catch-up jump;
//! - `orient_spin(d, rate)` orients onto `d` then spins about it;
//! - scripted mutations may reassign `rel` and compose the same native ops.

use std::collections::HashMap;
use std::f32::consts::TAU;
use std::sync::OnceLock;

use glam::{Quat, Vec3};
use regex::Regex;
use rhai::Dynamic;

use crate::card::{CardId, DisplayAction};
use crate::script_scope::{build_scope, take_mem, take_rel, CallLocals};
use crate::scripting::{
    begin_capture, references_point_locals, take_capture, ScriptHost, SlotKey,
};

/// Gap (in ticks) beyond which a gated spin re-bases its start tick instead
/// of catching up. Consecutive active ticks (gap 1) keep their phase; a
/// skipped tick re-bases. This is a policy knob, not a law.
pub const SPIN_REBASE_GAP_TICKS: f32 = 1.6;

/// A native transform operation, either folded from the action list or
/// captured from a script's helper calls.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NativeOp {
    Orient { dir: Vec3 },
    Spin { rate: f32 },
    OrientSpin { dir: Vec3, rate: f32 },
}

/// A direction operand: folded literal or compiled expression.
#[derive(Debug, Clone, Copy)]
pub enum DirSource {
    Literal(Vec3),
    Expr(SlotKey),
}

/// A rate operand: folded literal or compiled expression.
#[derive(Debug, Clone, Copy)]
pub enum RateSource {
    Literal(f32),
    Expr(SlotKey),
}

/// One normalized action.
#[derive(Debug, Clone)]
pub enum ActionOp {
    Orient {
        dir: DirSource,
    },
    Spin {
        rate: RateSource,
        gate: Option<SlotKey>,
        action: u16,
    },
    OrientSpin {
        dir: DirSource,
        rate: RateSource,
    },
    Script {
        slot: SlotKey,
    },
}

/// The result of normalizing one level's action list.
#[derive(Debug, Clone, Default)]
pub struct NormalizedLevel {
    pub ops: Vec<ActionOp>,
    /// Expression slots that need compiling, with their sources.
    pub compiles: Vec<(SlotKey, String)>,
    /// True when any dynamic source references per-point call-locals, which
    /// disables group-level result sharing.
    pub point_dependent: bool,
}

/// Parse a numeric literal like `0.5` or `-2`.
pub fn parse_f32_literal(s: &str) -> Option<f32> {
    s.trim().parse::<f32>().ok()
}

/// Parse a vector literal: `x,y,z`, `(x,y,z)`, `[x,y,z]` or `vec3(x,y,z)`.
pub fn parse_vec3_literal(s: &str) -> Option<Vec3> {
    let t = s.trim();
    let inner = if let Some(rest) = t.strip_prefix("vec3") {
        rest.trim().strip_prefix('(')?.strip_suffix(')')?
    } else if t.starts_with('(') {
        t.strip_prefix('(')?.strip_suffix(')')?
    } else if t.starts_with('[') {
        t.strip_prefix('[')?.strip_suffix(']')?
    } else {
        t
    };

    let parts: Vec<&str> = inner.split(',').collect();
    if parts.len() != 3 {
        return None;
    }
    let x = parse_f32_literal(parts[0])?;
    let y = parse_f32_literal(parts[1])?;
    let z = parse_f32_literal(parts[2])?;
    Some(Vec3::new(x, y, z))
}

const NUM: &str = r"-?[0-9]*\.?[0-9]+";

fn fold_regex<'a>(cell: &'a OnceLock<Option<Regex>>, pattern: &str) -> Option<&'a Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

/// Fold a scripted one-liner that is equivalent to a native op.
fn fold_script(source: &str) -> Option<NativeOp> {
    static SPIN: OnceLock<Option<Regex>> = OnceLock::new();
    static ORIENT: OnceLock<Option<Regex>> = OnceLock::new();
    static ORIENT_SPIN: OnceLock<Option<Regex>> = OnceLock::new();

    let spin = fold_regex(&SPIN, &format!(r"^\s*spin\s*\(\s*({NUM})\s*\)\s*;?\s*$"))?;
    if let Some(caps) = spin.captures(source) {
        let rate = parse_f32_literal(caps.get(1)?.as_str())?;
        return Some(NativeOp::Spin { rate });
    }

    let orient = fold_regex(
        &ORIENT,
        r"^\s*orient\s*\(\s*vec3\s*\(([^)]*)\)\s*\)\s*;?\s*$",
    )?;
    if let Some(caps) = orient.captures(source) {
        let dir = parse_vec3_literal(caps.get(1)?.as_str())?;
        return Some(NativeOp::Orient { dir });
    }

    let orient_spin = fold_regex(
        &ORIENT_SPIN,
        &format!(r"^\s*orient_spin\s*\(\s*vec3\s*\(([^)]*)\)\s*,\s*({NUM})\s*\)\s*;?\s*$"),
    )?;
    if let Some(caps) = orient_spin.captures(source) {
        let dir = parse_vec3_literal(caps.get(1)?.as_str())?;
        let rate = parse_f32_literal(caps.get(2)?.as_str())?;
        return Some(NativeOp::OrientSpin { dir, rate });
    }

    None
}

/// Normalize one level's authored actions into executable ops, folding
/// statics and collecting the expression slots that need compiling.
pub fn normalize_actions(
    card: CardId,
    level: u8,
    actions: &[DisplayAction],
) -> NormalizedLevel {
    let mut out = NormalizedLevel::default();

    for (i, action) in actions.iter().enumerate() {
        let i = i as u16;
        match action {
            DisplayAction::Orient { dir } => {
                let dir = resolve_dir(card, level, i, dir, &mut out);
                out.ops.push(ActionOp::Orient { dir });
            }
            DisplayAction::Spin { rate, cond } => {
                let rate = resolve_rate(card, level, i, rate, &mut out);
                let gate = cond.as_ref().map(|src| {
                    let slot = SlotKey::SpinGate {
                        card,
                        level,
                        action: i,
                    };
                    out.point_dependent |= references_point_locals(src);
                    out.compiles.push((slot, src.clone()));
                    slot
                });
                out.ops.push(ActionOp::Spin {
                    rate,
                    gate,
                    action: i,
                });
            }
            DisplayAction::OrientSpin { dir, rate } => {
                let dir = resolve_dir(card, level, i, dir, &mut out);
                let rate = resolve_rate(card, level, i, rate, &mut out);
                out.ops.push(ActionOp::OrientSpin { dir, rate });
            }
            DisplayAction::Script { source } => {
                if let Some(op) = fold_script(source) {
                    out.ops.push(match op {
                        NativeOp::Orient { dir } => ActionOp::Orient {
                            dir: DirSource::Literal(dir),
                        },
                        NativeOp::Spin { rate } => ActionOp::Spin {
                            rate: RateSource::Literal(rate),
                            gate: None,
                            action: i,
                        },
                        NativeOp::OrientSpin { dir, rate } => ActionOp::OrientSpin {
                            dir: DirSource::Literal(dir),
                            rate: RateSource::Literal(rate),
                        },
                    });
                } else {
                    let slot = SlotKey::Display {
                        card,
                        level,
                        action: i,
                    };
                    out.point_dependent |= references_point_locals(source);
                    out.compiles.push((slot, source.clone()));
                    out.ops.push(ActionOp::Script { slot });
                }
            }
        }
    }

    out
}

fn resolve_dir(
    card: CardId,
    level: u8,
    action: u16,
    source: &str,
    out: &mut NormalizedLevel,
) -> DirSource {
    if let Some(v) = parse_vec3_literal(source) {
        DirSource::Literal(v)
    } else {
        let slot = SlotKey::Display {
            card,
            level,
            action,
        };
        out.point_dependent |= references_point_locals(source);
        out.compiles.push((slot, source.to_string()));
        DirSource::Expr(slot)
    }
}

fn resolve_rate(
    card: CardId,
    level: u8,
    action: u16,
    source: &str,
    out: &mut NormalizedLevel,
) -> RateSource {
    if let Some(v) = parse_f32_literal(source) {
        RateSource::Literal(v)
    } else {
        let slot = SlotKey::Rate {
            card,
            level,
            action,
        };
        out.point_dependent |= references_point_locals(source);
        out.compiles.push((slot, source.to_string()));
        RateSource::Expr(slot)
    }
}

/// Per-(card, level, action) state for gated spins.
#[derive(Debug, Clone, Copy)]
pub struct SpinState {
    pub started: i64,
    pub last_active: i64,
}

pub type SpinKey = (CardId, u8, u16);

/// Elapsed ticks for a gated spin at `now`, re-basing after a gap.
pub fn gated_spin_elapsed(
    states: &mut HashMap<SpinKey, SpinState>,
    key: SpinKey,
    now: i64,
) -> i64 {
    let state = states.entry(key).or_insert(SpinState {
        started: now,
        last_active: now,
    });
    let gap = now - state.last_active;
    if gap as f32 > SPIN_REBASE_GAP_TICKS {
        state.started = now;
    }
    state.last_active = now;
    now - state.started
}

/// Apply one native op to (point, axis).
pub fn apply_native(op: &NativeOp, point: Vec3, axis: Vec3, elapsed: i64) -> (Vec3, Vec3) {
    match *op {
        NativeOp::Orient { dir } => apply_orient(point, axis, dir),
        NativeOp::Spin { rate } => (apply_spin(point, axis, rate, elapsed), axis),
        NativeOp::OrientSpin { dir, rate } => {
            let (point, axis) = apply_orient(point, axis, dir);
            (apply_spin(point, axis, rate, elapsed), axis)
        }
    }
}

fn apply_orient(point: Vec3, axis: Vec3, dir: Vec3) -> (Vec3, Vec3) {
    let from = axis.normalize_or_zero();
    let to = dir.normalize_or_zero();
    if from == Vec3::ZERO || to == Vec3::ZERO {
        return (point, axis);
    }
    let q = Quat::from_rotation_arc(from, to);
    (q * point, to)
}

fn apply_spin(point: Vec3, axis: Vec3, rate: f32, elapsed: i64) -> Vec3 {
    let axis = axis.normalize_or_zero();
    if axis == Vec3::ZERO {
        return point;
    }
    let angle = (rate * elapsed as f32).rem_euclid(TAU);
    Quat::from_axis_angle(axis, angle) * point
}

/// Everything one pipeline evaluation needs besides the point itself.
pub struct PipelineCtx<'a> {
    pub card: CardId,
    pub level: u8,
    pub tick: i64,
    pub age: i64,
    pub globals: &'a HashMap<String, Dynamic>,
    pub host: &'a mut ScriptHost,
    pub spin_states: &'a mut HashMap<SpinKey, SpinState>,
    /// Card-shared scope; scripted mutations write into it, the caller
    /// carries it home.
    pub mem: rhai::Map,
}

impl<'a> PipelineCtx<'a> {
    fn expr_locals(&self, base: &CallLocals, rel: Vec3) -> CallLocals {
        let mut locals = base.clone();
        locals.tick = self.tick;
        locals.age = base.age;
        locals.rel = rel;
        locals
    }
}

/// Run one level's ops over a point, returning the transformed point and
/// the final current axis.
pub fn eval_ops(
    ops: &[ActionOp],
    point: Vec3,
    axis: Vec3,
    base_locals: &CallLocals,
    ctx: &mut PipelineCtx,
) -> (Vec3, Vec3) {
    let mut point = point;
    let mut axis = axis;

    for op in ops {
        match op {
            ActionOp::Orient { dir } => {
                let dir = resolve_dir_value(dir, &point, base_locals, ctx);
                let (p, a) = apply_native(&NativeOp::Orient { dir }, point, axis, 0);
                point = p;
                axis = a;
            }
            ActionOp::Spin { rate, gate, action } => {
                if let Some(gate) = gate {
                    let locals = ctx.expr_locals(base_locals, point);
                    let mut scope = build_scope(ctx.globals, &ctx.mem, &locals);
                    if !ctx.host.eval_bool(*gate, &mut scope) {
                        continue; // gated off: skipped, state untouched
                    }
                }
                let rate = resolve_rate_value(rate, &point, base_locals, ctx);
                let elapsed = if gate.is_some() {
                    gated_spin_elapsed(
                        ctx.spin_states,
                        (ctx.card, ctx.level, *action),
                        ctx.age,
                    )
                } else {
                    ctx.age
                };
                point = apply_spin(point, axis, rate, elapsed);
            }
            ActionOp::OrientSpin { dir, rate } => {
                let dir = resolve_dir_value(dir, &point, base_locals, ctx);
                let rate = resolve_rate_value(rate, &point, base_locals, ctx);
                let (p, a) =
                    apply_native(&NativeOp::OrientSpin { dir, rate }, point, axis, ctx.age);
                point = p;
                axis = a;
            }
            ActionOp::Script { slot } => {
                let locals = ctx.expr_locals(base_locals, point);
                let mut scope = build_scope(ctx.globals, &ctx.mem, &locals);
                begin_capture();
                ctx.host.eval_slot(*slot, &mut scope);
                let capture = take_capture();

                point = take_rel(&scope, point);
                if let Some(mem) = take_mem(&scope) {
                    ctx.mem = mem;
                }
                for op in &capture.ops {
                    let (p, a) = apply_native(op, point, axis, ctx.age);
                    point = p;
                    axis = a;
                }
            }
        }
    }

    (point, axis)
}

fn resolve_dir_value(
    dir: &DirSource,
    point: &Vec3,
    base_locals: &CallLocals,
    ctx: &mut PipelineCtx,
) -> Vec3 {
    match dir {
        DirSource::Literal(v) => *v,
        DirSource::Expr(slot) => {
            let locals = ctx.expr_locals(base_locals, *point);
            let mut scope = build_scope(ctx.globals, &ctx.mem, &locals);
            ctx.host.eval_vec3(*slot, &mut scope)
        }
    }
}

fn resolve_rate_value(
    rate: &RateSource,
    point: &Vec3,
    base_locals: &CallLocals,
    ctx: &mut PipelineCtx,
) -> f32 {
    match rate {
        RateSource::Literal(v) => *v,
        RateSource::Expr(slot) => {
            let locals = ctx.expr_locals(base_locals, *point);
            let mut scope = build_scope(ctx.globals, &ctx.mem, &locals);
            ctx.host.eval_number(*slot, &mut scope)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    fn ctx<'a>(
        host: &'a mut ScriptHost,
        spin_states: &'a mut HashMap<SpinKey, SpinState>,
        globals: &'a HashMap<String, Dynamic>,
        tick: i64,
    ) -> PipelineCtx<'a> {
        PipelineCtx {
            card: CardId(1),
            level: 0,
            tick,
            age: tick,
            globals,
            host,
            spin_states,
            mem: rhai::Map::new(),
        }
    }

    fn assert_close(a: Vec3, b: Vec3) {
        assert!((a - b).length() < 1e-4, "{a:?} != {b:?}");
    }

    #[test]
    fn test_parse_vec3_literal_forms() {
        assert_eq!(parse_vec3_literal("1, 0, 0"), Some(Vec3::X));
        assert_eq!(parse_vec3_literal("(0, 1, 0)"), Some(Vec3::Y));
        assert_eq!(parse_vec3_literal("[0, 0, 1]"), Some(Vec3::Z));
        assert_eq!(parse_vec3_literal("vec3(1, 2, 3)"), Some(Vec3::new(1.0, 2.0, 3.0)));
        assert_eq!(parse_vec3_literal("tick, 0, 0"), None);
        assert_eq!(parse_vec3_literal("1, 2"), None);
    }

    #[test]
    fn test_fold_script_one_liners() {
        assert_eq!(fold_script("spin(0.5);"), Some(NativeOp::Spin { rate: 0.5 }));
        assert_eq!(
            fold_script("orient(vec3(1, 0, 0))"),
            Some(NativeOp::Orient { dir: Vec3::X })
        );
        assert_eq!(
            fold_script("orient_spin(vec3(0, 0, 1), 0.1);"),
            Some(NativeOp::OrientSpin {
                dir: Vec3::Z,
                rate: 0.1
            })
        );
        assert_eq!(fold_script("spin(rate_var);"), None);
        assert_eq!(fold_script("rel = rel * 2.0;"), None);
    }

    #[test]
    fn test_normalize_folds_statics() {
        let actions = vec![
            DisplayAction::Orient {
                dir: "1, 0, 0".to_string(),
            },
            DisplayAction::Script {
                source: "spin(0.5);".to_string(),
            },
            DisplayAction::Spin {
                rate: "speed * 0.1".to_string(),
                cond: None,
            },
        ];
        let norm = normalize_actions(CardId(1), 0, &actions);
        assert_eq!(norm.ops.len(), 3);
        // Only the dynamic rate expression needs a compile.
        assert_eq!(norm.compiles.len(), 1);
        assert!(!norm.point_dependent);

        let actions = vec![DisplayAction::Script {
            source: "rel = rel * (1.0 + index);".to_string(),
        }];
        let norm = normalize_actions(CardId(1), 0, &actions);
        assert!(norm.point_dependent);
    }

    #[test]
    fn test_orient_maps_axis_onto_dir() {
        let (point, axis) = apply_orient(Vec3::Y, Vec3::Y, Vec3::X);
        assert_close(point, Vec3::X);
        assert_close(axis, Vec3::X);
    }

    #[test]
    fn test_spin_quarter_turn() {
        // rate π/10 for 5 ticks = π/2 about Y: X → -Z.
        let point = apply_spin(Vec3::X, Vec3::Y, PI / 10.0, 5);
        assert_close(point, Vec3::new(0.0, 0.0, -1.0));
    }

    #[test]
    fn test_gated_spin_has_no_catchup_jump() {
        // Gate open only on even ticks; rate π/10. The first tick after
        // each gap must not jump by more than one tick's worth of angle.
        let mut states = HashMap::new();
        let key = (CardId(1), 0u8, 0u16);
        let rate = PI / 10.0;

        let mut prev_angle = 0.0_f32;
        for now in (0..20).step_by(2) {
            let elapsed = gated_spin_elapsed(&mut states, key, now);
            let angle = (rate * elapsed as f32).rem_euclid(TAU);
            let delta = (angle - prev_angle).abs();
            assert!(
                delta <= rate + 1e-6,
                "tick {now}: angle jumped by {delta} (> {rate})"
            );
            prev_angle = angle;
        }
    }

    #[test]
    fn test_ungated_consecutive_spin_keeps_phase() {
        let mut states = HashMap::new();
        let key = (CardId(1), 0u8, 1u16);
        for now in 0..5 {
            let elapsed = gated_spin_elapsed(&mut states, key, now);
            assert_eq!(elapsed, now);
        }
    }

    #[test]
    fn test_eval_ops_scripted_mutation() {
        let mut host = ScriptHost::new();
        let mut spin_states = HashMap::new();
        let globals = HashMap::new();

        let actions = vec![DisplayAction::Script {
            source: "rel = rel + vec3(0, 2, 0); spin(0.0);".to_string(),
        }];
        let norm = normalize_actions(CardId(1), 0, &actions);
        for (slot, src) in &norm.compiles {
            assert!(host.compile(*slot, src, false).ok);
        }

        let mut ctx = ctx(&mut host, &mut spin_states, &globals, 3);
        let locals = CallLocals::at_tick(3);
        let (point, _axis) = eval_ops(&norm.ops, Vec3::X, Vec3::Y, &locals, &mut ctx);
        assert_close(point, Vec3::new(1.0, 2.0, 0.0));
    }

    #[test]
    fn test_eval_ops_gate_skips_spin() {
        let mut host = ScriptHost::new();
        let mut spin_states = HashMap::new();
        let globals = HashMap::new();

        let actions = vec![DisplayAction::Spin {
            rate: "0.7853982".to_string(), // π/4 folds to a literal
            cond: Some("tick % 2 == 0".to_string()),
        }];
        let norm = normalize_actions(CardId(1), 0, &actions);
        for (slot, src) in &norm.compiles {
            assert!(host.compile(*slot, src, false).ok);
        }

        // Odd tick: gate closed, point unchanged.
        let mut c = ctx(&mut host, &mut spin_states, &globals, 3);
        let locals = CallLocals::at_tick(3);
        let (point, _) = eval_ops(&norm.ops, Vec3::X, Vec3::Y, &locals, &mut c);
        assert_close(point, Vec3::X);
    }
}
