//! Sandboxed script compilation and the per-slot cache.
//!
//! Author scripts are small rhai bodies compiled into ASTs, one per logical
//! slot (a display action, a controller, a builder, a growth source or
//! condition). The cache keeps, per slot:
//! - the last *successfully* compiled AST ("last good"), which stays live
//!   even when a newer compile attempt fails, and
//! - the last attempted source, so resubmitting unchanged text never
//!   re-invokes the compiler.
//!
//! Every evaluation is guarded: a runtime error inside a script is recorded
//! as a diagnostic and treated as a no-op for that point/tick, never
//! propagated. The sandbox exposes a fixed vocabulary only — the scoped
//! variables built in `script_scope` plus the helper calls registered here
//! (`orient`, `spin`, `orient_spin`, `grow`, `grow_by`, `vec3`, logging).
//! No other host capability is reachable.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::OnceLock;

use glam::Vec3;
use regex::Regex;
use rhai::{Dynamic, Engine, Scope, AST};
use serde::Serialize;

use crate::card::CardId;
use crate::growth::GrowthScope;
use crate::script_diagnostics::{from_eval_error, from_parse_error, ScriptDiagnostic};
use crate::script_log::{script_log, stringify_dynamic, LogLevel};
use crate::transform::NativeOp;

/// Stable identity of a compiled-script slot. Editors derive these from the
/// owning card and position, so targeted recompiles need no knowledge of the
/// caching internals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotKey {
    /// A display-action expression (direction or script body) at a nesting
    /// level.
    Display { card: CardId, level: u8, action: u16 },
    /// A spin-rate expression.
    Rate { card: CardId, level: u8, action: u16 },
    /// The gating condition of a spin action.
    SpinGate { card: CardId, level: u8, action: u16 },
    /// A controller script.
    Controller { card: CardId, action: u16 },
    /// A builder-geometry script.
    Builder { card: CardId, level: u8 },
    /// A count-curve condition expression.
    Condition {
        card: CardId,
        scope: GrowthScope,
        entry: u16,
    },
    /// A scripted growth walker. `level` 0 is the card's own settings,
    /// `level` N is nested level N-1's contribution.
    Growth {
        card: CardId,
        scope: GrowthScope,
        level: u8,
    },
    /// A visual initializer expression.
    Visual { card: CardId, index: u16 },
}

/// Bulk-compile report for UI display.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CompileSummary {
    pub total: u32,
    pub compiled: u32,
    pub failed: u32,
    /// Failed slots that still have an older callable live.
    pub fallback: u32,
}

/// Result of a compile request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOutcome {
    pub ok: bool,
    /// True when this attempt failed but an older, *different* source is
    /// still live as the slot's callable.
    pub used_fallback: bool,
    pub message: Option<String>,
}

#[derive(Debug, Default)]
struct Slot {
    good_source: Option<String>,
    good_ast: Option<AST>,
    attempted: Option<String>,
    last_ok: bool,
    last_error: Option<String>,
}

impl Slot {
    fn outcome(&self) -> CompileOutcome {
        let used_fallback = !self.last_ok
            && match (&self.good_source, &self.attempted) {
                (Some(good), Some(attempted)) => good != attempted,
                _ => false,
            };
        CompileOutcome {
            ok: self.last_ok,
            used_fallback,
            message: self.last_error.clone(),
        }
    }
}

// Helper calls made by a script during one evaluation are captured through a
// thread-local sink (the engine owns registered fns, not per-call state).
#[derive(Debug, Default, Clone)]
pub struct HelperCapture {
    /// Native transform ops composed by the script, in call order.
    pub ops: Vec<NativeOp>,
    /// Points revealed via `grow()` / `grow_by(n)`.
    pub grow_events: u64,
}

thread_local! {
    static ACTIVE_CAPTURE: RefCell<Option<HelperCapture>> = const { RefCell::new(None) };
}

/// Install a fresh capture sink for the next evaluation.
pub fn begin_capture() {
    ACTIVE_CAPTURE.with(|cell| *cell.borrow_mut() = Some(HelperCapture::default()));
}

/// Take the sink installed by `begin_capture`, with everything the script
/// captured into it.
pub fn take_capture() -> HelperCapture {
    ACTIVE_CAPTURE
        .with(|cell| cell.borrow_mut().take())
        .unwrap_or_default()
}

fn capture_op(op: NativeOp) {
    ACTIVE_CAPTURE.with(|cell| {
        if let Some(sink) = cell.borrow_mut().as_mut() {
            sink.ops.push(op);
        }
    });
}

fn capture_grow(n: u64) {
    ACTIVE_CAPTURE.with(|cell| {
        if let Some(sink) = cell.borrow_mut().as_mut() {
            sink.grow_events += n;
        }
    });
}

/// Sandboxed script host: one rhai engine plus the slot cache.
pub struct ScriptHost {
    engine: Engine,
    slots: HashMap<SlotKey, Slot>,
    diagnostics: Vec<ScriptDiagnostic>,
    /// Slots that already produced a runtime diagnostic this tick.
    runtime_warned: HashMap<SlotKey, i64>,
    current_tick: i64,
    compile_calls: u64,
}

impl ScriptHost {
    pub fn new() -> Self {
        let mut engine = Engine::new();

        // Sandbox limits: author scripts run thousands of times per tick.
        engine.set_max_expr_depths(64, 64);
        engine.set_max_call_levels(32);
        engine.set_max_operations(100_000);
        engine.set_max_string_size(10_000);
        engine.set_max_array_size(1_000);
        engine.set_max_map_size(500);

        register_vec3(&mut engine);
        register_helpers(&mut engine);
        register_logging(&mut engine);

        Self {
            engine,
            slots: HashMap::new(),
            diagnostics: Vec::new(),
            runtime_warned: HashMap::new(),
            current_tick: 0,
            compile_calls: 0,
        }
    }

    /// Mark the start of an applied tick: resets the script log budget and
    /// the per-tick runtime-diagnostic dedup.
    pub fn begin_tick(&mut self, tick: i64) {
        self.current_tick = tick;
        crate::script_log::reset_tick_log_count();
    }

    /// Compile `source` into `slot`.
    ///
    /// Unchanged source (after normalization) without `force` returns the
    /// cached verdict without touching the compiler. A failed attempt never
    /// discards the slot's last good AST.
    pub fn compile(&mut self, key: SlotKey, source: &str, force: bool) -> CompileOutcome {
        let norm = normalize_source(source);
        let slot = self.slots.entry(key).or_default();

        if !force && slot.attempted.as_deref() == Some(norm.as_str()) {
            return slot.outcome();
        }

        self.compile_calls += 1;
        match self.engine.compile(&norm) {
            Ok(ast) => {
                slot.good_source = Some(norm.clone());
                slot.good_ast = Some(ast);
                slot.attempted = Some(norm);
                slot.last_ok = true;
                slot.last_error = None;
                slot.outcome()
            }
            Err(err) => {
                let diag = from_parse_error(key, &err);
                slot.attempted = Some(norm);
                slot.last_ok = false;
                slot.last_error = Some(diag.message.clone());
                let outcome = slot.outcome();
                self.push_diagnostic(diag);
                outcome
            }
        }
    }

    /// Whether the slot currently has a live (last good) callable.
    pub fn has_callable(&self, key: SlotKey) -> bool {
        self.slots
            .get(&key)
            .map(|s| s.good_ast.is_some())
            .unwrap_or(false)
    }

    /// Number of real compiler invocations so far (cache hits excluded).
    pub fn compile_count(&self) -> u64 {
        self.compile_calls
    }

    /// Evaluate a slot's last good callable in `scope`.
    ///
    /// Returns `None` when the slot has no callable or the evaluation
    /// errored; the error is recorded once per (slot, tick) and the call is
    /// a no-op for the caller.
    pub fn eval_slot(&mut self, key: SlotKey, scope: &mut Scope<'static>) -> Option<Dynamic> {
        let ast = self.slots.get(&key).and_then(|s| s.good_ast.clone())?;
        match self.engine.eval_ast_with_scope::<Dynamic>(scope, &ast) {
            Ok(value) => Some(value),
            Err(err) => {
                if self.runtime_warned.get(&key) != Some(&self.current_tick) {
                    self.runtime_warned.insert(key, self.current_tick);
                    self.push_diagnostic(from_eval_error(key, &err));
                }
                None
            }
        }
    }

    /// Evaluate a boolean condition; any failure reads as `false`.
    pub fn eval_bool(&mut self, key: SlotKey, scope: &mut Scope<'static>) -> bool {
        self.eval_slot(key, scope)
            .and_then(|v| v.as_bool().ok())
            .unwrap_or(false)
    }

    /// Evaluate a numeric expression; any failure reads as zero.
    pub fn eval_number(&mut self, key: SlotKey, scope: &mut Scope<'static>) -> f32 {
        self.eval_slot(key, scope)
            .map(|v| dynamic_to_f32(&v))
            .unwrap_or(0.0)
    }

    /// Evaluate a vector expression; any failure reads as the zero vector.
    pub fn eval_vec3(&mut self, key: SlotKey, scope: &mut Scope<'static>) -> Vec3 {
        self.eval_slot(key, scope)
            .map(|v| dynamic_to_vec3(&v))
            .unwrap_or(Vec3::ZERO)
    }

    fn push_diagnostic(&mut self, diag: ScriptDiagnostic) {
        // Bounded queue so repeated runtime errors don't grow without limit.
        const MAX_DIAGNOSTICS: usize = 32;

        self.diagnostics.push(diag);
        if self.diagnostics.len() > MAX_DIAGNOSTICS {
            let excess = self.diagnostics.len() - MAX_DIAGNOSTICS;
            self.diagnostics.drain(0..excess);
        }
    }

    /// Drain and return all pending diagnostics.
    pub fn take_diagnostics(&mut self) -> Vec<ScriptDiagnostic> {
        std::mem::take(&mut self.diagnostics)
    }
}

impl Default for ScriptHost {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize_source(source: &str) -> String {
    source.replace("\r\n", "\n").trim().to_string()
}

/// Coerce a rhai value to f32 (floats and ints both count).
pub fn dynamic_to_f32(value: &Dynamic) -> f32 {
    if let Ok(f) = value.as_float() {
        return f;
    }
    if let Ok(i) = value.as_int() {
        return i as f32;
    }
    0.0
}

/// Coerce a rhai value to a vector: a `Vec3`, or a map with x/y/z keys.
/// Anything else is the zero vector.
pub fn dynamic_to_vec3(value: &Dynamic) -> Vec3 {
    if let Some(v) = value.clone().try_cast::<Vec3>() {
        return v;
    }
    if let Some(map) = value.clone().try_cast::<rhai::Map>() {
        let get = |k: &str| map.get(k).map(dynamic_to_f32).unwrap_or(0.0);
        return Vec3::new(get("x"), get("y"), get("z"));
    }
    Vec3::ZERO
}

fn register_vec3(engine: &mut Engine) {
    engine.register_type_with_name::<Vec3>("Vec3");

    engine.register_fn("vec3", |x: f32, y: f32, z: f32| Vec3::new(x, y, z));
    engine.register_fn("vec3", |x: i64, y: i64, z: i64| {
        Vec3::new(x as f32, y as f32, z as f32)
    });

    engine.register_get_set(
        "x",
        |v: &mut Vec3| v.x,
        |v: &mut Vec3, value: f32| v.x = value,
    );
    engine.register_get_set(
        "y",
        |v: &mut Vec3| v.y,
        |v: &mut Vec3, value: f32| v.y = value,
    );
    engine.register_get_set(
        "z",
        |v: &mut Vec3| v.z,
        |v: &mut Vec3, value: f32| v.z = value,
    );

    engine.register_fn("+", |a: Vec3, b: Vec3| a + b);
    engine.register_fn("-", |a: Vec3, b: Vec3| a - b);
    engine.register_fn("-", |a: Vec3| -a);
    engine.register_fn("*", |a: Vec3, s: f32| a * s);
    engine.register_fn("*", |s: f32, a: Vec3| a * s);
    engine.register_fn("*", |a: Vec3, s: i64| a * s as f32);
    engine.register_fn("*", |s: i64, a: Vec3| a * s as f32);

    engine.register_fn("dot", |a: Vec3, b: Vec3| a.dot(b));
    engine.register_fn("cross", |a: Vec3, b: Vec3| a.cross(b));
    engine.register_fn("length", |v: Vec3| v.length());
    engine.register_fn("normalize", |v: Vec3| v.normalize_or_zero());

    engine.register_fn("to_string", |v: Vec3| {
        format!("({}, {}, {})", v.x, v.y, v.z)
    });
}

fn register_helpers(engine: &mut Engine) {
    engine.register_fn("orient", |dir: Vec3| {
        capture_op(NativeOp::Orient { dir });
    });
    engine.register_fn("orient", |x: f32, y: f32, z: f32| {
        capture_op(NativeOp::Orient {
            dir: Vec3::new(x, y, z),
        });
    });

    engine.register_fn("spin", |rate: f32| {
        capture_op(NativeOp::Spin { rate });
    });
    engine.register_fn("spin", |rate: i64| {
        capture_op(NativeOp::Spin { rate: rate as f32 });
    });

    engine.register_fn("orient_spin", |dir: Vec3, rate: f32| {
        capture_op(NativeOp::OrientSpin { dir, rate });
    });
    engine.register_fn("orient_spin", |dir: Vec3, rate: i64| {
        capture_op(NativeOp::OrientSpin {
            dir,
            rate: rate as f32,
        });
    });

    engine.register_fn("grow", || capture_grow(1));
    engine.register_fn("grow_by", |n: i64| capture_grow(n.max(0) as u64));
}

fn register_logging(engine: &mut Engine) {
    engine.register_fn("log_info", |value: Dynamic| {
        script_log(LogLevel::Info, &stringify_dynamic(&value));
    });
    engine.register_fn("log_warn", |value: Dynamic| {
        script_log(LogLevel::Warn, &stringify_dynamic(&value));
    });
    engine.register_fn("log_debug", |value: Dynamic| {
        script_log(LogLevel::Debug, &stringify_dynamic(&value));
    });
}

fn matches(cell: &'static OnceLock<Option<Regex>>, pattern: &str, source: &str) -> bool {
    cell.get_or_init(|| Regex::new(pattern).ok())
        .as_ref()
        .map(|re| re.is_match(source))
        .unwrap_or(false)
}

/// Does the expression reference the per-point `age` variable?
pub fn references_age(source: &str) -> bool {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    matches(&RE, r"\bage\b", source)
}

/// Does the script depend on per-point call-locals (`index`, `age`, any
/// `rel` handle)? Point-independent scripts can be evaluated once per group.
pub fn references_point_locals(source: &str) -> bool {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    matches(&RE, r"\b(index|age|rel\d*)\b", source)
}

/// Does the script assign to `status`? Assignment pins the lifecycle status
/// until the source stops assigning.
pub fn assigns_status(source: &str) -> bool {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    matches(&RE, r"\bstatus\s*=[^=]", source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script_scope::{build_scope, CallLocals};
    use std::collections::HashMap as StdHashMap;

    fn slot() -> SlotKey {
        SlotKey::Controller {
            card: CardId(1),
            action: 0,
        }
    }

    fn empty_scope() -> Scope<'static> {
        let globals = StdHashMap::new();
        let mem = rhai::Map::new();
        build_scope(&globals, &mem, &CallLocals::at_tick(0))
    }

    #[test]
    fn test_unchanged_source_is_not_recompiled() {
        let mut host = ScriptHost::new();

        let out = host.compile(slot(), "1 + 1", false);
        assert!(out.ok);
        assert_eq!(host.compile_count(), 1);

        let out = host.compile(slot(), "1 + 1", false);
        assert!(out.ok);
        assert_eq!(host.compile_count(), 1);

        // Whitespace-only differences normalize away.
        let out = host.compile(slot(), "  1 + 1  ", false);
        assert!(out.ok);
        assert_eq!(host.compile_count(), 1);

        host.compile(slot(), "1 + 1", true);
        assert_eq!(host.compile_count(), 2);
    }

    #[test]
    fn test_failed_compile_keeps_last_good() {
        let mut host = ScriptHost::new();

        assert!(host.compile(slot(), "2 * 21", false).ok);

        let out = host.compile(slot(), "let x = ;", false);
        assert!(!out.ok);
        assert!(out.used_fallback);
        assert!(out.message.is_some());

        // The last good callable still runs and yields the old result.
        let mut scope = empty_scope();
        let value = host.eval_slot(slot(), &mut scope);
        assert_eq!(value.and_then(|v| v.as_int().ok()), Some(42));
    }

    #[test]
    fn test_failure_without_prior_good_has_no_fallback() {
        let mut host = ScriptHost::new();
        let out = host.compile(slot(), "let x = ;", false);
        assert!(!out.ok);
        assert!(!out.used_fallback);
        assert!(!host.has_callable(slot()));
    }

    #[test]
    fn test_resubmitting_failed_source_is_cached() {
        let mut host = ScriptHost::new();
        host.compile(slot(), "let x = ;", false);
        let calls = host.compile_count();
        let out = host.compile(slot(), "let x = ;", false);
        assert!(!out.ok);
        assert_eq!(host.compile_count(), calls);
    }

    #[test]
    fn test_runtime_error_is_a_no_op() {
        let mut host = ScriptHost::new();
        host.compile(slot(), "undefined_var + 1", false);

        let mut scope = empty_scope();
        assert!(host.eval_slot(slot(), &mut scope).is_none());
        assert_eq!(host.eval_number(slot(), &mut scope), 0.0);

        let diags = host.take_diagnostics();
        assert!(!diags.is_empty());
    }

    #[test]
    fn test_helper_capture() {
        let mut host = ScriptHost::new();
        host.compile(slot(), "orient(vec3(1, 0, 0)); spin(0.5); grow_by(3);", false);

        begin_capture();
        let mut scope = empty_scope();
        host.eval_slot(slot(), &mut scope);
        let capture = take_capture();

        assert_eq!(capture.ops.len(), 2);
        assert_eq!(capture.grow_events, 3);
        match capture.ops[0] {
            NativeOp::Orient { dir } => assert_eq!(dir, Vec3::X),
            _ => panic!("expected orient first"),
        }
    }

    #[test]
    fn test_scope_variables_reach_scripts() {
        let mut host = ScriptHost::new();
        host.compile(slot(), "tick * 2", false);

        let globals = StdHashMap::new();
        let mem = rhai::Map::new();
        let mut scope = build_scope(&globals, &mem, &CallLocals::at_tick(21));
        let value = host.eval_slot(slot(), &mut scope);
        assert_eq!(value.and_then(|v| v.as_int().ok()), Some(42));
    }

    #[test]
    fn test_mem_mutation_reads_back() {
        let mut host = ScriptHost::new();
        host.compile(slot(), r#"mem.counter = 5;"#, false);

        let globals = StdHashMap::new();
        let mem = rhai::Map::new();
        let mut scope = build_scope(&globals, &mem, &CallLocals::at_tick(0));
        host.eval_slot(slot(), &mut scope);

        let mem = crate::script_scope::take_mem(&scope).unwrap_or_default();
        let counter = mem.get("counter").and_then(|d| d.as_int().ok());
        assert_eq!(counter, Some(5));
    }

    #[test]
    fn test_reference_detection() {
        assert!(references_age("age * 0.1"));
        assert!(!references_age("stage * 0.1"));
        assert!(references_point_locals("vec3(index, 0, 0)"));
        assert!(references_point_locals("rel1 + rel"));
        assert!(!references_point_locals("tick * 2"));
        assert!(assigns_status("status = 2;"));
        assert!(!assigns_status("if status == 2 { }"));
    }
}
