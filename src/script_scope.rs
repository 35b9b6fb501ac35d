//! Layered variable scope for script invocations.
//!
//! Every script call sees three layers, innermost last:
//! - read-only built-ins: the scene's typed global declarations;
//! - card scope: `mem`, a read/write map shared by all of a card's scripts;
//! - call-locals: `tick`, `age`, `index`, `count`, `rel` (the relative
//!   position handle), `rel1`/`rel2`/… (ancestor-level handles) and
//!   `status`.
//!
//! Rhai maps are copy-on-write, so mutated layers (`mem`, `rel`, `status`)
//! are read back out of the scope after the call and written home by the
//! caller.

use std::collections::HashMap;

use glam::Vec3;
use rhai::{Dynamic, Scope};

use crate::card::{VarDecl, VarValue};
use crate::timeline::Status;

/// Scope names reserved for call-locals; a global declaration shadowing one
/// of these would be silently unreachable, so it is skipped with a warning.
const RESERVED: &[&str] = &["tick", "age", "index", "count", "rel", "mem", "status"];

/// Per-invocation variable values.
#[derive(Debug, Clone)]
pub struct CallLocals {
    pub tick: i64,
    pub age: i64,
    pub index: i64,
    pub count: i64,
    /// Relative position handle; scripts may reassign it to move the point.
    pub rel: Vec3,
    /// Ancestor-level relative handles, outermost first (`rel1`, `rel2`, …).
    pub ancestors: Vec<Vec3>,
    pub status: Status,
}

impl CallLocals {
    pub fn at_tick(tick: i64) -> Self {
        Self {
            tick,
            age: tick,
            index: 0,
            count: 0,
            rel: Vec3::ZERO,
            ancestors: Vec::new(),
            status: Status::Alive,
        }
    }
}

/// Resolve the scene's variable declarations into a flat name → value map.
/// Called once per applied tick; later declarations win on name collision.
pub fn resolve_globals(decls: &[VarDecl]) -> HashMap<String, Dynamic> {
    let mut map = HashMap::with_capacity(decls.len());
    for decl in decls {
        if RESERVED.contains(&decl.name.as_str()) {
            log::warn!(
                "global variable '{}' shadows a built-in scope name, skipping",
                decl.name
            );
            continue;
        }
        let value = match &decl.value {
            VarValue::Number(n) => Dynamic::from(*n),
            VarValue::Bool(b) => Dynamic::from(*b),
            VarValue::Vector(v) => Dynamic::from(Vec3::from_array(*v)),
            VarValue::Text(s) => Dynamic::from(s.clone()),
        };
        map.insert(decl.name.clone(), value);
    }
    map
}

/// Build the full layered scope for one script invocation.
pub fn build_scope(
    globals: &HashMap<String, Dynamic>,
    mem: &rhai::Map,
    locals: &CallLocals,
) -> Scope<'static> {
    let mut scope = Scope::new();

    for (name, value) in globals {
        scope.push_constant(name.clone(), value.clone());
    }

    scope.push("mem", mem.clone());

    scope.push("tick", locals.tick);
    scope.push("age", locals.age);
    scope.push("index", locals.index);
    scope.push("count", locals.count);
    scope.push("rel", locals.rel);
    for (i, ancestor) in locals.ancestors.iter().enumerate() {
        scope.push(format!("rel{}", i + 1), *ancestor);
    }
    scope.push("status", locals.status as i64);

    scope
}

/// Read the mutated `mem` layer back out of a scope after a call.
pub fn take_mem(scope: &Scope) -> Option<rhai::Map> {
    scope.get_value::<rhai::Map>("mem")
}

/// Read the (possibly reassigned) relative position back out of a scope.
/// Falls back to the pre-call value if the script replaced it with something
/// that is not a vector.
pub fn take_rel(scope: &Scope, fallback: Vec3) -> Vec3 {
    scope.get_value::<Vec3>("rel").unwrap_or(fallback)
}

/// Read the `status` value back out of a scope.
pub fn take_status(scope: &Scope) -> Option<Status> {
    let raw = scope.get_value::<i64>("status")?;
    Status::from_code(raw)
}
