//! Growth/visibility planning.
//!
//! A growth plan answers, per owner and scope, "how many points are visible
//! at tick T" and "at which tick does index i unlock". Plans are built from
//! two source kinds:
//! - declarative count curves: entries whose boolean condition is evaluated
//!   in the sandbox; the limit at a tick is the sum of counts that hold;
//! - scripted growth: a script walked tick by tick, accumulating `grow()` /
//!   `grow_by(n)` calls.
//!
//! The cumulative count is an extend-only prefix: `extend_to(T)` simulates
//! only the ticks past the last one already computed, never replays from
//! zero. Counts are monotonically non-decreasing and capped at the owner's
//! point count.
//!
//! Defaults are asymmetric on purpose: a sequenced owner with no declared
//! source never grows (limit stays 0); a non-sequenced owner with no source
//! is fully visible at tick 0.

use std::collections::HashMap;

use rhai::Dynamic;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::card::{CardId, GrowthCombine};
use crate::script_scope::{build_scope, take_mem, CallLocals};
use crate::scripting::{begin_capture, take_capture, ScriptHost, SlotKey};

/// Which plan a growth source feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GrowthScope {
    /// Gates whole shape instances (ordered reveal across repeated roots).
    Global,
    /// Gates individual points within one shape instance.
    Local,
}

/// Compiled growth sources for one plan.
#[derive(Debug, Clone, Default)]
pub struct PlanSources {
    /// Count-curve entries: (condition slot, count).
    pub curve: Vec<(SlotKey, u32)>,
    /// Scripted growth walker slots.
    pub scripts: Vec<SlotKey>,
    pub combine: GrowthCombine,
    pub sequenced: bool,
}

impl PlanSources {
    pub fn is_empty(&self) -> bool {
        self.curve.is_empty() && self.scripts.is_empty()
    }
}

/// An incrementally extended visibility plan.
#[derive(Debug)]
pub struct GrowthPlan {
    cap: u32,
    sources: PlanSources,
    /// `counts[t]` is the cumulative visible count at tick `t`.
    counts: Vec<u32>,
    /// Accumulated scripted `grow()` events across the walked prefix.
    script_cum: u64,
    /// Persistent state for scripted walkers (their `mem` layer).
    mem: rhai::Map,
    /// Tick at which each index unlocks; filled as the prefix grows.
    unlock: Vec<Option<i64>>,
}

impl GrowthPlan {
    pub fn new(cap: u32, sources: PlanSources) -> Self {
        let mut plan = Self {
            cap,
            counts: Vec::new(),
            script_cum: 0,
            mem: rhai::Map::new(),
            unlock: vec![None; cap as usize],
            sources,
        };
        if plan.sources.is_empty() && !plan.sources.sequenced {
            // No declared growth on a non-sequenced owner: everything is
            // visible from tick 0.
            plan.counts.push(cap);
            for slot in plan.unlock.iter_mut() {
                *slot = Some(0);
            }
        }
        plan
    }

    /// Extend the prefix up to `tick`, simulating only the new ticks.
    pub fn extend_to(
        &mut self,
        tick: i64,
        host: &mut ScriptHost,
        globals: &HashMap<String, Dynamic>,
    ) {
        if self.sources.is_empty() {
            return;
        }

        let target = tick.max(0) as usize;
        while self.counts.len() <= target {
            let t = self.counts.len() as i64;
            let prev = self.counts.last().copied().unwrap_or(0);

            let mut locals = CallLocals::at_tick(t);
            locals.count = self.cap as i64;

            for &script in &self.sources.scripts {
                begin_capture();
                let mut scope = build_scope(globals, &self.mem, &locals);
                host.eval_slot(script, &mut scope);
                self.script_cum += take_capture().grow_events;
                if let Some(mem) = take_mem(&scope) {
                    self.mem = mem;
                }
            }

            let mut curve_sum: u64 = 0;
            for &(cond, count) in &self.sources.curve {
                let mut scope = build_scope(globals, &self.mem, &locals);
                if host.eval_bool(cond, &mut scope) {
                    curve_sum += count as u64;
                }
            }

            let raw = match (!self.sources.curve.is_empty(), !self.sources.scripts.is_empty()) {
                (true, false) => curve_sum,
                (false, true) => self.script_cum,
                _ => match self.sources.combine {
                    GrowthCombine::Add => curve_sum + self.script_cum,
                    GrowthCombine::Min => curve_sum.min(self.script_cum),
                },
            };

            // Monotonic and capped: a condition turning false never
            // un-reveals points.
            let next = (raw.min(self.cap as u64) as u32).max(prev);
            for i in prev..next {
                self.unlock[i as usize] = Some(t);
            }
            self.counts.push(next);
        }
    }

    /// Cumulative visible count at `tick` (clamped to the extended prefix).
    pub fn limit_at(&self, tick: i64) -> u32 {
        if tick < 0 || self.counts.is_empty() {
            return 0;
        }
        let idx = (tick as usize).min(self.counts.len() - 1);
        self.counts[idx]
    }

    /// Tick at which `index` unlocks, if it has within the extended prefix.
    pub fn unlock_tick(&self, index: usize) -> Option<i64> {
        self.unlock.get(index).copied().flatten()
    }

    /// First tick at which the plan reaches its cap, if it has.
    pub fn ticks_to_full(&self) -> Option<i64> {
        if self.cap == 0 {
            return Some(0);
        }
        self.unlock_tick(self.cap as usize - 1)
    }

    pub fn cap(&self) -> u32 {
        self.cap
    }
}

/// Cache key for growth plans: owner point count and source signature are
/// part of the identity so a geometry or source edit misses cleanly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlanKey {
    pub card: CardId,
    pub scope: GrowthScope,
    pub count: u32,
    pub signature: String,
}

/// Content signature over the plan's source texts.
pub fn source_signature(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]); // separator so concatenations can't collide
    }
    format!("{:x}", hasher.finalize())
}

/// All growth plans for the current scene generation.
#[derive(Default)]
pub struct GrowthCache {
    plans: HashMap<PlanKey, GrowthPlan>,
}

impl GrowthCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wholesale invalidation on scene/geometry rebuild.
    pub fn clear(&mut self) {
        self.plans.clear();
    }

    pub fn get_or_insert(
        &mut self,
        key: &PlanKey,
        make: impl FnOnce() -> GrowthPlan,
    ) -> &mut GrowthPlan {
        self.plans.entry(key.clone()).or_insert_with(make)
    }

    pub fn get(&self, key: &PlanKey) -> Option<&GrowthPlan> {
        self.plans.get(key)
    }

    pub fn get_mut(&mut self, key: &PlanKey) -> Option<&mut GrowthPlan> {
        self.plans.get_mut(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cond_slot(entry: u16) -> SlotKey {
        SlotKey::Condition {
            card: CardId(1),
            scope: GrowthScope::Local,
            entry,
        }
    }

    fn script_slot() -> SlotKey {
        SlotKey::Growth {
            card: CardId(1),
            scope: GrowthScope::Local,
            level: 0,
        }
    }

    fn sources_with_script(host: &mut ScriptHost, source: &str, sequenced: bool) -> PlanSources {
        assert!(host.compile(script_slot(), source, false).ok);
        PlanSources {
            scripts: vec![script_slot()],
            sequenced,
            ..Default::default()
        }
    }

    #[test]
    fn test_grow_once_per_tick() {
        let mut host = ScriptHost::new();
        let globals = HashMap::new();
        let sources = sources_with_script(&mut host, "grow();", true);
        let mut plan = GrowthPlan::new(5, sources);

        plan.extend_to(10, &mut host, &globals);
        let mut prev = 0;
        for tick in 0..=10 {
            let limit = plan.limit_at(tick);
            assert_eq!(limit, ((tick + 1) as u32).min(5));
            assert!(limit >= prev);
            prev = limit;
        }
    }

    #[test]
    fn test_no_source_defaults() {
        // Non-sequenced with no source: fully visible immediately.
        let plan = GrowthPlan::new(4, PlanSources::default());
        assert_eq!(plan.limit_at(0), 4);
        assert_eq!(plan.unlock_tick(3), Some(0));

        // Sequenced with no source: never grows.
        let mut host = ScriptHost::new();
        let globals = HashMap::new();
        let mut plan = GrowthPlan::new(
            4,
            PlanSources {
                sequenced: true,
                ..Default::default()
            },
        );
        plan.extend_to(100, &mut host, &globals);
        for tick in [0, 1, 50, 100] {
            assert_eq!(plan.limit_at(tick), 0);
        }
        assert_eq!(plan.unlock_tick(0), None);
    }

    #[test]
    fn test_unlock_ticks_are_monotonic() {
        let mut host = ScriptHost::new();
        let globals = HashMap::new();
        let sources = sources_with_script(&mut host, "if tick % 2 == 0 { grow_by(2); }", true);
        let mut plan = GrowthPlan::new(7, sources);
        plan.extend_to(8, &mut host, &globals);

        let mut prev = i64::MIN;
        for i in 0..7 {
            if let Some(t) = plan.unlock_tick(i) {
                assert!(t >= prev, "unlock must be non-decreasing in index");
                prev = t;
            }
        }

        // Every index below the limit at T unlocked at or before T.
        for t in 0..=8 {
            let limit = plan.limit_at(t);
            for i in 0..limit as usize {
                let u = plan.unlock_tick(i).unwrap();
                assert!(u <= t);
            }
        }
    }

    #[test]
    fn test_curve_conditions() {
        let mut host = ScriptHost::new();
        let globals = HashMap::new();
        assert!(host.compile(cond_slot(0), "tick >= 3", false).ok);
        assert!(host.compile(cond_slot(1), "tick == 5", false).ok);

        let sources = PlanSources {
            curve: vec![(cond_slot(0), 2), (cond_slot(1), 4)],
            sequenced: true,
            ..Default::default()
        };
        let mut plan = GrowthPlan::new(10, sources);
        plan.extend_to(8, &mut host, &globals);

        assert_eq!(plan.limit_at(0), 0);
        assert_eq!(plan.limit_at(3), 2);
        assert_eq!(plan.limit_at(5), 6);
        // The second condition turned false again; counts hold monotonic.
        assert_eq!(plan.limit_at(8), 6);
    }

    #[test]
    fn test_extension_simulates_each_tick_once() {
        let mut host = ScriptHost::new();
        let globals = HashMap::new();
        // A stateful walker: grows once per simulated tick, counting its
        // invocations in its persistent mem layer.
        let source = r#"
            if !mem.contains("calls") { mem.calls = 0; }
            mem.calls += 1;
            grow();
        "#;
        let sources = sources_with_script(&mut host, source, true);
        let mut plan = GrowthPlan::new(100, sources);

        plan.extend_to(2, &mut host, &globals);
        assert_eq!(plan.limit_at(2), 3);

        // Asking for a later tick only simulates the new ticks.
        plan.extend_to(5, &mut host, &globals);
        assert_eq!(plan.limit_at(5), 6);

        // Asking for an earlier tick is a pure read.
        plan.extend_to(1, &mut host, &globals);
        assert_eq!(plan.limit_at(1), 2);
        assert_eq!(plan.limit_at(5), 6);
    }

    #[test]
    fn test_limit_capped_at_owner_count() {
        let mut host = ScriptHost::new();
        let globals = HashMap::new();
        let sources = sources_with_script(&mut host, "grow_by(10);", true);
        let mut plan = GrowthPlan::new(6, sources);
        plan.extend_to(4, &mut host, &globals);
        assert_eq!(plan.limit_at(0), 6);
        assert_eq!(plan.limit_at(4), 6);
        assert_eq!(plan.ticks_to_full(), Some(0));
    }

    #[test]
    fn test_source_signature_changes_with_text() {
        let a = source_signature(&["grow();", "tick > 3"]);
        let b = source_signature(&["grow();", "tick > 4"]);
        let c = source_signature(&["grow();tick > 3"]);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, source_signature(&["grow();", "tick > 3"]));
    }
}
