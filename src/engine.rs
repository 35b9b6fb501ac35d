//! The per-frame evaluation engine.
//!
//! The host's render loop calls `advance_to_tick(T)` once per displayed
//! frame. The engine advances per-card lifecycle state, extends growth
//! plans, resolves each group's cached runtime snapshot (transform results,
//! visuals) or computes it once, and writes flat parallel output arrays the
//! external renderer owns. Consumers must treat output length changes as
//! "rebuild the draw buffers".
//!
//! Single-threaded and frame-driven: all caches are plain maps with one
//! logical writer. Ticks apply monotonically — requesting an older tick
//! without a rebuild is a contract violation answered by a logged no-op;
//! requesting the same tick twice is a pure re-read of cached results.

use std::collections::HashMap;

use anyhow::Context;
use glam::Vec3;

use crate::card::{Card, CardId, Geometry, SceneDesc};
use crate::flatten::{build_index, PointIndex};
use crate::growth::{GrowthCache, GrowthPlan, GrowthScope, PlanKey, PlanSources, source_signature};
use crate::script_diagnostics::ScriptDiagnostic;
use crate::script_scope::{resolve_globals, CallLocals};
use crate::scripting::{CompileOutcome, CompileSummary, ScriptHost, SlotKey};
use crate::timeline::{cyclic_age, resolve_cycle, Cycle, LifecycleState, Status};
use crate::transform::{eval_ops, normalize_actions, ActionOp, PipelineCtx, SpinKey, SpinState};
use crate::visual::{finalize, run_controller, run_inits, VisualOut, VisualProgram};

/// Flat parallel output arrays. Lengths change only on rebuild.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputBuffers {
    /// 3 floats per point.
    pub positions: Vec<f32>,
    /// 3 floats per point, linear color space.
    pub colors: Vec<f32>,
    /// 1 float per point.
    pub sizes: Vec<f32>,
    /// 1 float per point.
    pub alphas: Vec<f32>,
    pub visible: Vec<bool>,
}

impl OutputBuffers {
    fn resize(&mut self, points: usize) {
        self.positions.clear();
        self.positions.resize(points * 3, 0.0);
        self.colors.clear();
        self.colors.resize(points * 3, 0.0);
        self.sizes.clear();
        self.sizes.resize(points, 0.0);
        self.alphas.clear();
        self.alphas.resize(points, 0.0);
        self.visible.clear();
        self.visible.resize(points, false);
    }

    pub fn point_count(&self) -> usize {
        self.sizes.len()
    }

    /// Byte views for zero-copy renderer upload.
    pub fn position_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.positions)
    }

    pub fn color_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.colors)
    }

    pub fn size_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.sizes)
    }

    pub fn alpha_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.alphas)
    }
}

/// Per-card runtime data prepared at rebuild.
struct CardRuntime {
    cycle: Cycle,
    birth_offset: i64,
    axis: Vec3,
    /// Normalized action lists: index 0 is the root level, 1.. are nested.
    levels: Vec<Vec<ActionOp>>,
    /// Any dynamic transform source references per-point locals.
    point_dependent: bool,
    visual: VisualProgram,
    global_plan: PlanKey,
    local_plan: PlanKey,
}

/// Frame-scoped per-group cache: anchor transform, point-independent level
/// results, and the group-level visual snapshot.
#[derive(Default)]
struct GroupRuntime {
    tick: Option<i64>,
    anchor: Option<Vec3>,
    level_cache: HashMap<(u8, u32), Vec3>,
    visual: Option<VisualOut>,
}

impl GroupRuntime {
    fn reset(&mut self, tick: i64) {
        self.tick = Some(tick);
        self.anchor = None;
        self.level_cache.clear();
        self.visual = None;
    }
}

/// The evaluation engine.
pub struct Engine {
    scene: SceneDesc,
    scripts: ScriptHost,
    index: PointIndex,
    cards: HashMap<CardId, CardRuntime>,
    growth: GrowthCache,
    lifecycles: HashMap<CardId, LifecycleState>,
    spin_states: HashMap<SpinKey, SpinState>,
    mem: HashMap<CardId, rhai::Map>,
    group_runtime: Vec<GroupRuntime>,
    last_applied: Option<i64>,
    out: OutputBuffers,
}

impl Engine {
    pub fn new(scene: SceneDesc) -> Self {
        let mut engine = Self {
            scene: SceneDesc::default(),
            scripts: ScriptHost::new(),
            index: PointIndex::default(),
            cards: HashMap::new(),
            growth: GrowthCache::new(),
            lifecycles: HashMap::new(),
            spin_states: HashMap::new(),
            mem: HashMap::new(),
            group_runtime: Vec::new(),
            last_applied: None,
            out: OutputBuffers::default(),
        };
        engine.rebuild(scene);
        engine
    }

    /// Build an engine from the editor's JSON scene document.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let scene: SceneDesc =
            serde_json::from_str(json).context("failed to parse scene descriptor")?;
        Ok(Self::new(scene))
    }

    /// Replace the scene and rebuild the point index.
    ///
    /// Compiled script slots survive (they are keyed by stable slot ids and
    /// unchanged sources skip the compiler); everything else — growth plans,
    /// group caches, lifecycle state, card scopes — is invalidated
    /// wholesale, and the tick clock resets.
    pub fn rebuild(&mut self, scene: SceneDesc) {
        self.scene = scene;

        self.compile_all();

        let globals = resolve_globals(&self.scene.variables);
        self.index = build_index(&self.scene, &mut self.scripts, &globals);

        self.growth.clear();
        self.cards.clear();
        self.lifecycles.clear();
        self.spin_states.clear();
        self.mem.clear();

        for card in &self.scene.cards {
            let instances = self.index.instances.get(&card.id).copied().unwrap_or(0);
            let per_instance = self
                .index
                .points_per_instance
                .get(&card.id)
                .copied()
                .unwrap_or(0);

            let mut levels = Vec::with_capacity(card.levels.len() + 1);
            let mut point_dependent = false;
            let root = normalize_actions(card.id, 0, &card.actions);
            point_dependent |= root.point_dependent;
            levels.push(root.ops);
            for (li, level) in card.levels.iter().enumerate() {
                let norm = normalize_actions(card.id, (li + 1) as u8, &level.actions);
                point_dependent |= norm.point_dependent;
                levels.push(norm.ops);
            }

            let (visual, _) = crate::visual::prepare_program(card);

            let (global_sources, global_sig) = global_plan_sources(card);
            let (local_sources, local_sig) = local_plan_sources(card);

            let global_plan = PlanKey {
                card: card.id,
                scope: GrowthScope::Global,
                count: instances,
                signature: global_sig,
            };
            let local_plan = PlanKey {
                card: card.id,
                scope: GrowthScope::Local,
                count: per_instance,
                signature: local_sig,
            };

            // Fully extend within the configured play window so `appear`
            // can be derived from the ticks growth needs.
            let play_cfg = (card.cycle.appear.max(0) + card.cycle.live.max(0)).max(1);
            let has_growth = !global_sources.is_empty() || !local_sources.is_empty();

            let gplan = self
                .growth
                .get_or_insert(&global_plan, || GrowthPlan::new(instances, global_sources));
            gplan.extend_to(play_cfg, &mut self.scripts, &globals);
            let global_full = gplan.ticks_to_full();

            let lplan = self
                .growth
                .get_or_insert(&local_plan, || GrowthPlan::new(per_instance, local_sources));
            lplan.extend_to(play_cfg, &mut self.scripts, &globals);
            let local_full = lplan.ticks_to_full();

            let growth_ticks = if has_growth {
                match (global_full, local_full) {
                    (Some(a), Some(b)) => Some(a.max(b) + 1),
                    (Some(a), None) => Some(a + 1),
                    (None, Some(b)) => Some(b + 1),
                    (None, None) => None,
                }
            } else {
                None
            };

            self.cards.insert(
                card.id,
                CardRuntime {
                    cycle: resolve_cycle(&card.cycle, growth_ticks),
                    birth_offset: card.birth_offset,
                    axis: card.axis_vec(),
                    levels,
                    point_dependent,
                    visual,
                    global_plan,
                    local_plan,
                },
            );
        }

        self.group_runtime = (0..self.index.groups.len())
            .map(|_| GroupRuntime::default())
            .collect();
        self.out.resize(self.index.len());
        self.last_applied = None;

        log::info!(
            "rebuilt scene: {} cards, {} points, {} groups",
            self.scene.cards.len(),
            self.index.len(),
            self.index.groups.len()
        );
    }

    /// Targeted recompile of one slot (the editor's live-edit path).
    pub fn compile(&mut self, slot: SlotKey, source: &str, force: bool) -> CompileOutcome {
        self.scripts.compile(slot, source, force)
    }

    /// Compile every script in the scene; unchanged sources are cache hits.
    pub fn compile_all(&mut self) -> CompileSummary {
        let slots = collect_compiles(&self.scene);
        let mut summary = CompileSummary::default();
        for (slot, source) in &slots {
            let outcome = self.scripts.compile(*slot, source, false);
            summary.total += 1;
            if outcome.ok {
                summary.compiled += 1;
            } else {
                summary.failed += 1;
                if outcome.used_fallback {
                    summary.fallback += 1;
                }
            }
        }
        summary
    }

    /// Advance the engine to `tick` and refresh the output arrays.
    pub fn advance_to_tick(&mut self, tick: i64) {
        match self.last_applied {
            Some(last) if tick == last => return, // pure re-read
            Some(last) if tick < last => {
                log::warn!(
                    "tick {} requested below last applied {}; rebuild first",
                    tick,
                    last
                );
                return;
            }
            _ => {}
        }

        self.scripts.begin_tick(tick);
        let globals = resolve_globals(&self.scene.variables);

        let Engine {
            scene,
            scripts,
            index,
            cards,
            growth,
            lifecycles,
            spin_states,
            mem,
            group_runtime,
            out,
            ..
        } = self;

        // Phase 1: per-card lifecycle + growth extension.
        let mut ages: HashMap<CardId, (i64, i64)> = HashMap::with_capacity(scene.cards.len());
        for card in &scene.cards {
            let rt = match cards.get(&card.id) {
                Some(rt) => rt,
                None => continue,
            };
            let age = cyclic_age(tick, rt.birth_offset, rt.cycle.total());
            let lc = lifecycles.entry(card.id).or_default();
            lc.observe(age, &rt.cycle, tick);
            let eff = lc.effective_age(age, &rt.cycle);

            let horizon = eff.min(rt.cycle.total());
            if let Some(plan) = growth.get_mut(&rt.global_plan) {
                plan.extend_to(horizon, scripts, &globals);
            }
            if let Some(plan) = growth.get_mut(&rt.local_plan) {
                plan.extend_to(horizon, scripts, &globals);
            }

            ages.insert(card.id, (age, eff));
        }

        // Phase 2: per-group snapshots and per-point outputs.
        for (gi, group) in index.groups.iter().enumerate() {
            let owner = group.key.owner;
            let rt = match cards.get(&owner) {
                Some(rt) => rt,
                None => continue,
            };
            let (_age, eff) = match ages.get(&owner) {
                Some(v) => *v,
                None => continue,
            };
            let rvi = group.key.root_virtual_index;
            let instances = index.instances.get(&owner).copied().unwrap_or(0);

            let grt = &mut group_runtime[gi];
            if grt.tick != Some(tick) {
                grt.reset(tick);
            }

            let instance_visible = growth
                .get(&rt.global_plan)
                .map(|p| p.limit_at(eff) > rvi)
                .unwrap_or(false);

            if !instance_visible {
                for &pi in &group.members {
                    write_hidden(out, pi);
                }
                continue;
            }

            // Anchor snapshot: computed once per group per tick.
            let first = &index.points[group.members[0]];
            let anchor = match grt.anchor {
                Some(anchor) => anchor,
                None => {
                    let mut locals = CallLocals::at_tick(tick);
                    locals.age = eff;
                    locals.index = rvi as i64;
                    locals.count = instances as i64;
                    locals.rel = first.anchor;
                    let lc = lifecycles.entry(owner).or_default();
                    locals.status = lc.status;

                    let mut ctx = PipelineCtx {
                        card: owner,
                        level: 0,
                        tick,
                        age: eff,
                        globals: &globals,
                        host: &mut *scripts,
                        spin_states: &mut *spin_states,
                        mem: mem.entry(owner).or_default().clone(),
                    };
                    let (anchor, _axis) =
                        eval_ops(&rt.levels[0], first.anchor, rt.axis, &locals, &mut ctx);
                    mem.insert(owner, ctx.mem);
                    grt.anchor = Some(anchor);
                    anchor
                }
            };

            // Group-level visual snapshot: initializers then controllers.
            let group_visual = match grt.visual {
                Some(v) => v,
                None => {
                    let mut locals = CallLocals::at_tick(tick);
                    locals.age = eff;
                    locals.index = rvi as i64;
                    locals.count = instances as i64;
                    locals.rel = anchor;
                    let lc = lifecycles.entry(owner).or_default();
                    locals.status = lc.status;

                    let mut visual = VisualOut::default();
                    let card_mem = mem.entry(owner).or_default().clone();
                    run_inits(
                        &rt.visual.group_inits,
                        scripts,
                        &globals,
                        &card_mem,
                        &locals,
                        &mut visual,
                    );

                    let mut card_mem = card_mem;
                    for ctrl in &rt.visual.group_ctrls {
                        let result = run_controller(
                            ctrl, scripts, &globals, &card_mem, &locals, &mut visual,
                        );
                        card_mem = result.mem;
                        if ctrl.assigns_status {
                            // Only a changed value counts as an explicit
                            // assignment; re-reading the current status must
                            // not pin it.
                            if let Some(status) = result.status {
                                if status != locals.status {
                                    lifecycles
                                        .entry(owner)
                                        .or_default()
                                        .set_manual(status, tick);
                                }
                            }
                        }
                    }
                    mem.insert(owner, card_mem);
                    grt.visual = Some(visual);
                    visual
                }
            };

            let lplan = growth.get(&rt.local_plan);

            for (j, &pi) in group.members.iter().enumerate() {
                let point = &index.points[pi];
                let unlock = lplan.and_then(|p| p.unlock_tick(j));
                let visible = unlock.map(|u| u <= eff).unwrap_or(false);
                if !visible {
                    write_hidden(out, pi);
                    continue;
                }
                let point_age = unlock.map(|u| (eff - u).max(0)).unwrap_or(eff);

                // Nested-level offsets, per-group cached when the governing
                // scripts are provably point-independent.
                let mut local_total = Vec3::ZERO;
                let mut ancestors = vec![anchor];
                for (li, lref) in point.level_refs.iter().enumerate() {
                    let level = (li + 1) as u8;
                    let cache_key = (level, lref.ref_index);
                    let cached = if rt.point_dependent {
                        None
                    } else {
                        grt.level_cache.get(&cache_key).copied()
                    };
                    let transformed = match cached {
                        Some(v) => v,
                        None => {
                            let mut locals = CallLocals::at_tick(tick);
                            locals.age = point_age;
                            locals.index = point.local_index as i64;
                            locals.count = point.sibling_count as i64;
                            locals.rel = lref.offset;
                            locals.ancestors = ancestors.clone();

                            let ops = rt
                                .levels
                                .get(li + 1)
                                .map(|v| v.as_slice())
                                .unwrap_or(&[]);
                            let mut ctx = PipelineCtx {
                                card: owner,
                                level,
                                tick,
                                age: eff,
                                globals: &globals,
                                host: &mut *scripts,
                                spin_states: &mut *spin_states,
                                mem: mem.entry(owner).or_default().clone(),
                            };
                            let (v, _axis) =
                                eval_ops(ops, lref.offset, rt.axis, &locals, &mut ctx);
                            mem.insert(owner, ctx.mem);
                            if !rt.point_dependent {
                                grt.level_cache.insert(cache_key, v);
                            }
                            v
                        }
                    };
                    local_total += transformed;
                    ancestors.push(lref.offset);
                }

                let position = anchor + local_total;

                // Per-point visual pass on top of the group snapshot.
                let mut visual = group_visual;
                if !rt.visual.point_inits.is_empty() || !rt.visual.point_ctrls.is_empty() {
                    let mut locals = CallLocals::at_tick(tick);
                    locals.age = point_age;
                    locals.index = point.local_index as i64;
                    locals.count = point.sibling_count as i64;
                    locals.rel = position;
                    let lc = lifecycles.entry(owner).or_default();
                    locals.status = lc.status;

                    let card_mem = mem.entry(owner).or_default().clone();
                    run_inits(
                        &rt.visual.point_inits,
                        scripts,
                        &globals,
                        &card_mem,
                        &locals,
                        &mut visual,
                    );
                    let mut card_mem = card_mem;
                    for ctrl in &rt.visual.point_ctrls {
                        let result = run_controller(
                            ctrl, scripts, &globals, &card_mem, &locals, &mut visual,
                        );
                        card_mem = result.mem;
                        if ctrl.assigns_status {
                            if let Some(status) = result.status {
                                if status != locals.status {
                                    lifecycles
                                        .entry(owner)
                                        .or_default()
                                        .set_manual(status, tick);
                                }
                            }
                        }
                    }
                    mem.insert(owner, card_mem);
                }

                write_point(out, pi, position, &visual);
            }
        }

        // A card whose controllers no longer assign status releases the pin
        // so the automatic rule resumes.
        for card in &scene.cards {
            if let Some(rt) = cards.get(&card.id) {
                if !rt.visual.any_assigns_status {
                    if let Some(lc) = lifecycles.get_mut(&card.id) {
                        lc.release_manual();
                    }
                }
            }
        }

        self.last_applied = Some(tick);
    }

    pub fn outputs(&self) -> &OutputBuffers {
        &self.out
    }

    pub fn point_count(&self) -> usize {
        self.index.len()
    }

    pub fn last_applied_tick(&self) -> Option<i64> {
        self.last_applied
    }

    /// Resolved cycle for a card (appear derived from growth needs).
    pub fn cycle_for(&self, id: CardId) -> Option<Cycle> {
        self.cards.get(&id).map(|rt| rt.cycle)
    }

    /// Current lifecycle status and effective age for a card, as of the
    /// last applied tick.
    pub fn card_state(&self, id: CardId) -> Option<(Status, i64)> {
        let rt = self.cards.get(&id)?;
        let lc = self.lifecycles.get(&id)?;
        let tick = self.last_applied?;
        let age = cyclic_age(tick, rt.birth_offset, rt.cycle.total());
        Some((lc.status, lc.effective_age(age, &rt.cycle)))
    }

    /// Drain pending script diagnostics for the editor UI.
    pub fn take_diagnostics(&mut self) -> Vec<ScriptDiagnostic> {
        self.scripts.take_diagnostics()
    }

    /// Number of real compiler invocations so far.
    pub fn compile_count(&self) -> u64 {
        self.scripts.compile_count()
    }
}

fn write_hidden(out: &mut OutputBuffers, pi: usize) {
    out.positions[pi * 3..pi * 3 + 3].copy_from_slice(&[0.0; 3]);
    out.colors[pi * 3..pi * 3 + 3].copy_from_slice(&[0.0; 3]);
    out.sizes[pi] = crate::visual::MIN_POINT_SIZE;
    out.alphas[pi] = 0.0;
    out.visible[pi] = false;
}

fn write_point(out: &mut OutputBuffers, pi: usize, position: Vec3, visual: &VisualOut) {
    let (color, size, alpha) = finalize(visual);
    out.positions[pi * 3..pi * 3 + 3].copy_from_slice(&position.to_array());
    out.colors[pi * 3..pi * 3 + 3].copy_from_slice(&color);
    out.sizes[pi] = size;
    out.alphas[pi] = alpha;
    out.visible[pi] = true;
}

/// All script slots the scene declares, with their sources.
fn collect_compiles(scene: &SceneDesc) -> Vec<(SlotKey, String)> {
    let mut slots = Vec::new();

    for card in &scene.cards {
        if let Geometry::Builder { script, .. } = &card.geometry {
            slots.push((
                SlotKey::Builder {
                    card: card.id,
                    level: 0,
                },
                script.clone(),
            ));
        }
        for (li, level) in card.levels.iter().enumerate() {
            if let Geometry::Builder { script, .. } = &level.geometry {
                slots.push((
                    SlotKey::Builder {
                        card: card.id,
                        level: (li + 1) as u8,
                    },
                    script.clone(),
                ));
            }
        }

        let root = normalize_actions(card.id, 0, &card.actions);
        slots.extend(root.compiles);
        for (li, level) in card.levels.iter().enumerate() {
            let norm = normalize_actions(card.id, (li + 1) as u8, &level.actions);
            slots.extend(norm.compiles);
        }

        let (_, visual_compiles) = crate::visual::prepare_program(card);
        slots.extend(visual_compiles);

        let (_, global_compiles) = global_growth_slots(card);
        slots.extend(global_compiles);
        let (_, local_compiles) = local_growth_slots(card);
        slots.extend(local_compiles);
    }

    slots
}

fn global_growth_slots(card: &Card) -> (PlanSources, Vec<(SlotKey, String)>) {
    let mut sources = PlanSources {
        combine: card.growth.global.combine,
        sequenced: card.sequenced,
        ..Default::default()
    };
    let mut compiles = Vec::new();

    for (i, entry) in card.growth.global.curve.iter().enumerate() {
        let slot = SlotKey::Condition {
            card: card.id,
            scope: GrowthScope::Global,
            entry: i as u16,
        };
        sources.curve.push((slot, entry.count));
        compiles.push((slot, entry.cond.clone()));
    }
    if let Some(script) = &card.growth.global.script {
        let slot = SlotKey::Growth {
            card: card.id,
            scope: GrowthScope::Global,
            level: 0,
        };
        sources.scripts.push(slot);
        compiles.push((slot, script.clone()));
    }

    (sources, compiles)
}

fn local_growth_slots(card: &Card) -> (PlanSources, Vec<(SlotKey, String)>) {
    let mut sources = PlanSources {
        combine: card.growth.local.combine,
        sequenced: card.levels.iter().any(|l| l.sequenced),
        ..Default::default()
    };
    let mut compiles = Vec::new();
    let mut entry_index: u16 = 0;

    let mut add_settings = |settings: &crate::card::GrowthSettings,
                            level: u8,
                            sources: &mut PlanSources,
                            compiles: &mut Vec<(SlotKey, String)>,
                            entry_index: &mut u16| {
        for entry in &settings.curve {
            let slot = SlotKey::Condition {
                card: card.id,
                scope: GrowthScope::Local,
                entry: *entry_index,
            };
            *entry_index += 1;
            sources.curve.push((slot, entry.count));
            compiles.push((slot, entry.cond.clone()));
        }
        if let Some(script) = &settings.script {
            let slot = SlotKey::Growth {
                card: card.id,
                scope: GrowthScope::Local,
                level,
            };
            sources.scripts.push(slot);
            compiles.push((slot, script.clone()));
        }
    };

    add_settings(
        &card.growth.local,
        0,
        &mut sources,
        &mut compiles,
        &mut entry_index,
    );
    for (li, level) in card.levels.iter().enumerate() {
        add_settings(
            &level.growth,
            (li + 1) as u8,
            &mut sources,
            &mut compiles,
            &mut entry_index,
        );
    }

    (sources, compiles)
}

fn plan_signature(compiles: &[(SlotKey, String)]) -> String {
    let parts: Vec<&str> = compiles.iter().map(|(_, src)| src.as_str()).collect();
    source_signature(&parts)
}

fn global_plan_sources(card: &Card) -> (PlanSources, String) {
    let (sources, compiles) = global_growth_slots(card);
    let signature = plan_signature(&compiles);
    (sources, signature)
}

fn local_plan_sources(card: &Card) -> (PlanSources, String) {
    let (sources, compiles) = local_growth_slots(card);
    let signature = plan_signature(&compiles);
    (sources, signature)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_scene(json: &str) -> Engine {
        match Engine::from_json(json) {
            Ok(engine) => engine,
            Err(err) => panic!("scene failed to parse: {err}"),
        }
    }

    const RING: &str = r#"{
        "cards": [{
            "id": 1,
            "name": "ring",
            "geometry": { "kind": "points", "positions": [[1,0,0],[0,0,1]] },
            "actions": [{ "kind": "spin", "rate": "0.314159265" }],
            "visuals": [
                { "attr": "size", "expr": "2.0" },
                { "attr": "color", "expr": "vec3(1.0, 0.0, 0.0)" }
            ],
            "cycle": { "appear": 1, "live": 200, "fade": 0 }
        }]
    }"#;

    #[test]
    fn test_outputs_are_sized_to_points() {
        let mut engine = simple_scene(RING);
        assert_eq!(engine.point_count(), 2);
        engine.advance_to_tick(0);
        let out = engine.outputs();
        assert_eq!(out.positions.len(), 6);
        assert_eq!(out.sizes.len(), 2);
        assert_eq!(out.position_bytes().len(), 24);
        assert!(out.visible.iter().all(|&v| v));
    }

    #[test]
    fn test_same_tick_twice_is_byte_identical() {
        let mut engine = simple_scene(RING);
        engine.advance_to_tick(5);
        let first = engine.outputs().clone();
        engine.advance_to_tick(5);
        assert_eq!(&first, engine.outputs());
    }

    #[test]
    fn test_regressing_tick_is_a_no_op() {
        let mut engine = simple_scene(RING);
        engine.advance_to_tick(10);
        let at_ten = engine.outputs().clone();
        engine.advance_to_tick(3);
        assert_eq!(&at_ten, engine.outputs());
        assert_eq!(engine.last_applied_tick(), Some(10));
    }

    #[test]
    fn test_spin_moves_points_between_ticks() {
        let mut engine = simple_scene(RING);
        engine.advance_to_tick(0);
        let p0 = engine.outputs().positions.clone();
        engine.advance_to_tick(5);
        let p5 = engine.outputs().positions.clone();
        assert_ne!(p0, p5);
    }

    #[test]
    fn test_visual_initializers_apply() {
        let mut engine = simple_scene(RING);
        engine.advance_to_tick(0);
        let out = engine.outputs();
        assert_eq!(out.sizes[0], 2.0);
        // Red stays red through linearization; green/blue stay zero.
        assert!((out.colors[0] - 1.0).abs() < 1e-5);
        assert_eq!(out.colors[1], 0.0);
        assert_eq!(out.colors[2], 0.0);
    }

    #[test]
    fn test_compile_all_summary_and_caching() {
        let mut engine = simple_scene(RING);
        let calls = engine.compile_count();
        // All sources unchanged: a second bulk compile hits the cache.
        let summary = engine.compile_all();
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.compiled, summary.total);
        assert_eq!(engine.compile_count(), calls);
    }

    #[test]
    fn test_rebuild_resets_tick_clock() {
        let mut engine = simple_scene(RING);
        engine.advance_to_tick(10);
        let scene = match serde_json::from_str::<SceneDesc>(RING) {
            Ok(s) => s,
            Err(e) => panic!("{e}"),
        };
        engine.rebuild(scene);
        assert_eq!(engine.last_applied_tick(), None);
        engine.advance_to_tick(0);
        assert_eq!(engine.last_applied_tick(), Some(0));
    }
}
