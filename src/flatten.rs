//! Scene flattening: cards → a flat array of point records plus groups.
//!
//! Each card's base points (literal or builder-generated) are
//! cross-multiplied with its nested level geometry; N-fold angular
//! repetition duplicates every combination with a distinct repeat index.
//! The repeat rotation is static per instance, so it is baked into the
//! anchor and level offsets here rather than re-derived every tick.
//!
//! A second pass buckets points into groups by (owner, birth offset, root
//! virtual index) — the memoization unit for per-tick transform results.
//! Rebuilding is O(total points) and must re-run whenever the card list or
//! its geometry changes; the engine clears all per-group caches when it
//! does.

use std::collections::HashMap;
use std::f32::consts::TAU;

use glam::{Quat, Vec3};
use rhai::Dynamic;

use crate::card::{CardId, Geometry, SceneDesc};
use crate::script_scope::{build_scope, CallLocals};
use crate::scripting::{dynamic_to_vec3, ScriptHost, SlotKey};

/// One nested-level contribution to a point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelRef {
    /// The level-local offset (repeat rotation already applied).
    pub offset: Vec3,
    /// Index into the level's point list, for sequencing and re-derivation.
    pub ref_index: u32,
}

/// One flattened output slot.
#[derive(Debug, Clone)]
pub struct PointRecord {
    pub owner: CardId,
    /// Index within the owner, in generation order.
    pub local_index: u32,
    /// Total points the owner contributes.
    pub sibling_count: u32,
    /// The root anchor point this record derives from.
    pub anchor: Vec3,
    /// Sum of all nested-level offsets.
    pub local_sum: Vec3,
    /// Per-level (offset, reference index) pairs, outermost level first.
    pub level_refs: Vec<LevelRef>,
    /// Whether nested-level ops apply to this record.
    pub leveled: bool,
    /// Virtual index of the owning root instance, for ordered reveal
    /// across repeated roots.
    pub root_virtual_index: u32,
    pub repeat_index: u32,
    pub birth_offset: i64,
    /// Index of the owning group in `PointIndex::groups`.
    pub group: usize,
}

/// Group identity: points sharing these are transform-cache siblings.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupKey {
    pub owner: CardId,
    pub birth_offset: i64,
    pub root_virtual_index: u32,
}

/// A memoization bucket of flattened points.
#[derive(Debug, Clone)]
pub struct Group {
    pub key: GroupKey,
    /// Indices into `PointIndex::points`, in reveal order.
    pub members: Vec<usize>,
}

/// The flattened scene.
#[derive(Debug, Clone, Default)]
pub struct PointIndex {
    pub points: Vec<PointRecord>,
    pub groups: Vec<Group>,
    /// Shape instances per card (root points × angular repeats).
    pub instances: HashMap<CardId, u32>,
    /// Points per single instance, per card.
    pub points_per_instance: HashMap<CardId, u32>,
}

impl PointIndex {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Resolve a geometry's point list. Builder scripts run in the sandbox; a
/// builder without a live callable yields no points.
fn resolve_geometry(
    geometry: &Geometry,
    slot: SlotKey,
    host: &mut ScriptHost,
    globals: &HashMap<String, Dynamic>,
) -> Vec<Vec3> {
    match geometry {
        Geometry::Point { position } => vec![Vec3::from_array(*position)],
        Geometry::Points { positions } => {
            positions.iter().map(|p| Vec3::from_array(*p)).collect()
        }
        Geometry::Builder { count, .. } => {
            if !host.has_callable(slot) {
                log::warn!("builder geometry for {:?} has no compiled script", slot);
                return Vec::new();
            }
            let count = *count as i64;
            let mem = rhai::Map::new();
            (0..count)
                .map(|i| {
                    let mut locals = CallLocals::at_tick(0);
                    locals.index = i;
                    locals.count = count;
                    let mut scope = build_scope(globals, &mem, &locals);
                    host.eval_slot(slot, &mut scope)
                        .map(|v| dynamic_to_vec3(&v))
                        .unwrap_or(Vec3::ZERO)
                })
                .collect()
        }
    }
}

/// Expand the card list into the flat point array and its group index.
pub fn build_index(
    scene: &SceneDesc,
    host: &mut ScriptHost,
    globals: &HashMap<String, Dynamic>,
) -> PointIndex {
    let mut index = PointIndex::default();
    let mut group_of: HashMap<GroupKey, usize> = HashMap::new();

    for card in &scene.cards {
        let roots = resolve_geometry(
            &card.geometry,
            SlotKey::Builder {
                card: card.id,
                level: 0,
            },
            host,
            globals,
        );
        if roots.is_empty() {
            // Structural error: the card contributes zero points rather
            // than failing the rebuild.
            log::warn!("card {:?} ({}) has no base points", card.id, card.name);
            continue;
        }

        let level_lists: Vec<Vec<Vec3>> = card
            .levels
            .iter()
            .enumerate()
            .map(|(li, level)| {
                resolve_geometry(
                    &level.geometry,
                    SlotKey::Builder {
                        card: card.id,
                        level: (li + 1) as u8,
                    },
                    host,
                    globals,
                )
            })
            .collect();
        // A declared level with no points would zero out the whole product;
        // drop such levels instead.
        let level_lists: Vec<Vec<Vec3>> =
            level_lists.into_iter().filter(|l| !l.is_empty()).collect();

        let repeats = card
            .angle_repeat
            .as_ref()
            .map(|r| r.count.max(1))
            .unwrap_or(1);
        let repeat_axis = card
            .angle_repeat
            .as_ref()
            .map(|r| r.axis_vec())
            .unwrap_or(Vec3::Y);

        let per_instance: u32 = level_lists
            .iter()
            .map(|l| l.len() as u32)
            .product::<u32>()
            .max(1);
        let instance_count = roots.len() as u32 * repeats;
        index.instances.insert(card.id, instance_count);
        index.points_per_instance.insert(card.id, per_instance);

        let card_start = index.points.len();

        for (root_idx, root) in roots.iter().enumerate() {
            for repeat in 0..repeats {
                let rvi = root_idx as u32 * repeats + repeat;
                let rot = if repeats > 1 {
                    Quat::from_axis_angle(repeat_axis, repeat as f32 * TAU / repeats as f32)
                } else {
                    Quat::IDENTITY
                };
                let anchor = rot * *root;

                let key = GroupKey {
                    owner: card.id,
                    birth_offset: card.birth_offset,
                    root_virtual_index: rvi,
                };
                let group = *group_of.entry(key.clone()).or_insert_with(|| {
                    index.groups.push(Group {
                        key,
                        members: Vec::new(),
                    });
                    index.groups.len() - 1
                });

                // Cartesian product over nested level points.
                let mut combo = vec![0usize; level_lists.len()];
                loop {
                    let mut local_sum = Vec3::ZERO;
                    let mut level_refs = Vec::with_capacity(level_lists.len());
                    for (li, list) in level_lists.iter().enumerate() {
                        let offset = rot * list[combo[li]];
                        local_sum += offset;
                        level_refs.push(LevelRef {
                            offset,
                            ref_index: combo[li] as u32,
                        });
                    }

                    let point_idx = index.points.len();
                    index.points.push(PointRecord {
                        owner: card.id,
                        local_index: (point_idx - card_start) as u32,
                        sibling_count: 0, // filled below
                        anchor,
                        local_sum,
                        leveled: !level_refs.is_empty(),
                        level_refs,
                        root_virtual_index: rvi,
                        repeat_index: repeat,
                        birth_offset: card.birth_offset,
                        group,
                    });
                    index.groups[group].members.push(point_idx);

                    // Advance the mixed-radix combination counter.
                    let mut li = level_lists.len();
                    loop {
                        if li == 0 {
                            break;
                        }
                        li -= 1;
                        combo[li] += 1;
                        if combo[li] < level_lists[li].len() {
                            break;
                        }
                        combo[li] = 0;
                    }
                    if level_lists.is_empty() || combo.iter().all(|&c| c == 0) {
                        break;
                    }
                }
            }
        }

        let sibling_count = (index.points.len() - card_start) as u32;
        for point in &mut index.points[card_start..] {
            point.sibling_count = sibling_count;
        }
    }

    log::debug!(
        "flattened {} cards into {} points / {} groups",
        scene.cards.len(),
        index.points.len(),
        index.groups.len()
    );

    index
}
