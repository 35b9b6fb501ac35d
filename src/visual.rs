//! Visual attribute resolution: per-point/per-group color, size and alpha.
//!
//! Static initializers (string expressions tagged color/size/alpha) are
//! evaluated once per group, unless the expression references the per-point
//! `age` variable — then it runs per point. Controller scripts run after
//! the initializers in declared order, through a read/write facade (`color`,
//! `size`, `alpha`, `status`); the `status` write funnels into the
//! lifecycle controller's sticky-status rule.
//!
//! Output is clamped (size floor, alpha and color components in [0, 1]) and
//! color is converted from the author-facing sRGB space to linear for the
//! renderer.

use std::collections::HashMap;

use glam::Vec3;
use rhai::Dynamic;

use crate::card::{Card, VisualAttr};
use crate::script_scope::{build_scope, take_mem, take_status, CallLocals};
use crate::scripting::{
    assigns_status, dynamic_to_f32, dynamic_to_vec3, references_age, references_point_locals,
    ScriptHost, SlotKey,
};
use crate::timeline::Status;

/// Smallest size a point may report; keeps degenerate sizes drawable.
pub const MIN_POINT_SIZE: f32 = 1.0e-3;

/// Resolved visual attributes before clamping/linearization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VisualOut {
    /// Author-space (sRGB) color.
    pub color: Vec3,
    pub size: f32,
    pub alpha: f32,
}

impl Default for VisualOut {
    fn default() -> Self {
        Self {
            color: Vec3::ONE,
            size: 1.0,
            alpha: 1.0,
        }
    }
}

impl VisualOut {
    pub fn clamp(&mut self) {
        self.color = self.color.clamp(Vec3::ZERO, Vec3::ONE);
        self.size = self.size.max(MIN_POINT_SIZE);
        self.alpha = self.alpha.clamp(0.0, 1.0);
    }
}

/// One compiled controller reference.
#[derive(Debug, Clone, Copy)]
pub struct ControllerRef {
    pub slot: SlotKey,
    /// Whether the source assigns `status` (pins the lifecycle).
    pub assigns_status: bool,
}

/// A card's visual evaluation plan, split by granularity.
#[derive(Debug, Clone, Default)]
pub struct VisualProgram {
    pub group_inits: Vec<(VisualAttr, SlotKey)>,
    pub point_inits: Vec<(VisualAttr, SlotKey)>,
    pub group_ctrls: Vec<ControllerRef>,
    pub point_ctrls: Vec<ControllerRef>,
    /// True when any controller source assigns `status` this generation.
    pub any_assigns_status: bool,
}

/// Build a card's visual program, collecting the slots that need compiling.
pub fn prepare_program(card: &Card) -> (VisualProgram, Vec<(SlotKey, String)>) {
    let mut program = VisualProgram::default();
    let mut compiles = Vec::new();

    for (i, init) in card.visuals.iter().enumerate() {
        let slot = SlotKey::Visual {
            card: card.id,
            index: i as u16,
        };
        compiles.push((slot, init.expr.clone()));
        if references_age(&init.expr) {
            program.point_inits.push((init.attr, slot));
        } else {
            program.group_inits.push((init.attr, slot));
        }
    }

    for (i, ctrl) in card.controllers.iter().enumerate() {
        let slot = SlotKey::Controller {
            card: card.id,
            action: i as u16,
        };
        compiles.push((slot, ctrl.source.clone()));
        let assigns = assigns_status(&ctrl.source);
        program.any_assigns_status |= assigns;
        let reference = ControllerRef {
            slot,
            assigns_status: assigns,
        };
        if references_point_locals(&ctrl.source) {
            program.point_ctrls.push(reference);
        } else {
            program.group_ctrls.push(reference);
        }
    }

    (program, compiles)
}

/// Apply one evaluated initializer value to the visual record.
pub fn apply_init(attr: VisualAttr, value: &Dynamic, visual: &mut VisualOut) {
    match attr {
        VisualAttr::Color => visual.color = dynamic_to_vec3(value),
        VisualAttr::Size => visual.size = dynamic_to_f32(value),
        VisualAttr::Alpha => visual.alpha = dynamic_to_f32(value),
    }
}

/// Run the initializers in `inits` against `visual`.
pub fn run_inits(
    inits: &[(VisualAttr, SlotKey)],
    host: &mut ScriptHost,
    globals: &HashMap<String, Dynamic>,
    mem: &rhai::Map,
    locals: &CallLocals,
    visual: &mut VisualOut,
) {
    for &(attr, slot) in inits {
        let mut scope = build_scope(globals, mem, locals);
        if let Some(value) = host.eval_slot(slot, &mut scope) {
            apply_init(attr, &value, visual);
        }
        // A failed initializer leaves the previous value standing.
    }
}

/// Outcome of one controller run.
pub struct ControllerResult {
    /// The `status` value after the call (always present; the caller only
    /// acts on it when the source assigns).
    pub status: Option<Status>,
    /// The card-shared scope after the call.
    pub mem: rhai::Map,
}

/// Run one controller through the read/write facade.
pub fn run_controller(
    ctrl: &ControllerRef,
    host: &mut ScriptHost,
    globals: &HashMap<String, Dynamic>,
    mem: &rhai::Map,
    locals: &CallLocals,
    visual: &mut VisualOut,
) -> ControllerResult {
    let mut scope = build_scope(globals, mem, locals);
    scope.push("color", visual.color);
    scope.push("size", visual.size);
    scope.push("alpha", visual.alpha);

    host.eval_slot(ctrl.slot, &mut scope);

    // Read the facade back with coercion: authors write `size = 2` as
    // readily as `size = 2.0`.
    if let Some(color) = scope.get_value::<Dynamic>("color") {
        visual.color = dynamic_to_vec3(&color);
    }
    if let Some(size) = scope.get_value::<Dynamic>("size") {
        visual.size = dynamic_to_f32(&size);
    }
    if let Some(alpha) = scope.get_value::<Dynamic>("alpha") {
        visual.alpha = dynamic_to_f32(&alpha);
    }

    ControllerResult {
        status: take_status(&scope),
        mem: take_mem(&scope).unwrap_or_else(|| mem.clone()),
    }
}

/// Author-facing sRGB component to linear.
pub fn srgb_to_linear(c: f32) -> f32 {
    let c = c.clamp(0.0, 1.0);
    if c <= 0.04045 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

/// Clamp and linearize a visual record into renderer components.
pub fn finalize(visual: &VisualOut) -> ([f32; 3], f32, f32) {
    let mut v = *visual;
    v.clamp();
    (
        [
            srgb_to_linear(v.color.x),
            srgb_to_linear(v.color.y),
            srgb_to_linear(v.color.z),
        ],
        v.size,
        v.alpha,
    )
}
