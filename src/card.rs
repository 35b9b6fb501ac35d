//! Authoring-side data model.
//!
//! A `Card` is one author-defined shape/effect unit: base geometry (a literal
//! point list or a builder script), zero or more nested shape levels, display
//! actions, controller scripts, visual initializers, growth settings and a
//! lifecycle cycle. The editor layer hands the engine a `SceneDesc` as one
//! JSON document; these types are its wire format.
//!
//! Vectors are `[f32; 3]` on the wire and converted to `glam::Vec3` at use
//! sites.

use glam::Vec3;
use serde::{Deserialize, Serialize};

/// Stable identifier for a card, assigned by the editor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CardId(pub u64);

/// The whole scene as handed over by the authoring layer.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneDesc {
    #[serde(default)]
    pub cards: Vec<Card>,
    /// Global variable/constant declarations, resolved once per tick into a
    /// flat name → value scope passed to every script.
    #[serde(default)]
    pub variables: Vec<VarDecl>,
}

/// One author-defined shape/effect unit.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Card {
    pub id: CardId,
    #[serde(default)]
    pub name: String,
    pub geometry: Geometry,
    /// Nested shape levels, cross-multiplied with the parent geometry.
    #[serde(default)]
    pub levels: Vec<ShapeLevel>,
    /// Display actions applied to the root (anchor) points.
    #[serde(default)]
    pub actions: Vec<DisplayAction>,
    /// Controller scripts, run in declared order after the initializers.
    #[serde(default)]
    pub controllers: Vec<ControllerScript>,
    /// Static visual initializers (color/size/alpha expressions).
    #[serde(default)]
    pub visuals: Vec<VisualInit>,
    #[serde(default)]
    pub growth: GrowthConfig,
    /// N-fold angular repetition of the whole shape.
    #[serde(default)]
    pub angle_repeat: Option<AngleRepeat>,
    #[serde(default)]
    pub cycle: CycleConfig,
    /// Tick offset of this card's cycle relative to the global clock.
    #[serde(default)]
    pub birth_offset: i64,
    /// Sequenced cards reveal whole shape instances in order; non-sequenced
    /// cards show every instance immediately (absent growth sources).
    #[serde(default)]
    pub sequenced: bool,
    /// Initial axis for the transform pipeline.
    #[serde(default = "default_axis")]
    pub axis: [f32; 3],
}

fn default_axis() -> [f32; 3] {
    [0.0, 1.0, 0.0]
}

impl Card {
    pub fn axis_vec(&self) -> Vec3 {
        let v = Vec3::from_array(self.axis);
        v.try_normalize().unwrap_or(Vec3::Y)
    }
}

/// One nested shape level.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShapeLevel {
    pub geometry: Geometry,
    #[serde(default)]
    pub actions: Vec<DisplayAction>,
    /// Sequenced levels reveal their points in index order.
    #[serde(default)]
    pub sequenced: bool,
    /// Growth sources contributed to the owning card's local plan.
    #[serde(default)]
    pub growth: GrowthSettings,
}

/// Base geometry of a card or level.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Geometry {
    /// A single literal point.
    Point { position: [f32; 3] },
    /// A literal point list.
    Points { positions: Vec<[f32; 3]> },
    /// A builder script evaluated once per index, returning each point.
    Builder { script: String, count: u32 },
}

impl Geometry {
    /// Number of points this geometry yields (builder scripts may still
    /// produce fewer if they fail to compile).
    pub fn declared_count(&self) -> usize {
        match self {
            Geometry::Point { .. } => 1,
            Geometry::Points { positions } => positions.len(),
            Geometry::Builder { count, .. } => *count as usize,
        }
    }
}

/// One display action in a card's or level's ordered action list.
///
/// `dir` and `rate` are author-facing string expressions; compile-time
/// constants are folded into native operations during normalization.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum DisplayAction {
    /// Rotate so the current axis maps onto `dir`.
    Orient { dir: String },
    /// Rotate about the current axis at `rate` radians per tick, optionally
    /// gated by a boolean condition.
    Spin {
        rate: String,
        #[serde(default)]
        cond: Option<String>,
    },
    /// Orient onto `dir`, then keep spinning about it.
    OrientSpin { dir: String, rate: String },
    /// Arbitrary scripted mutation.
    Script { source: String },
}

/// A controller script; order in the vec is execution order.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerScript {
    pub source: String,
}

/// A static visual initializer expression.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VisualInit {
    pub attr: VisualAttr,
    pub expr: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum VisualAttr {
    Color,
    Size,
    Alpha,
}

/// Growth configuration: a global plan (gating whole shape instances) and a
/// local plan (gating points within one instance).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GrowthConfig {
    #[serde(default)]
    pub global: GrowthSettings,
    #[serde(default)]
    pub local: GrowthSettings,
}

/// Growth sources for one plan.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GrowthSettings {
    /// Declarative count curve: the visible limit at a tick is the sum of
    /// counts whose condition holds.
    #[serde(default)]
    pub curve: Vec<CountCurveEntry>,
    /// Scripted growth: walked tick by tick, accumulating `grow()` /
    /// `grow_by(n)` calls.
    #[serde(default)]
    pub script: Option<String>,
    #[serde(default)]
    pub combine: GrowthCombine,
}

impl GrowthSettings {
    pub fn is_empty(&self) -> bool {
        self.curve.is_empty() && self.script.is_none()
    }
}

/// One declarative count-curve entry.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CountCurveEntry {
    /// Boolean condition expression, evaluated in the sandbox.
    pub cond: String,
    pub count: u32,
}

/// How curve and scripted growth values combine when both are present.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum GrowthCombine {
    #[default]
    Add,
    Min,
}

/// N-fold angular repetition config.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AngleRepeat {
    pub count: u32,
    #[serde(default = "default_axis")]
    pub axis: [f32; 3],
}

impl AngleRepeat {
    pub fn axis_vec(&self) -> Vec3 {
        let v = Vec3::from_array(self.axis);
        v.try_normalize().unwrap_or(Vec3::Y)
    }
}

/// Lifecycle cycle lengths in ticks. `fade` may be zero; everything else is
/// clamped to safe bounds when resolved (see `timeline`).
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleConfig {
    pub appear: i64,
    pub live: i64,
    #[serde(default)]
    pub fade: i64,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            appear: 1,
            live: 60,
            fade: 0,
        }
    }
}

/// A typed global variable declaration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VarDecl {
    pub name: String,
    pub value: VarValue,
}

/// Typed variable values the authoring layer can declare.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum VarValue {
    Number(f32),
    Bool(bool),
    Vector([f32; 3]),
    Text(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scene_desc_from_json() {
        let json = r#"{
            "cards": [{
                "id": 1,
                "name": "ring",
                "geometry": { "kind": "points", "positions": [[0,0,0],[1,0,0]] },
                "actions": [{ "kind": "spin", "rate": "0.1" }],
                "cycle": { "appear": 5, "live": 10, "fade": 3 },
                "sequenced": true
            }],
            "variables": [
                { "name": "speed", "value": { "type": "number", "value": 2.5 } },
                { "name": "up", "value": { "type": "vector", "value": [0,1,0] } }
            ]
        }"#;

        let scene: SceneDesc = serde_json::from_str(json).unwrap();
        assert_eq!(scene.cards.len(), 1);
        let card = &scene.cards[0];
        assert_eq!(card.id, CardId(1));
        assert_eq!(card.geometry.declared_count(), 2);
        assert!(card.sequenced);
        assert_eq!(card.cycle.fade, 3);
        assert_eq!(scene.variables.len(), 2);
    }

    #[test]
    fn test_defaults() {
        let json = r#"{
            "id": 7,
            "geometry": { "kind": "point", "position": [0,0,0] }
        }"#;
        let card: Card = serde_json::from_str(json).unwrap();
        assert!(card.levels.is_empty());
        assert!(card.controllers.is_empty());
        assert!(!card.sequenced);
        assert_eq!(card.birth_offset, 0);
        assert_eq!(card.axis_vec(), Vec3::Y);
        assert!(card.growth.global.is_empty());
        assert!(card.growth.local.is_empty());
    }

    #[test]
    fn test_builder_geometry_declared_count() {
        let geo = Geometry::Builder {
            script: "vec3(index, 0, 0)".to_string(),
            count: 12,
        };
        assert_eq!(geo.declared_count(), 12);
    }
}
