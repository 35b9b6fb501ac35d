//! pointlace: the per-frame evaluation engine of a point-cloud effect
//! authoring tool.
//!
//! Cards (geometry + scripts + growth/lifecycle settings) go in; flat
//! position/color/size/alpha/visibility arrays come out, once per tick.
//! Author scripts run in a sandboxed rhai engine with last-good fallback so
//! a bad edit can never crash the preview.

pub mod card;
pub mod engine;
pub mod flatten;
pub mod growth;
pub mod script_diagnostics;
pub mod script_log;
pub mod script_scope;
pub mod scripting;
pub mod timeline;
pub mod transform;
pub mod visual;
