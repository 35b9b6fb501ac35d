//! Structured script diagnostics.
//!
//! Rhai provides rich error types (parse + runtime) with positions. The
//! engine wraps those into a stable, JSON-serializable diagnostic format the
//! editor can surface next to the offending script slot, without requiring
//! access to Rust logs. Scripts compile standalone (no injected prelude), so
//! rhai positions are already user-relative.

use serde::Serialize;

use crate::scripting::SlotKey;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScriptDiagnosticKind {
    /// Syntax/parse errors (compile time).
    ParseError,
    /// Runtime errors in user code.
    RuntimeError,
    /// Script used the sandbox API incorrectly (missing members, wrong
    /// types, unknown variables).
    HostApiMisuse,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScriptPhase {
    Compile,
    Eval,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ScriptLocation {
    /// 1-based line number in the author's script.
    pub line: u32,
    /// 1-based column number.
    pub column: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScriptDiagnostic {
    pub kind: ScriptDiagnosticKind,
    pub phase: ScriptPhase,
    /// The script slot the diagnostic belongs to, so the editor can attach
    /// it to the right text field.
    pub slot: SlotKey,
    pub message: String,
    pub location: Option<ScriptLocation>,
}

fn classify_message(message: &str) -> ScriptDiagnosticKind {
    // Rhai error strings are fairly stable; this is a pragmatic
    // classification that avoids depending on rhai's internal enum variants.
    let lower = message.to_ascii_lowercase();

    if lower.contains("property not found")
        || lower.contains("variable not found")
        || lower.contains("function not found")
        || lower.contains("index")
        || lower.contains("map key")
        || lower.contains("mismatched types")
        || lower.contains("invalid")
    {
        return ScriptDiagnosticKind::HostApiMisuse;
    }

    ScriptDiagnosticKind::RuntimeError
}

fn location_of(line: u32, column: u32) -> Option<ScriptLocation> {
    if line == 0 {
        return None;
    }
    Some(ScriptLocation {
        line,
        column: column.max(1),
    })
}

pub fn from_parse_error(slot: SlotKey, err: &rhai::ParseError) -> ScriptDiagnostic {
    let pos = err.position();
    let line = pos.line().unwrap_or(0) as u32;
    let column = pos.position().unwrap_or(0) as u32;

    ScriptDiagnostic {
        kind: ScriptDiagnosticKind::ParseError,
        phase: ScriptPhase::Compile,
        slot,
        message: err.to_string(),
        location: location_of(line, column),
    }
}

pub fn from_eval_error(slot: SlotKey, err: &rhai::EvalAltResult) -> ScriptDiagnostic {
    let message = err.to_string();
    let kind = classify_message(&message);

    let pos = err.position();
    let line = pos.line().unwrap_or(0) as u32;
    let column = pos.position().unwrap_or(0) as u32;

    ScriptDiagnostic {
        kind,
        phase: ScriptPhase::Eval,
        slot,
        message,
        location: location_of(line, column),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card::CardId;

    #[test]
    fn test_classify_api_misuse() {
        assert_eq!(
            classify_message("Variable not found: foo (line 1, position 3)"),
            ScriptDiagnosticKind::HostApiMisuse
        );
        assert_eq!(
            classify_message("Division by zero"),
            ScriptDiagnosticKind::RuntimeError
        );
    }

    #[test]
    fn test_parse_error_location() {
        let engine = rhai::Engine::new();
        let err = engine.compile("let x = ;").unwrap_err();
        let slot = SlotKey::Controller {
            card: CardId(1),
            action: 0,
        };
        let diag = from_parse_error(slot, &err);
        assert_eq!(diag.kind, ScriptDiagnosticKind::ParseError);
        assert_eq!(diag.phase, ScriptPhase::Compile);
        assert!(diag.location.is_some());
    }
}
