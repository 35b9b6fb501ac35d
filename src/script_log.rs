//! Bounded logging facade for author scripts.
//!
//! Scripts get `log_info(value)` / `log_warn(value)` / `log_debug(value)`,
//! capped per tick so a script that logs from every point cannot flood the
//! host log. Messages are dispatched through the `log` crate under the
//! `pointlace::script` target.

use std::sync::atomic::{AtomicU32, Ordering};

/// Maximum number of script log messages allowed per tick.
const MAX_LOGS_PER_TICK: u32 = 100;

static LOG_COUNT: AtomicU32 = AtomicU32::new(0);
static WARNED_LIMIT: AtomicU32 = AtomicU32::new(0);

const TARGET: &str = "pointlace::script";

/// Log level for script messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
}

/// Reset the per-tick log counter. The engine calls this at the start of
/// each applied tick.
pub fn reset_tick_log_count() {
    LOG_COUNT.store(0, Ordering::Relaxed);
    WARNED_LIMIT.store(0, Ordering::Relaxed);
}

/// Check if another message may be logged this tick.
fn can_log() -> bool {
    let count = LOG_COUNT.fetch_add(1, Ordering::Relaxed);
    if count >= MAX_LOGS_PER_TICK {
        if WARNED_LIMIT.swap(1, Ordering::Relaxed) == 0 {
            log::warn!(
                target: TARGET,
                "script log limit exceeded ({} messages/tick), further logs dropped",
                MAX_LOGS_PER_TICK
            );
        }
        false
    } else {
        true
    }
}

fn emit(level: LogLevel, message: &str) {
    match level {
        LogLevel::Debug => log::debug!(target: TARGET, "{}", message),
        LogLevel::Info => log::info!(target: TARGET, "{}", message),
        LogLevel::Warn => log::warn!(target: TARGET, "{}", message),
    }
}

/// Log a message from a script, respecting the per-tick limit.
pub fn script_log(level: LogLevel, message: &str) {
    if can_log() {
        emit(level, message);
    }
}

/// Convert a rhai value to a display string without ever panicking.
pub fn stringify_dynamic(value: &rhai::Dynamic) -> String {
    if let Ok(s) = value.clone().into_string() {
        return s;
    }

    if value.is_array() {
        if let Some(arr) = value.clone().try_cast::<rhai::Array>() {
            let parts: Vec<String> = arr.iter().map(stringify_dynamic).collect();
            return parts.join(" ");
        }
    }

    if value.is_map() {
        if let Some(map) = value.clone().try_cast::<rhai::Map>() {
            let parts: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{}: {}", k, stringify_dynamic(v)))
                .collect();
            return format!("{{{}}}", parts.join(", "));
        }
    }

    if let Ok(i) = value.as_int() {
        return i.to_string();
    }
    if let Ok(f) = value.as_float() {
        return format!("{}", f);
    }
    if let Ok(b) = value.as_bool() {
        return b.to_string();
    }
    if value.is_unit() {
        return "()".to_string();
    }

    format!("{:?}", value)
}
