//! Retail back-office engine.
//!
//! The core of the POS back office: the cashier session lifecycle (open,
//! temporary close, permanent close with cash variance settlement, reopen),
//! the interim settlement ledger, and the business-day close with its
//! checklist gate and settlement reconciliation. Callers — the back-office
//! front-end or any other client — invoke the async operations in
//! [`commands`]; everything persists through the SQLite layer in [`db`].

use serde_json::Value;
use std::path::Path;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod commands;
pub mod db;
pub mod dayclose;
pub mod error;
pub mod money;
pub mod sessions;
pub mod settlement;

pub use error::{EngineError, Result};

/// First non-empty string found under any of `keys`, trimmed.
pub(crate) fn value_str(v: &Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(s) = v.get(*key).and_then(|x| x.as_str()) {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

/// Initialize structured logging (console + daily rolling file).
///
/// Honors `RUST_LOG`; defaults to info with engine-level debug.
pub fn init_tracing(log_dir: &Path) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,retail_backoffice=debug"));

    std::fs::create_dir_all(log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(log_dir, "backoffice");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    // Keep the guard alive for the lifetime of the process — dropping it
    // flushes logs. We leak it intentionally since the engine runs until
    // process exit.
    std::mem::forget(guard);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_str_trims_and_walks_aliases() {
        let payload = serde_json::json!({
            "sessionId": "  ",
            "session_id": " session-1 "
        });
        assert_eq!(
            value_str(&payload, &["sessionId", "session_id"]).as_deref(),
            Some("session-1")
        );
        assert!(value_str(&payload, &["dayId"]).is_none());
    }
}
