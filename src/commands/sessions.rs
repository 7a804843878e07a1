use serde::Deserialize;
use serde_json::Value;

use crate::db::DbState;
use crate::error::{EngineError, Result};
use crate::money;
use crate::sessions as session_service;
use crate::sessions::NewSession;
use crate::value_str;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenSessionPayload {
    #[serde(alias = "cashier_id")]
    cashier_id: String,
    #[serde(default, alias = "cashier_name")]
    cashier_name: Option<String>,
    #[serde(alias = "location_id")]
    location_id: String,
    #[serde(alias = "terminal_id")]
    terminal_id: String,
}

fn parse_open_session_payload(arg0: Option<Value>) -> Result<NewSession> {
    let payload =
        arg0.ok_or_else(|| EngineError::Validation("missing session payload".to_string()))?;
    let opening_cash = money::value_cash(&payload, &["openingCash", "opening_cash"])?
        .unwrap_or_else(money::zero);

    let mut parsed: OpenSessionPayload = serde_json::from_value(payload)
        .map_err(|e| EngineError::Validation(format!("invalid session payload: {e}")))?;
    parsed.cashier_id = parsed.cashier_id.trim().to_string();
    parsed.location_id = parsed.location_id.trim().to_string();
    parsed.terminal_id = parsed.terminal_id.trim().to_string();
    if parsed.cashier_id.is_empty() {
        return Err(EngineError::Validation("missing cashierId".to_string()));
    }
    if parsed.location_id.is_empty() {
        return Err(EngineError::Validation("missing locationId".to_string()));
    }
    if parsed.terminal_id.is_empty() {
        return Err(EngineError::Validation("missing terminalId".to_string()));
    }

    Ok(NewSession {
        cashier_id: parsed.cashier_id,
        cashier_name: parsed.cashier_name,
        location_id: parsed.location_id,
        terminal_id: parsed.terminal_id,
        opening_cash,
    })
}

/// Accept either a bare session id string or an object carrying one.
fn parse_session_ref(arg0: Option<Value>) -> Result<(String, Value)> {
    let payload = match arg0 {
        Some(Value::String(session_id)) => serde_json::json!({ "sessionId": session_id }),
        Some(Value::Object(obj)) => Value::Object(obj),
        Some(v) => v,
        None => serde_json::json!({}),
    };
    let session_id = value_str(&payload, &["sessionId", "session_id", "id"])
        .ok_or_else(|| EngineError::Validation("missing sessionId".to_string()))?;
    Ok((session_id, payload))
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

pub async fn session_open(arg0: Option<Value>, db: &DbState) -> Result<Value> {
    let req = parse_open_session_payload(arg0)?;
    session_service::open_session(db, &req)
}

/// Close a session. `mode` selects a temporary suspension or the permanent
/// settling close (which requires the counted cash).
pub async fn session_close(arg0: Option<Value>, db: &DbState) -> Result<Value> {
    let (session_id, payload) = parse_session_ref(arg0)?;
    let mode = value_str(&payload, &["mode"])
        .ok_or_else(|| EngineError::Validation("missing close mode".to_string()))?;

    match mode.as_str() {
        "temporary" => session_service::close_temporary(db, &session_id),
        "permanent" => {
            let counted = money::value_cash(&payload, &["countedCash", "counted_cash"])?
                .ok_or_else(|| {
                    EngineError::Validation("permanent close requires countedCash".to_string())
                })?;
            let variance_reason = value_str(&payload, &["varianceReason", "variance_reason"]);
            let closed_by = value_str(&payload, &["closedBy", "closed_by"]);
            session_service::close_permanent(db, &session_id, counted, variance_reason, closed_by)
        }
        other => Err(EngineError::Validation(format!(
            "unknown close mode {other:?} (expected \"temporary\" or \"permanent\")"
        ))),
    }
}

pub async fn session_reopen(arg0: Option<Value>, db: &DbState) -> Result<Value> {
    let (session_id, payload) = parse_session_ref(arg0)?;
    let authorization = value_str(
        &payload,
        &["authorization", "authorizationToken", "authorization_token"],
    )
    .unwrap_or_default();
    session_service::reopen(db, &session_id, &authorization)
}

pub async fn session_record_sale(arg0: Option<Value>, db: &DbState) -> Result<Value> {
    let (session_id, payload) = parse_session_ref(arg0)?;
    let amount = money::value_cash(&payload, &["amount", "totalAmount", "total_amount"])?
        .ok_or_else(|| EngineError::Validation("missing sale amount".to_string()))?;
    session_service::record_sale(db, &session_id, amount)
}

pub async fn session_get(arg0: Option<Value>, db: &DbState) -> Result<Value> {
    let (session_id, _) = parse_session_ref(arg0)?;
    session_service::get_session(db, &session_id)
}

pub async fn session_get_active(arg0: Option<Value>, db: &DbState) -> Result<Value> {
    let payload = match arg0 {
        Some(Value::String(cashier_id)) => serde_json::json!({ "cashierId": cashier_id }),
        Some(Value::Object(obj)) => Value::Object(obj),
        Some(v) => v,
        None => serde_json::json!({}),
    };
    let cashier_id = value_str(&payload, &["cashierId", "cashier_id"])
        .ok_or_else(|| EngineError::Validation("missing cashierId".to_string()))?;
    session_service::get_active_by_cashier(db, &cashier_id)
}

pub async fn session_get_active_by_terminal(
    arg0: Option<Value>,
    arg1: Option<Value>,
    db: &DbState,
) -> Result<Value> {
    let payload = match (arg0, arg1) {
        (Some(Value::String(location_id)), Some(Value::String(terminal_id))) => {
            serde_json::json!({ "locationId": location_id, "terminalId": terminal_id })
        }
        (Some(Value::Object(obj)), _) => Value::Object(obj),
        (Some(v), _) => v,
        _ => serde_json::json!({}),
    };
    let location_id = value_str(&payload, &["locationId", "location_id"])
        .ok_or_else(|| EngineError::Validation("missing locationId".to_string()))?;
    let terminal_id = value_str(&payload, &["terminalId", "terminal_id"])
        .ok_or_else(|| EngineError::Validation("missing terminalId".to_string()))?;
    session_service::get_active_by_terminal(db, &location_id, &terminal_id)
}

#[cfg(test)]
mod dto_tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn parse_open_session_supports_aliases_and_exact_cash() {
        let req = parse_open_session_payload(Some(serde_json::json!({
            "cashier_id": "cashier-1",
            "locationId": "loc-1",
            "terminal_id": "term-1",
            "openingCash": "500.00"
        })))
        .expect("payload should parse");
        assert_eq!(req.cashier_id, "cashier-1");
        assert_eq!(req.terminal_id, "term-1");
        assert_eq!(req.opening_cash, dec!(500.00));
    }

    #[test]
    fn parse_open_session_defaults_opening_cash_to_zero() {
        let req = parse_open_session_payload(Some(serde_json::json!({
            "cashierId": "cashier-1",
            "locationId": "loc-1",
            "terminalId": "term-1"
        })))
        .unwrap();
        assert_eq!(req.opening_cash, dec!(0.00));
    }

    #[test]
    fn parse_open_session_rejects_blank_required_fields() {
        let err = parse_open_session_payload(Some(serde_json::json!({
            "cashierId": "  ",
            "locationId": "loc-1",
            "terminalId": "term-1"
        })))
        .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn parse_session_ref_supports_string_and_object() {
        let (from_string, _) = parse_session_ref(Some(serde_json::json!("session-1"))).unwrap();
        let (from_object, payload) = parse_session_ref(Some(serde_json::json!({
            "session_id": "session-2",
            "mode": "temporary"
        })))
        .unwrap();
        assert_eq!(from_string, "session-1");
        assert_eq!(from_object, "session-2");
        assert_eq!(payload["mode"], "temporary");
    }

    #[tokio::test]
    async fn session_close_rejects_unknown_modes() {
        let db = crate::db::DbState {
            conn: std::sync::Mutex::new(
                rusqlite::Connection::open_in_memory().expect("in-memory db"),
            ),
            db_path: std::path::PathBuf::from(":memory:"),
        };
        {
            let conn = db.lock().unwrap();
            crate::db::run_migrations_for_test(&conn);
        }

        let err = session_close(
            Some(serde_json::json!({ "sessionId": "session-1", "mode": "forever" })),
            &db,
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "validation");

        let err = session_close(Some(serde_json::json!({ "sessionId": "session-1" })), &db)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }
}
