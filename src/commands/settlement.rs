use serde_json::Value;

use crate::db::DbState;
use crate::error::{EngineError, Result};
use crate::money;
use crate::settlement as settlement_service;
use crate::value_str;

fn merge_payload_args(arg0: Option<Value>, arg1: Option<Value>) -> Value {
    match (arg0, arg1) {
        (Some(Value::Object(mut base)), Some(Value::Object(extra))) => {
            for (k, v) in extra {
                base.insert(k, v);
            }
            Value::Object(base)
        }
        (Some(v), None) => v,
        (None, Some(v)) => v,
        (Some(v), Some(_)) => v,
        _ => serde_json::json!({}),
    }
}

fn parse_summary_payload(arg0: Option<Value>, arg1: Option<Value>) -> Result<(String, String)> {
    let payload = match (arg0, arg1) {
        (Some(Value::String(location_id)), Some(Value::String(business_date))) => {
            serde_json::json!({
                "locationId": location_id,
                "businessDate": business_date
            })
        }
        (lhs, rhs) => merge_payload_args(lhs, rhs),
    };

    let location_id = value_str(&payload, &["locationId", "location_id", "location"])
        .ok_or_else(|| EngineError::Validation("missing locationId".to_string()))?;
    let business_date = value_str(&payload, &["businessDate", "business_date", "date"])
        .ok_or_else(|| EngineError::Validation("missing businessDate".to_string()))?;
    Ok((location_id, business_date))
}

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

/// Settlement recap for a (location, business date) pair. Read-only and
/// recomputed on every call.
pub async fn settlement_get_summary(
    arg0: Option<Value>,
    arg1: Option<Value>,
    db: &DbState,
) -> Result<Value> {
    let (location_id, business_date) = parse_summary_payload(arg0, arg1)?;
    settlement_service::settlement_summary(db, &location_id, &business_date)
}

pub async fn settlement_record_interim(arg0: Option<Value>, db: &DbState) -> Result<Value> {
    let (session_id, payload) = parse_session_ref(arg0)?;
    let amount = money::value_cash(&payload, &["amount"])?
        .ok_or_else(|| EngineError::Validation("missing interim amount".to_string()))?;
    let reason_type = value_str(&payload, &["reasonType", "reason_type"]).unwrap_or_default();
    let reason_name = value_str(&payload, &["reasonName", "reason_name"]);
    settlement_service::record_interim(db, &session_id, amount, &reason_type, reason_name)
}

pub async fn settlement_get_interims(arg0: Option<Value>, db: &DbState) -> Result<Value> {
    let (session_id, _) = parse_session_ref(arg0)?;
    settlement_service::get_interims(db, &session_id)
}
