use serde_json::Value;
use std::collections::BTreeMap;

use crate::db::DbState;
use crate::dayclose as day_service;
use crate::error::{EngineError, Result};
use crate::value_str;

/// A checklist must be an object of named booleans; anything else is
/// rejected rather than coerced (fail-closed).
fn parse_checklist_value(raw: &Value) -> Result<BTreeMap<String, bool>> {
    let obj = raw
        .as_object()
        .ok_or_else(|| EngineError::Validation("checklist must be an object".to_string()))?;

    let mut checklist = BTreeMap::new();
    for (key, value) in obj {
        match value {
            Value::Bool(flag) => {
                checklist.insert(key.clone(), *flag);
            }
            other => {
                return Err(EngineError::Validation(format!(
                    "checklist value for {key:?} must be a boolean, got {other}"
                )))
            }
        }
    }
    Ok(checklist)
}

fn parse_day_ref(arg0: Option<Value>) -> Result<(String, Value)> {
    let payload = match arg0 {
        Some(Value::String(day_id)) => serde_json::json!({ "dayId": day_id }),
        Some(Value::Object(obj)) => Value::Object(obj),
        Some(v) => v,
        None => serde_json::json!({}),
    };
    let day_id = value_str(&payload, &["dayId", "day_id", "id"])
        .ok_or_else(|| EngineError::Validation("missing dayId".to_string()))?;
    Ok((day_id, payload))
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

pub async fn day_open(arg0: Option<Value>, arg1: Option<Value>, db: &DbState) -> Result<Value> {
    let payload = match (arg0, arg1) {
        (Some(Value::String(location_id)), Some(Value::String(business_date))) => {
            serde_json::json!({
                "locationId": location_id,
                "businessDate": business_date
            })
        }
        (Some(Value::Object(obj)), _) => Value::Object(obj),
        (Some(v), _) => v,
        _ => serde_json::json!({}),
    };
    let location_id = value_str(&payload, &["locationId", "location_id"])
        .ok_or_else(|| EngineError::Validation("missing locationId".to_string()))?;
    let business_date = value_str(&payload, &["businessDate", "business_date", "date"])
        .ok_or_else(|| EngineError::Validation("missing businessDate".to_string()))?;
    day_service::open_day(db, &location_id, &business_date)
}

pub async fn day_update_checklist(arg0: Option<Value>, db: &DbState) -> Result<Value> {
    let (day_id, payload) = parse_day_ref(arg0)?;
    let raw = payload
        .get("checklist")
        .ok_or_else(|| EngineError::Validation("missing checklist".to_string()))?;
    let updates = parse_checklist_value(raw)?;
    day_service::update_checklist(db, &day_id, &updates)
}

/// Close a business day. The checklist may ride inside the payload or as a
/// second argument (either `{checklist: {...}}` or the bare map).
pub async fn day_close(arg0: Option<Value>, arg1: Option<Value>, db: &DbState) -> Result<Value> {
    let (day_id, payload) = parse_day_ref(arg0)?;

    let raw = payload
        .get("checklist")
        .cloned()
        .or_else(|| match &arg1 {
            Some(Value::Object(obj)) => Some(
                obj.get("checklist")
                    .cloned()
                    .unwrap_or_else(|| Value::Object(obj.clone())),
            ),
            _ => None,
        })
        .ok_or_else(|| EngineError::Validation("missing checklist".to_string()))?;

    let checklist = parse_checklist_value(&raw)?;
    day_service::close_day(db, &day_id, &checklist)
}

pub async fn day_get(arg0: Option<Value>, db: &DbState) -> Result<Value> {
    let (day_id, _) = parse_day_ref(arg0)?;
    day_service::get_day(db, &day_id)
}
