//! Business-day records: the day-close checklist gate and orchestrator.
//!
//! A location's business day may close only once every required checklist
//! gate is true. The gate is a pure predicate evaluated immediately before
//! the close commit; the settlement recap is recomputed at close purely for
//! audit and attached to the closed record. The close itself is a single
//! conditional write, so two concurrent operators cannot both succeed.

use chrono::{NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::info;
use uuid::Uuid;

use crate::db::DbState;
use crate::error::{EngineError, Result};
use crate::settlement;

/// Gates that must all be true before a day may close. Missing keys are
/// treated as false, never as satisfied-by-absence.
pub const REQUIRED_CHECKS: [&str; 6] = [
    "all_sessions_closed",
    "all_settlements_completed",
    "reports_generated",
    "backup_completed",
    "cash_counted",
    "inventory_verified",
];

// ---------------------------------------------------------------------------
// Checklist gate
// ---------------------------------------------------------------------------

/// The required keys not present-and-true in the supplied checklist.
pub fn missing_checks(checklist: &BTreeMap<String, bool>) -> Vec<String> {
    REQUIRED_CHECKS
        .iter()
        .filter(|key| !checklist.get(**key).copied().unwrap_or(false))
        .map(|key| key.to_string())
        .collect()
}

/// True iff every required gate is present and true.
pub fn all_checks_completed(checklist: &BTreeMap<String, bool>) -> bool {
    missing_checks(checklist).is_empty()
}

fn reject_unknown_checks(checklist: &BTreeMap<String, bool>) -> Result<()> {
    let unknown: Vec<&str> = checklist
        .keys()
        .map(String::as_str)
        .filter(|key| !REQUIRED_CHECKS.contains(key))
        .collect();
    if unknown.is_empty() {
        Ok(())
    } else {
        Err(EngineError::Validation(format!(
            "unknown checklist keys: {}",
            unknown.join(", ")
        )))
    }
}

// ---------------------------------------------------------------------------
// Day lifecycle
// ---------------------------------------------------------------------------

/// Open a location's business day. At most one record per (location, date).
pub fn open_day(db: &DbState, location_id: &str, business_date: &str) -> Result<Value> {
    let location_id = location_id.trim();
    let business_date = business_date.trim();
    if location_id.is_empty() {
        return Err(EngineError::Validation("missing locationId".to_string()));
    }
    NaiveDate::parse_from_str(business_date, "%Y-%m-%d").map_err(|_| {
        EngineError::Validation(format!(
            "businessDate must be YYYY-MM-DD, got {business_date:?}"
        ))
    })?;

    let conn = db.lock()?;

    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM business_days WHERE location_id = ?1 AND business_date = ?2",
            params![location_id, business_date],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(existing_id) = existing {
        return Err(EngineError::Validation(format!(
            "business day {business_date} at {location_id} already opened ({existing_id})"
        )));
    }

    // Start with every gate explicitly unmet
    let checklist: BTreeMap<&str, bool> = REQUIRED_CHECKS.iter().map(|k| (*k, false)).collect();
    let checklist_json = serde_json::to_string(&checklist)
        .map_err(|e| EngineError::StorageUnavailable(format!("encode checklist: {e}")))?;

    let day_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO business_days (
            id, location_id, business_date, status, checklist_json,
            opened_at, created_at, updated_at
        ) VALUES (?1, ?2, ?3, 'open', ?4, ?5, ?5, ?5)",
        params![day_id, location_id, business_date, checklist_json, now],
    )?;

    info!(day_id = %day_id, location_id = %location_id, business_date = %business_date, "Business day opened");

    day_json(&conn, &day_id)
}

/// Merge checklist updates into an open day's stored checklist.
pub fn update_checklist(
    db: &DbState,
    day_id: &str,
    updates: &BTreeMap<String, bool>,
) -> Result<Value> {
    reject_unknown_checks(updates)?;

    let conn = db.lock()?;
    let head = fetch_head(&conn, day_id)?;
    if head.status != "open" {
        return Err(EngineError::AlreadyClosed(format!(
            "business day {day_id} is closed"
        )));
    }

    let mut checklist = head.checklist;
    for (key, value) in updates {
        checklist.insert(key.clone(), *value);
    }
    let checklist_json = serde_json::to_string(&checklist)
        .map_err(|e| EngineError::StorageUnavailable(format!("encode checklist: {e}")))?;

    let changed = conn.execute(
        "UPDATE business_days SET checklist_json = ?1, updated_at = ?2
         WHERE id = ?3 AND status = 'open'",
        params![checklist_json, Utc::now().to_rfc3339(), day_id],
    )?;
    if changed == 0 {
        return Err(EngineError::AlreadyClosed(format!(
            "business day {day_id} was closed by a concurrent request"
        )));
    }

    day_json(&conn, day_id)
}

/// Close a business day.
///
/// The supplied checklist is the sole gate; the settlement recap is
/// recomputed for audit and persisted with the close. The transition is one
/// conditional write on `status = 'open'`, so of two concurrent close
/// requests exactly one succeeds and the other gets `AlreadyClosed`.
pub fn close_day(db: &DbState, day_id: &str, checklist: &BTreeMap<String, bool>) -> Result<Value> {
    reject_unknown_checks(checklist)?;

    let conn = db.lock()?;
    let head = fetch_head(&conn, day_id)?;
    if head.status != "open" {
        return Err(EngineError::AlreadyClosed(format!(
            "business day {day_id} is already closed"
        )));
    }

    // Gate evaluated against the supplied state, immediately before commit
    let missing = missing_checks(checklist);
    if !missing.is_empty() {
        return Err(EngineError::ChecklistIncomplete(missing));
    }

    let summary = settlement::summary_on(&conn, &head.location_id, &head.business_date)?;

    let checklist_json = serde_json::to_string(checklist)
        .map_err(|e| EngineError::StorageUnavailable(format!("encode checklist: {e}")))?;
    let settlement_json = summary.to_string();
    let now = Utc::now().to_rfc3339();

    let changed = conn.execute(
        "UPDATE business_days SET
            status = 'closed', closed_at = ?1, checklist_json = ?2,
            settlement_json = ?3, updated_at = ?1
         WHERE id = ?4 AND status = 'open'",
        params![now, checklist_json, settlement_json, day_id],
    )?;
    if changed == 0 {
        return Err(EngineError::AlreadyClosed(format!(
            "business day {day_id} was closed by a concurrent request"
        )));
    }

    info!(
        day_id = %day_id,
        location_id = %head.location_id,
        business_date = %head.business_date,
        total_variance = %summary["totals"]["variance"],
        "Business day closed"
    );

    let day = day_json(&conn, day_id)?;
    Ok(serde_json::json!({
        "day": day,
        "settlement": summary,
    }))
}

/// Get a business day by id.
pub fn get_day(db: &DbState, day_id: &str) -> Result<Value> {
    let conn = db.lock()?;
    day_json(&conn, day_id)
}

// ---------------------------------------------------------------------------
// Internals
// ---------------------------------------------------------------------------

struct DayHead {
    location_id: String,
    business_date: String,
    status: String,
    checklist: BTreeMap<String, bool>,
}

fn fetch_head(conn: &Connection, day_id: &str) -> Result<DayHead> {
    let row = conn
        .query_row(
            "SELECT location_id, business_date, status, checklist_json
             FROM business_days WHERE id = ?1",
            params![day_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )
        .optional()?
        .ok_or_else(|| EngineError::DayNotFound(day_id.to_string()))?;

    let checklist: BTreeMap<String, bool> = serde_json::from_str(&row.3)
        .map_err(|e| EngineError::StorageUnavailable(format!("corrupt checklist: {e}")))?;

    Ok(DayHead {
        location_id: row.0,
        business_date: row.1,
        status: row.2,
        checklist,
    })
}

fn day_json(conn: &Connection, day_id: &str) -> Result<Value> {
    let (value, checklist_json, settlement_json) = conn
        .query_row(
            "SELECT id, location_id, business_date, status, checklist_json,
                    settlement_json, opened_at, closed_at
             FROM business_days WHERE id = ?1",
            params![day_id],
            |row| {
                let value = serde_json::json!({
                    "id": row.get::<_, String>(0)?,
                    "locationId": row.get::<_, String>(1)?,
                    "businessDate": row.get::<_, String>(2)?,
                    "status": row.get::<_, String>(3)?,
                    "openedAt": row.get::<_, String>(6)?,
                    "closedAt": row.get::<_, Option<String>>(7)?,
                });
                Ok((
                    value,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            },
        )
        .optional()?
        .ok_or_else(|| EngineError::DayNotFound(day_id.to_string()))?;

    let mut day = value;
    day["checklist"] = serde_json::from_str(&checklist_json)
        .map_err(|e| EngineError::StorageUnavailable(format!("corrupt checklist: {e}")))?;
    if let Some(snapshot) = settlement_json {
        day["settlement"] = serde_json::from_str(&snapshot)
            .map_err(|e| EngineError::StorageUnavailable(format!("corrupt settlement: {e}")))?;
    }
    Ok(day)
}
