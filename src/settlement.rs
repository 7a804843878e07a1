//! Interim settlement ledger and business-day settlement aggregation.
//!
//! The ledger is append-only: each row gets the next per-session sequence
//! number inside its insert transaction and is never mutated afterwards.
//! The aggregator produces the settlement recap for a (location, business
//! date) pair, recomputed fresh on every request so it always reflects the
//! latest close events.

use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use serde_json::Value;
use tracing::info;

use crate::db::DbState;
use crate::error::{EngineError, Result};
use crate::money;
use crate::sessions;

// ---------------------------------------------------------------------------
// Interim ledger
// ---------------------------------------------------------------------------

/// Record a mid-session cash drop (negative) or addition (positive).
///
/// Only open sessions accept appends; once acknowledged the row is
/// immutable. Movements are informational for settlement: the cash they
/// moved is already reflected in counted/expected at close.
pub fn record_interim(
    db: &DbState,
    session_id: &str,
    amount: Decimal,
    reason_type: &str,
    reason_name: Option<String>,
) -> Result<Value> {
    let amount = money::to_cash(amount);
    if amount.is_zero() {
        return Err(EngineError::Validation(
            "interim settlement amount must be non-zero".to_string(),
        ));
    }
    let reason_type = reason_type.trim();
    if reason_type.is_empty() {
        return Err(EngineError::Validation(
            "interim settlement requires a reasonType".to_string(),
        ));
    }

    let conn = db.lock()?;
    let now = chrono::Utc::now().to_rfc3339();

    conn.execute_batch("BEGIN IMMEDIATE")?;

    let result = (|| -> Result<i64> {
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM cashier_sessions WHERE id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;
        match status.as_deref() {
            None => return Err(EngineError::SessionNotFound(session_id.to_string())),
            Some("open") => {}
            Some(other) => {
                return Err(EngineError::InvalidStateTransition(format!(
                    "interim settlements can only be recorded during an open session \
                     (session {session_id} is {other})"
                )))
            }
        }

        // Next strictly-increasing sequence for this session
        let seq: i64 = conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM interim_settlements WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;

        conn.execute(
            "INSERT INTO interim_settlements (
                session_id, seq, amount, reason_type, reason_name, recorded_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                session_id,
                seq,
                money::cash_text(amount),
                reason_type,
                reason_name,
                now,
            ],
        )?;

        Ok(seq)
    })();

    let seq = match result {
        Ok(seq) => {
            conn.execute_batch("COMMIT")?;
            seq
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            return Err(e);
        }
    };

    info!(
        session_id = %session_id,
        seq = seq,
        amount = %amount,
        reason_type = %reason_type,
        "Interim settlement recorded"
    );

    Ok(serde_json::json!({
        "sessionId": session_id,
        "seq": seq,
        "amount": money::cash_text(amount),
        "reasonType": reason_type,
        "reasonName": reason_name,
        "recordedAt": now,
    }))
}

/// All interim settlements for a session, in sequence order.
pub fn get_interims(db: &DbState, session_id: &str) -> Result<Value> {
    let conn = db.lock()?;
    interim_list(&conn, session_id).map(Value::Array)
}

fn interim_list(conn: &Connection, session_id: &str) -> Result<Vec<Value>> {
    let mut stmt = conn.prepare(
        "SELECT seq, amount, reason_type, reason_name, recorded_at
         FROM interim_settlements WHERE session_id = ?1
         ORDER BY seq ASC",
    )?;
    let rows = stmt.query_map(params![session_id], |row| {
        Ok(serde_json::json!({
            "seq": row.get::<_, i64>(0)?,
            "amount": row.get::<_, String>(1)?,
            "reasonType": row.get::<_, String>(2)?,
            "reasonName": row.get::<_, Option<String>>(3)?,
            "recordedAt": row.get::<_, String>(4)?,
        }))
    })?;

    let mut items = Vec::new();
    for row in rows {
        items.push(row?);
    }
    Ok(items)
}

// ---------------------------------------------------------------------------
// Settlement aggregation
// ---------------------------------------------------------------------------

/// Settlement recap for every session closed on a business date at a
/// location. Never cached: recomputed from the session rows on each call.
pub fn settlement_summary(db: &DbState, location_id: &str, business_date: &str) -> Result<Value> {
    let conn = db.lock()?;
    summary_on(&conn, location_id, business_date)
}

/// Aggregation body, callable with an already-held connection (the
/// day-close orchestrator recomputes the snapshot inside its own lock).
pub(crate) fn summary_on(
    conn: &Connection,
    location_id: &str,
    business_date: &str,
) -> Result<Value> {
    let mut stmt = conn.prepare(
        "SELECT id, session_number, cashier_name, status, opening_cash,
                expected_cash, counted_cash, variance_reason, closed_at
         FROM cashier_sessions
         WHERE location_id = ?1 AND business_date = ?2
           AND status IN ('temporarily_closed', 'permanently_closed')
         ORDER BY closed_at DESC",
    )?;

    let rows: Vec<(
        String,
        String,
        Option<String>,
        String,
        String,
        Option<String>,
        Option<String>,
        Option<String>,
        Option<String>,
    )> = stmt
        .query_map(params![location_id, business_date], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
                row.get(7)?,
                row.get(8)?,
            ))
        })?
        .collect::<std::result::Result<_, _>>()?;

    let mut recaps: Vec<Value> = Vec::with_capacity(rows.len());
    let mut total_expected = money::zero();
    let mut total_counted = money::zero();
    let mut interim_count: i64 = 0;

    for (id, number, cashier_name, status, opening, expected, counted, reason, closed_at) in rows {
        // Permanently closed sessions settled their expected cash; suspended
        // ones derive it live from opening float plus recorded sales.
        let expected: Decimal = match expected {
            Some(raw) => money::cash_from_db(&raw)?,
            None => sessions::expected_cash_on(conn, &id, money::cash_from_db(&opening)?)?,
        };
        let counted: Decimal = match counted {
            Some(raw) => money::cash_from_db(&raw)?,
            None => money::zero(),
        };
        let variance = counted - expected;

        let interims = interim_list(conn, &id)?;
        interim_count += interims.len() as i64;

        total_expected += expected;
        total_counted += counted;

        recaps.push(serde_json::json!({
            "sessionId": id,
            "sessionNumber": number,
            "cashierName": cashier_name,
            "status": status,
            "expected": money::cash_text(expected),
            "counted": money::cash_text(counted),
            "variance": money::cash_text(variance),
            "varianceReason": reason,
            "closedAt": closed_at,
            "interimList": interims,
        }));
    }

    // Recomputed from the totals, not summed per-row
    let total_variance = total_counted - total_expected;

    Ok(serde_json::json!({
        "locationId": location_id,
        "businessDate": business_date,
        "sessions": recaps,
        "totals": {
            "expected": money::cash_text(total_expected),
            "counted": money::cash_text(total_counted),
            "variance": money::cash_text(total_variance),
            "interimCount": interim_count,
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::sessions::{close_permanent, close_temporary, open_session, record_sale, NewSession};
    use rusqlite::Connection;
    use rust_decimal_macros::dec;

    fn test_db() -> DbState {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )
        .expect("pragma setup");
        db::run_migrations_for_test(&conn);
        DbState {
            conn: std::sync::Mutex::new(conn),
            db_path: std::path::PathBuf::from(":memory:"),
        }
    }

    fn open(db: &DbState, cashier: &str, opening: Decimal) -> String {
        let session = open_session(
            db,
            &NewSession {
                cashier_id: cashier.to_string(),
                cashier_name: Some(format!("{cashier} name")),
                location_id: "loc-1".to_string(),
                terminal_id: "term-1".to_string(),
                opening_cash: opening,
            },
        )
        .expect("open session");
        session["id"].as_str().unwrap().to_string()
    }

    #[test]
    fn interim_sequence_is_monotonic_and_append_only() {
        let db = test_db();
        let id = open(&db, "cashier-1", dec!(500.00));

        for (amount, reason) in [
            (dec!(-200.00), "cash_drop"),
            (dec!(50.00), "change_added"),
            (dec!(-100.00), "cash_drop"),
        ] {
            record_interim(&db, &id, amount, reason, None).unwrap();
        }

        let interims = get_interims(&db, &id).unwrap();
        let seqs: Vec<i64> = interims
            .as_array()
            .unwrap()
            .iter()
            .map(|i| i["seq"].as_i64().unwrap())
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);

        close_temporary(&db, &id).unwrap();
        let err = record_interim(&db, &id, dec!(-10.00), "cash_drop", None).unwrap_err();
        assert_eq!(err.kind(), "invalid_state_transition");
    }

    #[test]
    fn interim_rejects_zero_amount_and_unknown_session() {
        let db = test_db();
        let id = open(&db, "cashier-1", dec!(100.00));
        assert_eq!(
            record_interim(&db, &id, dec!(0.00), "cash_drop", None)
                .unwrap_err()
                .kind(),
            "validation"
        );
        assert_eq!(
            record_interim(&db, "missing", dec!(5.00), "cash_drop", None)
                .unwrap_err()
                .kind(),
            "session_not_found"
        );
    }

    #[test]
    fn summary_totals_match_per_session_variances() {
        let db = test_db();

        // S1: opening 500, sales 1200, counted 1699.50 -> variance -0.50
        let s1 = open(&db, "cashier-1", dec!(500.00));
        record_sale(&db, &s1, dec!(700.00)).unwrap();
        record_sale(&db, &s1, dec!(500.00)).unwrap();
        record_interim(&db, &s1, dec!(-200.00), "cash_drop", Some("safe drop".to_string()))
            .unwrap();
        record_interim(&db, &s1, dec!(-150.00), "cash_drop", Some("safe drop".to_string()))
            .unwrap();
        let s1_closed = close_permanent(
            &db,
            &s1,
            dec!(1699.50),
            Some("note shortage".to_string()),
            None,
        )
        .unwrap();

        // S2: opening 300, no sales, counted exactly
        let s2 = open(&db, "cashier-2", dec!(300.00));
        close_permanent(&db, &s2, dec!(300.00), None, None).unwrap();

        let business_date = s1_closed["businessDate"].as_str().unwrap();
        let summary = settlement_summary(&db, "loc-1", business_date).unwrap();

        let totals = &summary["totals"];
        assert_eq!(totals["expected"], "2000.00");
        assert_eq!(totals["counted"], "1999.50");
        assert_eq!(totals["variance"], "-0.50");
        assert_eq!(totals["interimCount"], 2);

        let sessions = summary["sessions"].as_array().unwrap();
        assert_eq!(sessions.len(), 2);
        // Most recent close first
        assert_eq!(sessions[0]["sessionId"], s2.as_str());
        assert_eq!(sessions[1]["sessionId"], s1.as_str());
        assert_eq!(sessions[1]["variance"], "-0.50");
        assert_eq!(sessions[1]["interimList"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn open_sessions_never_settle() {
        let db = test_db();
        let s1 = open(&db, "cashier-1", dec!(100.00));
        let closed = close_permanent(&db, &s1, dec!(100.00), None, None).unwrap();
        let business_date = closed["businessDate"].as_str().unwrap();

        // Still open on the same date and location: excluded entirely
        open(&db, "cashier-2", dec!(250.00));

        let summary = settlement_summary(&db, "loc-1", business_date).unwrap();
        assert_eq!(summary["sessions"].as_array().unwrap().len(), 1);
        assert_eq!(summary["totals"]["expected"], "100.00");
    }

    #[test]
    fn suspended_sessions_count_with_zero_counted_cash() {
        let db = test_db();
        let s1 = open(&db, "cashier-1", dec!(100.00));
        record_sale(&db, &s1, dec!(40.00)).unwrap();
        let suspended = close_temporary(&db, &s1).unwrap();
        let business_date = suspended["businessDate"].as_str().unwrap();

        let summary = settlement_summary(&db, "loc-1", business_date).unwrap();
        let sessions = summary["sessions"].as_array().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0]["expected"], "140.00");
        assert_eq!(sessions[0]["counted"], "0.00");
        assert_eq!(sessions[0]["variance"], "-140.00");
        assert_eq!(summary["totals"]["variance"], "-140.00");
    }

    #[test]
    fn no_matching_sessions_is_an_empty_summary_not_an_error() {
        let db = test_db();
        let summary = settlement_summary(&db, "loc-9", "2024-01-10").unwrap();
        assert_eq!(summary["sessions"].as_array().unwrap().len(), 0);
        assert_eq!(summary["totals"]["expected"], "0.00");
        assert_eq!(summary["totals"]["counted"], "0.00");
        assert_eq!(summary["totals"]["variance"], "0.00");
        assert_eq!(summary["totals"]["interimCount"], 0);
    }
}
