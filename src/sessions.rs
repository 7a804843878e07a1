//! Cashier session lifecycle for the back-office engine.
//!
//! Implements the open / temporary-close / permanent-close / reopen state
//! machine with cash variance calculation at settlement. Every transition is
//! a single conditional UPDATE keyed on the current status, so a racing
//! second close loses cleanly instead of double-applying.
//!
//! Expected cash is re-derived from the `session_sales` source-of-truth
//! table at close time rather than trusting a running counter.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::db::{self, DbState};
use crate::error::{EngineError, Result};
use crate::money;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Open,
    TemporarilyClosed,
    PermanentlyClosed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Open => "open",
            SessionStatus::TemporarilyClosed => "temporarily_closed",
            SessionStatus::PermanentlyClosed => "permanently_closed",
        }
    }

    fn from_db(raw: &str) -> Result<Self> {
        match raw {
            "open" => Ok(SessionStatus::Open),
            "temporarily_closed" => Ok(SessionStatus::TemporarilyClosed),
            "permanently_closed" => Ok(SessionStatus::PermanentlyClosed),
            other => Err(EngineError::StorageUnavailable(format!(
                "corrupt session status {other:?}"
            ))),
        }
    }
}

/// Parameters for opening a new cashier session.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub cashier_id: String,
    pub cashier_name: Option<String>,
    pub location_id: String,
    pub terminal_id: String,
    pub opening_cash: Decimal,
}

// ---------------------------------------------------------------------------
// Open session
// ---------------------------------------------------------------------------

/// Open a new session for a cashier.
///
/// Assigns the next per-location session number and refuses to open while
/// the cashier still has an open session.
pub fn open_session(db: &DbState, req: &NewSession) -> Result<Value> {
    if req.opening_cash < money::zero() {
        return Err(EngineError::Validation(
            "opening cash must not be negative".to_string(),
        ));
    }

    let conn = db.lock()?;

    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM cashier_sessions WHERE cashier_id = ?1 AND status = 'open'",
            params![req.cashier_id],
            |row| row.get(0),
        )
        .optional()?;

    if let Some(existing_id) = existing {
        return Err(EngineError::Validation(format!(
            "cashier {} already has an open session ({existing_id})",
            req.cashier_id
        )));
    }

    let session_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();

    conn.execute_batch("BEGIN IMMEDIATE")?;

    let result = (|| -> Result<String> {
        // Per-location human-readable sequence label
        let counter_key = format!("session_number:{}", req.location_id);
        let next = db::get_setting(&conn, "sequence", &counter_key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(0)
            + 1;
        db::set_setting(&conn, "sequence", &counter_key, &next.to_string())?;
        let session_number = format!("S-{next:04}");

        conn.execute(
            "INSERT INTO cashier_sessions (
                id, session_number, cashier_id, cashier_name, location_id,
                terminal_id, status, opened_at, opening_cash, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'open', ?7, ?8, ?7, ?7)",
            params![
                session_id,
                session_number,
                req.cashier_id,
                req.cashier_name,
                req.location_id,
                req.terminal_id,
                now,
                money::cash_text(req.opening_cash),
            ],
        )?;

        Ok(session_number)
    })();

    match result {
        Ok(session_number) => {
            conn.execute_batch("COMMIT")?;
            info!(
                session_id = %session_id,
                session_number = %session_number,
                cashier_id = %req.cashier_id,
                location_id = %req.location_id,
                "Session opened"
            );
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            return Err(e);
        }
    }

    session_json(&conn, &session_id)
}

// ---------------------------------------------------------------------------
// Sales
// ---------------------------------------------------------------------------

/// Record a completed sale total against an open session.
pub fn record_sale(db: &DbState, session_id: &str, amount: Decimal) -> Result<Value> {
    if amount <= money::zero() {
        return Err(EngineError::Validation(
            "sale amount must be positive".to_string(),
        ));
    }

    let conn = db.lock()?;
    let head = fetch_head(&conn, session_id)?;
    if head.status != SessionStatus::Open {
        return Err(EngineError::InvalidStateTransition(format!(
            "cannot record a sale against session {session_id} in status {}",
            head.status.as_str()
        )));
    }

    let sale_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO session_sales (id, session_id, amount, recorded_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![sale_id, session_id, money::cash_text(amount), now],
    )?;

    Ok(serde_json::json!({
        "saleId": sale_id,
        "sessionId": session_id,
        "amount": money::cash_text(amount),
        "recordedAt": now,
    }))
}

// ---------------------------------------------------------------------------
// Close / reopen
// ---------------------------------------------------------------------------

/// Suspend an open session without settling it.
///
/// Sets `closed_at` and stamps the location-local business date; counted
/// cash and variance stay unset until permanent close.
pub fn close_temporary(db: &DbState, session_id: &str) -> Result<Value> {
    let conn = db.lock()?;
    let head = fetch_head(&conn, session_id)?;

    match head.status {
        SessionStatus::Open => {}
        SessionStatus::TemporarilyClosed => {
            return Err(EngineError::InvalidStateTransition(format!(
                "session {session_id} is already temporarily closed"
            )))
        }
        SessionStatus::PermanentlyClosed => {
            return Err(EngineError::InvalidStateTransition(format!(
                "session {session_id} is permanently closed"
            )))
        }
    }

    let now = Utc::now();
    let business_date = business_date_for(&conn, &head.location_id, now);
    let changed = conn.execute(
        "UPDATE cashier_sessions SET
            status = 'temporarily_closed', closed_at = ?1,
            business_date = ?2, updated_at = ?1
         WHERE id = ?3 AND status = 'open'",
        params![now.to_rfc3339(), business_date, session_id],
    )?;
    if changed == 0 {
        return Err(EngineError::AlreadyClosed(format!(
            "session {session_id} was closed by a concurrent request"
        )));
    }

    info!(session_id = %session_id, business_date = %business_date, "Session temporarily closed");

    session_json(&conn, session_id)
}

/// Permanently close and settle a session.
///
/// Accepted from `open` or `temporarily_closed`. Re-derives expected cash
/// from recorded sales, computes the variance against the counted cash, and
/// refuses a non-zero variance without a reason. The conditional write makes
/// the close apply at most once; a racing second attempt gets `AlreadyClosed`.
pub fn close_permanent(
    db: &DbState,
    session_id: &str,
    counted_cash: Decimal,
    variance_reason: Option<String>,
    closed_by: Option<String>,
) -> Result<Value> {
    let conn = db.lock()?;
    let head = fetch_head(&conn, session_id)?;

    if head.status == SessionStatus::PermanentlyClosed {
        return Err(EngineError::InvalidStateTransition(format!(
            "session {session_id} is already permanently closed"
        )));
    }

    let counted = money::to_cash(counted_cash);
    let expected = expected_cash_on(&conn, session_id, head.opening_cash)?;
    let variance = counted - expected;

    let reason = variance_reason
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty());
    if !variance.is_zero() && reason.is_none() {
        return Err(EngineError::MissingVarianceReason { variance });
    }

    let now = Utc::now();
    // The drawer stopped at the temporary close, if there was one; settling
    // later must not move the session into a different business day.
    let (closed_at, business_date) = match (head.closed_at, head.business_date) {
        (Some(at), Some(date)) => (at, date),
        _ => (
            now.to_rfc3339(),
            business_date_for(&conn, &head.location_id, now),
        ),
    };

    let changed = conn.execute(
        "UPDATE cashier_sessions SET
            status = 'permanently_closed', closed_at = ?1, business_date = ?2,
            expected_cash = ?3, counted_cash = ?4, variance = ?5,
            variance_reason = ?6, closed_by = ?7, updated_at = ?8
         WHERE id = ?9 AND status IN ('open', 'temporarily_closed')",
        params![
            closed_at,
            business_date,
            money::cash_text(expected),
            money::cash_text(counted),
            money::cash_text(variance),
            reason,
            closed_by,
            now.to_rfc3339(),
            session_id,
        ],
    )?;
    if changed == 0 {
        return Err(EngineError::AlreadyClosed(format!(
            "session {session_id} was closed by a concurrent request"
        )));
    }

    info!(
        session_id = %session_id,
        expected = %expected,
        counted = %counted,
        variance = %variance,
        "Session permanently closed"
    );

    session_json(&conn, session_id)
}

/// Reopen a temporarily closed session.
///
/// The authorization token comes from the caller's policy layer; the engine
/// treats it as opaque and only requires that one was supplied.
pub fn reopen(db: &DbState, session_id: &str, authorization: &str) -> Result<Value> {
    if authorization.trim().is_empty() {
        return Err(EngineError::Validation(
            "reopen requires an authorization token".to_string(),
        ));
    }

    let conn = db.lock()?;
    let head = fetch_head(&conn, session_id)?;

    match head.status {
        SessionStatus::TemporarilyClosed => {}
        SessionStatus::Open => {
            return Err(EngineError::InvalidStateTransition(format!(
                "session {session_id} is already open"
            )))
        }
        SessionStatus::PermanentlyClosed => {
            return Err(EngineError::InvalidStateTransition(format!(
                "session {session_id} is permanently closed"
            )))
        }
    }

    let now = Utc::now().to_rfc3339();
    let changed = conn.execute(
        "UPDATE cashier_sessions SET
            status = 'open', closed_at = NULL, business_date = NULL, updated_at = ?1
         WHERE id = ?2 AND status = 'temporarily_closed'",
        params![now, session_id],
    )?;
    if changed == 0 {
        return Err(EngineError::AlreadyClosed(format!(
            "session {session_id} was closed by a concurrent request"
        )));
    }

    info!(session_id = %session_id, "Session reopened");

    session_json(&conn, session_id)
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Get a session by id.
pub fn get_session(db: &DbState, session_id: &str) -> Result<Value> {
    let conn = db.lock()?;
    session_json(&conn, session_id)
}

/// Get the open session for a cashier, or null.
pub fn get_active_by_cashier(db: &DbState, cashier_id: &str) -> Result<Value> {
    let conn = db.lock()?;
    let id: Option<String> = conn
        .query_row(
            "SELECT id FROM cashier_sessions
             WHERE cashier_id = ?1 AND status = 'open'
             ORDER BY opened_at DESC LIMIT 1",
            params![cashier_id],
            |row| row.get(0),
        )
        .optional()?;
    match id {
        Some(id) => session_json(&conn, &id),
        None => Ok(Value::Null),
    }
}

/// Get the most recent open session on a terminal, or null.
pub fn get_active_by_terminal(db: &DbState, location_id: &str, terminal_id: &str) -> Result<Value> {
    let conn = db.lock()?;
    let id: Option<String> = conn
        .query_row(
            "SELECT id FROM cashier_sessions
             WHERE location_id = ?1 AND terminal_id = ?2 AND status = 'open'
             ORDER BY opened_at DESC LIMIT 1",
            params![location_id, terminal_id],
            |row| row.get(0),
        )
        .optional()?;
    match id {
        Some(id) => session_json(&conn, &id),
        None => Ok(Value::Null),
    }
}

// ---------------------------------------------------------------------------
// Internals
// ---------------------------------------------------------------------------

struct SessionHead {
    status: SessionStatus,
    location_id: String,
    opening_cash: Decimal,
    closed_at: Option<String>,
    business_date: Option<String>,
}

fn fetch_head(conn: &Connection, session_id: &str) -> Result<SessionHead> {
    let row = conn
        .query_row(
            "SELECT status, location_id, opening_cash, closed_at, business_date
             FROM cashier_sessions WHERE id = ?1",
            params![session_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            },
        )
        .optional()?
        .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;

    Ok(SessionHead {
        status: SessionStatus::from_db(&row.0)?,
        location_id: row.1,
        opening_cash: money::cash_from_db(&row.2)?,
        closed_at: row.3,
        business_date: row.4,
    })
}

/// Expected cash: opening float plus all completed sale totals.
pub(crate) fn expected_cash_on(
    conn: &Connection,
    session_id: &str,
    opening_cash: Decimal,
) -> Result<Decimal> {
    let mut stmt = conn.prepare("SELECT amount FROM session_sales WHERE session_id = ?1")?;
    let rows = stmt.query_map(params![session_id], |row| row.get::<_, String>(0))?;

    // Summed in Rust over exact decimals, not in SQL over floats.
    let mut total = opening_cash;
    for raw in rows {
        total += money::cash_from_db(&raw?)?;
    }
    Ok(money::to_cash(total))
}

/// Location-local calendar date for a UTC instant, using the per-location
/// UTC offset from local_settings (calendar-day match, not UTC truncation).
pub(crate) fn business_date_for(
    conn: &Connection,
    location_id: &str,
    at: DateTime<Utc>,
) -> String {
    let offset_minutes = db::get_setting(
        conn,
        "location",
        &format!("utc_offset_minutes:{location_id}"),
    )
    .and_then(|v| v.trim().parse::<i64>().ok())
    .unwrap_or(0);
    (at + chrono::Duration::minutes(offset_minutes))
        .format("%Y-%m-%d")
        .to_string()
}

/// Full session row as a wire payload. Cash fields stay canonical text.
pub(crate) fn session_json(conn: &Connection, session_id: &str) -> Result<Value> {
    conn.query_row(
        "SELECT id, session_number, cashier_id, cashier_name, location_id,
                terminal_id, status, opened_at, closed_at, business_date,
                opening_cash, expected_cash, counted_cash, variance,
                variance_reason, closed_by
         FROM cashier_sessions WHERE id = ?1",
        params![session_id],
        |row| {
            Ok(serde_json::json!({
                "id": row.get::<_, String>(0)?,
                "sessionNumber": row.get::<_, String>(1)?,
                "cashierId": row.get::<_, String>(2)?,
                "cashierName": row.get::<_, Option<String>>(3)?,
                "locationId": row.get::<_, String>(4)?,
                "terminalId": row.get::<_, String>(5)?,
                "status": row.get::<_, String>(6)?,
                "openedAt": row.get::<_, String>(7)?,
                "closedAt": row.get::<_, Option<String>>(8)?,
                "businessDate": row.get::<_, Option<String>>(9)?,
                "openingCash": row.get::<_, String>(10)?,
                "expectedCash": row.get::<_, Option<String>>(11)?,
                "countedCash": row.get::<_, Option<String>>(12)?,
                "variance": row.get::<_, Option<String>>(13)?,
                "varianceReason": row.get::<_, Option<String>>(14)?,
                "closedBy": row.get::<_, Option<String>>(15)?,
            }))
        },
    )
    .optional()?
    .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use chrono::TimeZone;
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

    fn new_session(cashier: &str) -> NewSession {
        NewSession {
            cashier_id: cashier.to_string(),
            cashier_name: Some("Avery".to_string()),
            location_id: "loc-1".to_string(),
            terminal_id: "term-1".to_string(),
            opening_cash: dec!(500.00),
        }
    }

    fn open(db: &DbState, cashier: &str) -> String {
        let session = open_session(db, &new_session(cashier)).expect("open session");
        session["id"].as_str().expect("session id").to_string()
    }

    #[test]
    fn open_assigns_sequential_numbers_per_location() {
        let db = test_db();
        let first = open_session(&db, &new_session("cashier-1")).unwrap();
        let second = open_session(&db, &new_session("cashier-2")).unwrap();
        assert_eq!(first["sessionNumber"], "S-0001");
        assert_eq!(second["sessionNumber"], "S-0002");
        assert_eq!(first["status"], "open");
        assert_eq!(first["openingCash"], "500.00");
    }

    #[test]
    fn second_open_for_same_cashier_is_refused() {
        let db = test_db();
        open(&db, "cashier-1");
        let err = open_session(&db, &new_session("cashier-1")).unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn permanent_close_computes_exact_variance() {
        let db = test_db();
        let id = open(&db, "cashier-1");
        record_sale(&db, &id, dec!(700.00)).unwrap();
        record_sale(&db, &id, dec!(500.00)).unwrap();

        // 500.00 + 1200.00 expected, 1699.50 counted: shortage of 0.50
        let err = close_permanent(&db, &id, dec!(1699.50), None, None).unwrap_err();
        match err {
            EngineError::MissingVarianceReason { variance } => {
                assert_eq!(variance, dec!(-0.50));
            }
            other => panic!("expected MissingVarianceReason, got {other:?}"),
        }

        let session = close_permanent(
            &db,
            &id,
            dec!(1699.50),
            Some("till shorted at handover".to_string()),
            Some("manager-1".to_string()),
        )
        .unwrap();
        assert_eq!(session["status"], "permanently_closed");
        assert_eq!(session["expectedCash"], "1700.00");
        assert_eq!(session["countedCash"], "1699.50");
        assert_eq!(session["variance"], "-0.50");
        assert_eq!(session["varianceReason"], "till shorted at handover");
    }

    #[test]
    fn zero_variance_needs_no_reason() {
        let db = test_db();
        let id = open(&db, "cashier-1");
        record_sale(&db, &id, dec!(300.00)).unwrap();
        let session = close_permanent(&db, &id, dec!(800.00), None, None).unwrap();
        assert_eq!(session["variance"], "0.00");
        assert!(session["varianceReason"].is_null());
    }

    #[test]
    fn temporary_close_then_reopen_round_trips() {
        let db = test_db();
        let id = open(&db, "cashier-1");

        let suspended = close_temporary(&db, &id).unwrap();
        assert_eq!(suspended["status"], "temporarily_closed");
        assert!(!suspended["closedAt"].is_null());
        assert!(suspended["countedCash"].is_null());

        // No settlement happened while suspended
        assert!(suspended["expectedCash"].is_null());

        let err = reopen(&db, &id, "  ").unwrap_err();
        assert_eq!(err.kind(), "validation");

        let reopened = reopen(&db, &id, "override-token-77").unwrap();
        assert_eq!(reopened["status"], "open");
        assert!(reopened["closedAt"].is_null());
        assert!(reopened["businessDate"].is_null());
    }

    #[test]
    fn permanent_close_is_accepted_from_temporarily_closed() {
        let db = test_db();
        let id = open(&db, "cashier-1");
        record_sale(&db, &id, dec!(100.00)).unwrap();
        let suspended = close_temporary(&db, &id).unwrap();
        let suspended_at = suspended["closedAt"].as_str().unwrap().to_string();

        let settled = close_permanent(&db, &id, dec!(600.00), None, None).unwrap();
        assert_eq!(settled["status"], "permanently_closed");
        // The drawer stopped at the temporary close; settling keeps that instant.
        assert_eq!(settled["closedAt"], suspended_at.as_str());
    }

    #[test]
    fn permanently_closed_is_terminal() {
        let db = test_db();
        let id = open(&db, "cashier-1");
        let closed = close_permanent(&db, &id, dec!(500.00), None, None).unwrap();

        for err in [
            close_temporary(&db, &id).unwrap_err(),
            close_permanent(&db, &id, dec!(500.00), None, None).unwrap_err(),
            reopen(&db, &id, "token").unwrap_err(),
            record_sale(&db, &id, dec!(10.00)).unwrap_err(),
        ] {
            assert_eq!(err.kind(), "invalid_state_transition");
        }

        // No field moved
        assert_eq!(get_session(&db, &id).unwrap(), closed);
    }

    #[test]
    fn unknown_session_reports_not_found() {
        let db = test_db();
        let err = close_temporary(&db, "missing").unwrap_err();
        assert_eq!(err.kind(), "session_not_found");
    }

    #[test]
    fn sales_require_an_open_session_and_positive_amount() {
        let db = test_db();
        let id = open(&db, "cashier-1");
        assert_eq!(
            record_sale(&db, &id, dec!(0.00)).unwrap_err().kind(),
            "validation"
        );
        close_temporary(&db, &id).unwrap();
        assert_eq!(
            record_sale(&db, &id, dec!(5.00)).unwrap_err().kind(),
            "invalid_state_transition"
        );
    }

    #[test]
    fn active_session_queries_find_open_sessions_only() {
        let db = test_db();
        let id = open(&db, "cashier-1");
        let by_cashier = get_active_by_cashier(&db, "cashier-1").unwrap();
        assert_eq!(by_cashier["id"], id.as_str());
        let by_terminal = get_active_by_terminal(&db, "loc-1", "term-1").unwrap();
        assert_eq!(by_terminal["id"], id.as_str());

        close_temporary(&db, &id).unwrap();
        assert!(get_active_by_cashier(&db, "cashier-1").unwrap().is_null());
        assert!(get_active_by_terminal(&db, "loc-1", "term-1")
            .unwrap()
            .is_null());
    }

    #[test]
    fn business_date_uses_location_offset_not_utc_truncation() {
        let db = test_db();
        let conn = db.lock().unwrap();
        db::set_setting(&conn, "location", "utc_offset_minutes:loc-west", "-300").unwrap();

        // 02:00 UTC on Jan 11 is still Jan 10 at UTC-5
        let at = Utc.with_ymd_and_hms(2024, 1, 11, 2, 0, 0).single().unwrap();
        assert_eq!(business_date_for(&conn, "loc-west", at), "2024-01-10");
        // An unconfigured location falls back to the UTC calendar date
        assert_eq!(business_date_for(&conn, "loc-utc", at), "2024-01-11");
    }
}
