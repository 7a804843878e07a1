//! Local SQLite layer for the back-office engine.
//!
//! Uses rusqlite with WAL mode, the same configuration the POS terminals
//! run. Provides schema migrations, settings helpers, and the managed
//! connection state shared by the command layer.

use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

use crate::error::{EngineError, Result};

/// Managed state holding the database connection.
///
/// One mutex-guarded connection; every state transition in the engine is a
/// single conditional `UPDATE` on it, so request workers serialize only for
/// the duration of their own write.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

impl DbState {
    /// Lock the connection. A poisoned lock is reported as a storage
    /// failure rather than propagating the panic.
    pub fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| EngineError::StorageUnavailable("database lock poisoned".to_string()))
    }
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 3;

/// Initialize the database at `{data_dir}/backoffice.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. On corruption or open failure,
/// deletes the file and retries once.
pub fn init(data_dir: &Path) -> Result<DbState> {
    fs::create_dir_all(data_dir)
        .map_err(|e| EngineError::StorageUnavailable(format!("create data dir: {e}")))?;

    let db_path = data_dir.join("backoffice.db");
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Database open failed ({}), deleting and retrying once",
                first_err
            );
            if db_path.exists() {
                let _ = fs::remove_file(&db_path);
                // Also remove WAL/SHM files if present
                let wal = db_path.with_extension("db-wal");
                let shm = db_path.with_extension("db-shm");
                let _ = fs::remove_file(&wal);
                let _ = fs::remove_file(&shm);
            }
            open_and_configure(&db_path).map_err(|e| {
                EngineError::StorageUnavailable(format!("database open failed after retry: {e}"))
            })?
        }
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .map_err(|e| EngineError::StorageUnavailable(format!("sqlite open: {e}")))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| EngineError::StorageUnavailable(format!("pragma setup: {e}")))?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<()> {
    // Ensure schema_version table exists first
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    if current < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Migration v1: settings plus the cashier session tables.
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        -- local_settings (category/key/value store)
        CREATE TABLE IF NOT EXISTS local_settings (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(setting_category, setting_key)
        );

        -- cashier_sessions: one row per cashier working period at a terminal.
        -- Cash columns hold canonical fixed-scale decimal text, never REAL.
        CREATE TABLE IF NOT EXISTS cashier_sessions (
            id TEXT PRIMARY KEY,
            session_number TEXT NOT NULL,
            cashier_id TEXT NOT NULL,
            cashier_name TEXT,
            location_id TEXT NOT NULL,
            terminal_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'open',
            opened_at TEXT NOT NULL,
            closed_at TEXT,
            business_date TEXT,
            opening_cash TEXT NOT NULL DEFAULT '0.00',
            expected_cash TEXT,
            counted_cash TEXT,
            variance TEXT,
            variance_reason TEXT,
            closed_by TEXT,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_sessions_cashier_status
            ON cashier_sessions(cashier_id, status);
        CREATE INDEX IF NOT EXISTS idx_sessions_location_date
            ON cashier_sessions(location_id, business_date);

        -- session_sales: completed sale totals recorded against a session.
        -- Source of truth for expected cash at close.
        CREATE TABLE IF NOT EXISTS session_sales (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL REFERENCES cashier_sessions(id),
            amount TEXT NOT NULL,
            recorded_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_session_sales_session
            ON session_sales(session_id);

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )?;
    Ok(())
}

/// Migration v2: interim settlement ledger (append-only).
fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS interim_settlements (
            session_id TEXT NOT NULL REFERENCES cashier_sessions(id),
            seq INTEGER NOT NULL,
            amount TEXT NOT NULL,
            reason_type TEXT NOT NULL,
            reason_name TEXT,
            recorded_at TEXT NOT NULL,
            PRIMARY KEY (session_id, seq)
        );

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )?;
    Ok(())
}

/// Migration v3: business day records.
fn migrate_v3(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS business_days (
            id TEXT PRIMARY KEY,
            location_id TEXT NOT NULL,
            business_date TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'open',
            checklist_json TEXT NOT NULL DEFAULT '{}',
            settlement_json TEXT,
            opened_at TEXT NOT NULL,
            closed_at TEXT,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(location_id, business_date)
        );

        CREATE INDEX IF NOT EXISTS idx_business_days_location
            ON business_days(location_id, status);

        INSERT INTO schema_version (version) VALUES (3);
        ",
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Read a value from local_settings. Returns None if absent.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings
         WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Upsert a value into local_settings.
pub fn set_setting(conn: &Connection, category: &str, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(setting_category, setting_key)
         DO UPDATE SET setting_value = excluded.setting_value,
                       updated_at = datetime('now')",
        params![category, key, value],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------

/// Run the full migration ladder against a test connection.
#[doc(hidden)]
pub fn run_migrations_for_test(conn: &Connection) {
    run_migrations(conn).expect("test migrations");
}
