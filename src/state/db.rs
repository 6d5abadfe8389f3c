// SQLite database setup and migrations
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Stored data is inconsistent: {0}")]
    Corrupt(String),
}

pub type DbResult<T> = Result<T, DbError>;

// Thread-safe database connection wrapper
pub struct DbConnection {
    conn: Arc<Mutex<Connection>>,
}

impl DbConnection {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Connection> {
        // Every write runs in a transaction, so a poisoned connection is still consistent
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Clone for DbConnection {
    fn clone(&self) -> Self {
        Self {
            conn: Arc::clone(&self.conn),
        }
    }
}

/// Open (or create) the run database at `path`
pub fn init_db(path: &Path) -> DbResult<DbConnection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let conn = Connection::open(path)?;
    setup(&conn)?;
    log::debug!("Opened run database at {}", path.display());

    Ok(DbConnection::new(conn))
}

/// In-memory database with the full schema
pub fn open_in_memory() -> DbResult<DbConnection> {
    let conn = Connection::open_in_memory()?;
    setup(&conn)?;
    Ok(DbConnection::new(conn))
}

fn setup(conn: &Connection) -> DbResult<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    run_migrations(conn)
}

fn run_migrations(conn: &Connection) -> DbResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    let current_version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    if current_version < 1 {
        migration_v1(conn)?;
        conn.execute("INSERT INTO schema_migrations (version) VALUES (?1)", [1])?;
    }

    Ok(())
}

fn migration_v1(conn: &Connection) -> DbResult<()> {
    // One row per metrics computation
    conn.execute(
        "CREATE TABLE IF NOT EXISTS runs (
            id TEXT PRIMARY KEY,
            created_at TEXT NOT NULL,
            input_path TEXT NOT NULL,
            input_sha256 TEXT NOT NULL,
            params_json TEXT NOT NULL,
            crate_version TEXT NOT NULL,
            n_units INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_runs_created_at ON runs(created_at DESC)",
        [],
    )?;

    // Metrics table in long format; REAL keeps every f64 bit
    conn.execute(
        "CREATE TABLE IF NOT EXISTS unit_metrics (
            run_id TEXT NOT NULL,
            unit_id INTEGER NOT NULL,
            position INTEGER NOT NULL,
            peak_channel INTEGER NOT NULL,
            metric TEXT NOT NULL,
            state TEXT NOT NULL,
            value REAL,
            reason_json TEXT,
            PRIMARY KEY (run_id, unit_id, metric),
            FOREIGN KEY (run_id) REFERENCES runs(id) ON DELETE CASCADE
        )",
        [],
    )?;

    // Each application of a threshold config to a run
    conn.execute(
        "CREATE TABLE IF NOT EXISTS label_sets (
            id TEXT PRIMARY KEY,
            run_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            thresholds_sha256 TEXT NOT NULL,
            thresholds_json TEXT NOT NULL,
            FOREIGN KEY (run_id) REFERENCES runs(id) ON DELETE CASCADE
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_label_sets_run_id ON label_sets(run_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS unit_labels (
            label_set_id TEXT NOT NULL,
            unit_id INTEGER NOT NULL,
            position INTEGER NOT NULL,
            label TEXT NOT NULL,
            rule_id TEXT,
            reasoning TEXT NOT NULL,
            PRIMARY KEY (label_set_id, unit_id),
            FOREIGN KEY (label_set_id) REFERENCES label_sets(id) ON DELETE CASCADE
        )",
        [],
    )?;

    Ok(())
}
