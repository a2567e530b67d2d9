//! State persistence module
//!
//! SQLite-backed storage for container records, registry credentials, the
//! image version cache, scheduled tasks, update history and execution logs.
//! Multi-row invariants (single-latest image version, one default credential
//! per registry, terminal-row immutability) are enforced inside
//! transactions here.

mod containers;
mod credentials;
mod executions;
mod history;
mod image_versions;
mod tasks;

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, Result as SqliteResult};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

/// Database errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}

impl DatabaseError {
    /// Whether an underlying SQLite error was a uniqueness/constraint hit
    pub fn is_constraint_violation(&self) -> bool {
        match self {
            DatabaseError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => {
                err.code == rusqlite::ErrorCode::ConstraintViolation
            }
            DatabaseError::InvariantViolation(_) => true,
            _ => false,
        }
    }
}

pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Main database wrapper
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create the database
    pub fn open(path: impl AsRef<Path>) -> DatabaseResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // WAL mode for better concurrent access
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        Self::init_tables(&conn)?;

        info!("Database opened at {:?}", path);

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> DatabaseResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_tables(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Initialize database tables
    fn init_tables(conn: &Connection) -> SqliteResult<()> {
        conn.execute_batch(
            r#"
            -- Registered containers
            CREATE TABLE IF NOT EXISTS containers (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                image TEXT NOT NULL,
                tag TEXT NOT NULL,
                container_id TEXT,
                status TEXT NOT NULL,
                update_policy TEXT NOT NULL,
                registry_ref TEXT,
                config_json TEXT NOT NULL,
                created_by TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- Registry credentials
            CREATE TABLE IF NOT EXISTS registry_credentials (
                name TEXT PRIMARY KEY,
                registry_url TEXT NOT NULL,
                auth_type TEXT NOT NULL,
                secret TEXT NOT NULL,
                is_default INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_registry_credentials_url
                ON registry_credentials(registry_url);

            -- Image version cache
            CREATE TABLE IF NOT EXISTS image_versions (
                image_name TEXT NOT NULL,
                tag TEXT NOT NULL,
                registry_url TEXT NOT NULL,
                digest TEXT NOT NULL,
                size_bytes INTEGER,
                published_at TEXT,
                architecture TEXT,
                os TEXT,
                metadata TEXT NOT NULL DEFAULT '{}',
                checked_at TEXT NOT NULL,
                is_latest INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (image_name, tag, registry_url)
            );

            CREATE INDEX IF NOT EXISTS idx_image_versions_digest
                ON image_versions(digest);

            -- Scheduled tasks
            CREATE TABLE IF NOT EXISTS scheduled_tasks (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                task_type TEXT NOT NULL,
                cron_expression TEXT NOT NULL,
                target_containers TEXT NOT NULL DEFAULT '[]',
                parameters TEXT NOT NULL DEFAULT '{}',
                is_active INTEGER NOT NULL DEFAULT 1,
                last_run_at TEXT,
                next_run_at TEXT,
                run_count INTEGER NOT NULL DEFAULT 0,
                failure_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- Update history
            CREATE TABLE IF NOT EXISTS update_history (
                id TEXT PRIMARY KEY,
                container_id TEXT NOT NULL,
                old_image TEXT NOT NULL,
                new_image TEXT NOT NULL,
                old_digest TEXT,
                new_digest TEXT,
                status TEXT NOT NULL,
                error_message TEXT,
                duration_seconds INTEGER,
                triggered_by TEXT NOT NULL,
                strategy TEXT NOT NULL,
                backup_created INTEGER NOT NULL DEFAULT 0,
                rollback_available INTEGER NOT NULL DEFAULT 0,
                logs TEXT NOT NULL DEFAULT '[]',
                backup_json TEXT,
                started_at TEXT NOT NULL,
                completed_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_update_history_container
                ON update_history(container_id, started_at);

            -- Durable task execution log
            CREATE TABLE IF NOT EXISTS task_execution_log (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                duration_ms INTEGER,
                progress INTEGER NOT NULL DEFAULT 0,
                result TEXT,
                error TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_task_execution_log_task
                ON task_execution_log(task_id, started_at);

            -- Pre-update configuration snapshots
            CREATE TABLE IF NOT EXISTS container_backups (
                id TEXT PRIMARY KEY,
                container_id TEXT NOT NULL,
                snapshot TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_container_backups_container
                ON container_backups(container_id, created_at);
            "#,
        )?;

        Ok(())
    }

    pub(crate) async fn lock(&self) -> tokio::sync::MutexGuard<'_, Connection> {
        self.conn.lock().await
    }
}

// ============================================================================
// Row helpers shared by the repository files
// ============================================================================

pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

pub(crate) fn format_ts_opt(ts: Option<DateTime<Utc>>) -> Option<String> {
    ts.map(format_ts)
}

pub(crate) fn parse_ts(s: &str) -> DatabaseResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Serialization(format!("bad timestamp {:?}: {}", s, e)))
}

pub(crate) fn parse_ts_opt(s: Option<String>) -> DatabaseResult<Option<DateTime<Utc>>> {
    s.map(|s| parse_ts(&s)).transpose()
}

pub(crate) fn parse_json(s: &str) -> DatabaseResult<serde_json::Value> {
    serde_json::from_str(s).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

pub(crate) fn to_json<T: serde::Serialize>(value: &T) -> DatabaseResult<String> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

pub(crate) fn parse_enum<T: std::str::FromStr<Err = String>>(s: &str) -> DatabaseResult<T> {
    s.parse().map_err(DatabaseError::Serialization)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_in_memory_initialises_schema() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.lock().await;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='containers'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }
}
