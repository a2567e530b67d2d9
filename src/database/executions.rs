//! Task execution log and backup snapshot repositories

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use uuid::Uuid;

use crate::types::{ExecutionStatus, TaskExecutionLog};

use super::{
    format_ts, format_ts_opt, parse_enum, parse_ts, parse_ts_opt, Database, DatabaseResult,
};

fn row_to_log(row: &Row<'_>) -> rusqlite::Result<RawLog> {
    Ok(RawLog {
        id: row.get(0)?,
        task_id: row.get(1)?,
        status: row.get(2)?,
        started_at: row.get(3)?,
        completed_at: row.get(4)?,
        duration_ms: row.get::<_, Option<i64>>(5)?,
        progress: row.get::<_, i64>(6)?,
        result: row.get(7)?,
        error: row.get(8)?,
    })
}

struct RawLog {
    id: String,
    task_id: String,
    status: String,
    started_at: String,
    completed_at: Option<String>,
    duration_ms: Option<i64>,
    progress: i64,
    result: Option<String>,
    error: Option<String>,
}

impl RawLog {
    fn into_record(self) -> DatabaseResult<TaskExecutionLog> {
        Ok(TaskExecutionLog {
            id: self.id,
            task_id: self.task_id,
            status: parse_enum::<ExecutionStatus>(&self.status)?,
            started_at: parse_ts(&self.started_at)?,
            completed_at: parse_ts_opt(self.completed_at)?,
            duration_ms: self.duration_ms.map(|v| v as u64),
            progress: self.progress.clamp(0, 100) as u8,
            result: self.result,
            error: self.error,
        })
    }
}

const SELECT_COLUMNS: &str =
    "id, task_id, status, started_at, completed_at, duration_ms, progress, result, error";

impl Database {
    pub async fn insert_execution_log(&self, log: &TaskExecutionLog) -> DatabaseResult<()> {
        let conn = self.lock().await;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO task_execution_log
                (id, task_id, status, started_at, completed_at, duration_ms,
                 progress, result, error)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                log.id,
                log.task_id,
                log.status.to_string(),
                format_ts(log.started_at),
                format_ts_opt(log.completed_at),
                log.duration_ms.map(|v| v as i64),
                log.progress as i64,
                log.result,
                log.error,
            ],
        )?;
        Ok(())
    }

    pub async fn list_execution_logs(
        &self,
        task_id: &str,
        limit: usize,
    ) -> DatabaseResult<Vec<TaskExecutionLog>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM task_execution_log
             WHERE task_id = ?1 ORDER BY started_at DESC LIMIT ?2",
            SELECT_COLUMNS
        ))?;

        let raws = stmt
            .query_map(params![task_id, limit as i64], row_to_log)?
            .collect::<Result<Vec<_>, _>>()?;
        raws.into_iter().map(RawLog::into_record).collect()
    }

    /// Most recent completed execution for a task, if any
    pub async fn latest_completed_execution(
        &self,
        task_id: &str,
    ) -> DatabaseResult<Option<TaskExecutionLog>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM task_execution_log
             WHERE task_id = ?1 AND completed_at IS NOT NULL
             ORDER BY completed_at DESC LIMIT 1",
            SELECT_COLUMNS
        ))?;

        let mut rows = stmt.query_map([task_id], row_to_log)?;
        match rows.next() {
            Some(raw) => Ok(Some(raw?.into_record()?)),
            None => Ok(None),
        }
    }

    /// Delete logs older than the cutoff; returns how many went away
    pub async fn prune_execution_logs(&self, older_than: DateTime<Utc>) -> DatabaseResult<usize> {
        let conn = self.lock().await;
        let deleted = conn.execute(
            "DELETE FROM task_execution_log WHERE started_at < ?1",
            [format_ts(older_than)],
        )?;
        Ok(deleted)
    }

    // ========================================================================
    // Configuration snapshots
    // ========================================================================

    /// Store a pre-update snapshot of a container's configuration
    pub async fn insert_backup(
        &self,
        container_id: &str,
        snapshot: &serde_json::Value,
    ) -> DatabaseResult<String> {
        let id = Uuid::new_v4().to_string();
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO container_backups (id, container_id, snapshot, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![id, container_id, snapshot.to_string(), format_ts(Utc::now())],
        )?;
        Ok(id)
    }

    /// Newest snapshot for a container
    pub async fn latest_backup(
        &self,
        container_id: &str,
    ) -> DatabaseResult<Option<serde_json::Value>> {
        let conn = self.lock().await;
        let snapshot: Option<String> = conn
            .query_row(
                "SELECT snapshot FROM container_backups
                 WHERE container_id = ?1 ORDER BY created_at DESC LIMIT 1",
                [container_id],
                |row| row.get(0),
            )
            .ok();

        snapshot.map(|s| super::parse_json(&s)).transpose()
    }

    /// Delete snapshots older than the cutoff
    pub async fn prune_backups(&self, older_than: DateTime<Utc>) -> DatabaseResult<usize> {
        let conn = self.lock().await;
        let deleted = conn.execute(
            "DELETE FROM container_backups WHERE created_at < ?1",
            [format_ts(older_than)],
        )?;
        Ok(deleted)
    }
}
