//! Update history repository
//!
//! Rows with a terminal status are immutable: any further update attempt
//! fails fast as an invariant violation.

use rusqlite::{params, Row};

use crate::types::{UpdateHistory, UpdateStatus, UpdateStrategy, UpdateTrigger};

use super::{
    format_ts, format_ts_opt, parse_enum, parse_ts, parse_ts_opt, Database, DatabaseError,
    DatabaseResult,
};

fn row_to_history(row: &Row<'_>) -> rusqlite::Result<RawHistory> {
    Ok(RawHistory {
        id: row.get(0)?,
        container_id: row.get(1)?,
        old_image: row.get(2)?,
        new_image: row.get(3)?,
        old_digest: row.get(4)?,
        new_digest: row.get(5)?,
        status: row.get(6)?,
        error_message: row.get(7)?,
        duration_seconds: row.get(8)?,
        triggered_by: row.get(9)?,
        strategy: row.get(10)?,
        backup_created: row.get::<_, i64>(11)? != 0,
        rollback_available: row.get::<_, i64>(12)? != 0,
        logs: row.get(13)?,
        backup_json: row.get(14)?,
        started_at: row.get(15)?,
        completed_at: row.get(16)?,
    })
}

struct RawHistory {
    id: String,
    container_id: String,
    old_image: String,
    new_image: String,
    old_digest: Option<String>,
    new_digest: Option<String>,
    status: String,
    error_message: Option<String>,
    duration_seconds: Option<i64>,
    triggered_by: String,
    strategy: String,
    backup_created: bool,
    rollback_available: bool,
    logs: String,
    backup_json: Option<String>,
    started_at: String,
    completed_at: Option<String>,
}

impl RawHistory {
    fn into_record(self) -> DatabaseResult<UpdateHistory> {
        let logs: Vec<String> = serde_json::from_str(&self.logs)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let backup = self
            .backup_json
            .map(|b| serde_json::from_str(&b))
            .transpose()
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        Ok(UpdateHistory {
            id: self.id,
            container_id: self.container_id,
            old_image: self.old_image,
            new_image: self.new_image,
            old_digest: self.old_digest,
            new_digest: self.new_digest,
            status: parse_enum::<UpdateStatus>(&self.status)?,
            error_message: self.error_message,
            duration_seconds: self.duration_seconds,
            triggered_by: parse_enum::<UpdateTrigger>(&self.triggered_by)?,
            strategy: parse_enum::<UpdateStrategy>(&self.strategy)?,
            backup_created: self.backup_created,
            rollback_available: self.rollback_available,
            logs,
            backup,
            started_at: parse_ts(&self.started_at)?,
            completed_at: parse_ts_opt(self.completed_at)?,
        })
    }
}

const SELECT_COLUMNS: &str = "id, container_id, old_image, new_image, old_digest, new_digest, \
     status, error_message, duration_seconds, triggered_by, strategy, backup_created, \
     rollback_available, logs, backup_json, started_at, completed_at";

impl Database {
    pub async fn insert_update_history(&self, history: &UpdateHistory) -> DatabaseResult<()> {
        let conn = self.lock().await;
        conn.execute(
            r#"
            INSERT INTO update_history
                (id, container_id, old_image, new_image, old_digest, new_digest,
                 status, error_message, duration_seconds, triggered_by, strategy,
                 backup_created, rollback_available, logs, backup_json,
                 started_at, completed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                    ?15, ?16, ?17)
            "#,
            params![
                history.id,
                history.container_id,
                history.old_image,
                history.new_image,
                history.old_digest,
                history.new_digest,
                history.status.to_string(),
                history.error_message,
                history.duration_seconds,
                history.triggered_by.to_string(),
                history.strategy.to_string(),
                history.backup_created as i64,
                history.rollback_available as i64,
                serde_json::to_string(&history.logs)
                    .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
                history
                    .backup
                    .as_ref()
                    .map(|b| serde_json::to_string(b))
                    .transpose()
                    .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
                format_ts(history.started_at),
                format_ts_opt(history.completed_at),
            ],
        )?;
        Ok(())
    }

    /// Persist new state for a history row
    ///
    /// Fails fast when the stored row has already reached a terminal
    /// status. Terminal writes must carry `completed_at`.
    pub async fn update_update_history(&self, history: &UpdateHistory) -> DatabaseResult<()> {
        if history.status.is_terminal() && history.completed_at.is_none() {
            return Err(DatabaseError::InvariantViolation(format!(
                "terminal update history {} without completed_at",
                history.id
            )));
        }

        let mut conn = self.lock().await;
        let tx = conn.transaction()?;

        let stored: String = tx
            .query_row(
                "SELECT status FROM update_history WHERE id = ?1",
                [&history.id],
                |row| row.get(0),
            )
            .map_err(|_| DatabaseError::NotFound(format!("update history {}", history.id)))?;

        let stored_status = parse_enum::<UpdateStatus>(&stored)?;
        if stored_status.is_terminal() {
            return Err(DatabaseError::InvariantViolation(format!(
                "update history {} is already terminal ({})",
                history.id, stored_status
            )));
        }

        tx.execute(
            r#"
            UPDATE update_history SET
                status = ?2, error_message = ?3, duration_seconds = ?4,
                backup_created = ?5, rollback_available = ?6, logs = ?7,
                backup_json = ?8, new_digest = ?9, completed_at = ?10
            WHERE id = ?1
            "#,
            params![
                history.id,
                history.status.to_string(),
                history.error_message,
                history.duration_seconds,
                history.backup_created as i64,
                history.rollback_available as i64,
                serde_json::to_string(&history.logs)
                    .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
                history
                    .backup
                    .as_ref()
                    .map(|b| serde_json::to_string(b))
                    .transpose()
                    .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
                history.new_digest,
                format_ts_opt(history.completed_at),
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    pub async fn get_update_history(&self, id: &str) -> DatabaseResult<Option<UpdateHistory>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM update_history WHERE id = ?1",
            SELECT_COLUMNS
        ))?;

        let mut rows = stmt.query_map([id], row_to_history)?;
        match rows.next() {
            Some(raw) => Ok(Some(raw?.into_record()?)),
            None => Ok(None),
        }
    }

    pub async fn list_update_history(
        &self,
        container_id: &str,
        limit: usize,
    ) -> DatabaseResult<Vec<UpdateHistory>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM update_history
             WHERE container_id = ?1 ORDER BY started_at DESC LIMIT ?2",
            SELECT_COLUMNS
        ))?;

        let raws = stmt
            .query_map(params![container_id, limit as i64], row_to_history)?
            .collect::<Result<Vec<_>, _>>()?;
        raws.into_iter().map(RawHistory::into_record).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn history() -> UpdateHistory {
        UpdateHistory {
            id: uuid::Uuid::new_v4().to_string(),
            container_id: "web".into(),
            old_image: "nginx:1.24".into(),
            new_image: "nginx:1.25".into(),
            old_digest: Some("sha256:aaa".into()),
            new_digest: Some("sha256:bbb".into()),
            status: UpdateStatus::Running,
            error_message: None,
            duration_seconds: None,
            triggered_by: UpdateTrigger::Auto,
            strategy: UpdateStrategy::Recreate,
            backup_created: false,
            rollback_available: false,
            logs: vec!["pulling image".into()],
            backup: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn running_row_can_progress_to_terminal() {
        let db = Database::open_in_memory().unwrap();
        let mut h = history();
        db.insert_update_history(&h).await.unwrap();

        h.status = UpdateStatus::Success;
        h.completed_at = Some(Utc::now());
        h.duration_seconds = Some(12);
        db.update_update_history(&h).await.unwrap();

        let loaded = db.get_update_history(&h.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, UpdateStatus::Success);
        assert!(loaded.completed_at.is_some());
        assert!(loaded.duration_seconds.unwrap() >= 0);
    }

    #[tokio::test]
    async fn terminal_row_is_immutable() {
        let db = Database::open_in_memory().unwrap();
        let mut h = history();
        h.status = UpdateStatus::Rollback;
        h.completed_at = Some(Utc::now());
        h.duration_seconds = Some(30);
        db.insert_update_history(&h).await.unwrap();

        h.status = UpdateStatus::Success;
        let err = db.update_update_history(&h).await.unwrap_err();
        assert!(matches!(err, DatabaseError::InvariantViolation(_)));
    }

    #[tokio::test]
    async fn terminal_write_requires_completed_at() {
        let db = Database::open_in_memory().unwrap();
        let mut h = history();
        db.insert_update_history(&h).await.unwrap();

        h.status = UpdateStatus::Failed;
        h.completed_at = None;
        let err = db.update_update_history(&h).await.unwrap_err();
        assert!(matches!(err, DatabaseError::InvariantViolation(_)));
    }
}
