//! Scheduled task repository

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

use crate::types::{ScheduledTask, TaskType};

use super::{
    format_ts, format_ts_opt, parse_enum, parse_json, parse_ts, parse_ts_opt, Database,
    DatabaseError, DatabaseResult,
};

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<RawTask> {
    Ok(RawTask {
        id: row.get(0)?,
        name: row.get(1)?,
        task_type: row.get(2)?,
        cron_expression: row.get(3)?,
        target_containers: row.get(4)?,
        parameters: row.get(5)?,
        is_active: row.get::<_, i64>(6)? != 0,
        last_run_at: row.get(7)?,
        next_run_at: row.get(8)?,
        run_count: row.get::<_, i64>(9)?,
        failure_count: row.get::<_, i64>(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

struct RawTask {
    id: String,
    name: String,
    task_type: String,
    cron_expression: String,
    target_containers: String,
    parameters: String,
    is_active: bool,
    last_run_at: Option<String>,
    next_run_at: Option<String>,
    run_count: i64,
    failure_count: i64,
    created_at: String,
    updated_at: String,
}

impl RawTask {
    fn into_record(self) -> DatabaseResult<ScheduledTask> {
        let target_containers: Vec<String> = serde_json::from_str(&self.target_containers)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        Ok(ScheduledTask {
            id: self.id,
            name: self.name,
            task_type: parse_enum::<TaskType>(&self.task_type)?,
            cron_expression: self.cron_expression,
            target_containers,
            parameters: parse_json(&self.parameters)?,
            is_active: self.is_active,
            last_run_at: parse_ts_opt(self.last_run_at)?,
            next_run_at: parse_ts_opt(self.next_run_at)?,
            run_count: self.run_count as u64,
            failure_count: self.failure_count as u64,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

const SELECT_COLUMNS: &str = "id, name, task_type, cron_expression, target_containers, \
     parameters, is_active, last_run_at, next_run_at, run_count, failure_count, \
     created_at, updated_at";

impl Database {
    pub async fn insert_task(&self, task: &ScheduledTask) -> DatabaseResult<()> {
        let conn = self.lock().await;
        conn.execute(
            r#"
            INSERT INTO scheduled_tasks
                (id, name, task_type, cron_expression, target_containers, parameters,
                 is_active, last_run_at, next_run_at, run_count, failure_count,
                 created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
            params![
                task.id,
                task.name,
                task.task_type.to_string(),
                task.cron_expression,
                serde_json::to_string(&task.target_containers)
                    .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
                serde_json::to_string(&task.parameters)
                    .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
                task.is_active as i64,
                format_ts_opt(task.last_run_at),
                format_ts_opt(task.next_run_at),
                task.run_count as i64,
                task.failure_count as i64,
                format_ts(task.created_at),
                format_ts(task.updated_at),
            ],
        )?;
        Ok(())
    }

    pub async fn get_task(&self, id: &str) -> DatabaseResult<Option<ScheduledTask>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM scheduled_tasks WHERE id = ?1",
            SELECT_COLUMNS
        ))?;

        let mut rows = stmt.query_map([id], row_to_task)?;
        match rows.next() {
            Some(raw) => Ok(Some(raw?.into_record()?)),
            None => Ok(None),
        }
    }

    pub async fn get_task_by_name(&self, name: &str) -> DatabaseResult<Option<ScheduledTask>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM scheduled_tasks WHERE name = ?1",
            SELECT_COLUMNS
        ))?;

        let mut rows = stmt.query_map([name], row_to_task)?;
        match rows.next() {
            Some(raw) => Ok(Some(raw?.into_record()?)),
            None => Ok(None),
        }
    }

    pub async fn list_tasks(&self, active_only: bool) -> DatabaseResult<Vec<ScheduledTask>> {
        let conn = self.lock().await;
        let sql = if active_only {
            format!(
                "SELECT {} FROM scheduled_tasks WHERE is_active = 1 ORDER BY name",
                SELECT_COLUMNS
            )
        } else {
            format!("SELECT {} FROM scheduled_tasks ORDER BY name", SELECT_COLUMNS)
        };
        let mut stmt = conn.prepare(&sql)?;

        let raws = stmt
            .query_map([], row_to_task)?
            .collect::<Result<Vec<_>, _>>()?;
        raws.into_iter().map(RawTask::into_record).collect()
    }

    /// Persist the full task row; `updated_at` comes from the caller
    pub async fn update_task(&self, task: &ScheduledTask) -> DatabaseResult<()> {
        let conn = self.lock().await;
        let changed = conn.execute(
            r#"
            UPDATE scheduled_tasks SET
                name = ?2, task_type = ?3, cron_expression = ?4,
                target_containers = ?5, parameters = ?6, is_active = ?7,
                last_run_at = ?8, next_run_at = ?9, run_count = ?10,
                failure_count = ?11, updated_at = ?12
            WHERE id = ?1
            "#,
            params![
                task.id,
                task.name,
                task.task_type.to_string(),
                task.cron_expression,
                serde_json::to_string(&task.target_containers)
                    .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
                serde_json::to_string(&task.parameters)
                    .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
                task.is_active as i64,
                format_ts_opt(task.last_run_at),
                format_ts_opt(task.next_run_at),
                task.run_count as i64,
                task.failure_count as i64,
                format_ts(task.updated_at),
            ],
        )?;

        if changed == 0 {
            return Err(DatabaseError::NotFound(format!("task {}", task.id)));
        }
        Ok(())
    }

    /// Persist the fire-time bookkeeping for one tick
    pub async fn record_task_fire(
        &self,
        id: &str,
        last_run_at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> DatabaseResult<()> {
        let conn = self.lock().await;
        let changed = conn.execute(
            "UPDATE scheduled_tasks
             SET last_run_at = ?2, next_run_at = ?3, updated_at = ?4
             WHERE id = ?1",
            params![
                id,
                format_ts(last_run_at),
                format_ts_opt(next_run_at),
                format_ts(Utc::now()),
            ],
        )?;

        if changed == 0 {
            return Err(DatabaseError::NotFound(format!("task {}", id)));
        }
        Ok(())
    }

    /// Bump run counters after a completed execution
    pub async fn bump_task_counters(&self, id: &str, failed: bool) -> DatabaseResult<()> {
        let conn = self.lock().await;
        let changed = conn.execute(
            "UPDATE scheduled_tasks
             SET run_count = run_count + 1,
                 failure_count = failure_count + ?2,
                 updated_at = ?3
             WHERE id = ?1",
            params![id, failed as i64, format_ts(Utc::now())],
        )?;

        if changed == 0 {
            return Err(DatabaseError::NotFound(format!("task {}", id)));
        }
        Ok(())
    }

    pub async fn delete_task(&self, id: &str) -> DatabaseResult<bool> {
        let conn = self.lock().await;
        let changed = conn.execute("DELETE FROM scheduled_tasks WHERE id = ?1", [id])?;
        Ok(changed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task(name: &str) -> ScheduledTask {
        ScheduledTask {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            task_type: TaskType::ImageCheck,
            cron_expression: "*/5 * * * *".into(),
            target_containers: vec!["web".into()],
            parameters: json!({"enqueue_updates": true}),
            is_active: true,
            last_run_at: None,
            next_run_at: Some(Utc::now() + chrono::Duration::minutes(5)),
            run_count: 0,
            failure_count: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn insert_and_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let t = task("t1");
        db.insert_task(&t).await.unwrap();

        let loaded = db.get_task(&t.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "t1");
        assert_eq!(loaded.task_type, TaskType::ImageCheck);
        assert_eq!(loaded.target_containers, vec!["web".to_string()]);
        assert_eq!(loaded.parameters["enqueue_updates"], true);
    }

    #[tokio::test]
    async fn duplicate_name_fails() {
        let db = Database::open_in_memory().unwrap();
        db.insert_task(&task("t1")).await.unwrap();
        let err = db.insert_task(&task("t1")).await.unwrap_err();
        assert!(err.is_constraint_violation());
    }

    #[tokio::test]
    async fn counters_accumulate() {
        let db = Database::open_in_memory().unwrap();
        let t = task("t1");
        db.insert_task(&t).await.unwrap();

        db.bump_task_counters(&t.id, false).await.unwrap();
        db.bump_task_counters(&t.id, true).await.unwrap();

        let loaded = db.get_task(&t.id).await.unwrap().unwrap();
        assert_eq!(loaded.run_count, 2);
        assert_eq!(loaded.failure_count, 1);
    }

    #[tokio::test]
    async fn fire_bookkeeping_persists() {
        let db = Database::open_in_memory().unwrap();
        let t = task("t1");
        db.insert_task(&t).await.unwrap();

        let now = Utc::now();
        let next = now + chrono::Duration::minutes(5);
        db.record_task_fire(&t.id, now, Some(next)).await.unwrap();

        let loaded = db.get_task(&t.id).await.unwrap().unwrap();
        assert!(loaded.last_run_at.is_some());
        assert_eq!(
            loaded.next_run_at.unwrap().timestamp(),
            next.timestamp()
        );
    }
}
