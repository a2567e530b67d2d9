//! History retention cleanup task

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::database::Database;
use crate::types::TaskType;

use super::super::executor::TaskExecutor;
use super::super::task::{Task, TaskError, TaskParameters};

/// Deletes expired execution logs and snapshots and evicts stale
/// executions from the live map
pub struct CleanupTask {
    db: Arc<Database>,
    executor: Arc<TaskExecutor>,
    retention_days: u64,
}

impl CleanupTask {
    pub fn new(db: Arc<Database>, executor: Arc<TaskExecutor>, retention_days: u64) -> Self {
        Self {
            db,
            executor,
            retention_days,
        }
    }
}

#[async_trait]
impl Task for CleanupTask {
    fn name(&self) -> &str {
        "cleanup"
    }

    fn task_type(&self) -> TaskType {
        TaskType::Cleanup
    }

    fn validate(&self, params: &TaskParameters) -> Result<(), TaskError> {
        if let Some(days) = params.get_u64("retention_days")? {
            if days == 0 {
                return Err(TaskError::InvalidParameters(
                    "retention_days must be at least 1".into(),
                ));
            }
        }
        Ok(())
    }

    async fn execute(
        &self,
        _ctx: CancellationToken,
        params: &TaskParameters,
    ) -> Result<(), TaskError> {
        let retention_days = params
            .get_u64("retention_days")?
            .unwrap_or(self.retention_days);
        let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);

        let logs = self.db.prune_execution_logs(cutoff).await?;
        let backups = self.db.prune_backups(cutoff).await?;
        let evicted = self.executor.evict_stale();

        info!(
            "Cleanup removed {} execution logs, {} snapshots, {} stale executions",
            logs, backups, evicted
        );
        Ok(())
    }

    fn default_timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(30 * 60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::executor::ExecutorConfig;
    use crate::types::{ExecutionStatus, TaskExecutionLog};

    #[tokio::test]
    async fn old_rows_are_pruned() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let executor = Arc::new(TaskExecutor::new(ExecutorConfig::default()));

        db.insert_execution_log(&TaskExecutionLog {
            id: "old".into(),
            task_id: "t1".into(),
            status: ExecutionStatus::Success,
            started_at: Utc::now() - chrono::Duration::days(45),
            completed_at: Some(Utc::now() - chrono::Duration::days(45)),
            duration_ms: Some(10),
            progress: 100,
            result: None,
            error: None,
        })
        .await
        .unwrap();
        db.insert_execution_log(&TaskExecutionLog {
            id: "new".into(),
            task_id: "t1".into(),
            status: ExecutionStatus::Success,
            started_at: Utc::now(),
            completed_at: Some(Utc::now()),
            duration_ms: Some(10),
            progress: 100,
            result: None,
            error: None,
        })
        .await
        .unwrap();

        let task = CleanupTask::new(db.clone(), executor, 30);
        task.execute(CancellationToken::new(), &TaskParameters::default())
            .await
            .unwrap();

        let remaining = db.list_execution_logs("t1", 10).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "new");
    }

    #[tokio::test]
    async fn zero_retention_is_rejected() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let executor = Arc::new(TaskExecutor::new(ExecutorConfig::default()));
        let task = CleanupTask::new(db, executor, 30);

        let mut params = TaskParameters::default();
        params
            .parameters
            .insert("retention_days".into(), serde_json::Value::from(0));
        assert!(task.validate(&params).is_err());
    }
}
