//! Configuration snapshot task

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::database::Database;
use crate::types::TaskType;

use super::super::task::{Task, TaskError, TaskParameters};

/// Stores a point-in-time snapshot of container configurations so updates
/// and operators always have something to roll back to
pub struct BackupTask {
    db: Arc<Database>,
}

impl BackupTask {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Task for BackupTask {
    fn name(&self) -> &str {
        "backup"
    }

    fn task_type(&self) -> TaskType {
        TaskType::Backup
    }

    fn validate(&self, _params: &TaskParameters) -> Result<(), TaskError> {
        Ok(())
    }

    async fn execute(
        &self,
        ctx: CancellationToken,
        params: &TaskParameters,
    ) -> Result<(), TaskError> {
        let containers = if params.target_containers.is_empty() {
            self.db.list_containers().await?
        } else {
            let mut records = Vec::new();
            for id in &params.target_containers {
                match self.db.get_container(id).await? {
                    Some(record) => records.push(record),
                    None => warn!("Target container {} does not exist, skipping", id),
                }
            }
            records
        };

        let mut stored = 0usize;
        for record in &containers {
            if ctx.is_cancelled() {
                return Err(TaskError::Cancelled);
            }
            let snapshot = serde_json::json!({
                "container_id": record.container_id,
                "name": record.name,
                "image": record.image_with_tag(),
                "config": record.config,
            });
            self.db.insert_backup(&record.id, &snapshot).await?;
            stored += 1;
        }

        info!("Stored {} configuration snapshots", stored);
        Ok(())
    }

    fn default_timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(2 * 60 * 60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContainerRecord, ContainerStatus, UpdatePolicy};
    use chrono::Utc;
    use serde_json::json;

    #[tokio::test]
    async fn snapshots_every_container() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        for name in ["web", "db"] {
            db.insert_container(&ContainerRecord {
                id: name.to_string(),
                name: name.to_string(),
                image: "nginx".into(),
                tag: "1.24".into(),
                container_id: Some(format!("c-{}", name)),
                status: ContainerStatus::Running,
                update_policy: UpdatePolicy::Auto,
                registry_ref: None,
                config: json!({"env": {}}),
                created_by: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
        }

        let task = BackupTask::new(db.clone());
        task.execute(CancellationToken::new(), &TaskParameters::default())
            .await
            .unwrap();

        let snapshot = db.latest_backup("web").await.unwrap().unwrap();
        assert_eq!(snapshot["image"], "nginx:1.24");
        assert!(db.latest_backup("db").await.unwrap().is_some());
    }
}
