//! Batch container update task

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::database::Database;
use crate::events::{Event, EventBus, EventType, Severity};
use crate::orchestrator::{Orchestrator, UpdateRequest};
use crate::registry::ImageRef;
use crate::types::{
    ContainerRecord, TaskType, UpdatePolicy, UpdateStatus, UpdateStrategy, UpdateTrigger,
};

use super::super::task::{Task, TaskError, TaskParameters};

/// Walks eligible containers and runs the orchestrator over them under a
/// concurrency bound, then emits a summary notification
pub struct ContainerUpdateTask {
    db: Arc<Database>,
    orchestrator: Arc<Orchestrator>,
    bus: EventBus,
}

impl ContainerUpdateTask {
    pub fn new(db: Arc<Database>, orchestrator: Arc<Orchestrator>, bus: EventBus) -> Self {
        Self {
            db,
            orchestrator,
            bus,
        }
    }

    /// Explicit targets, or every auto-policy container whose latest check
    /// flagged an update
    async fn eligible(&self, params: &TaskParameters) -> Result<Vec<ContainerRecord>, TaskError> {
        if !params.target_containers.is_empty() {
            let mut records = Vec::new();
            for id in &params.target_containers {
                match self.db.get_container(id).await? {
                    Some(record) => records.push(record),
                    None => warn!("Target container {} does not exist, skipping", id),
                }
            }
            return Ok(records);
        }

        let mut eligible = Vec::new();
        for record in self.db.list_containers_by_policy(UpdatePolicy::Auto).await? {
            let Ok(parsed) = ImageRef::parse(&record.image_with_tag()) else {
                continue;
            };
            let flagged = self
                .db
                .get_image_version(&parsed.repo_path(), &parsed.tag, &parsed.registry)
                .await?
                .map(|v| {
                    v.metadata
                        .get("update_available")
                        .and_then(|f| f.as_bool())
                        .unwrap_or(false)
                })
                .unwrap_or(false);
            if flagged {
                eligible.push(record);
            }
        }
        Ok(eligible)
    }
}

#[async_trait]
impl Task for ContainerUpdateTask {
    fn name(&self) -> &str {
        "container_update"
    }

    fn task_type(&self) -> TaskType {
        TaskType::ContainerUpdate
    }

    fn validate(&self, params: &TaskParameters) -> Result<(), TaskError> {
        if let Some(strategy) = params.get_str("strategy")? {
            strategy
                .parse::<UpdateStrategy>()
                .map_err(TaskError::InvalidParameters)?;
        }
        params.get_u64("max_concurrent")?;
        params.get_bool("notify_on_success")?;
        params.get_bool("notify_on_failure")?;
        Ok(())
    }

    async fn execute(
        &self,
        ctx: CancellationToken,
        params: &TaskParameters,
    ) -> Result<(), TaskError> {
        let strategy = params
            .get_str("strategy")?
            .map(|s| s.parse::<UpdateStrategy>())
            .transpose()
            .map_err(TaskError::InvalidParameters)?
            .unwrap_or(UpdateStrategy::Recreate);
        let max_concurrent = params
            .get_u64("max_concurrent")?
            .map(|n| n.max(1) as usize)
            .unwrap_or(self.orchestrator.config().max_concurrent.max(1));
        let notify_on_success = params.get_bool("notify_on_success")?.unwrap_or(true);
        let notify_on_failure = params.get_bool("notify_on_failure")?.unwrap_or(true);

        let targets = self.eligible(params).await?;
        if targets.is_empty() {
            info!("No containers eligible for update");
            return Ok(());
        }
        info!(
            "Batch update over {} containers ({} at a time)",
            targets.len(),
            max_concurrent
        );

        let mut update_futures: Vec<
            std::pin::Pin<
                Box<dyn std::future::Future<Output = (String, Result<UpdateStatus, String>)> + Send + '_>,
            >,
        > = Vec::with_capacity(targets.len());
        for record in &targets {
            let ctx = ctx.clone();
            let request = UpdateRequest {
                strategy,
                trigger: UpdateTrigger::Schedule,
                // Eligibility was decided above from the cache flag.
                force_update: true,
                ..Default::default()
            };
            update_futures.push(Box::pin(async move {
                let outcome = self
                    .orchestrator
                    .update_container(ctx.child_token(), &record.id, request)
                    .await
                    .map(|r| r.status)
                    .map_err(|e| e.to_string());
                (record.name.clone(), outcome)
            }));
        }
        let outcomes: Vec<(String, Result<UpdateStatus, String>)> =
            futures_util::stream::iter(update_futures)
                .buffer_unordered(max_concurrent)
                .collect()
                .await;

        let mut succeeded = 0usize;
        let mut rolled_back = 0usize;
        let mut failed: Vec<String> = Vec::new();
        for (name, outcome) in &outcomes {
            match outcome {
                Ok(UpdateStatus::Success) => succeeded += 1,
                Ok(UpdateStatus::Rollback) => {
                    rolled_back += 1;
                    failed.push(name.clone());
                }
                Ok(status) => {
                    warn!("Update of {} ended as {}", name, status);
                    failed.push(name.clone());
                }
                Err(e) => {
                    warn!("Update of {} refused: {}", name, e);
                    failed.push(name.clone());
                }
            }
        }

        let wants_notification =
            (succeeded > 0 && notify_on_success) || (!failed.is_empty() && notify_on_failure);
        if wants_notification {
            let severity = if failed.is_empty() {
                Severity::Success
            } else {
                Severity::Warning
            };
            self.bus.publish(Event::new(
                EventType::NotificationCreated,
                severity,
                "container_update",
                "Batch update finished",
                format!(
                    "{} updated, {} rolled back, {} failed of {} containers",
                    succeeded,
                    rolled_back,
                    failed.len(),
                    outcomes.len()
                ),
            ));
        }

        if succeeded == 0 && !failed.is_empty() {
            return Err(TaskError::Failed(format!(
                "all {} updates failed",
                failed.len()
            )));
        }
        Ok(())
    }

    fn default_timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(60 * 60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::events::EventFilter;
    use crate::orchestrator::{NoopTrafficSwitch, OrchestratorConfig};
    use crate::runtime::mock::MockRuntime;
    use crate::types::{ContainerStatus, ImageVersion};
    use chrono::Utc;
    use serde_json::json;

    async fn seed(db: &Database, runtime: &MockRuntime, name: &str, policy: UpdatePolicy) {
        db.insert_container(&ContainerRecord {
            id: name.to_string(),
            name: name.to_string(),
            image: "nginx".into(),
            tag: "1.24".into(),
            container_id: Some(format!("c-{}", name)),
            status: ContainerStatus::Running,
            update_policy: policy,
            registry_ref: None,
            config: json!({}),
            created_by: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
        .await
        .unwrap();
        runtime.add_container(
            &format!("c-{}", name),
            name,
            "nginx:1.24",
            ContainerStatus::Running,
        );
    }

    async fn flag_update(db: &Database) {
        db.upsert_image_version(&ImageVersion {
            image_name: "library/nginx".into(),
            tag: "1.24".into(),
            registry_url: "docker.io".into(),
            digest: "sha256:bbb".into(),
            size_bytes: None,
            published_at: None,
            architecture: None,
            os: None,
            metadata: json!({"update_available": true}),
            checked_at: Utc::now(),
            is_latest: true,
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn flagged_auto_containers_are_updated() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let runtime = Arc::new(MockRuntime::new());
        let bus = EventBus::new();
        seed(&db, &runtime, "web", UpdatePolicy::Auto).await;
        seed(&db, &runtime, "manual", UpdatePolicy::Manual).await;
        flag_update(&db).await;

        let orchestrator = Arc::new(Orchestrator::new(
            OrchestratorConfig {
                health_poll_interval: Duration::from_millis(5),
                ..Default::default()
            },
            runtime.clone(),
            db.clone(),
            bus.clone(),
            Arc::new(NoopTrafficSwitch),
        ));

        let mut sub = bus.subscribe(EventFilter::for_types(vec![
            EventType::NotificationCreated,
        ]));

        let task = ContainerUpdateTask::new(db.clone(), orchestrator, bus);
        task.execute(CancellationToken::new(), &TaskParameters::default())
            .await
            .unwrap();

        // Only the auto-policy container was replaced.
        assert!(runtime.ops().iter().any(|o| o == "remove c-web"));
        assert!(!runtime.ops().iter().any(|o| o == "remove c-manual"));

        let summary = tokio::time::timeout(Duration::from_millis(100), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(summary.message.contains("1 updated"));
    }

    #[tokio::test]
    async fn notifications_can_be_silenced() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let runtime = Arc::new(MockRuntime::new());
        let bus = EventBus::new();
        seed(&db, &runtime, "web", UpdatePolicy::Auto).await;
        flag_update(&db).await;

        let orchestrator = Arc::new(Orchestrator::new(
            OrchestratorConfig {
                health_poll_interval: Duration::from_millis(5),
                ..Default::default()
            },
            runtime.clone(),
            db.clone(),
            bus.clone(),
            Arc::new(NoopTrafficSwitch),
        ));

        let mut sub = bus.subscribe(EventFilter::for_types(vec![
            EventType::NotificationCreated,
        ]));

        let task = ContainerUpdateTask::new(db.clone(), orchestrator, bus);
        let mut params = TaskParameters::default();
        params
            .parameters
            .insert("notify_on_success".into(), serde_json::Value::Bool(false));
        task.execute(CancellationToken::new(), &params).await.unwrap();

        assert!(
            tokio::time::timeout(Duration::from_millis(50), sub.recv())
                .await
                .is_err()
        );
    }
}
