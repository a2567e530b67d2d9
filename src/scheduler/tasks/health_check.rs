//! Fleet-wide health probing task

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::database::Database;
use crate::events::{Event, EventBus, EventType, Severity};
use crate::orchestrator::{checks_from_config, evaluate};
use crate::runtime::ContainerRuntime;
use crate::types::TaskType;

use super::super::task::{Task, TaskError, TaskParameters};

/// Evaluates every running container's health and raises events on
/// unhealthy containers and resource pressure
pub struct HealthCheckTask {
    db: Arc<Database>,
    runtime: Arc<dyn ContainerRuntime>,
    bus: EventBus,
    http: reqwest::Client,
}

impl HealthCheckTask {
    pub fn new(db: Arc<Database>, runtime: Arc<dyn ContainerRuntime>, bus: EventBus) -> Self {
        Self {
            db,
            runtime,
            bus,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Task for HealthCheckTask {
    fn name(&self) -> &str {
        "health_check"
    }

    fn task_type(&self) -> TaskType {
        TaskType::HealthCheck
    }

    fn validate(&self, _params: &TaskParameters) -> Result<(), TaskError> {
        Ok(())
    }

    async fn execute(
        &self,
        ctx: CancellationToken,
        params: &TaskParameters,
    ) -> Result<(), TaskError> {
        let containers = self.db.list_containers().await?;
        let mut probed = 0usize;
        let mut unhealthy = 0usize;

        for record in containers {
            if ctx.is_cancelled() {
                return Err(TaskError::Cancelled);
            }
            if !params.target_containers.is_empty()
                && !params.target_containers.contains(&record.id)
            {
                continue;
            }
            let Some(runtime_id) = &record.container_id else {
                continue;
            };

            let checks = match checks_from_config(&record.config) {
                Ok(checks) => checks,
                Err(e) => {
                    warn!("Bad health check config on {}: {}", record.name, e);
                    continue;
                }
            };

            let evaluation =
                evaluate(self.runtime.as_ref(), &self.http, runtime_id, &checks).await;
            probed += 1;

            // Keep the observed status current while the fleet is walked.
            if let Ok(state) = self.runtime.container_state(runtime_id).await {
                if state.status != record.status {
                    let _ = self
                        .db
                        .update_container_runtime_state(
                            &record.id,
                            state.status,
                            Some(runtime_id),
                        )
                        .await;
                }
            }

            if !evaluation.healthy {
                unhealthy += 1;
                let mut event = Event::new(
                    EventType::SystemHealthChanged,
                    Severity::Warning,
                    "health_check",
                    "Container unhealthy",
                    format!("{}: {}", record.name, evaluation.failures.join("; ")),
                )
                .with_resource("container", record.id.clone());
                if let Some(streak) = evaluation.failing_streak {
                    event = event.with_data("failing_streak", serde_json::Value::from(streak));
                }
                self.bus.publish(event);
            }

            for warning in &evaluation.warnings {
                self.bus.publish(
                    Event::new(
                        EventType::SystemResourceAlert,
                        Severity::Warning,
                        "health_check",
                        "Resource pressure",
                        format!("{}: {}", record.name, warning),
                    )
                    .with_resource("container", record.id.clone()),
                );
            }
        }

        info!(
            "Health sweep probed {} containers, {} unhealthy",
            probed, unhealthy
        );
        Ok(())
    }

    fn default_timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(10 * 60))
    }

    fn can_run_concurrently(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventFilter;
    use crate::runtime::mock::MockRuntime;
    use crate::types::{ContainerRecord, ContainerStatus, UpdatePolicy};
    use chrono::Utc;
    use serde_json::json;

    #[tokio::test]
    async fn unhealthy_container_raises_event() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let runtime = Arc::new(MockRuntime::new());
        let bus = EventBus::new();

        db.insert_container(&ContainerRecord {
            id: "web".into(),
            name: "web".into(),
            image: "nginx".into(),
            tag: "1.24".into(),
            container_id: Some("c-web".into()),
            status: ContainerStatus::Running,
            update_policy: UpdatePolicy::Auto,
            registry_ref: None,
            config: json!({}),
            created_by: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
        .await
        .unwrap();
        runtime.add_container("c-web", "web", "nginx:1.24", ContainerStatus::Running);
        runtime.script_health(vec![false]);

        let mut sub = bus.subscribe(EventFilter::for_types(vec![
            EventType::SystemHealthChanged,
        ]));

        let task = HealthCheckTask::new(db, runtime, bus);
        task.execute(CancellationToken::new(), &TaskParameters::default())
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_millis(100), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.resource_id.as_deref(), Some("web"));
        assert_eq!(event.data["failing_streak"], 1);
    }
}
