//! Built-in task implementations

mod backup;
mod cleanup;
mod container_update;
mod health_check;
mod image_check;

pub use backup::BackupTask;
pub use cleanup::CleanupTask;
pub use container_update::ContainerUpdateTask;
pub use health_check::HealthCheckTask;
pub use image_check::ImageCheckTask;

use std::sync::Arc;

use crate::config::ImageCheckConfig;
use crate::database::Database;
use crate::events::EventBus;
use crate::orchestrator::Orchestrator;
use crate::resolver::UpdateResolver;
use crate::runtime::ContainerRuntime;
use crate::types::TaskType;

use super::executor::TaskExecutor;
use super::task::{TaskError, TaskRegistry};

/// Everything the built-in tasks need
#[derive(Clone)]
pub struct BuiltinTaskDeps {
    pub db: Arc<Database>,
    pub resolver: Arc<UpdateResolver>,
    pub orchestrator: Arc<Orchestrator>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub executor: Arc<TaskExecutor>,
    pub bus: EventBus,
    pub image_check: ImageCheckConfig,
    pub history_retention_days: u64,
}

/// Register all five built-in task types
pub fn register_builtin(
    registry: &TaskRegistry,
    deps: BuiltinTaskDeps,
) -> Result<(), TaskError> {
    {
        let deps = deps.clone();
        registry.register(TaskType::ImageCheck, move || {
            Arc::new(ImageCheckTask::new(
                deps.db.clone(),
                deps.resolver.clone(),
                deps.bus.clone(),
                Some(deps.orchestrator.clone()),
                deps.image_check.clone(),
            ))
        })?;
    }
    {
        let deps = deps.clone();
        registry.register(TaskType::ContainerUpdate, move || {
            Arc::new(ContainerUpdateTask::new(
                deps.db.clone(),
                deps.orchestrator.clone(),
                deps.bus.clone(),
            ))
        })?;
    }
    {
        let deps = deps.clone();
        registry.register(TaskType::Cleanup, move || {
            Arc::new(CleanupTask::new(
                deps.db.clone(),
                deps.executor.clone(),
                deps.history_retention_days,
            ))
        })?;
    }
    {
        let deps = deps.clone();
        registry.register(TaskType::Backup, move || {
            Arc::new(BackupTask::new(deps.db.clone()))
        })?;
    }
    registry.register(TaskType::HealthCheck, move || {
        Arc::new(HealthCheckTask::new(
            deps.db.clone(),
            deps.runtime.clone(),
            deps.bus.clone(),
        ))
    })?;

    Ok(())
}
