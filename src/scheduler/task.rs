//! Task trait, parameters and the process-wide registry

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::database::DatabaseError;
use crate::registry::RegistryError;
use crate::resolver::ResolverError;
use crate::runtime::RuntimeError;
use crate::types::{ScheduledTask, TaskType};

/// Errors produced by task validation and execution
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Task failed: {0}")]
    Failed(String),

    #[error("Task cancelled")]
    Cancelled,

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Resolver(#[from] ResolverError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl TaskError {
    /// Whether the root cause is an authorisation failure
    ///
    /// Unauthorised failures pause the owning scheduled task instead of
    /// being retried, so bad credentials cannot spam a registry.
    pub fn is_unauthorized(&self) -> bool {
        match self {
            TaskError::Registry(RegistryError::Unauthorized(_)) => true,
            TaskError::Resolver(ResolverError::Registry(RegistryError::Unauthorized(_))) => true,
            _ => false,
        }
    }

    /// Whether another attempt could plausibly succeed
    ///
    /// Transient remote failures and rate limits retry; not-found,
    /// authorisation, parameter and invariant failures are terminal for
    /// the attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            TaskError::InvalidParameters(_) | TaskError::Cancelled => false,
            TaskError::Registry(e) => e.is_retryable(),
            TaskError::Resolver(ResolverError::Registry(e)) => e.is_retryable(),
            TaskError::Resolver(ResolverError::Credentials(_)) => false,
            TaskError::Database(e) => !e.is_constraint_violation(),
            _ => true,
        }
    }

    /// Server-suggested retry delay, when the failure carried one
    pub fn retry_after(&self) -> Option<Duration> {
        let registry_error = match self {
            TaskError::Registry(e) => e,
            TaskError::Resolver(ResolverError::Registry(e)) => e,
            _ => return None,
        };
        match registry_error {
            RegistryError::RateLimited {
                retry_after: Some(seconds),
            } => Some(Duration::from_secs(*seconds)),
            _ => None,
        }
    }
}

/// Condition a dependency must satisfy before a gated fire proceeds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyCondition {
    Success,
    Failure,
    Completion,
}

impl std::str::FromStr for DependencyCondition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(DependencyCondition::Success),
            "failure" => Ok(DependencyCondition::Failure),
            "completion" => Ok(DependencyCondition::Completion),
            other => Err(format!("unknown dependency condition: {}", other)),
        }
    }
}

/// Declared dependencies gating a fire
#[derive(Debug, Clone)]
pub struct TaskDependencies {
    /// Task ids whose most recent completed execution must satisfy the
    /// condition
    pub depends_on: Vec<String>,
    /// Task types that must have a satisfying execution
    pub wait_for_types: Vec<TaskType>,
    pub condition: DependencyCondition,
}

/// Parameters handed to one task execution
#[derive(Debug, Clone, Default)]
pub struct TaskParameters {
    /// Container ids the task targets; empty means all eligible
    pub target_containers: Vec<String>,

    /// Task-type-specific parameter map
    pub parameters: serde_json::Map<String, Value>,

    pub timeout: Option<Duration>,
    pub max_retries: Option<u32>,
    pub retry_delay: Option<Duration>,

    pub dependencies: Option<TaskDependencies>,
}

impl TaskParameters {
    /// Build parameters from a stored task row
    ///
    /// Override keys (`timeout_seconds`, `max_retries`,
    /// `retry_delay_seconds`, `dependencies`) are pulled out of the blob;
    /// everything else stays in the task-specific map.
    pub fn from_scheduled(task: &ScheduledTask) -> Result<Self, TaskError> {
        let map = match &task.parameters {
            Value::Object(map) => map.clone(),
            Value::Null => serde_json::Map::new(),
            other => {
                return Err(TaskError::InvalidParameters(format!(
                    "parameters must be an object, got {}",
                    kind_of(other)
                )))
            }
        };

        let mut params = TaskParameters {
            target_containers: task.target_containers.clone(),
            parameters: map,
            ..Default::default()
        };

        if let Some(secs) = params.take_u64("timeout_seconds")? {
            params.timeout = Some(Duration::from_secs(secs));
        }
        if let Some(retries) = params.take_u64("max_retries")? {
            params.max_retries = Some(retries as u32);
        }
        if let Some(secs) = params.take_u64("retry_delay_seconds")? {
            params.retry_delay = Some(Duration::from_secs(secs));
        }
        params.dependencies = params.take_dependencies()?;

        Ok(params)
    }

    /// String parameter; present-but-wrong-type is an error, not a coercion
    pub fn get_str(&self, key: &str) -> Result<Option<&str>, TaskError> {
        match self.parameters.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(other) => Err(TaskError::InvalidParameters(format!(
                "{} must be a string, got {}",
                key,
                kind_of(other)
            ))),
        }
    }

    pub fn get_bool(&self, key: &str) -> Result<Option<bool>, TaskError> {
        match self.parameters.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(other) => Err(TaskError::InvalidParameters(format!(
                "{} must be a bool, got {}",
                key,
                kind_of(other)
            ))),
        }
    }

    pub fn get_u64(&self, key: &str) -> Result<Option<u64>, TaskError> {
        match self.parameters.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n.as_u64().map(Some).ok_or_else(|| {
                TaskError::InvalidParameters(format!("{} out of range", key))
            }),
            Some(other) => Err(TaskError::InvalidParameters(format!(
                "{} must be a number, got {}",
                key,
                kind_of(other)
            ))),
        }
    }

    fn take_u64(&mut self, key: &str) -> Result<Option<u64>, TaskError> {
        let value = self.get_u64(key)?;
        if value.is_some() {
            self.parameters.remove(key);
        }
        Ok(value)
    }

    fn take_dependencies(&mut self) -> Result<Option<TaskDependencies>, TaskError> {
        let Some(value) = self.parameters.remove("dependencies") else {
            return Ok(None);
        };
        let Value::Object(map) = value else {
            return Err(TaskError::InvalidParameters(
                "dependencies must be an object".into(),
            ));
        };

        let depends_on = match map.get("depends_on") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(entries)) => entries
                .iter()
                .map(|v| match v {
                    Value::String(s) => Ok(s.clone()),
                    other => Err(TaskError::InvalidParameters(format!(
                        "dependencies.depends_on entries must be strings, got {}",
                        kind_of(other)
                    ))),
                })
                .collect::<Result<Vec<_>, _>>()?,
            Some(other) => {
                return Err(TaskError::InvalidParameters(format!(
                    "dependencies.depends_on must be an array, got {}",
                    kind_of(other)
                )))
            }
        };

        let wait_for_types = match map.get("wait_for_types") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(entries)) => entries
                .iter()
                .map(|v| match v {
                    Value::String(s) => s
                        .parse::<TaskType>()
                        .map_err(TaskError::InvalidParameters),
                    other => Err(TaskError::InvalidParameters(format!(
                        "dependencies.wait_for_types entries must be strings, got {}",
                        kind_of(other)
                    ))),
                })
                .collect::<Result<Vec<_>, _>>()?,
            Some(other) => {
                return Err(TaskError::InvalidParameters(format!(
                    "dependencies.wait_for_types must be an array, got {}",
                    kind_of(other)
                )))
            }
        };

        let condition = match map.get("condition") {
            None | Some(Value::Null) => DependencyCondition::Success,
            Some(Value::String(s)) => s
                .parse::<DependencyCondition>()
                .map_err(TaskError::InvalidParameters)?,
            Some(other) => {
                return Err(TaskError::InvalidParameters(format!(
                    "dependencies.condition must be a string, got {}",
                    kind_of(other)
                )))
            }
        };

        if depends_on.is_empty() && wait_for_types.is_empty() {
            return Ok(None);
        }

        Ok(Some(TaskDependencies {
            depends_on,
            wait_for_types,
            condition,
        }))
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A unit of executable work
#[async_trait]
pub trait Task: Send + Sync {
    fn name(&self) -> &str;

    fn task_type(&self) -> TaskType;

    /// Check parameters before execution; called once per fire
    fn validate(&self, params: &TaskParameters) -> Result<(), TaskError>;

    async fn execute(
        &self,
        ctx: CancellationToken,
        params: &TaskParameters,
    ) -> Result<(), TaskError>;

    /// Per-type execution deadline; `None` means unbounded
    fn default_timeout(&self) -> Option<Duration>;

    /// Whether two executions of the same task may overlap
    fn can_run_concurrently(&self) -> bool {
        false
    }
}

type TaskFactory = Arc<dyn Fn() -> Arc<dyn Task> + Send + Sync>;

/// Process-wide mapping from task type to factory
///
/// Registration is one-shot per type; re-registering is an error.
#[derive(Default)]
pub struct TaskRegistry {
    factories: parking_lot::RwLock<HashMap<TaskType, TaskFactory>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, task_type: TaskType, factory: F) -> Result<(), TaskError>
    where
        F: Fn() -> Arc<dyn Task> + Send + Sync + 'static,
    {
        let mut factories = self.factories.write();
        if factories.contains_key(&task_type) {
            return Err(TaskError::InvalidParameters(format!(
                "task type {} already registered",
                task_type
            )));
        }
        factories.insert(task_type, Arc::new(factory));
        Ok(())
    }

    /// Produce a fresh task instance
    pub fn create(&self, task_type: TaskType) -> Option<Arc<dyn Task>> {
        let factory = self.factories.read().get(&task_type).cloned()?;
        Some(factory())
    }

    pub fn registered_types(&self) -> Vec<TaskType> {
        self.factories.read().keys().copied().collect()
    }
}
