//! Scheduled task records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of work a scheduled task performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    ImageCheck,
    ContainerUpdate,
    Cleanup,
    Backup,
    HealthCheck,
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskType::ImageCheck => "image_check",
            TaskType::ContainerUpdate => "container_update",
            TaskType::Cleanup => "cleanup",
            TaskType::Backup => "backup",
            TaskType::HealthCheck => "health_check",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image_check" => Ok(TaskType::ImageCheck),
            "container_update" => Ok(TaskType::ContainerUpdate),
            "cleanup" => Ok(TaskType::Cleanup),
            "backup" => Ok(TaskType::Backup),
            "health_check" => Ok(TaskType::HealthCheck),
            other => Err(format!("unknown task type: {}", other)),
        }
    }
}

/// Outcome state of one task execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Success,
    Failed,
    Timeout,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(ExecutionStatus::Running),
            "success" => Ok(ExecutionStatus::Success),
            "failed" => Ok(ExecutionStatus::Failed),
            "timeout" => Ok(ExecutionStatus::Timeout),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            other => Err(format!("unknown execution status: {}", other)),
        }
    }
}

/// Durable record of one task execution
///
/// Same shape as the in-memory execution minus the cancel handle, which
/// never leaves the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecutionLog {
    /// Execution id (UUID)
    pub id: String,
    pub task_id: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    /// Coarse progress, 0-100
    pub progress: u8,
    pub result: Option<String>,
    pub error: Option<String>,
}

/// A cron-driven task definition
///
/// Invariants: `cron_expression` is valid whenever the row is saved;
/// `next_run_at` is recomputed and persisted on every mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    /// Record id (UUID)
    pub id: String,

    /// Unique task name
    pub name: String,

    pub task_type: TaskType,

    /// Five-field cron expression or @-descriptor
    pub cron_expression: String,

    /// Container ids this task targets; empty means all eligible
    pub target_containers: Vec<String>,

    /// Task-type-specific parameters
    pub parameters: serde_json::Value,

    pub is_active: bool,

    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,

    pub run_count: u64,
    pub failure_count: u64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
