//! Update history records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::UpdateTrigger;

/// Outcome state of an update run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateStatus {
    Pending,
    Running,
    Success,
    Failed,
    Rollback,
    Cancelled,
}

impl UpdateStatus {
    /// Terminal rows are immutable and carry `completed_at`
    pub fn is_terminal(&self) -> bool {
        !matches!(self, UpdateStatus::Pending | UpdateStatus::Running)
    }
}

impl std::fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UpdateStatus::Pending => "pending",
            UpdateStatus::Running => "running",
            UpdateStatus::Success => "success",
            UpdateStatus::Failed => "failed",
            UpdateStatus::Rollback => "rollback",
            UpdateStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for UpdateStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(UpdateStatus::Pending),
            "running" => Ok(UpdateStatus::Running),
            "success" => Ok(UpdateStatus::Success),
            "failed" => Ok(UpdateStatus::Failed),
            "rollback" => Ok(UpdateStatus::Rollback),
            "cancelled" => Ok(UpdateStatus::Cancelled),
            other => Err(format!("unknown update status: {}", other)),
        }
    }
}

/// How an update replaces the running container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStrategy {
    Recreate,
    Rolling,
    BlueGreen,
    Canary,
}

impl std::fmt::Display for UpdateStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UpdateStrategy::Recreate => "recreate",
            UpdateStrategy::Rolling => "rolling",
            UpdateStrategy::BlueGreen => "blue_green",
            UpdateStrategy::Canary => "canary",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for UpdateStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "recreate" => Ok(UpdateStrategy::Recreate),
            "rolling" => Ok(UpdateStrategy::Rolling),
            "blue_green" => Ok(UpdateStrategy::BlueGreen),
            "canary" => Ok(UpdateStrategy::Canary),
            other => Err(format!("unknown update strategy: {}", other)),
        }
    }
}

/// One row per attempted container update
///
/// Once `status` is terminal, `completed_at` and `duration_seconds` are set
/// and the row does not change again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateHistory {
    /// Record id (UUID)
    pub id: String,

    pub container_id: String,

    pub old_image: String,
    pub new_image: String,
    pub old_digest: Option<String>,
    pub new_digest: Option<String>,

    pub status: UpdateStatus,
    pub error_message: Option<String>,
    pub duration_seconds: Option<i64>,

    pub triggered_by: UpdateTrigger,
    pub strategy: UpdateStrategy,

    pub backup_created: bool,
    pub rollback_available: bool,

    /// Step-by-step log lines collected during the run
    pub logs: Vec<String>,

    /// Pre-update snapshot (config blob + runtime handle), present when a
    /// backup was taken
    pub backup: Option<serde_json::Value>,

    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!UpdateStatus::Pending.is_terminal());
        assert!(!UpdateStatus::Running.is_terminal());
        assert!(UpdateStatus::Success.is_terminal());
        assert!(UpdateStatus::Failed.is_terminal());
        assert!(UpdateStatus::Rollback.is_terminal());
        assert!(UpdateStatus::Cancelled.is_terminal());
    }
}
