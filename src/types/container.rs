//! Container records and update policies

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Observed runtime status of a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Running,
    Stopped,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Unknown,
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ContainerStatus::Running => "running",
            ContainerStatus::Stopped => "stopped",
            ContainerStatus::Paused => "paused",
            ContainerStatus::Restarting => "restarting",
            ContainerStatus::Removing => "removing",
            ContainerStatus::Exited => "exited",
            ContainerStatus::Dead => "dead",
            ContainerStatus::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for ContainerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(ContainerStatus::Running),
            "stopped" => Ok(ContainerStatus::Stopped),
            "paused" => Ok(ContainerStatus::Paused),
            "restarting" => Ok(ContainerStatus::Restarting),
            "removing" => Ok(ContainerStatus::Removing),
            "exited" => Ok(ContainerStatus::Exited),
            "dead" => Ok(ContainerStatus::Dead),
            "unknown" => Ok(ContainerStatus::Unknown),
            other => Err(format!("unknown container status: {}", other)),
        }
    }
}

/// Who may trigger updates for a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdatePolicy {
    /// Updates applied automatically when detected
    Auto,
    /// Updates only on explicit user action
    Manual,
    /// Updates only through scheduled tasks
    Scheduled,
    /// Updates never applied
    Disabled,
}

impl UpdatePolicy {
    /// Whether a trigger source is allowed to start an update under this policy
    pub fn permits(&self, trigger: UpdateTrigger) -> bool {
        match self {
            UpdatePolicy::Auto => true,
            UpdatePolicy::Manual => trigger == UpdateTrigger::Manual,
            UpdatePolicy::Scheduled => {
                matches!(trigger, UpdateTrigger::Schedule | UpdateTrigger::Manual)
            }
            UpdatePolicy::Disabled => false,
        }
    }
}

impl std::fmt::Display for UpdatePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UpdatePolicy::Auto => "auto",
            UpdatePolicy::Manual => "manual",
            UpdatePolicy::Scheduled => "scheduled",
            UpdatePolicy::Disabled => "disabled",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for UpdatePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(UpdatePolicy::Auto),
            "manual" => Ok(UpdatePolicy::Manual),
            "scheduled" => Ok(UpdatePolicy::Scheduled),
            "disabled" => Ok(UpdatePolicy::Disabled),
            other => Err(format!("unknown update policy: {}", other)),
        }
    }
}

/// Source of an update request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateTrigger {
    Auto,
    Manual,
    Schedule,
    Webhook,
}

impl std::fmt::Display for UpdateTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UpdateTrigger::Auto => "auto",
            UpdateTrigger::Manual => "manual",
            UpdateTrigger::Schedule => "schedule",
            UpdateTrigger::Webhook => "webhook",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for UpdateTrigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(UpdateTrigger::Auto),
            "manual" => Ok(UpdateTrigger::Manual),
            "schedule" => Ok(UpdateTrigger::Schedule),
            "webhook" => Ok(UpdateTrigger::Webhook),
            other => Err(format!("unknown update trigger: {}", other)),
        }
    }
}

/// A container registered with the daemon
///
/// The `config` blob holds the desired runtime configuration (env, ports,
/// volumes, labels, restart policy, healthcheck) as free-form JSON; typed
/// access happens at the runtime seam when the blob is turned into a
/// container spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerRecord {
    /// Record id (UUID)
    pub id: String,

    /// Globally unique name
    pub name: String,

    /// Image reference without tag (registry + repository)
    pub image: String,

    /// Image tag, never empty (defaults to "latest")
    pub tag: String,

    /// Runtime handle of the live container, if any
    pub container_id: Option<String>,

    /// Last observed status
    pub status: ContainerStatus,

    /// Update policy for this container
    pub update_policy: UpdatePolicy,

    /// Name of the RegistryCredentials record to authenticate with
    pub registry_ref: Option<String>,

    /// Desired configuration blob
    pub config: serde_json::Value,

    /// User who registered the container
    pub created_by: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ContainerRecord {
    /// Full image reference including the tag
    pub fn image_with_tag(&self) -> String {
        format!("{}:{}", self.image, self.tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_permits_matrix() {
        assert!(UpdatePolicy::Auto.permits(UpdateTrigger::Auto));
        assert!(UpdatePolicy::Auto.permits(UpdateTrigger::Manual));
        assert!(!UpdatePolicy::Manual.permits(UpdateTrigger::Auto));
        assert!(UpdatePolicy::Manual.permits(UpdateTrigger::Manual));
        assert!(UpdatePolicy::Scheduled.permits(UpdateTrigger::Schedule));
        assert!(!UpdatePolicy::Scheduled.permits(UpdateTrigger::Webhook));
        assert!(!UpdatePolicy::Disabled.permits(UpdateTrigger::Manual));
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            ContainerStatus::Running,
            ContainerStatus::Exited,
            ContainerStatus::Dead,
        ] {
            let parsed: ContainerStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }
}
