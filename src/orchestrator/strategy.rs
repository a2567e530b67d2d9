//! Update strategies and the traffic switch seam

use async_trait::async_trait;

pub use crate::types::UpdateStrategy;

/// Pull behaviour for the new image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PullPolicy {
    #[default]
    Always,
    IfNotPresent,
    Never,
}

impl std::str::FromStr for PullPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "always" => Ok(PullPolicy::Always),
            "if-not-present" | "if_not_present" => Ok(PullPolicy::IfNotPresent),
            "never" => Ok(PullPolicy::Never),
            other => Err(format!("unknown pull policy: {}", other)),
        }
    }
}

/// External collaborator that repoints traffic between containers
///
/// Blue-green and canary strategies hand the actual reference swap to this
/// seam; how traffic moves is deployment-specific and outside the
/// orchestrator's knowledge.
#[async_trait]
pub trait TrafficSwitch: Send + Sync {
    /// Whether this switch can actually move traffic
    fn capable(&self) -> bool;

    /// Atomically repoint external references from `old` to `new`
    async fn swap(&self, old_container: &str, new_container: &str) -> Result<(), String>;

    /// Set a traffic weight (0-100) for a container
    async fn set_weight(&self, container: &str, weight: u8) -> Result<(), String>;
}

/// Placeholder switch: reports itself incapable and does nothing
///
/// With this switch installed, blue-green and canary selections fall back
/// to recreate.
#[derive(Debug, Default)]
pub struct NoopTrafficSwitch;

#[async_trait]
impl TrafficSwitch for NoopTrafficSwitch {
    fn capable(&self) -> bool {
        false
    }

    async fn swap(&self, _old_container: &str, _new_container: &str) -> Result<(), String> {
        Ok(())
    }

    async fn set_weight(&self, _container: &str, _weight: u8) -> Result<(), String> {
        Ok(())
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Capable switch that records its calls
    #[derive(Default)]
    pub struct RecordingSwitch {
        pub calls: Mutex<Vec<String>>,
        /// When set, every `set_weight` call fails
        pub fail_weight: bool,
    }

    #[async_trait]
    impl TrafficSwitch for RecordingSwitch {
        fn capable(&self) -> bool {
            true
        }

        async fn swap(&self, old_container: &str, new_container: &str) -> Result<(), String> {
            self.calls
                .lock()
                .push(format!("swap {} -> {}", old_container, new_container));
            Ok(())
        }

        async fn set_weight(&self, container: &str, weight: u8) -> Result<(), String> {
            self.calls
                .lock()
                .push(format!("weight {} = {}", container, weight));
            if self.fail_weight {
                return Err(format!("weight endpoint refused {}", container));
            }
            Ok(())
        }
    }
}
