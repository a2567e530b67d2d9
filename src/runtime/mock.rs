//! Scriptable in-memory runtime for tests

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::types::ContainerStatus;

use super::{
    ContainerRuntime, ContainerSpec, ContainerState, ContainerStats, ExecResult, PullAuth,
    RuntimeContainer, RuntimeError, RuntimeHealth, RuntimeImage, RuntimeInfo, RuntimeResult,
};

#[derive(Debug, Clone)]
pub struct MockContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: ContainerStatus,
    pub labels: HashMap<String, String>,
}

#[derive(Default)]
struct MockState {
    containers: HashMap<String, MockContainer>,
    images: Vec<String>,
    /// Scripted health probe outcomes, consumed front-first; empty = healthy
    health_script: VecDeque<bool>,
    exec_script: VecDeque<ExecResult>,
    stats: ContainerStats,
    fail_pull: bool,
    fail_start: bool,
    ops: Vec<String>,
}

/// In-memory [`ContainerRuntime`] with scriptable failures
#[derive(Default)]
pub struct MockRuntime {
    state: Mutex<MockState>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_container(&self, id: &str, name: &str, image: &str, status: ContainerStatus) {
        self.state.lock().containers.insert(
            id.to_string(),
            MockContainer {
                id: id.to_string(),
                name: name.to_string(),
                image: image.to_string(),
                status,
                labels: HashMap::new(),
            },
        );
    }

    pub fn add_image(&self, reference: &str) {
        self.state.lock().images.push(reference.to_string());
    }

    /// Outcomes for successive health probes; once exhausted, healthy
    pub fn script_health(&self, outcomes: Vec<bool>) {
        self.state.lock().health_script = outcomes.into();
    }

    pub fn script_exec(&self, results: Vec<ExecResult>) {
        self.state.lock().exec_script = results.into();
    }

    pub fn set_stats(&self, stats: ContainerStats) {
        self.state.lock().stats = stats;
    }

    pub fn fail_pulls(&self, fail: bool) {
        self.state.lock().fail_pull = fail;
    }

    pub fn fail_starts(&self, fail: bool) {
        self.state.lock().fail_start = fail;
    }

    /// Recorded operations, in call order
    pub fn ops(&self) -> Vec<String> {
        self.state.lock().ops.clone()
    }

    pub fn container(&self, id: &str) -> Option<MockContainer> {
        self.state.lock().containers.get(id).cloned()
    }

    pub fn container_by_name(&self, name: &str) -> Option<MockContainer> {
        self.state
            .lock()
            .containers
            .values()
            .find(|c| c.name == name)
            .cloned()
    }

    fn record(&self, op: String) {
        self.state.lock().ops.push(op);
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn ping(&self) -> RuntimeResult<()> {
        Ok(())
    }

    async fn info(&self) -> RuntimeResult<RuntimeInfo> {
        let state = self.state.lock();
        Ok(RuntimeInfo {
            name: "mock".to_string(),
            version: Some("0.0.0".to_string()),
            containers: state.containers.len() as u64,
        })
    }

    async fn list_containers(&self, all: bool) -> RuntimeResult<Vec<RuntimeContainer>> {
        let state = self.state.lock();
        Ok(state
            .containers
            .values()
            .filter(|c| all || c.status == ContainerStatus::Running)
            .map(|c| RuntimeContainer {
                id: c.id.clone(),
                name: c.name.clone(),
                image: c.image.clone(),
                status: c.status,
                labels: c.labels.clone(),
            })
            .collect())
    }

    async fn list_images(&self) -> RuntimeResult<Vec<RuntimeImage>> {
        let state = self.state.lock();
        Ok(state
            .images
            .iter()
            .map(|tag| RuntimeImage {
                id: format!("sha256:{}", tag),
                tags: vec![tag.clone()],
            })
            .collect())
    }

    async fn container_state(&self, id: &str) -> RuntimeResult<ContainerState> {
        let mut state = self.state.lock();
        let container = state
            .containers
            .get(id)
            .cloned()
            .ok_or_else(|| RuntimeError::ContainerNotFound(id.to_string()))?;

        let healthy = state.health_script.pop_front().unwrap_or(true);
        Ok(ContainerState {
            status: container.status,
            health: Some(RuntimeHealth {
                status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
                failing_streak: (!healthy).then_some(1),
            }),
        })
    }

    async fn container_stats(&self, id: &str) -> RuntimeResult<ContainerStats> {
        let state = self.state.lock();
        if !state.containers.contains_key(id) {
            return Err(RuntimeError::ContainerNotFound(id.to_string()));
        }
        Ok(state.stats.clone())
    }

    async fn pull_image(&self, reference: &str, _auth: Option<PullAuth>) -> RuntimeResult<()> {
        self.record(format!("pull {}", reference));
        let mut state = self.state.lock();
        if state.fail_pull {
            return Err(RuntimeError::ImagePull(format!("scripted failure: {}", reference)));
        }
        state.images.push(reference.to_string());
        Ok(())
    }

    async fn image_present(&self, reference: &str) -> RuntimeResult<bool> {
        Ok(self.state.lock().images.iter().any(|i| i == reference))
    }

    async fn create_container(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        self.record(format!("create {} ({})", spec.name, spec.image));
        let mut state = self.state.lock();
        if state.containers.values().any(|c| c.name == spec.name) {
            return Err(RuntimeError::ContainerExists(spec.name.clone()));
        }

        let id = Uuid::new_v4().to_string();
        state.containers.insert(
            id.clone(),
            MockContainer {
                id: id.clone(),
                name: spec.name.clone(),
                image: spec.image.clone(),
                status: ContainerStatus::Stopped,
                labels: spec.labels.clone(),
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> RuntimeResult<()> {
        self.record(format!("start {}", id));
        let mut state = self.state.lock();
        if state.fail_start {
            return Err(RuntimeError::Other(format!("scripted start failure: {}", id)));
        }
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::ContainerNotFound(id.to_string()))?;
        container.status = ContainerStatus::Running;
        Ok(())
    }

    async fn stop_container(&self, id: &str, _grace: Duration) -> RuntimeResult<()> {
        self.record(format!("stop {}", id));
        let mut state = self.state.lock();
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::ContainerNotFound(id.to_string()))?;
        container.status = ContainerStatus::Exited;
        Ok(())
    }

    async fn remove_container(&self, id: &str, _force: bool) -> RuntimeResult<()> {
        self.record(format!("remove {}", id));
        self.state.lock().containers.remove(id);
        Ok(())
    }

    async fn exec(&self, id: &str, cmd: &[String]) -> RuntimeResult<ExecResult> {
        self.record(format!("exec {} {:?}", id, cmd));
        let mut state = self.state.lock();
        if !state.containers.contains_key(id) {
            return Err(RuntimeError::ContainerNotFound(id.to_string()));
        }
        Ok(state.exec_script.pop_front().unwrap_or(ExecResult {
            exit_code: 0,
            output: String::new(),
        }))
    }

    async fn remove_image(&self, reference: &str) -> RuntimeResult<()> {
        self.record(format!("rmi {}", reference));
        self.state.lock().images.retain(|i| i != reference);
        Ok(())
    }
}
