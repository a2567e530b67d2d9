//! Container runtime abstraction
//!
//! The orchestrator talks to the container engine through the
//! [`ContainerRuntime`] trait so it stays agnostic of the underlying
//! runtime. The surface mirrors the Docker Engine v1.41 operations the
//! update flow needs.

mod docker;
mod spec;

#[cfg(test)]
pub mod mock;

pub use docker::DockerRuntime;
pub use spec::{spec_from_config, ContainerSpec, HealthcheckSpec, PortMapping, VolumeMount};

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::types::ContainerStatus;

/// Error type for runtime operations
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Container already exists: {0}")]
    ContainerExists(String),

    #[error("Image pull failed: {0}")]
    ImagePull(String),

    #[error("Exec failed: {0}")]
    ExecFailed(String),

    #[error("Invalid container config: {0}")]
    InvalidConfig(String),

    #[error("Operation timed out")]
    Timeout,

    #[error("{0}")]
    Other(String),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Facts about the runtime endpoint
#[derive(Debug, Clone)]
pub struct RuntimeInfo {
    pub name: String,
    pub version: Option<String>,
    pub containers: u64,
}

/// A container as the runtime lists it
#[derive(Debug, Clone)]
pub struct RuntimeContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: ContainerStatus,
    pub labels: HashMap<String, String>,
}

/// An image as the runtime lists it
#[derive(Debug, Clone)]
pub struct RuntimeImage {
    pub id: String,
    pub tags: Vec<String>,
}

/// Runtime-reported health of a container
#[derive(Debug, Clone)]
pub struct RuntimeHealth {
    /// Runtime vocabulary: `starting`, `healthy`, `unhealthy`
    pub status: String,
    pub failing_streak: Option<i64>,
}

/// Inspected status + health of one container
#[derive(Debug, Clone)]
pub struct ContainerState {
    pub status: ContainerStatus,
    pub health: Option<RuntimeHealth>,
}

/// Point-in-time resource usage of one container
#[derive(Debug, Clone, Default)]
pub struct ContainerStats {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_bytes: u64,
    pub memory_limit_bytes: u64,
}

/// Credentials passed to the runtime for a pull
#[derive(Debug, Clone)]
pub struct PullAuth {
    pub username: String,
    pub password: String,
    pub server_address: String,
}

/// Outcome of a command executed inside a container
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub exit_code: i64,
    pub output: String,
}

/// Operations the update orchestrator needs from a container engine
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn ping(&self) -> RuntimeResult<()>;

    async fn info(&self) -> RuntimeResult<RuntimeInfo>;

    async fn list_containers(&self, all: bool) -> RuntimeResult<Vec<RuntimeContainer>>;

    async fn list_images(&self) -> RuntimeResult<Vec<RuntimeImage>>;

    async fn container_state(&self, id: &str) -> RuntimeResult<ContainerState>;

    async fn container_stats(&self, id: &str) -> RuntimeResult<ContainerStats>;

    async fn pull_image(&self, reference: &str, auth: Option<PullAuth>) -> RuntimeResult<()>;

    /// Whether the image is already present locally
    async fn image_present(&self, reference: &str) -> RuntimeResult<bool>;

    /// Create a container; returns the runtime handle
    async fn create_container(&self, spec: &ContainerSpec) -> RuntimeResult<String>;

    async fn start_container(&self, id: &str) -> RuntimeResult<()>;

    async fn stop_container(&self, id: &str, grace: Duration) -> RuntimeResult<()>;

    async fn remove_container(&self, id: &str, force: bool) -> RuntimeResult<()>;

    /// Run a command inside the container and wait for it
    async fn exec(&self, id: &str, cmd: &[String]) -> RuntimeResult<ExecResult>;

    async fn remove_image(&self, reference: &str) -> RuntimeResult<()>;
}
