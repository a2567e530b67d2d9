//! Docker implementation of the container runtime

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions, StatsOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::{CreateImageOptions, ListImagesOptions, RemoveImageOptions};
use bollard::models::{HealthConfig, HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum};
use bollard::Docker;
use futures_util::StreamExt;
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::types::ContainerStatus;

use super::{
    ContainerRuntime, ContainerSpec, ContainerState, ContainerStats, ExecResult, PullAuth,
    RuntimeContainer, RuntimeError, RuntimeHealth, RuntimeImage, RuntimeInfo, RuntimeResult,
};

/// Container runtime backed by the Docker Engine API
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect using the configured endpoint, falling back to the local
    /// defaults when none is set
    pub fn connect(config: &RuntimeConfig) -> RuntimeResult<Self> {
        let timeout = config.timeout_seconds;

        let docker = match &config.docker_host {
            Some(host) if host.starts_with("http://") || host.starts_with("tcp://") => {
                Docker::connect_with_http(host, timeout, bollard::API_DEFAULT_VERSION)?
            }
            Some(host) => {
                let path = host.strip_prefix("unix://").unwrap_or(host);
                Docker::connect_with_socket(path, timeout, bollard::API_DEFAULT_VERSION)?
            }
            None => Docker::connect_with_local_defaults()?,
        };

        info!("Connected to Docker runtime");
        Ok(Self { docker })
    }

    fn map_status(state: Option<&str>) -> ContainerStatus {
        match state {
            Some("running") => ContainerStatus::Running,
            Some("paused") => ContainerStatus::Paused,
            Some("restarting") => ContainerStatus::Restarting,
            Some("removing") => ContainerStatus::Removing,
            Some("exited") => ContainerStatus::Exited,
            Some("dead") => ContainerStatus::Dead,
            Some("created") => ContainerStatus::Stopped,
            _ => ContainerStatus::Unknown,
        }
    }

    fn not_found(e: bollard::errors::Error, id: &str) -> RuntimeError {
        match e {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            } => RuntimeError::ContainerNotFound(id.to_string()),
            other => RuntimeError::Docker(other),
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> RuntimeResult<()> {
        self.docker.ping().await?;
        Ok(())
    }

    async fn info(&self) -> RuntimeResult<RuntimeInfo> {
        let info = self.docker.info().await?;
        Ok(RuntimeInfo {
            name: info.name.unwrap_or_else(|| "docker".to_string()),
            version: info.server_version,
            containers: info.containers.unwrap_or(0) as u64,
        })
    }

    async fn list_containers(&self, all: bool) -> RuntimeResult<Vec<RuntimeContainer>> {
        let options = ListContainersOptions::<String> {
            all,
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(options)).await?;

        Ok(containers
            .into_iter()
            .map(|c| RuntimeContainer {
                id: c.id.unwrap_or_default(),
                name: c
                    .names
                    .unwrap_or_default()
                    .first()
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default(),
                image: c.image.unwrap_or_default(),
                status: Self::map_status(c.state.as_deref()),
                labels: c.labels.unwrap_or_default(),
            })
            .collect())
    }

    async fn list_images(&self) -> RuntimeResult<Vec<RuntimeImage>> {
        let options = ListImagesOptions::<String>::default();
        let images = self.docker.list_images(Some(options)).await?;

        Ok(images
            .into_iter()
            .map(|i| RuntimeImage {
                id: i.id,
                tags: i.repo_tags,
            })
            .collect())
    }

    async fn container_state(&self, id: &str) -> RuntimeResult<ContainerState> {
        let inspect = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| Self::not_found(e, id))?;

        let state = inspect.state.unwrap_or_default();
        let status = state
            .status
            .map(|s| Self::map_status(Some(s.as_ref())))
            .unwrap_or(ContainerStatus::Unknown);

        let health = state.health.and_then(|h| {
            h.status.map(|s| RuntimeHealth {
                status: s.as_ref().to_string(),
                failing_streak: h.failing_streak,
            })
        });

        Ok(ContainerState { status, health })
    }

    async fn container_stats(&self, id: &str) -> RuntimeResult<ContainerStats> {
        let options = StatsOptions {
            stream: false,
            one_shot: true,
        };
        let mut stream = self.docker.stats(id, Some(options));

        let stats = match stream.next().await {
            Some(Ok(stats)) => stats,
            Some(Err(e)) => return Err(Self::not_found(e, id)),
            None => return Err(RuntimeError::ContainerNotFound(id.to_string())),
        };

        let memory_bytes = stats.memory_stats.usage.unwrap_or(0);
        let memory_limit_bytes = stats.memory_stats.limit.unwrap_or(0);
        let memory_percent = if memory_limit_bytes > 0 {
            memory_bytes as f64 / memory_limit_bytes as f64 * 100.0
        } else {
            0.0
        };

        // One-shot reads have no previous sample; precpu carries it.
        let cpu_delta = stats.cpu_stats.cpu_usage.total_usage as f64
            - stats.precpu_stats.cpu_usage.total_usage as f64;
        let system_delta = stats.cpu_stats.system_cpu_usage.unwrap_or(0) as f64
            - stats.precpu_stats.system_cpu_usage.unwrap_or(0) as f64;
        let online_cpus = stats.cpu_stats.online_cpus.unwrap_or(1).max(1) as f64;

        let cpu_percent = if system_delta > 0.0 && cpu_delta >= 0.0 {
            cpu_delta / system_delta * online_cpus * 100.0
        } else {
            0.0
        };

        Ok(ContainerStats {
            cpu_percent,
            memory_percent,
            memory_bytes,
            memory_limit_bytes,
        })
    }

    async fn pull_image(&self, reference: &str, auth: Option<PullAuth>) -> RuntimeResult<()> {
        let options = CreateImageOptions {
            from_image: reference,
            ..Default::default()
        };

        let credentials = auth.map(|a| DockerCredentials {
            username: Some(a.username),
            password: Some(a.password),
            serveraddress: Some(a.server_address),
            ..Default::default()
        });

        let mut stream = self.docker.create_image(Some(options), None, credentials);

        while let Some(result) = stream.next().await {
            match result {
                Ok(progress) => {
                    if let Some(status) = progress.status {
                        debug!("Pull {}: {}", reference, status);
                    }
                }
                Err(e) => return Err(RuntimeError::ImagePull(e.to_string())),
            }
        }

        info!("Pulled image {}", reference);
        Ok(())
    }

    async fn image_present(&self, reference: &str) -> RuntimeResult<bool> {
        match self.docker.inspect_image(reference).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(RuntimeError::Docker(e)),
        }
    }

    async fn create_container(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        let mut exposed_ports = HashMap::new();
        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        for port in &spec.ports {
            let key = format!("{}/{}", port.container_port, port.protocol);
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: Some(port.host_port.to_string()),
                }]),
            );
        }

        let binds: Vec<String> = spec
            .volumes
            .iter()
            .map(|v| {
                if v.read_only {
                    format!("{}:{}:ro", v.source, v.target)
                } else {
                    format!("{}:{}", v.source, v.target)
                }
            })
            .collect();

        let restart_policy = spec.restart_policy.as_deref().map(|name| RestartPolicy {
            name: Some(match name {
                "always" => RestartPolicyNameEnum::ALWAYS,
                "unless-stopped" => RestartPolicyNameEnum::UNLESS_STOPPED,
                "on-failure" => RestartPolicyNameEnum::ON_FAILURE,
                _ => RestartPolicyNameEnum::NO,
            }),
            ..Default::default()
        });

        let healthcheck = spec.healthcheck.as_ref().map(|h| HealthConfig {
            test: Some(h.test.clone()),
            interval: Some(h.interval_seconds as i64 * 1_000_000_000),
            timeout: Some(h.timeout_seconds as i64 * 1_000_000_000),
            retries: Some(h.retries as i64),
            ..Default::default()
        });

        let host_config = HostConfig {
            port_bindings: if port_bindings.is_empty() {
                None
            } else {
                Some(port_bindings)
            },
            binds: if binds.is_empty() { None } else { Some(binds) },
            restart_policy,
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            env: if spec.env.is_empty() {
                None
            } else {
                Some(spec.env.clone())
            },
            cmd: spec.command.clone(),
            labels: if spec.labels.is_empty() {
                None
            } else {
                Some(spec.labels.clone())
            },
            exposed_ports: if exposed_ports.is_empty() {
                None
            } else {
                Some(exposed_ports)
            },
            healthcheck,
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.as_str(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| {
                if let bollard::errors::Error::DockerResponseServerError {
                    status_code: 409, ..
                } = e
                {
                    return RuntimeError::ContainerExists(spec.name.clone());
                }
                RuntimeError::Docker(e)
            })?;

        info!("Created container {} ({})", spec.name, response.id);
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> RuntimeResult<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Self::not_found(e, id))?;
        info!("Started container {}", id);
        Ok(())
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> RuntimeResult<()> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };

        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => {
                info!("Stopped container {}", id);
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                // Already stopped
                Ok(())
            }
            Err(e) => Err(Self::not_found(e, id)),
        }
    }

    async fn remove_container(&self, id: &str, force: bool) -> RuntimeResult<()> {
        let options = RemoveContainerOptions {
            force,
            v: false,
            ..Default::default()
        };

        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => {
                info!("Removed container {}", id);
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!("Container {} already gone", id);
                Ok(())
            }
            Err(e) => Err(RuntimeError::Docker(e)),
        }
    }

    async fn exec(&self, id: &str, cmd: &[String]) -> RuntimeResult<ExecResult> {
        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions {
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    cmd: Some(cmd.to_vec()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| Self::not_found(e, id))?;

        let mut collected = String::new();
        match self.docker.start_exec(&exec.id, None).await? {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(chunk) = output.next().await {
                    match chunk {
                        Ok(msg) => collected.push_str(&String::from_utf8_lossy(&msg.into_bytes())),
                        Err(e) => {
                            warn!("Error reading exec output from {}: {}", id, e);
                            break;
                        }
                    }
                }
            }
            StartExecResults::Detached => {}
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        let exit_code = inspect.exit_code.unwrap_or(-1);

        Ok(ExecResult {
            exit_code,
            output: collected,
        })
    }

    async fn remove_image(&self, reference: &str) -> RuntimeResult<()> {
        let options = RemoveImageOptions {
            force: false,
            ..Default::default()
        };

        match self.docker.remove_image(reference, Some(options), None).await {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(RuntimeError::Docker(e)),
        }
    }
}
