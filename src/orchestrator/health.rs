//! Container health evaluation
//!
//! A container is healthy only when the runtime's own health status (if it
//! reports one) is `healthy` AND every configured custom check passes.
//! Resource pressure is an operational warning, never a failure.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::runtime::{ContainerRuntime, RuntimeError};

/// CPU / memory percentage above which a pressure warning is raised
const RESOURCE_PRESSURE_THRESHOLD: f64 = 90.0;

/// One configured custom health check
#[derive(Debug, Clone)]
pub enum HealthCheckSpec {
    Http {
        method: String,
        url: String,
        headers: HashMap<String, String>,
        expected_status: u16,
        /// Substring expected within the first KiB of the body
        body_substring: Option<String>,
        timeout: Duration,
    },
    Tcp {
        host: String,
        port: u16,
        timeout: Duration,
    },
    Command {
        command: Vec<String>,
        expected_exit: i64,
    },
}

/// Parse the `health_checks` array of a container config blob
pub fn checks_from_config(config: &Value) -> Result<Vec<HealthCheckSpec>, RuntimeError> {
    let entries = match config.get("health_checks") {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(entries)) => entries,
        Some(_) => {
            return Err(RuntimeError::InvalidConfig(
                "health_checks must be an array".into(),
            ))
        }
    };

    entries.iter().map(parse_check).collect()
}

fn parse_check(value: &Value) -> Result<HealthCheckSpec, RuntimeError> {
    let Value::Object(map) = value else {
        return Err(RuntimeError::InvalidConfig(
            "health check entries must be objects".into(),
        ));
    };

    let kind = match map.get("type") {
        Some(Value::String(s)) => s.as_str(),
        _ => {
            return Err(RuntimeError::InvalidConfig(
                "health check type must be a string".into(),
            ))
        }
    };

    match kind {
        "http" => {
            let url = string_field(map, "url")?.ok_or_else(|| {
                RuntimeError::InvalidConfig("http health check needs a url".into())
            })?;
            let mut headers = HashMap::new();
            if let Some(Value::Object(raw)) = map.get("headers") {
                for (key, header) in raw {
                    let Value::String(header) = header else {
                        return Err(RuntimeError::InvalidConfig(format!(
                            "health check header {} must be a string",
                            key
                        )));
                    };
                    headers.insert(key.clone(), header.clone());
                }
            }
            Ok(HealthCheckSpec::Http {
                method: string_field(map, "method")?.unwrap_or_else(|| "GET".into()),
                url,
                headers,
                expected_status: number_field(map, "expected_status")?.unwrap_or(200) as u16,
                body_substring: string_field(map, "body_substring")?,
                timeout: Duration::from_secs(number_field(map, "timeout_seconds")?.unwrap_or(10)),
            })
        }
        "tcp" => {
            let host = string_field(map, "host")?.ok_or_else(|| {
                RuntimeError::InvalidConfig("tcp health check needs a host".into())
            })?;
            let port = number_field(map, "port")?.ok_or_else(|| {
                RuntimeError::InvalidConfig("tcp health check needs a port".into())
            })?;
            Ok(HealthCheckSpec::Tcp {
                host,
                port: port as u16,
                timeout: Duration::from_secs(number_field(map, "timeout_seconds")?.unwrap_or(5)),
            })
        }
        "command" => {
            let command = match map.get("command") {
                Some(Value::Array(entries)) => entries
                    .iter()
                    .map(|v| match v {
                        Value::String(s) => Ok(s.clone()),
                        _ => Err(RuntimeError::InvalidConfig(
                            "command health check entries must be strings".into(),
                        )),
                    })
                    .collect::<Result<Vec<_>, _>>()?,
                _ => {
                    return Err(RuntimeError::InvalidConfig(
                        "command health check needs a command array".into(),
                    ))
                }
            };
            Ok(HealthCheckSpec::Command {
                command,
                expected_exit: number_field(map, "expected_exit")?.unwrap_or(0) as i64,
            })
        }
        other => Err(RuntimeError::InvalidConfig(format!(
            "unknown health check type {:?}",
            other
        ))),
    }
}

fn string_field(
    map: &serde_json::Map<String, Value>,
    key: &str,
) -> Result<Option<String>, RuntimeError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(RuntimeError::InvalidConfig(format!(
            "health check {} must be a string",
            key
        ))),
    }
}

fn number_field(
    map: &serde_json::Map<String, Value>,
    key: &str,
) -> Result<Option<u64>, RuntimeError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n.as_u64().map(Some).ok_or_else(|| {
            RuntimeError::InvalidConfig(format!("health check {} out of range", key))
        }),
        Some(_) => Err(RuntimeError::InvalidConfig(format!(
            "health check {} must be a number",
            key
        ))),
    }
}

/// Outcome of one health evaluation
#[derive(Debug, Clone, Default)]
pub struct HealthEvaluation {
    pub healthy: bool,
    pub failures: Vec<String>,
    /// Operational signals (resource pressure); never block an update
    pub warnings: Vec<String>,
    /// Runtime-reported failing streak, when the runtime exposes one
    pub failing_streak: Option<i64>,
}

/// Evaluate a container's health: runtime status plus custom checks
pub async fn evaluate(
    runtime: &dyn ContainerRuntime,
    http: &reqwest::Client,
    container_id: &str,
    checks: &[HealthCheckSpec],
) -> HealthEvaluation {
    let mut evaluation = HealthEvaluation {
        healthy: true,
        ..Default::default()
    };

    match runtime.container_state(container_id).await {
        Ok(state) => {
            if let Some(health) = state.health {
                evaluation.failing_streak = health.failing_streak;
                if health.status != "healthy" {
                    evaluation.healthy = false;
                    evaluation
                        .failures
                        .push(format!("runtime health is {}", health.status));
                }
            }
        }
        Err(e) => {
            evaluation.healthy = false;
            evaluation.failures.push(format!("inspect failed: {}", e));
        }
    }

    for check in checks {
        if let Err(reason) = run_check(runtime, http, container_id, check).await {
            evaluation.healthy = false;
            evaluation.failures.push(reason);
        }
    }

    if let Ok(stats) = runtime.container_stats(container_id).await {
        if stats.cpu_percent > RESOURCE_PRESSURE_THRESHOLD {
            evaluation
                .warnings
                .push(format!("cpu at {:.1}%", stats.cpu_percent));
        }
        if stats.memory_percent > RESOURCE_PRESSURE_THRESHOLD {
            evaluation
                .warnings
                .push(format!("memory at {:.1}%", stats.memory_percent));
        }
    }

    evaluation
}

async fn run_check(
    runtime: &dyn ContainerRuntime,
    http: &reqwest::Client,
    container_id: &str,
    check: &HealthCheckSpec,
) -> Result<(), String> {
    match check {
        HealthCheckSpec::Http {
            method,
            url,
            headers,
            expected_status,
            body_substring,
            timeout,
        } => {
            let method: reqwest::Method = method
                .parse()
                .map_err(|_| format!("bad http method {:?}", method))?;
            let mut request = http.request(method, url).timeout(*timeout);
            for (key, value) in headers {
                request = request.header(key, value);
            }

            let response = request
                .send()
                .await
                .map_err(|e| format!("http check {} failed: {}", url, e))?;

            let status = response.status().as_u16();
            if status != *expected_status {
                return Err(format!(
                    "http check {} returned {}, expected {}",
                    url, status, expected_status
                ));
            }

            if let Some(needle) = body_substring {
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| format!("http check {} body read failed: {}", url, e))?;
                let head = &body[..body.len().min(1024)];
                if !String::from_utf8_lossy(head).contains(needle.as_str()) {
                    return Err(format!(
                        "http check {} body missing {:?}",
                        url, needle
                    ));
                }
            }
            Ok(())
        }
        HealthCheckSpec::Tcp {
            host,
            port,
            timeout,
        } => {
            match tokio::time::timeout(
                *timeout,
                tokio::net::TcpStream::connect((host.as_str(), *port)),
            )
            .await
            {
                Ok(Ok(_)) => Ok(()),
                Ok(Err(e)) => Err(format!("tcp check {}:{} failed: {}", host, port, e)),
                Err(_) => Err(format!("tcp check {}:{} timed out", host, port)),
            }
        }
        HealthCheckSpec::Command {
            command,
            expected_exit,
        } => {
            let result = runtime
                .exec(container_id, command)
                .await
                .map_err(|e| format!("command check failed: {}", e))?;
            if result.exit_code != *expected_exit {
                debug!(
                    "Command check output for {}: {}",
                    container_id, result.output
                );
                return Err(format!(
                    "command check exited {}, expected {}",
                    result.exit_code, expected_exit
                ));
            }
            Ok(())
        }
    }
}
