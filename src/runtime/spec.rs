//! Container spec built from a stored configuration blob
//!
//! The config blob is free-form JSON; turning it into a spec is where typed
//! access happens. Wrong types fail loudly instead of being coerced.

use std::collections::HashMap;

use serde_json::Value;

use super::{RuntimeError, RuntimeResult};

/// One published port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub container_port: u16,
    pub host_port: u16,
    pub protocol: String,
}

/// One bind-mounted volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

/// Healthcheck configuration as the runtime understands it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthcheckSpec {
    /// Test command in runtime form (e.g. `["CMD-SHELL", "curl -f ..."]`)
    pub test: Vec<String>,
    pub interval_seconds: u64,
    pub timeout_seconds: u64,
    pub retries: u64,
}

/// Everything needed to create a container
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<String>,
    pub ports: Vec<PortMapping>,
    pub volumes: Vec<VolumeMount>,
    pub labels: HashMap<String, String>,
    pub restart_policy: Option<String>,
    pub healthcheck: Option<HealthcheckSpec>,
    pub command: Option<Vec<String>>,
}

/// Build a [`ContainerSpec`] from a stored config blob
///
/// Recognised keys: `env` (object of strings), `ports` (array of
/// `{container, host, protocol?}`), `volumes` (array of
/// `{source, target, read_only?}`), `labels` (object of strings),
/// `restart_policy` (string), `healthcheck` (`{test, interval_seconds,
/// timeout_seconds, retries}`), `command` (array of strings). A key of the
/// wrong shape is an error, not a silent default.
pub fn spec_from_config(name: &str, image: &str, config: &Value) -> RuntimeResult<ContainerSpec> {
    let obj = match config {
        Value::Object(map) => map,
        Value::Null => {
            return Ok(ContainerSpec {
                name: name.to_string(),
                image: image.to_string(),
                env: Vec::new(),
                ports: Vec::new(),
                volumes: Vec::new(),
                labels: HashMap::new(),
                restart_policy: None,
                healthcheck: None,
                command: None,
            })
        }
        other => {
            return Err(RuntimeError::InvalidConfig(format!(
                "config must be an object, got {}",
                json_kind(other)
            )))
        }
    };

    let env = match obj.get("env") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Object(map)) => {
            let mut env = Vec::with_capacity(map.len());
            for (key, value) in map {
                let Value::String(value) = value else {
                    return Err(RuntimeError::InvalidConfig(format!(
                        "env.{} must be a string, got {}",
                        key,
                        json_kind(value)
                    )));
                };
                env.push(format!("{}={}", key, value));
            }
            env
        }
        Some(other) => {
            return Err(RuntimeError::InvalidConfig(format!(
                "env must be an object, got {}",
                json_kind(other)
            )))
        }
    };

    let ports = match obj.get("ports") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(entries)) => {
            let mut ports = Vec::with_capacity(entries.len());
            for entry in entries {
                ports.push(parse_port(entry)?);
            }
            ports
        }
        Some(other) => {
            return Err(RuntimeError::InvalidConfig(format!(
                "ports must be an array, got {}",
                json_kind(other)
            )))
        }
    };

    let volumes = match obj.get("volumes") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(entries)) => {
            let mut volumes = Vec::with_capacity(entries.len());
            for entry in entries {
                volumes.push(parse_volume(entry)?);
            }
            volumes
        }
        Some(other) => {
            return Err(RuntimeError::InvalidConfig(format!(
                "volumes must be an array, got {}",
                json_kind(other)
            )))
        }
    };

    let labels = match obj.get("labels") {
        None | Some(Value::Null) => HashMap::new(),
        Some(Value::Object(map)) => {
            let mut labels = HashMap::with_capacity(map.len());
            for (key, value) in map {
                let Value::String(value) = value else {
                    return Err(RuntimeError::InvalidConfig(format!(
                        "labels.{} must be a string, got {}",
                        key,
                        json_kind(value)
                    )));
                };
                labels.insert(key.clone(), value.clone());
            }
            labels
        }
        Some(other) => {
            return Err(RuntimeError::InvalidConfig(format!(
                "labels must be an object, got {}",
                json_kind(other)
            )))
        }
    };

    let restart_policy = match obj.get("restart_policy") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => {
            return Err(RuntimeError::InvalidConfig(format!(
                "restart_policy must be a string, got {}",
                json_kind(other)
            )))
        }
    };

    let healthcheck = match obj.get("healthcheck") {
        None | Some(Value::Null) => None,
        Some(value) => Some(parse_healthcheck(value)?),
    };

    let command = match obj.get("command") {
        None | Some(Value::Null) => None,
        Some(Value::Array(entries)) => {
            let mut command = Vec::with_capacity(entries.len());
            for entry in entries {
                let Value::String(part) = entry else {
                    return Err(RuntimeError::InvalidConfig(format!(
                        "command entries must be strings, got {}",
                        json_kind(entry)
                    )));
                };
                command.push(part.clone());
            }
            Some(command)
        }
        Some(other) => {
            return Err(RuntimeError::InvalidConfig(format!(
                "command must be an array, got {}",
                json_kind(other)
            )))
        }
    };

    Ok(ContainerSpec {
        name: name.to_string(),
        image: image.to_string(),
        env,
        ports,
        volumes,
        labels,
        restart_policy,
        healthcheck,
        command,
    })
}

fn parse_port(value: &Value) -> RuntimeResult<PortMapping> {
    let Value::Object(map) = value else {
        return Err(RuntimeError::InvalidConfig(format!(
            "port entries must be objects, got {}",
            json_kind(value)
        )));
    };

    let container_port = required_port(map.get("container"), "ports[].container")?;
    let host_port = required_port(map.get("host"), "ports[].host")?;
    let protocol = match map.get("protocol") {
        None | Some(Value::Null) => "tcp".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => {
            return Err(RuntimeError::InvalidConfig(format!(
                "ports[].protocol must be a string, got {}",
                json_kind(other)
            )))
        }
    };

    Ok(PortMapping {
        container_port,
        host_port,
        protocol,
    })
}

fn required_port(value: Option<&Value>, key: &str) -> RuntimeResult<u16> {
    let Some(Value::Number(n)) = value else {
        return Err(RuntimeError::InvalidConfig(format!(
            "{} must be a number",
            key
        )));
    };
    n.as_u64()
        .filter(|v| *v > 0 && *v <= u16::MAX as u64)
        .map(|v| v as u16)
        .ok_or_else(|| RuntimeError::InvalidConfig(format!("{} out of range", key)))
}

fn parse_volume(value: &Value) -> RuntimeResult<VolumeMount> {
    let Value::Object(map) = value else {
        return Err(RuntimeError::InvalidConfig(format!(
            "volume entries must be objects, got {}",
            json_kind(value)
        )));
    };

    let source = match map.get("source") {
        Some(Value::String(s)) => s.clone(),
        _ => {
            return Err(RuntimeError::InvalidConfig(
                "volumes[].source must be a string".into(),
            ))
        }
    };
    let target = match map.get("target") {
        Some(Value::String(s)) => s.clone(),
        _ => {
            return Err(RuntimeError::InvalidConfig(
                "volumes[].target must be a string".into(),
            ))
        }
    };
    let read_only = match map.get("read_only") {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(other) => {
            return Err(RuntimeError::InvalidConfig(format!(
                "volumes[].read_only must be a bool, got {}",
                json_kind(other)
            )))
        }
    };

    Ok(VolumeMount {
        source,
        target,
        read_only,
    })
}

fn parse_healthcheck(value: &Value) -> RuntimeResult<HealthcheckSpec> {
    let Value::Object(map) = value else {
        return Err(RuntimeError::InvalidConfig(format!(
            "healthcheck must be an object, got {}",
            json_kind(value)
        )));
    };

    let test = match map.get("test") {
        Some(Value::Array(entries)) => {
            let mut test = Vec::with_capacity(entries.len());
            for entry in entries {
                let Value::String(part) = entry else {
                    return Err(RuntimeError::InvalidConfig(
                        "healthcheck.test entries must be strings".into(),
                    ));
                };
                test.push(part.clone());
            }
            test
        }
        _ => {
            return Err(RuntimeError::InvalidConfig(
                "healthcheck.test must be an array of strings".into(),
            ))
        }
    };

    Ok(HealthcheckSpec {
        test,
        interval_seconds: optional_u64(map.get("interval_seconds"), "healthcheck.interval_seconds")?
            .unwrap_or(30),
        timeout_seconds: optional_u64(map.get("timeout_seconds"), "healthcheck.timeout_seconds")?
            .unwrap_or(5),
        retries: optional_u64(map.get("retries"), "healthcheck.retries")?.unwrap_or(3),
    })
}

fn optional_u64(value: Option<&Value>, key: &str) -> RuntimeResult<Option<u64>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| RuntimeError::InvalidConfig(format!("{} out of range", key))),
        Some(other) => Err(RuntimeError::InvalidConfig(format!(
            "{} must be a number, got {}",
            key,
            json_kind(other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn full_config_parses() {
        let config = json!({
            "env": {"LISTEN": "0.0.0.0"},
            "ports": [{"container": 80, "host": 8080}],
            "volumes": [{"source": "/srv/web", "target": "/data", "read_only": true}],
            "labels": {"app": "web"},
            "restart_policy": "unless-stopped",
            "healthcheck": {"test": ["CMD-SHELL", "curl -f http://localhost/"], "retries": 5},
            "command": ["nginx", "-g", "daemon off;"]
        });

        let spec = spec_from_config("web", "nginx:1.25", &config).unwrap();
        assert_eq!(spec.env, vec!["LISTEN=0.0.0.0"]);
        assert_eq!(spec.ports[0].host_port, 8080);
        assert_eq!(spec.ports[0].protocol, "tcp");
        assert!(spec.volumes[0].read_only);
        assert_eq!(spec.healthcheck.as_ref().unwrap().retries, 5);
        assert_eq!(spec.healthcheck.as_ref().unwrap().interval_seconds, 30);
        assert_eq!(spec.command.as_ref().unwrap().len(), 3);
    }

    #[test]
    fn wrong_types_are_refused_not_coerced() {
        let config = json!({"env": {"PORT": 8080}});
        assert!(spec_from_config("web", "nginx", &config).is_err());

        let config = json!({"ports": [{"container": "80", "host": 8080}]});
        assert!(spec_from_config("web", "nginx", &config).is_err());

        let config = json!({"restart_policy": true});
        assert!(spec_from_config("web", "nginx", &config).is_err());
    }

    #[test]
    fn null_config_is_an_empty_spec() {
        let spec = spec_from_config("web", "nginx", &serde_json::Value::Null).unwrap();
        assert!(spec.env.is_empty());
        assert!(spec.healthcheck.is_none());
    }
}
