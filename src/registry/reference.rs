//! Image reference parsing and formatting
//!
//! Grammar: `[registry/][namespace/]repository[:tag]`. A first slash-segment
//! containing `.` or `:` is a registry hostname; otherwise it is a
//! namespace. Harbor-style `host/project/repo` three-segment forms parse the
//! same way.

use serde::{Deserialize, Serialize};

use super::errors::{RegistryError, RegistryResult};

pub const DEFAULT_REGISTRY: &str = "docker.io";
pub const DEFAULT_NAMESPACE: &str = "library";
pub const DEFAULT_TAG: &str = "latest";

/// A fully resolved image reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub registry: String,
    pub namespace: String,
    pub repository: String,
    pub tag: String,
}

impl ImageRef {
    /// Parse an image reference string, filling in defaults
    pub fn parse(s: &str) -> RegistryResult<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(RegistryError::InvalidReference("empty reference".into()));
        }

        // Split the tag off the last path segment only; a ':' before the
        // last '/' belongs to a registry port.
        let (path, tag) = match s.rfind(':') {
            Some(idx) if idx > s.rfind('/').unwrap_or(0) => {
                (&s[..idx], s[idx + 1..].to_string())
            }
            _ => (s, DEFAULT_TAG.to_string()),
        };

        if tag.is_empty() {
            return Err(RegistryError::InvalidReference(format!(
                "empty tag in reference: {}",
                s
            )));
        }

        let segments: Vec<&str> = path.split('/').collect();
        if segments.iter().any(|seg| seg.is_empty()) {
            return Err(RegistryError::InvalidReference(format!(
                "empty path segment in reference: {}",
                s
            )));
        }

        let (registry, namespace, repository) = match segments.len() {
            1 => (
                DEFAULT_REGISTRY.to_string(),
                DEFAULT_NAMESPACE.to_string(),
                segments[0].to_string(),
            ),
            _ => {
                let first = segments[0];
                if is_registry_host(first) {
                    let rest = &segments[1..];
                    match rest.len() {
                        1 => (
                            first.to_string(),
                            DEFAULT_NAMESPACE.to_string(),
                            rest[0].to_string(),
                        ),
                        _ => (
                            first.to_string(),
                            rest[0].to_string(),
                            rest[1..].join("/"),
                        ),
                    }
                } else {
                    (
                        DEFAULT_REGISTRY.to_string(),
                        first.to_string(),
                        segments[1..].join("/"),
                    )
                }
            }
        };

        Ok(ImageRef {
            registry,
            namespace,
            repository,
            tag,
        })
    }

    /// Build the canonical string form, omitting default registry,
    /// default namespace and default tag
    pub fn build(&self) -> String {
        let mut out = String::new();
        if self.registry != DEFAULT_REGISTRY {
            out.push_str(&self.registry);
            out.push('/');
        }
        if self.namespace != DEFAULT_NAMESPACE {
            out.push_str(&self.namespace);
            out.push('/');
        }
        out.push_str(&self.repository);
        if self.tag != DEFAULT_TAG {
            out.push(':');
            out.push_str(&self.tag);
        }
        out
    }

    /// Repository path as the registry sees it (`namespace/repository`)
    pub fn repo_path(&self) -> String {
        format!("{}/{}", self.namespace, self.repository)
    }

    /// Reference with an explicit tag, suitable for a runtime pull
    pub fn with_tag(&self, tag: &str) -> ImageRef {
        ImageRef {
            tag: tag.to_string(),
            ..self.clone()
        }
    }

    /// Full pullable reference string including registry and tag
    pub fn pull_reference(&self) -> String {
        if self.registry == DEFAULT_REGISTRY && self.namespace == DEFAULT_NAMESPACE {
            format!("{}:{}", self.repository, self.tag)
        } else if self.registry == DEFAULT_REGISTRY {
            format!("{}/{}:{}", self.namespace, self.repository, self.tag)
        } else {
            format!(
                "{}/{}/{}:{}",
                self.registry, self.namespace, self.repository, self.tag
            )
        }
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.build())
    }
}

fn is_registry_host(segment: &str) -> bool {
    segment.contains('.') || segment.contains(':') || segment == "localhost"
}
