//! Wire-level and normalised registry types

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Immutable view of a registry artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    /// Repository path (`namespace/repository`)
    pub image_name: String,
    pub tag: String,

    /// Content-addressable manifest digest (mandatory)
    pub digest: String,

    pub size_bytes: Option<u64>,
    pub published_at: Option<DateTime<Utc>>,
    pub architecture: Option<String>,
    pub os: Option<String>,

    pub registry_url: String,

    /// Registry-specific extras
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// A repository tag as listed by the registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagInfo {
    pub name: String,
    pub digest: Option<String>,
    pub size_bytes: Option<u64>,
    pub last_updated: Option<DateTime<Utc>>,
}

/// One manifest config/layer entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestLayer {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub size: u64,
    pub digest: String,
}

/// An image manifest (pragmatic OCI distribution v2 subset)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType", default)]
    pub media_type: Option<String>,
    pub config: ManifestLayer,
    #[serde(default)]
    pub layers: Vec<ManifestLayer>,

    /// Digest from the `Docker-Content-Digest` response header
    #[serde(skip)]
    pub digest: String,
}

impl Manifest {
    /// Config size plus the sum of all layer sizes
    pub fn total_size(&self) -> u64 {
        self.config.size + self.layers.iter().map(|l| l.size).sum::<u64>()
    }
}

/// Semantic class of an available update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateType {
    Major,
    Minor,
    Patch,
    None,
    Unknown,
}

impl std::fmt::Display for UpdateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UpdateType::Major => "major",
            UpdateType::Minor => "minor",
            UpdateType::Patch => "patch",
            UpdateType::None => "none",
            UpdateType::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// Result of comparing a running image against the registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateCheckResult {
    pub repository: String,

    pub current_tag: String,
    pub current_digest: Option<String>,

    pub latest_tag: String,
    pub latest_digest: String,

    /// True iff the digests differ
    pub update_available: bool,
    pub update_type: UpdateType,

    /// Tags that were considered during the check
    pub compared_tags: Vec<String>,

    pub security_issues: Option<SecurityScanSummary>,

    pub last_checked: DateTime<Utc>,
}

/// Aggregated vulnerability scan outcome for one artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityScanSummary {
    /// Worst severity present (registry's own vocabulary)
    pub severity: String,
    pub total: u64,
    pub fixable: u64,
    /// Count per severity name
    #[serde(default)]
    pub summary: HashMap<String, u64>,
}

/// Basic facts about a repository
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryInfo {
    pub name: String,
    pub namespace: Option<String>,
    pub description: Option<String>,
    pub star_count: Option<u64>,
    pub pull_count: Option<u64>,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Facts about the registry endpoint itself
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryInfo {
    pub url: String,
    pub flavor: String,
    pub version: Option<String>,
}

/// Paging and ordering for tag listings
#[derive(Debug, Clone)]
pub struct ListOptions {
    pub page: u32,
    pub page_size: u32,
    /// Field to order by (registry vocabulary, e.g. `last_updated`)
    pub sort: Option<String>,
    pub descending: bool,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: 25,
            sort: None,
            descending: true,
        }
    }
}

/// Query options for repository search
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub query: String,
    pub limit: u32,
}

impl SearchOptions {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            limit: 25,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_size_sums_config_and_layers() {
        let manifest = Manifest {
            schema_version: 2,
            media_type: Some("application/vnd.docker.distribution.manifest.v2+json".into()),
            config: ManifestLayer {
                media_type: "application/vnd.docker.container.image.v1+json".into(),
                size: 100,
                digest: "sha256:cfg".into(),
            },
            layers: vec![
                ManifestLayer {
                    media_type: "application/vnd.docker.image.rootfs.diff.tar.gzip".into(),
                    size: 1000,
                    digest: "sha256:l1".into(),
                },
                ManifestLayer {
                    media_type: "application/vnd.docker.image.rootfs.diff.tar.gzip".into(),
                    size: 2000,
                    digest: "sha256:l2".into(),
                },
            ],
            digest: "sha256:abc".into(),
        };
        assert_eq!(manifest.total_size(), 3100);
    }
}
