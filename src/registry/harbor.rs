//! Harbor-flavor registry client
//!
//! Harbor references are `host/project/repo[:tag]`; artifact listings come
//! from the Harbor API v2.0, manifests from the plain `/v2/` endpoints on
//! the same host.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use super::errors::{RegistryError, RegistryResult};
use super::reference::{ImageRef, DEFAULT_TAG};
use super::types::{
    ArtifactDescriptor, ListOptions, Manifest, RegistryInfo, RepositoryInfo, SearchOptions,
    SecurityScanSummary, TagInfo, UpdateCheckResult, UpdateType,
};
use super::version::classify_update;
use super::{
    build_http_client, ensure_success, registry_base_url, RegistryAuth, RegistryClient,
    MANIFEST_MEDIA_TYPE,
};

/// Harbor API version prefix
const API_VERSION: &str = "v2.0";

/// Client for Harbor-style registries
pub struct HarborClient {
    http: reqwest::Client,
    registry: String,
    base: String,
    auth: RegistryAuth,
}

impl HarborClient {
    pub fn new(registry: &str, auth: RegistryAuth, timeout: Duration) -> RegistryResult<Self> {
        Ok(Self {
            http: build_http_client(timeout)?,
            registry: registry.to_string(),
            base: registry_base_url(registry)?,
            auth,
        })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/api/{}/{}", self.base, API_VERSION, path)
    }

    /// Repository segment with embedded slashes percent-encoded, as the
    /// Harbor API requires
    fn encoded_repo(image: &ImageRef) -> String {
        image.repository.replace('/', "%2F")
    }

    async fn fetch_artifacts(
        &self,
        image: &ImageRef,
        options: &ListOptions,
    ) -> RegistryResult<Vec<HarborArtifact>> {
        let sort = options.sort.as_deref().unwrap_or("push_time");
        let sort = if options.descending {
            format!("-{}", sort)
        } else {
            sort.to_string()
        };

        let url = self.api_url(&format!(
            "projects/{}/repositories/{}/artifacts",
            image.namespace,
            Self::encoded_repo(image)
        ));
        let request = self.http.get(&url).query(&[
            ("page", options.page.to_string()),
            ("page_size", options.page_size.to_string()),
            ("sort", sort),
            ("with_tag", "true".to_string()),
        ]);

        let response = self.auth.apply(request).send().await?;
        let response = ensure_success(response, &image.repo_path()).await?;
        Ok(response.json().await?)
    }

    /// Find the artifact carrying the given tag
    async fn find_artifact(
        &self,
        image: &ImageRef,
        tag: &str,
    ) -> RegistryResult<HarborArtifact> {
        let url = self.api_url(&format!(
            "projects/{}/repositories/{}/artifacts/{}",
            image.namespace,
            Self::encoded_repo(image),
            tag
        ));
        let request = self
            .http
            .get(&url)
            .query(&[("with_tag", "true"), ("with_scan_overview", "true")]);

        let response = self.auth.apply(request).send().await?;
        match ensure_success(response, &image.repo_path()).await {
            Ok(r) => Ok(r.json().await?),
            Err(RegistryError::ImageNotFound(_)) => Err(RegistryError::TagNotFound(format!(
                "{}:{}",
                image.repo_path(),
                tag
            ))),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl RegistryClient for HarborClient {
    fn registry_url(&self) -> &str {
        &self.registry
    }

    async fn test_connection(&self) -> RegistryResult<()> {
        let request = self.http.get(self.api_url("health"));
        let response = self.auth.apply(request).send().await?;
        let response = ensure_success(response, "registry").await?;
        let health: HarborHealth = response.json().await?;

        if health.status == "healthy" {
            Ok(())
        } else {
            Err(RegistryError::ConnectionFailed(format!(
                "harbor reports status {}",
                health.status
            )))
        }
    }

    async fn get_registry_info(&self) -> RegistryResult<RegistryInfo> {
        let request = self.http.get(self.api_url("systeminfo"));
        let response = self.auth.apply(request).send().await?;
        let response = ensure_success(response, "registry").await?;
        let info: HarborSystemInfo = response.json().await?;

        Ok(RegistryInfo {
            url: self.registry.clone(),
            flavor: "harbor".to_string(),
            version: info.harbor_version,
        })
    }

    async fn check_image_update(
        &self,
        image: &ImageRef,
        current_digest: Option<&str>,
    ) -> RegistryResult<UpdateCheckResult> {
        let latest = self.get_latest_image_info(image).await?;
        let security_issues = self.get_security_scan(image, &latest.tag).await.ok().flatten();

        let update_available = match current_digest {
            Some(current) => current != latest.digest,
            None => true,
        };
        let update_type = if update_available {
            classify_update(&image.tag, &latest.tag)
        } else {
            UpdateType::None
        };

        debug!(
            "Checked {} against {}: available={} type={}",
            image,
            self.registry,
            update_available,
            update_type
        );

        Ok(UpdateCheckResult {
            repository: image.repo_path(),
            current_tag: image.tag.clone(),
            current_digest: current_digest.map(str::to_string),
            latest_tag: latest.tag.clone(),
            latest_digest: latest.digest.clone(),
            update_available,
            update_type,
            compared_tags: vec![image.tag.clone(), latest.tag.clone()],
            security_issues,
            last_checked: Utc::now(),
        })
    }

    async fn get_latest_image_info(&self, image: &ImageRef) -> RegistryResult<ArtifactDescriptor> {
        let artifact = if image.tag.is_empty() || image.tag == DEFAULT_TAG {
            let options = ListOptions {
                page: 1,
                page_size: 1,
                sort: Some("push_time".to_string()),
                descending: true,
            };
            self.fetch_artifacts(image, &options)
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| RegistryError::TagNotFound(image.repo_path()))?
        } else {
            self.find_artifact(image, &image.tag).await?
        };

        let tag = artifact
            .tags
            .as_ref()
            .and_then(|tags| tags.first())
            .map(|t| t.name.clone())
            .unwrap_or_else(|| image.tag.clone());

        let mut metadata = HashMap::new();
        if let Some(extra) = artifact.extra_attrs.clone() {
            metadata.insert("extra_attrs".to_string(), extra);
        }

        Ok(ArtifactDescriptor {
            image_name: image.repo_path(),
            tag,
            digest: artifact.digest.clone(),
            size_bytes: artifact.size,
            published_at: artifact.push_time,
            architecture: artifact
                .extra_attrs
                .as_ref()
                .and_then(|v| v.get("architecture"))
                .and_then(|v| v.as_str())
                .map(str::to_string),
            os: artifact
                .extra_attrs
                .as_ref()
                .and_then(|v| v.get("os"))
                .and_then(|v| v.as_str())
                .map(str::to_string),
            registry_url: self.registry.clone(),
            metadata,
        })
    }

    async fn get_image_tags(
        &self,
        image: &ImageRef,
        options: &ListOptions,
    ) -> RegistryResult<Vec<TagInfo>> {
        let artifacts = self.fetch_artifacts(image, options).await?;

        let mut tags = Vec::new();
        for artifact in artifacts {
            for tag in artifact.tags.unwrap_or_default() {
                tags.push(TagInfo {
                    name: tag.name,
                    digest: Some(artifact.digest.clone()),
                    size_bytes: artifact.size,
                    last_updated: tag.push_time.or(artifact.push_time),
                });
            }
        }
        Ok(tags)
    }

    async fn get_image_manifest(&self, image: &ImageRef, tag: &str) -> RegistryResult<Manifest> {
        let url = format!("{}/v2/{}/manifests/{}", self.base, image.repo_path(), tag);
        let request = self.http.get(&url).header("Accept", MANIFEST_MEDIA_TYPE);
        let response = self.auth.apply(request).send().await?;

        let response = match ensure_success(response, &image.repo_path()).await {
            Ok(r) => r,
            Err(RegistryError::ImageNotFound(_)) => {
                return Err(RegistryError::TagNotFound(format!(
                    "{}:{}",
                    image.repo_path(),
                    tag
                )))
            }
            Err(e) => return Err(e),
        };

        let digest = response
            .headers()
            .get("Docker-Content-Digest")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                RegistryError::InvalidResponse("missing Docker-Content-Digest header".into())
            })?;

        let mut manifest: Manifest = response.json().await?;
        manifest.digest = digest;
        Ok(manifest)
    }

    async fn search_repositories(
        &self,
        options: &SearchOptions,
    ) -> RegistryResult<Vec<RepositoryInfo>> {
        let request = self
            .http
            .get(self.api_url("search"))
            .query(&[("q", options.query.as_str())]);
        let response = self.auth.apply(request).send().await?;
        let response = ensure_success(response, &options.query).await?;
        let body: HarborSearchResponse = response.json().await?;

        Ok(body
            .repository
            .into_iter()
            .take(options.limit as usize)
            .map(|r| RepositoryInfo {
                name: r.repository_name,
                namespace: r.project_name,
                description: None,
                star_count: None,
                pull_count: r.pull_count,
                last_updated: None,
            })
            .collect())
    }

    async fn get_repository_info(&self, image: &ImageRef) -> RegistryResult<RepositoryInfo> {
        let url = self.api_url(&format!(
            "projects/{}/repositories/{}",
            image.namespace,
            Self::encoded_repo(image)
        ));
        let request = self.http.get(&url);
        let response = self.auth.apply(request).send().await?;
        let response = ensure_success(response, &image.repo_path()).await?;
        let body: HarborRepository = response.json().await?;

        Ok(RepositoryInfo {
            name: body.name,
            namespace: Some(image.namespace.clone()),
            description: body.description,
            star_count: None,
            pull_count: body.pull_count,
            last_updated: body.update_time,
        })
    }

    async fn get_security_scan(
        &self,
        image: &ImageRef,
        tag: &str,
    ) -> RegistryResult<Option<SecurityScanSummary>> {
        let artifact = self.find_artifact(image, tag).await?;

        let Some(overview) = artifact.scan_overview else {
            return Ok(None);
        };

        // scan_overview is keyed by report mime type; take the first entry.
        let Some(report) = overview.as_object().and_then(|m| m.values().next()) else {
            return Ok(None);
        };

        let severity = report
            .get("severity")
            .and_then(|v| v.as_str())
            .unwrap_or("Unknown")
            .to_string();
        let summary_obj = report.get("summary");
        let total = summary_obj
            .and_then(|s| s.get("total"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let fixable = summary_obj
            .and_then(|s| s.get("fixable"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0);

        let mut summary = HashMap::new();
        if let Some(counts) = summary_obj
            .and_then(|s| s.get("summary"))
            .and_then(|v| v.as_object())
        {
            for (name, count) in counts {
                summary.insert(name.clone(), count.as_u64().unwrap_or(0));
            }
        }

        Ok(Some(SecurityScanSummary {
            severity,
            total,
            fixable,
            summary,
        }))
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct HarborArtifact {
    digest: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    push_time: Option<DateTime<Utc>>,
    #[serde(default)]
    extra_attrs: Option<serde_json::Value>,
    #[serde(default)]
    tags: Option<Vec<HarborTag>>,
    #[serde(default)]
    scan_overview: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct HarborTag {
    name: String,
    #[serde(default)]
    push_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct HarborHealth {
    status: String,
}

#[derive(Debug, Deserialize)]
struct HarborSystemInfo {
    #[serde(default)]
    harbor_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HarborSearchResponse {
    #[serde(default)]
    repository: Vec<HarborSearchRepo>,
}

#[derive(Debug, Deserialize)]
struct HarborSearchRepo {
    repository_name: String,
    #[serde(default)]
    project_name: Option<String>,
    #[serde(default)]
    pull_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct HarborRepository {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    pull_count: Option<u64>,
    #[serde(default)]
    update_time: Option<DateTime<Utc>>,
}
