//! Docker-Hub-flavor registry client
//!
//! Tag listings come from the hub-style index API
//! (`/v2/repositories/{ns}/{repo}/tags`); manifests come from the registry
//! host itself with the digest read verbatim from `Docker-Content-Digest`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use super::errors::{RegistryError, RegistryResult};
use super::reference::{ImageRef, DEFAULT_REGISTRY, DEFAULT_TAG};
use super::types::{
    ArtifactDescriptor, ListOptions, Manifest, RegistryInfo, RepositoryInfo, SearchOptions,
    SecurityScanSummary, TagInfo, UpdateCheckResult, UpdateType,
};
use super::version::classify_update;
use super::{
    build_http_client, ensure_success, registry_base_url, RegistryAuth, RegistryClient,
    MANIFEST_MEDIA_TYPE,
};

/// Index API host used for the public Docker Hub
const DOCKER_HUB_API: &str = "https://hub.docker.com";

/// Registry host serving manifests for the public Docker Hub
const DOCKER_HUB_REGISTRY: &str = "https://registry-1.docker.io";

/// Client for Docker-Hub-style registries
pub struct DockerHubClient {
    http: reqwest::Client,
    /// Identifier as it appears in image references (e.g. `docker.io`)
    registry: String,
    /// Base URL for the repositories index API
    api_base: String,
    /// Base URL for the `/v2/` manifest endpoints
    registry_base: String,
    auth: RegistryAuth,
}

impl DockerHubClient {
    pub fn new(registry: &str, auth: RegistryAuth, timeout: Duration) -> RegistryResult<Self> {
        let http = build_http_client(timeout)?;

        let (api_base, registry_base) = if registry == DEFAULT_REGISTRY {
            (DOCKER_HUB_API.to_string(), DOCKER_HUB_REGISTRY.to_string())
        } else {
            let base = registry_base_url(registry)?;
            (base.clone(), base)
        };

        Ok(Self {
            http,
            registry: registry.to_string(),
            api_base,
            registry_base,
            auth,
        })
    }

    fn tags_url(&self, image: &ImageRef) -> String {
        format!(
            "{}/v2/repositories/{}/{}/tags",
            self.api_base, image.namespace, image.repository
        )
    }

    async fn fetch_tags(
        &self,
        image: &ImageRef,
        options: &ListOptions,
    ) -> RegistryResult<Vec<TagInfo>> {
        let ordering = options.sort.as_deref().map(|field| {
            if options.descending {
                format!("-{}", field)
            } else {
                field.to_string()
            }
        });

        let mut request = self
            .http
            .get(self.tags_url(image))
            .query(&[
                ("page", options.page.to_string()),
                ("page_size", options.page_size.to_string()),
            ]);
        if let Some(ordering) = ordering {
            request = request.query(&[("ordering", ordering)]);
        }

        let response = self.auth.apply(request).send().await?;
        let response = ensure_success(response, &image.repo_path()).await?;
        let body: HubTagsResponse = response.json().await?;

        Ok(body
            .results
            .into_iter()
            .map(|tag| {
                let digest = tag
                    .digest
                    .or_else(|| tag.images.iter().find_map(|i| i.digest.clone()));
                TagInfo {
                    name: tag.name,
                    digest,
                    size_bytes: tag.full_size,
                    last_updated: tag.last_updated,
                }
            })
            .collect())
    }
}

#[async_trait]
impl RegistryClient for DockerHubClient {
    fn registry_url(&self) -> &str {
        &self.registry
    }

    async fn test_connection(&self) -> RegistryResult<()> {
        let request = self.http.get(format!("{}/v2/", self.registry_base));
        let response = self.auth.apply(request).send().await?;
        let status = response.status();

        // Anonymous pings commonly answer 401; that still proves the
        // endpoint speaks the v2 protocol.
        if status.is_success() || (status.as_u16() == 401 && self.auth.is_anonymous()) {
            Ok(())
        } else {
            ensure_success(response, "registry").await.map(|_| ())
        }
    }

    async fn get_registry_info(&self) -> RegistryResult<RegistryInfo> {
        self.test_connection().await?;
        Ok(RegistryInfo {
            url: self.registry.clone(),
            flavor: "dockerhub".to_string(),
            version: Some("v2".to_string()),
        })
    }

    async fn check_image_update(
        &self,
        image: &ImageRef,
        current_digest: Option<&str>,
    ) -> RegistryResult<UpdateCheckResult> {
        let latest = self.get_latest_image_info(image).await?;

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
            security_issues: None,
            last_checked: Utc::now(),
        })
    }

    async fn get_latest_image_info(&self, image: &ImageRef) -> RegistryResult<ArtifactDescriptor> {
        // A floating tag is resolved to the most recently pushed one.
        let tag = if image.tag.is_empty() || image.tag == DEFAULT_TAG {
            let options = ListOptions {
                page: 1,
                page_size: 1,
                sort: Some("last_updated".to_string()),
                descending: true,
            };
            let tags = self.fetch_tags(image, &options).await?;
            tags.first()
                .map(|t| t.name.clone())
                .ok_or_else(|| RegistryError::TagNotFound(image.repo_path()))?
        } else {
            image.tag.clone()
        };

        let manifest = self.get_image_manifest(image, &tag).await?;

        let mut metadata = HashMap::new();
        if let Some(media_type) = &manifest.media_type {
            metadata.insert(
                "media_type".to_string(),
                serde_json::Value::String(media_type.clone()),
            );
        }

        Ok(ArtifactDescriptor {
            image_name: image.repo_path(),
            tag,
            digest: manifest.digest.clone(),
            size_bytes: Some(manifest.total_size()),
            published_at: None,
            architecture: None,
            os: None,
            registry_url: self.registry.clone(),
            metadata,
        })
    }

    async fn get_image_tags(
        &self,
        image: &ImageRef,
        options: &ListOptions,
    ) -> RegistryResult<Vec<TagInfo>> {
        self.fetch_tags(image, options).await
    }

    async fn get_image_manifest(&self, image: &ImageRef, tag: &str) -> RegistryResult<Manifest> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.registry_base,
            image.repo_path(),
            tag
        );

        let request = self.http.get(&url).header("Accept", MANIFEST_MEDIA_TYPE);
        let response = self.auth.apply(request).send().await?;

        let response = match ensure_success(response, &image.repo_path()).await {
            Ok(r) => r,
            // 404 on a manifest means the repository exists but the tag
            // does not.
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
        let url = format!("{}/v2/search/repositories", self.api_base);
        let request = self.http.get(&url).query(&[
            ("query", options.query.clone()),
            ("page_size", options.limit.to_string()),
        ]);

        let response = self.auth.apply(request).send().await?;
        let response = ensure_success(response, &options.query).await?;
        let body: HubSearchResponse = response.json().await?;

        Ok(body
            .results
            .into_iter()
            .map(|r| RepositoryInfo {
                name: r.repo_name,
                namespace: None,
                description: r.short_description,
                star_count: r.star_count,
                pull_count: r.pull_count,
                last_updated: None,
            })
            .collect())
    }

    async fn get_repository_info(&self, image: &ImageRef) -> RegistryResult<RepositoryInfo> {
        let url = format!(
            "{}/v2/repositories/{}/{}",
            self.api_base, image.namespace, image.repository
        );
        let request = self.http.get(&url);
        let response = self.auth.apply(request).send().await?;
        let response = ensure_success(response, &image.repo_path()).await?;
        let body: HubRepository = response.json().await?;

        Ok(RepositoryInfo {
            name: body.name,
            namespace: body.namespace,
            description: body.description,
            star_count: body.star_count,
            pull_count: body.pull_count,
            last_updated: body.last_updated,
        })
    }

    async fn get_security_scan(
        &self,
        _image: &ImageRef,
        _tag: &str,
    ) -> RegistryResult<Option<SecurityScanSummary>> {
        // The hub index API does not expose scan results in the v2 subset.
        Ok(None)
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct HubTagsResponse {
    #[serde(default)]
    results: Vec<HubTag>,
}

#[derive(Debug, Deserialize)]
struct HubTag {
    name: String,
    #[serde(default)]
    digest: Option<String>,
    #[serde(default)]
    full_size: Option<u64>,
    #[serde(default)]
    last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    images: Vec<HubTagImage>,
}

#[derive(Debug, Deserialize)]
struct HubTagImage {
    #[serde(default)]
    digest: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HubSearchResponse {
    #[serde(default)]
    results: Vec<HubSearchResult>,
}

#[derive(Debug, Deserialize)]
struct HubSearchResult {
    repo_name: String,
    #[serde(default)]
    short_description: Option<String>,
    #[serde(default)]
    star_count: Option<u64>,
    #[serde(default)]
    pull_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct HubRepository {
    name: String,
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    star_count: Option<u64>,
    #[serde(default)]
    pull_count: Option<u64>,
    #[serde(default)]
    last_updated: Option<DateTime<Utc>>,
}
