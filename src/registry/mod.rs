//! Registry clients
//!
//! Wire-level access to Docker-Hub-style and Harbor-style v2 registries,
//! normalised into [`ArtifactDescriptor`] values.

mod dockerhub;
mod errors;
mod harbor;
mod reference;
mod types;
mod version;

pub use dockerhub::DockerHubClient;
pub use errors::{RegistryError, RegistryResult};
pub use harbor::HarborClient;
pub use reference::{ImageRef, DEFAULT_NAMESPACE, DEFAULT_REGISTRY, DEFAULT_TAG};
pub use types::{
    ArtifactDescriptor, ListOptions, Manifest, ManifestLayer, RegistryInfo, RepositoryInfo,
    SearchOptions, SecurityScanSummary, TagInfo, UpdateCheckResult, UpdateType,
};
pub use version::classify_update;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};

/// Default per-call timeout for registry HTTP operations
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Manifest media type requested from v2 registries
pub const MANIFEST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// Credentials attached to outbound registry requests
#[derive(Debug, Clone, Default)]
pub enum RegistryAuth {
    /// No credentials; anonymous request
    #[default]
    Anonymous,
    Basic {
        username: String,
        password: String,
    },
    Bearer {
        token: String,
    },
}

impl RegistryAuth {
    /// Apply the credentials to a request builder
    pub fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        match self {
            RegistryAuth::Anonymous => request,
            RegistryAuth::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
            RegistryAuth::Bearer { token } => request.bearer_auth(token),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, RegistryAuth::Anonymous)
    }
}

/// Common interface over registry flavors
///
/// Every operation runs under the client's configured per-call timeout
/// (30 s unless overridden at construction).
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Registry base this client talks to
    fn registry_url(&self) -> &str;

    /// Verify the registry is reachable with the configured credentials
    async fn test_connection(&self) -> RegistryResult<()>;

    /// Describe the registry endpoint
    async fn get_registry_info(&self) -> RegistryResult<RegistryInfo>;

    /// Compare a running digest against the newest artifact for the ref
    async fn check_image_update(
        &self,
        image: &ImageRef,
        current_digest: Option<&str>,
    ) -> RegistryResult<UpdateCheckResult>;

    /// Resolve the newest artifact for the ref into a descriptor
    async fn get_latest_image_info(&self, image: &ImageRef) -> RegistryResult<ArtifactDescriptor>;

    /// List tags of a repository
    async fn get_image_tags(
        &self,
        image: &ImageRef,
        options: &ListOptions,
    ) -> RegistryResult<Vec<TagInfo>>;

    /// Fetch a manifest; the digest comes from `Docker-Content-Digest`
    async fn get_image_manifest(&self, image: &ImageRef, tag: &str) -> RegistryResult<Manifest>;

    /// Search repositories by name
    async fn search_repositories(
        &self,
        options: &SearchOptions,
    ) -> RegistryResult<Vec<RepositoryInfo>>;

    /// Fetch repository metadata
    async fn get_repository_info(&self, image: &ImageRef) -> RegistryResult<RepositoryInfo>;

    /// Fetch the vulnerability scan summary, when the registry has one
    async fn get_security_scan(
        &self,
        image: &ImageRef,
        tag: &str,
    ) -> RegistryResult<Option<SecurityScanSummary>>;

    /// Release client resources; connection pools drain on drop, so the
    /// default is a no-op
    fn close(&self) {}
}

/// Map a non-success response onto the error taxonomy
///
/// `subject` names the resource for not-found messages. 404 on a repository
/// endpoint maps to `ImageNotFound`; manifest fetches override this to
/// `TagNotFound` at the call site.
pub(crate) async fn ensure_success(
    response: Response,
    subject: &str,
) -> RegistryResult<Response> {
    let status = response.status();

    if status.is_success() {
        return Ok(response);
    }

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(RegistryError::Unauthorized(subject.to_string()));
    }

    if status == StatusCode::NOT_FOUND {
        return Err(RegistryError::ImageNotFound(subject.to_string()));
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok());
        return Err(RegistryError::RateLimited { retry_after });
    }

    let message = response.text().await.unwrap_or_default();

    if status.is_server_error() {
        return Err(RegistryError::Server {
            status: status.as_u16(),
            message,
        });
    }

    Err(RegistryError::InvalidResponse(format!(
        "unexpected status {} for {}: {}",
        status, subject, message
    )))
}

/// Build the shared HTTP client with registry timeouts applied
pub(crate) fn build_http_client(timeout: Duration) -> RegistryResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .pool_max_idle_per_host(10)
        .build()
        .map_err(|e| RegistryError::ConnectionFailed(e.to_string()))
}

/// Normalise a registry id into a validated https base URL
pub(crate) fn registry_base_url(registry: &str) -> RegistryResult<String> {
    let candidate = if registry.starts_with("http://") || registry.starts_with("https://") {
        registry.trim_end_matches('/').to_string()
    } else {
        format!("https://{}", registry.trim_end_matches('/'))
    };

    let parsed = url::Url::parse(&candidate)
        .map_err(|e| RegistryError::InvalidReference(format!("{}: {}", registry, e)))?;
    if parsed.host_str().is_none() {
        return Err(RegistryError::InvalidReference(format!(
            "{}: missing host",
            registry
        )));
    }

    Ok(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_urls_are_normalised_and_validated() {
        assert_eq!(
            registry_base_url("harbor.example.com").unwrap(),
            "https://harbor.example.com"
        );
        assert_eq!(
            registry_base_url("http://registry.local:5000/").unwrap(),
            "http://registry.local:5000"
        );
        assert!(registry_base_url("http://").is_err());
    }
}
