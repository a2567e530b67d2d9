//! Update resolver
//!
//! Facade over the registry clients: reconciles an image reference against
//! its registry, produces the latest-known artifact descriptor, classifies
//! the update and maintains the image version cache.

mod secrets;

pub use secrets::{SealError, SecretSealer};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::database::{Database, DatabaseError};
use crate::registry::{
    classify_update, ArtifactDescriptor, DockerHubClient, HarborClient, ImageRef, RegistryAuth,
    RegistryClient, RegistryError, SecurityScanSummary, UpdateCheckResult, UpdateType,
    DEFAULT_REGISTRY, DEFAULT_TIMEOUT,
};
use crate::types::{AuthType, ImageVersion, RegistryCredentials};

/// Resolver errors
#[derive(Debug, Error)]
pub enum ResolverError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("Credential error: {0}")]
    Credentials(String),
}

pub type ResolverResult<T> = Result<T, ResolverError>;

/// Registry flavor a base URL answers as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flavor {
    DockerHub,
    Harbor,
}

/// Outcome of a resolution: the descriptor plus the comparison
#[derive(Debug, Clone)]
pub struct ResolvedUpdate {
    pub descriptor: ArtifactDescriptor,
    pub check: UpdateCheckResult,
}

/// Facade that picks a client flavor, resolves the newest artifact and
/// keeps the `ImageVersion` cache current
pub struct UpdateResolver {
    db: Arc<Database>,
    sealer: SecretSealer,
    timeout: Duration,
    flavors: RwLock<HashMap<String, Flavor>>,
    #[cfg(test)]
    injected: parking_lot::RwLock<HashMap<String, Arc<dyn RegistryClient>>>,
}

impl UpdateResolver {
    pub fn new(db: Arc<Database>, sealer: SecretSealer) -> Self {
        Self {
            db,
            sealer,
            timeout: DEFAULT_TIMEOUT,
            flavors: RwLock::new(HashMap::new()),
            #[cfg(test)]
            injected: parking_lot::RwLock::new(HashMap::new()),
        }
    }

    /// Substitute a canned client for a registry under test
    #[cfg(test)]
    pub fn inject_client(&self, registry: &str, client: Arc<dyn RegistryClient>) {
        self.injected.write().insert(registry.to_string(), client);
    }

    /// Reconcile an image reference against its registry
    ///
    /// `registry_override`, when set and different from the parsed
    /// registry, wins. `credentials_name` selects a stored credential
    /// record; otherwise the registry's default record (if any) is used.
    pub async fn check_image(
        &self,
        image_ref: &str,
        current_digest: Option<&str>,
        registry_override: Option<&str>,
        credentials_name: Option<&str>,
    ) -> ResolverResult<ResolvedUpdate> {
        let mut image = ImageRef::parse(image_ref)?;
        if let Some(registry) = registry_override {
            if !registry.is_empty() && registry != image.registry {
                debug!(
                    "Registry override {} replaces parsed {}",
                    registry, image.registry
                );
                image.registry = registry.to_string();
            }
        }

        let client = self.client_for(&image.registry, credentials_name).await?;

        let descriptor = match client.get_latest_image_info(&image).await {
            Ok(descriptor) => descriptor,
            Err(e) => {
                // Leave a trace on the cache row for not-found failures so
                // operators can see why checks stopped producing results.
                if matches!(
                    e,
                    RegistryError::ImageNotFound(_) | RegistryError::TagNotFound(_)
                ) {
                    let _ = self
                        .db
                        .set_image_version_error(
                            &image.repo_path(),
                            &image.tag,
                            &image.registry,
                            &e.to_string(),
                        )
                        .await;
                }
                return Err(e.into());
            }
        };

        let update_available = match current_digest {
            Some(current) => current != descriptor.digest,
            None => true,
        };
        let update_type = if update_available {
            classify_update(&image.tag, &descriptor.tag)
        } else {
            UpdateType::None
        };

        let security_issues = if update_available {
            self.security_scan(client.as_ref(), &image, &descriptor.tag)
                .await
        } else {
            None
        };

        let check = UpdateCheckResult {
            repository: image.repo_path(),
            current_tag: image.tag.clone(),
            current_digest: current_digest.map(str::to_string),
            latest_tag: descriptor.tag.clone(),
            latest_digest: descriptor.digest.clone(),
            update_available,
            update_type,
            compared_tags: vec![image.tag.clone(), descriptor.tag.clone()],
            security_issues,
            last_checked: Utc::now(),
        };

        self.db
            .upsert_image_version(&ImageVersion {
                image_name: descriptor.image_name.clone(),
                tag: descriptor.tag.clone(),
                registry_url: descriptor.registry_url.clone(),
                digest: descriptor.digest.clone(),
                size_bytes: descriptor.size_bytes,
                published_at: descriptor.published_at,
                architecture: descriptor.architecture.clone(),
                os: descriptor.os.clone(),
                metadata: serde_json::to_value(&descriptor.metadata)
                    .unwrap_or(serde_json::Value::Null),
                checked_at: check.last_checked,
                is_latest: true,
            })
            .await?;

        Ok(ResolvedUpdate { descriptor, check })
    }

    /// The cached digest last seen for an image, if any
    pub async fn cached_digest(
        &self,
        image: &ImageRef,
    ) -> ResolverResult<Option<ImageVersion>> {
        Ok(self
            .db
            .get_image_version(&image.repo_path(), &image.tag, &image.registry)
            .await?)
    }

    /// Build a client for a registry, honouring stored credentials
    pub async fn client_for(
        &self,
        registry: &str,
        credentials_name: Option<&str>,
    ) -> ResolverResult<Arc<dyn RegistryClient>> {
        #[cfg(test)]
        if let Some(client) = self.injected.read().get(registry) {
            return Ok(client.clone());
        }

        let credentials = match credentials_name {
            Some(name) => self.db.get_credentials(name).await?,
            None => self.db.default_credentials_for(registry).await?,
        };
        let auth = match &credentials {
            Some(record) => self.auth_from(record)?,
            None => RegistryAuth::Anonymous,
        };

        match self.detect_flavor(registry, &auth).await {
            Flavor::Harbor => Ok(Arc::new(HarborClient::new(registry, auth, self.timeout)?)),
            Flavor::DockerHub => Ok(Arc::new(DockerHubClient::new(registry, auth, self.timeout)?)),
        }
    }

    fn auth_from(&self, record: &RegistryCredentials) -> ResolverResult<RegistryAuth> {
        let secret = self
            .sealer
            .open(&record.secret)
            .map_err(|e| ResolverError::Credentials(format!("{}: {}", record.name, e)))?;

        Ok(match record.auth_type {
            AuthType::Basic => {
                let (username, password) = secret.split_once(':').ok_or_else(|| {
                    ResolverError::Credentials(format!(
                        "{}: basic secret must be user:password",
                        record.name
                    ))
                })?;
                RegistryAuth::Basic {
                    username: username.to_string(),
                    password: password.to_string(),
                }
            }
            AuthType::Token | AuthType::Oauth => RegistryAuth::Bearer { token: secret },
        })
    }

    /// Decide which flavor a registry speaks, probing once per registry
    async fn detect_flavor(&self, registry: &str, auth: &RegistryAuth) -> Flavor {
        if registry == DEFAULT_REGISTRY {
            return Flavor::DockerHub;
        }

        if let Some(flavor) = self.flavors.read().await.get(registry) {
            return *flavor;
        }

        // A registry that answers the Harbor health endpoint is Harbor;
        // anything else is treated as Docker-Hub-style.
        let flavor = match HarborClient::new(registry, auth.clone(), Duration::from_secs(5)) {
            Ok(probe) => match probe.test_connection().await {
                Ok(()) => Flavor::Harbor,
                Err(_) => Flavor::DockerHub,
            },
            Err(e) => {
                warn!("Flavor probe for {} failed: {}", registry, e);
                Flavor::DockerHub
            }
        };

        debug!("Registry {} detected as {:?}", registry, flavor);
        self.flavors.write().await.insert(registry.to_string(), flavor);
        flavor
    }

    async fn security_scan(
        &self,
        client: &dyn RegistryClient,
        image: &ImageRef,
        tag: &str,
    ) -> Option<SecurityScanSummary> {
        match client.get_security_scan(image, tag).await {
            Ok(scan) => scan,
            Err(e) => {
                debug!("Security scan lookup failed for {}: {}", image, e);
                None
            }
        }
    }
}
