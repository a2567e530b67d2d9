//! Periodic registry polling for registered containers

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ImageCheckConfig;
use crate::database::Database;
use crate::events::{Event, EventBus, EventType, Severity};
use crate::orchestrator::{Orchestrator, UpdateRequest};
use crate::registry::ImageRef;
use crate::resolver::UpdateResolver;
use crate::types::{ContainerRecord, TaskType, UpdatePolicy, UpdateTrigger};

use super::super::task::{Task, TaskError, TaskParameters};

/// Walks registered containers and reconciles their images against the
/// registries, flagging available updates
pub struct ImageCheckTask {
    db: Arc<Database>,
    resolver: Arc<UpdateResolver>,
    bus: EventBus,
    /// Present when `enqueue_updates` should start updates directly
    orchestrator: Option<Arc<Orchestrator>>,
    config: ImageCheckConfig,
}

impl ImageCheckTask {
    pub fn new(
        db: Arc<Database>,
        resolver: Arc<UpdateResolver>,
        bus: EventBus,
        orchestrator: Option<Arc<Orchestrator>>,
        config: ImageCheckConfig,
    ) -> Self {
        Self {
            db,
            resolver,
            bus,
            orchestrator,
            config,
        }
    }

    /// Check one container; returns whether an update was flagged
    async fn check_one(
        &self,
        ctx: &CancellationToken,
        record: &ContainerRecord,
        enqueue: bool,
    ) -> Result<bool, TaskError> {
        if ctx.is_cancelled() {
            return Err(TaskError::Cancelled);
        }

        let reference = record.image_with_tag();
        let parsed = ImageRef::parse(&reference)?;

        // A floating tag tracks whichever row is currently flagged latest;
        // a pinned tag tracks its own row.
        let cached = if parsed.tag == crate::registry::DEFAULT_TAG {
            self.db
                .latest_image_version(&parsed.repo_path(), &parsed.registry)
                .await?
        } else {
            self.db
                .get_image_version(&parsed.repo_path(), &parsed.tag, &parsed.registry)
                .await?
        };

        // A fresh cache row answers the check without a registry round trip.
        if let Some(cached) = &cached {
            if !cached.is_stale(self.config.image_cache_hours, Utc::now()) {
                debug!("Cache row for {} is fresh, skipping", reference);
                return Ok(false);
            }
        }

        let current_digest = cached.as_ref().map(|v| v.digest.clone());
        let resolved = self
            .resolver
            .check_image(
                &reference,
                current_digest.as_deref(),
                None,
                record.registry_ref.as_deref(),
            )
            .await?;

        // The first sighting of an image only seeds the cache; an update
        // needs a previously known digest to differ from.
        let update_found = cached.is_some() && resolved.check.update_available;
        if !update_found {
            return Ok(false);
        }

        let mut patch = serde_json::Map::new();
        patch.insert("update_available".into(), serde_json::Value::Bool(true));
        if let Some(previous) = &current_digest {
            patch.insert(
                "previous_digest".into(),
                serde_json::Value::String(previous.clone()),
            );
        }
        self.db
            .merge_image_version_metadata(
                &parsed.repo_path(),
                &resolved.check.latest_tag,
                &parsed.registry,
                &patch,
            )
            .await?;

        info!(
            "Update available for {}: {} -> {} ({})",
            record.name,
            current_digest.as_deref().unwrap_or("unknown"),
            resolved.check.latest_digest,
            resolved.check.update_type
        );

        self.bus.publish(
            Event::new(
                EventType::ImageUpdateAvailable,
                Severity::Info,
                "image_check",
                "Image update available",
                format!(
                    "{} has a {} update to {}",
                    record.name, resolved.check.update_type, resolved.check.latest_tag
                ),
            )
            .with_resource("container", record.id.clone())
            .with_data(
                "current_digest",
                serde_json::Value::String(current_digest.unwrap_or_default()),
            )
            .with_data(
                "latest_digest",
                serde_json::Value::String(resolved.check.latest_digest.clone()),
            )
            .with_data(
                "update_type",
                serde_json::Value::String(resolved.check.update_type.to_string()),
            ),
        );

        if enqueue && record.update_policy == UpdatePolicy::Auto {
            if let Some(orchestrator) = &self.orchestrator {
                let request = UpdateRequest {
                    trigger: UpdateTrigger::Auto,
                    ..Default::default()
                };
                match orchestrator
                    .update_container(ctx.child_token(), &record.id, request)
                    .await
                {
                    Ok(result) => debug!(
                        "Enqueued update of {} finished as {}",
                        record.name, result.status
                    ),
                    Err(e) => warn!("Enqueued update of {} refused: {}", record.name, e),
                }
            }
        }

        Ok(true)
    }

    async fn targets(&self, params: &TaskParameters) -> Result<Vec<ContainerRecord>, TaskError> {
        if params.target_containers.is_empty() {
            let mut eligible = self.db.list_containers_by_policy(UpdatePolicy::Auto).await?;
            eligible.extend(
                self.db
                    .list_containers_by_policy(UpdatePolicy::Scheduled)
                    .await?,
            );
            return Ok(eligible);
        }

        let mut records = Vec::new();
        for id in &params.target_containers {
            match self.db.get_container(id).await? {
                Some(record) => records.push(record),
                None => warn!("Target container {} does not exist, skipping", id),
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl Task for ImageCheckTask {
    fn name(&self) -> &str {
        "image_check"
    }

    fn task_type(&self) -> TaskType {
        TaskType::ImageCheck
    }

    fn validate(&self, params: &TaskParameters) -> Result<(), TaskError> {
        params.get_bool("enqueue_updates")?;
        Ok(())
    }

    async fn execute(
        &self,
        ctx: CancellationToken,
        params: &TaskParameters,
    ) -> Result<(), TaskError> {
        let enqueue = params.get_bool("enqueue_updates")?.unwrap_or(false);
        let containers = self.targets(params).await?;
        info!("Checking {} containers for image updates", containers.len());

        let limit = self.config.max_concurrent_checks.max(1);
        let mut check_futures: Vec<
            std::pin::Pin<Box<dyn std::future::Future<Output = (String, Result<bool, TaskError>)> + Send + '_>>,
        > = Vec::with_capacity(containers.len());
        for record in &containers {
            let ctx = ctx.clone();
            check_futures.push(Box::pin(async move {
                let outcome = self.check_one(&ctx, record, enqueue).await;
                (record.name.clone(), outcome)
            }));
        }
        let outcomes: Vec<(String, Result<bool, TaskError>)> =
            futures_util::stream::iter(check_futures)
                .buffer_unordered(limit)
                .collect()
                .await;

        let mut updates = 0usize;
        let mut errors = Vec::new();
        for (name, outcome) in outcomes {
            match outcome {
                Ok(true) => updates += 1,
                Ok(false) => {}
                Err(e) if e.is_unauthorized() => return Err(e),
                Err(TaskError::Cancelled) => return Err(TaskError::Cancelled),
                Err(e) => {
                    warn!("Image check for {} failed: {}", name, e);
                    errors.push((name, e));
                }
            }
        }

        info!(
            "Image check finished: {} updates flagged, {} errors",
            updates,
            errors.len()
        );

        match errors.into_iter().next() {
            // Every container failing means the task run failed.
            Some((_, e)) if updates == 0 => Err(e),
            _ => Ok(()),
        }
    }

    fn default_timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(15 * 60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventFilter;
    use crate::registry::{
        ArtifactDescriptor, ListOptions, Manifest, RegistryClient, RegistryError, RegistryInfo,
        RegistryResult, RepositoryInfo, SearchOptions, SecurityScanSummary, TagInfo,
        UpdateCheckResult, UpdateType,
    };
    use crate::resolver::SecretSealer;
    use crate::types::{ContainerStatus, ImageVersion};
    use serde_json::json;
    use std::collections::HashMap;

    /// Registry stub that always reports one fixed digest
    struct FixedDigestRegistry {
        digest: String,
    }

    #[async_trait]
    impl RegistryClient for FixedDigestRegistry {
        fn registry_url(&self) -> &str {
            "docker.io"
        }

        async fn test_connection(&self) -> RegistryResult<()> {
            Ok(())
        }

        async fn get_registry_info(&self) -> RegistryResult<RegistryInfo> {
            Ok(RegistryInfo {
                url: "docker.io".into(),
                flavor: "dockerhub".into(),
                version: Some("v2".into()),
            })
        }

        async fn check_image_update(
            &self,
            image: &ImageRef,
            current_digest: Option<&str>,
        ) -> RegistryResult<UpdateCheckResult> {
            Ok(UpdateCheckResult {
                repository: image.repo_path(),
                current_tag: image.tag.clone(),
                current_digest: current_digest.map(str::to_string),
                latest_tag: image.tag.clone(),
                latest_digest: self.digest.clone(),
                update_available: current_digest != Some(self.digest.as_str()),
                update_type: UpdateType::Unknown,
                compared_tags: vec![image.tag.clone()],
                security_issues: None,
                last_checked: Utc::now(),
            })
        }

        async fn get_latest_image_info(
            &self,
            image: &ImageRef,
        ) -> RegistryResult<ArtifactDescriptor> {
            Ok(ArtifactDescriptor {
                image_name: image.repo_path(),
                tag: image.tag.clone(),
                digest: self.digest.clone(),
                size_bytes: Some(1000),
                published_at: None,
                architecture: Some("amd64".into()),
                os: Some("linux".into()),
                registry_url: "docker.io".into(),
                metadata: HashMap::new(),
            })
        }

        async fn get_image_tags(
            &self,
            _image: &ImageRef,
            _options: &ListOptions,
        ) -> RegistryResult<Vec<TagInfo>> {
            Ok(Vec::new())
        }

        async fn get_image_manifest(
            &self,
            image: &ImageRef,
            _tag: &str,
        ) -> RegistryResult<Manifest> {
            Err(RegistryError::TagNotFound(image.repo_path()))
        }

        async fn search_repositories(
            &self,
            _options: &SearchOptions,
        ) -> RegistryResult<Vec<RepositoryInfo>> {
            Ok(Vec::new())
        }

        async fn get_repository_info(&self, image: &ImageRef) -> RegistryResult<RepositoryInfo> {
            Ok(RepositoryInfo {
                name: image.repository.clone(),
                namespace: Some(image.namespace.clone()),
                description: None,
                star_count: None,
                pull_count: None,
                last_updated: None,
            })
        }

        async fn get_security_scan(
            &self,
            _image: &ImageRef,
            _tag: &str,
        ) -> RegistryResult<Option<SecurityScanSummary>> {
            Ok(None)
        }
    }

    async fn seed(db: &Database, digest: &str) {
        db.insert_container(&ContainerRecord {
            id: "web".into(),
            name: "web".into(),
            image: "nginx".into(),
            tag: "1.24".into(),
            container_id: Some("c-web".into()),
            status: ContainerStatus::Running,
            update_policy: UpdatePolicy::Auto,
            registry_ref: None,
            config: json!({}),
            created_by: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
        .await
        .unwrap();

        db.upsert_image_version(&ImageVersion {
            image_name: "library/nginx".into(),
            tag: "1.24".into(),
            registry_url: "docker.io".into(),
            digest: digest.into(),
            size_bytes: None,
            published_at: None,
            architecture: None,
            os: None,
            metadata: json!({}),
            // Stale so the task actually queries the registry.
            checked_at: Utc::now() - chrono::Duration::hours(48),
            is_latest: true,
        })
        .await
        .unwrap();
    }

    fn task(db: Arc<Database>, bus: EventBus, registry_digest: &str) -> ImageCheckTask {
        let resolver = Arc::new(UpdateResolver::new(
            db.clone(),
            SecretSealer::new("0123456789abcdef0123456789abcdef"),
        ));
        resolver.inject_client(
            "docker.io",
            Arc::new(FixedDigestRegistry {
                digest: registry_digest.to_string(),
            }),
        );
        ImageCheckTask::new(db, resolver, bus, None, ImageCheckConfig::default())
    }

    #[tokio::test]
    async fn digest_change_flags_update_and_publishes() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let bus = EventBus::new();
        seed(&db, "sha256:aaa").await;
        let mut sub = bus.subscribe(EventFilter::for_types(vec![
            EventType::ImageUpdateAvailable,
        ]));

        let check = task(db.clone(), bus, "sha256:bbb");
        check
            .execute(CancellationToken::new(), &TaskParameters::default())
            .await
            .unwrap();

        // The cache row moved to the new digest and stays single-latest.
        let row = db
            .get_image_version("library/nginx", "1.24", "docker.io")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.digest, "sha256:bbb");
        assert!(row.is_latest);
        assert_eq!(row.metadata["update_available"], true);
        assert_eq!(row.metadata["previous_digest"], "sha256:aaa");

        let event = tokio::time::timeout(Duration::from_millis(100), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.resource_id.as_deref(), Some("web"));
        assert_eq!(event.data["latest_digest"], "sha256:bbb");
    }

    #[tokio::test]
    async fn unchanged_digest_flags_nothing() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let bus = EventBus::new();
        seed(&db, "sha256:aaa").await;
        let mut sub = bus.subscribe(EventFilter::for_types(vec![
            EventType::ImageUpdateAvailable,
        ]));

        let check = task(db.clone(), bus, "sha256:aaa");
        check
            .execute(CancellationToken::new(), &TaskParameters::default())
            .await
            .unwrap();

        assert!(
            tokio::time::timeout(Duration::from_millis(50), sub.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn fresh_cache_skips_the_registry() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let bus = EventBus::new();
        seed(&db, "sha256:aaa").await;

        // Refresh the cache row so it is within the cache window.
        let mut row = db
            .get_image_version("library/nginx", "1.24", "docker.io")
            .await
            .unwrap()
            .unwrap();
        row.checked_at = Utc::now();
        db.upsert_image_version(&row).await.unwrap();

        let check = task(db.clone(), bus, "sha256:bbb");
        check
            .execute(CancellationToken::new(), &TaskParameters::default())
            .await
            .unwrap();

        // Digest untouched: the registry was never asked.
        let row = db
            .get_image_version("library/nginx", "1.24", "docker.io")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.digest, "sha256:aaa");
    }
}
