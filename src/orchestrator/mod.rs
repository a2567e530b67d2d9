//! Container update orchestrator
//!
//! Drives a per-container state machine through pull, backup, replace and
//! health gating, rolling back on failure. Updates for one container are
//! serialised; distinct containers may update in parallel up to the batch
//! bound.

mod health;
mod strategy;
mod window;

pub use health::{checks_from_config, evaluate, HealthCheckSpec, HealthEvaluation};
pub use strategy::{NoopTrafficSwitch, PullPolicy, TrafficSwitch};
pub use window::{within_any, MaintenanceWindow};

#[cfg(test)]
pub use strategy::testing;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::database::{Database, DatabaseError};
use crate::events::{Event, EventBus, EventType, Severity};
use crate::registry::ImageRef;
use crate::runtime::{spec_from_config, ContainerRuntime, ContainerSpec, RuntimeError};
use crate::types::{
    ContainerRecord, ContainerStatus, UpdateHistory, UpdateStatus, UpdateStrategy, UpdateTrigger,
};

/// States of one update run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePhase {
    Pending,
    Pulling,
    BackingUp,
    Stopping,
    Removing,
    Creating,
    Starting,
    HealthChecking,
    Succeeded,
    RollingBack,
    RolledBack,
    Failed,
    Cancelled,
}

impl std::fmt::Display for UpdatePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UpdatePhase::Pending => "pending",
            UpdatePhase::Pulling => "pulling",
            UpdatePhase::BackingUp => "backing-up",
            UpdatePhase::Stopping => "stopping",
            UpdatePhase::Removing => "removing",
            UpdatePhase::Creating => "creating",
            UpdatePhase::Starting => "starting",
            UpdatePhase::HealthChecking => "health-checking",
            UpdatePhase::Succeeded => "succeeded",
            UpdatePhase::RollingBack => "rolling-back",
            UpdatePhase::RolledBack => "rolled-back",
            UpdatePhase::Failed => "failed",
            UpdatePhase::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Orchestrator tuning knobs
#[derive(Clone)]
pub struct OrchestratorConfig {
    pub stop_grace: Duration,
    pub health_check_timeout: Duration,
    pub health_check_retries: u32,
    pub health_poll_interval: Duration,
    /// Parallel updates allowed across a group or batch
    pub max_concurrent: usize,
    pub windows: Vec<MaintenanceWindow>,
    pub default_pull_policy: PullPolicy,
    pub pre_update_backup: bool,
    pub rollback_on_failure: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_secs(30),
            health_check_timeout: Duration::from_secs(300),
            health_check_retries: 3,
            health_poll_interval: Duration::from_secs(10),
            max_concurrent: 1,
            windows: Vec::new(),
            default_pull_policy: PullPolicy::Always,
            pre_update_backup: true,
            rollback_on_failure: true,
        }
    }
}

/// Parameters for one update
#[derive(Debug, Clone)]
pub struct UpdateRequest {
    pub strategy: UpdateStrategy,
    pub trigger: UpdateTrigger,
    /// Full image reference to move to; defaults to the container's own
    /// reference (tag moved in place)
    pub new_image: Option<String>,
    pub new_digest: Option<String>,
    pub force_update: bool,
    pub pull_policy: Option<PullPolicy>,
    pub pre_update_backup: Option<bool>,
    pub rollback_on_failure: Option<bool>,
    pub stop_grace: Option<Duration>,
    /// Extra custom health checks beyond the container's configured ones
    pub health_checks: Vec<HealthCheckSpec>,
    /// Initial traffic weight for canary updates (0-100)
    pub canary_weight: u8,
}

impl Default for UpdateRequest {
    fn default() -> Self {
        Self {
            strategy: UpdateStrategy::Recreate,
            trigger: UpdateTrigger::Manual,
            new_image: None,
            new_digest: None,
            force_update: false,
            pull_policy: None,
            pre_update_backup: None,
            rollback_on_failure: None,
            stop_grace: None,
            health_checks: Vec::new(),
            canary_weight: 10,
        }
    }
}

/// Outcome of one container update
#[derive(Debug, Clone)]
pub struct SingleContainerUpdateResult {
    pub container_id: String,
    pub history_id: String,
    pub status: UpdateStatus,
    pub final_phase: UpdatePhase,
    pub error: Option<String>,
    pub duration: Duration,
}

impl SingleContainerUpdateResult {
    pub fn success(&self) -> bool {
        self.status == UpdateStatus::Success
    }
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Update not eligible: {0}")]
    NotEligible(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

enum StepError {
    Failed(String),
    Cancelled,
}

impl From<RuntimeError> for StepError {
    fn from(e: RuntimeError) -> Self {
        StepError::Failed(e.to_string())
    }
}

/// Pre-update snapshot used for rollback
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct Snapshot {
    container_id: Option<String>,
    name: String,
    image: String,
    config: serde_json::Value,
}

struct Run {
    phase: UpdatePhase,
    history: UpdateHistory,
    snapshot: Option<Snapshot>,
    new_container_id: Option<String>,
    started: tokio::time::Instant,
}

impl Run {
    fn log(&mut self, line: impl Into<String>) {
        let line = line.into();
        info!("{}", line);
        self.history.logs.push(line);
    }

    fn enter(&mut self, ctx: &CancellationToken, phase: UpdatePhase) -> Result<(), StepError> {
        if ctx.is_cancelled() {
            return Err(StepError::Cancelled);
        }
        self.phase = phase;
        self.history.logs.push(format!("phase: {}", phase));
        Ok(())
    }
}

/// The update orchestrator
pub struct Orchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    db: Arc<Database>,
    bus: EventBus,
    traffic: Arc<dyn TrafficSwitch>,
    http: reqwest::Client,
    config: OrchestratorConfig,
    /// Per-container serialisation of update runs
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        runtime: Arc<dyn ContainerRuntime>,
        db: Arc<Database>,
        bus: EventBus,
        traffic: Arc<dyn TrafficSwitch>,
    ) -> Self {
        Self {
            runtime,
            db,
            bus,
            traffic,
            http: reqwest::Client::new(),
            config,
            locks: DashMap::new(),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Update one container, writing an UpdateHistory row either way
    pub async fn update_container(
        &self,
        ctx: CancellationToken,
        container_id: &str,
        request: UpdateRequest,
    ) -> Result<SingleContainerUpdateResult, OrchestratorError> {
        let lock = self
            .locks
            .entry(container_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let record = self
            .db
            .get_container(container_id)
            .await?
            .ok_or_else(|| OrchestratorError::ContainerNotFound(container_id.to_string()))?;

        self.check_eligibility(&record, &request).await?;

        let strategy = self.effective_strategy(&record, request.strategy);
        let new_image = request
            .new_image
            .clone()
            .unwrap_or_else(|| record.image_with_tag());

        let cached = self
            .db
            .get_image_version(&cache_key(&record), &record.tag, &registry_of(&record))
            .await
            .ok()
            .flatten();
        let old_digest = cached
            .as_ref()
            .and_then(|v| v.metadata.get("previous_digest"))
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let new_digest = request
            .new_digest
            .clone()
            .or_else(|| cached.as_ref().map(|v| v.digest.clone()));

        let history = UpdateHistory {
            id: Uuid::new_v4().to_string(),
            container_id: record.id.clone(),
            old_image: record.image_with_tag(),
            new_image: new_image.clone(),
            old_digest,
            new_digest,
            status: UpdateStatus::Running,
            error_message: None,
            duration_seconds: None,
            triggered_by: request.trigger,
            strategy,
            backup_created: false,
            rollback_available: false,
            logs: Vec::new(),
            backup: None,
            started_at: Utc::now(),
            completed_at: None,
        };
        self.db.insert_update_history(&history).await?;

        self.emit(
            Event::new(
                EventType::ContainerUpdated,
                Severity::Info,
                "orchestrator",
                "Container updating",
                format!("container {} is being replaced", record.name),
            )
            .with_resource("container", record.id.clone()),
        );
        self.emit(
            Event::new(
                EventType::ImageUpdateStarted,
                Severity::Info,
                "orchestrator",
                "Update started",
                format!("updating {} to {}", record.name, new_image),
            )
            .with_resource("container", record.id.clone()),
        );

        let mut run = Run {
            phase: UpdatePhase::Pending,
            history,
            snapshot: None,
            new_container_id: None,
            started: tokio::time::Instant::now(),
        };

        let outcome = match strategy {
            UpdateStrategy::Recreate | UpdateStrategy::Rolling => {
                self.run_recreate(&ctx, &record, &request, &new_image, &mut run)
                    .await
            }
            UpdateStrategy::BlueGreen => {
                self.run_blue_green(&ctx, &record, &request, &new_image, &mut run, false)
                    .await
            }
            UpdateStrategy::Canary => {
                self.run_blue_green(&ctx, &record, &request, &new_image, &mut run, true)
                    .await
            }
        };

        let result = self.finish(&record, &request, &new_image, run, outcome).await?;
        Ok(result)
    }

    /// Update every member of a label-sharing group, one at a time,
    /// waiting for health before advancing
    pub async fn update_group(
        &self,
        ctx: CancellationToken,
        label_key: &str,
        request: UpdateRequest,
    ) -> Result<Vec<SingleContainerUpdateResult>, OrchestratorError> {
        let members: Vec<ContainerRecord> = self
            .db
            .list_containers()
            .await?
            .into_iter()
            .filter(|record| {
                record
                    .config
                    .get("labels")
                    .and_then(|l| l.get(label_key))
                    .is_some()
            })
            .collect();

        info!(
            "Rolling update over {} containers sharing label {}",
            members.len(),
            label_key
        );

        let mut results = Vec::new();
        for member in members {
            if ctx.is_cancelled() {
                break;
            }
            // Group eligibility was decided when the rollout started; a
            // member whose shared cache flag was cleared by an earlier
            // member must still advance.
            let mut member_request = request.clone();
            member_request.force_update = true;
            let result = self
                .update_container(ctx.clone(), &member.id, member_request)
                .await?;
            let ok = result.success();
            results.push(result);
            if !ok {
                // A failed member halts the rollout; the rest keep their
                // current version.
                warn!("Rolling update halted at {}", member.name);
                break;
            }
        }
        Ok(results)
    }

    // ========================================================================
    // Eligibility
    // ========================================================================

    async fn check_eligibility(
        &self,
        record: &ContainerRecord,
        request: &UpdateRequest,
    ) -> Result<(), OrchestratorError> {
        if !record.update_policy.permits(request.trigger) {
            return Err(OrchestratorError::NotEligible(format!(
                "policy {} does not permit {} triggers",
                record.update_policy, request.trigger
            )));
        }

        // Manual operators may update a stopped container; automation only
        // touches running ones.
        if record.status != ContainerStatus::Running && request.trigger != UpdateTrigger::Manual {
            return Err(OrchestratorError::NotEligible(format!(
                "container is {}, not running",
                record.status
            )));
        }

        if matches!(
            request.trigger,
            UpdateTrigger::Auto | UpdateTrigger::Schedule
        ) && !within_any(&self.config.windows, Utc::now())
        {
            return Err(OrchestratorError::NotEligible(
                "outside the maintenance window".into(),
            ));
        }

        if !request.force_update && request.new_image.is_none() {
            let available = self
                .db
                .get_image_version(&cache_key(record), &record.tag, &registry_of(record))
                .await?
                .map(|v| {
                    v.metadata
                        .get("update_available")
                        .and_then(|f| f.as_bool())
                        .unwrap_or(false)
                })
                .unwrap_or(false);
            if !available {
                return Err(OrchestratorError::NotEligible(
                    "no update available for this container".into(),
                ));
            }
        }

        Ok(())
    }

    /// Strategy fallback: selections the deployment cannot satisfy become
    /// recreate, with a warning event
    fn effective_strategy(
        &self,
        record: &ContainerRecord,
        requested: UpdateStrategy,
    ) -> UpdateStrategy {
        let fallback = |reason: &str| {
            warn!(
                "Strategy {} unavailable for {}: {}; falling back to recreate",
                requested, record.name, reason
            );
            self.emit(
                Event::new(
                    EventType::SystemError,
                    Severity::Warning,
                    "orchestrator",
                    "Strategy fallback",
                    format!(
                        "strategy {} unavailable ({}), using recreate",
                        requested, reason
                    ),
                )
                .with_resource("container", record.id.clone()),
            );
            UpdateStrategy::Recreate
        };

        match requested {
            UpdateStrategy::Recreate | UpdateStrategy::Rolling => requested,
            UpdateStrategy::BlueGreen | UpdateStrategy::Canary => {
                if self.traffic.capable() {
                    requested
                } else {
                    fallback("no traffic switch installed")
                }
            }
        }
    }

    // ========================================================================
    // State machines
    // ========================================================================

    async fn run_recreate(
        &self,
        ctx: &CancellationToken,
        record: &ContainerRecord,
        request: &UpdateRequest,
        new_image: &str,
        run: &mut Run,
    ) -> Result<(), StepError> {
        self.pull(ctx, record, request, new_image, run).await?;
        self.backup(ctx, record, request, run).await?;

        run.enter(ctx, UpdatePhase::Stopping)?;
        if let Some(old_id) = &record.container_id {
            let grace = request.stop_grace.unwrap_or(self.config.stop_grace);
            run.log(format!("stopping {} with {}s grace", old_id, grace.as_secs()));
            self.runtime.stop_container(old_id, grace).await?;
        }

        run.enter(ctx, UpdatePhase::Removing)?;
        if let Some(old_id) = &record.container_id {
            self.runtime.remove_container(old_id, true).await?;
        }

        run.enter(ctx, UpdatePhase::Creating)?;
        let spec = self.build_spec(record, &record.name, new_image)?;
        let new_id = self.runtime.create_container(&spec).await?;
        run.new_container_id = Some(new_id.clone());
        run.log(format!("created replacement container {}", new_id));

        run.enter(ctx, UpdatePhase::Starting)?;
        self.runtime.start_container(&new_id).await?;

        run.enter(ctx, UpdatePhase::HealthChecking)?;
        self.health_gate(ctx, record, request, &new_id, run).await?;

        run.phase = UpdatePhase::Succeeded;
        Ok(())
    }

    async fn run_blue_green(
        &self,
        ctx: &CancellationToken,
        record: &ContainerRecord,
        request: &UpdateRequest,
        new_image: &str,
        run: &mut Run,
        canary: bool,
    ) -> Result<(), StepError> {
        self.pull(ctx, record, request, new_image, run).await?;
        self.backup(ctx, record, request, run).await?;

        let shadow_name = if canary {
            format!("{}-canary", record.name)
        } else {
            format!("{}-green", record.name)
        };

        run.enter(ctx, UpdatePhase::Creating)?;
        let spec = self.build_spec(record, &shadow_name, new_image)?;
        let new_id = self.runtime.create_container(&spec).await?;
        run.new_container_id = Some(new_id.clone());
        run.log(format!("created shadow container {} ({})", shadow_name, new_id));

        run.enter(ctx, UpdatePhase::Starting)?;
        self.runtime.start_container(&new_id).await?;

        run.enter(ctx, UpdatePhase::HealthChecking)?;
        if let Err(e) = self.health_gate(ctx, record, request, &new_id, run).await {
            // The original container was never touched: discard the shadow
            // and report failure without a rollback. Dropping the snapshot
            // keeps finish() from recreating a container that still exists.
            run.log("shadow container unhealthy, discarding it");
            let _ = self.runtime.remove_container(&new_id, true).await;
            run.new_container_id = None;
            run.snapshot = None;
            return Err(e);
        }

        if canary {
            run.log(format!(
                "canary {} serving at weight {}",
                shadow_name, request.canary_weight
            ));
            if let Err(e) = self.traffic.set_weight(&new_id, request.canary_weight).await {
                // Same situation as a failed health gate: the original is
                // untouched, so discard the shadow and skip any rollback.
                run.log("canary weight assignment failed, discarding the shadow");
                let _ = self.runtime.remove_container(&new_id, true).await;
                run.new_container_id = None;
                run.snapshot = None;
                return Err(StepError::Failed(e));
            }
            // Weight progression is externally driven; both containers
            // keep running.
            run.phase = UpdatePhase::Succeeded;
            return Ok(());
        }

        if let Some(old_id) = &record.container_id {
            self.traffic
                .swap(old_id, &new_id)
                .await
                .map_err(StepError::Failed)?;
            run.log(format!("traffic swapped from {} to {}", old_id, new_id));

            run.enter(ctx, UpdatePhase::Stopping)?;
            let grace = request.stop_grace.unwrap_or(self.config.stop_grace);
            self.runtime.stop_container(old_id, grace).await?;

            run.enter(ctx, UpdatePhase::Removing)?;
            self.runtime.remove_container(old_id, true).await?;
        }

        run.phase = UpdatePhase::Succeeded;
        Ok(())
    }

    async fn pull(
        &self,
        ctx: &CancellationToken,
        record: &ContainerRecord,
        request: &UpdateRequest,
        new_image: &str,
        run: &mut Run,
    ) -> Result<(), StepError> {
        run.enter(ctx, UpdatePhase::Pulling)?;
        let policy = request.pull_policy.unwrap_or(self.config.default_pull_policy);

        match policy {
            PullPolicy::Always => {
                run.log(format!("pulling {}", new_image));
                self.runtime.pull_image(new_image, None).await?;
            }
            PullPolicy::IfNotPresent => {
                if self.runtime.image_present(new_image).await? {
                    run.log(format!("image {} already present", new_image));
                } else {
                    run.log(format!("pulling {}", new_image));
                    self.runtime.pull_image(new_image, None).await?;
                }
            }
            PullPolicy::Never => {
                if !self.runtime.image_present(new_image).await? {
                    return Err(StepError::Failed(format!(
                        "image {} not present and pull policy is never",
                        new_image
                    )));
                }
                run.log(format!("using local image {}", new_image));
            }
        }

        let _ = record;
        Ok(())
    }

    async fn backup(
        &self,
        ctx: &CancellationToken,
        record: &ContainerRecord,
        request: &UpdateRequest,
        run: &mut Run,
    ) -> Result<(), StepError> {
        if !request
            .pre_update_backup
            .unwrap_or(self.config.pre_update_backup)
        {
            return Ok(());
        }

        run.enter(ctx, UpdatePhase::BackingUp)?;
        let snapshot = Snapshot {
            container_id: record.container_id.clone(),
            name: record.name.clone(),
            image: record.image_with_tag(),
            config: record.config.clone(),
        };
        let value = serde_json::to_value(&snapshot)
            .map_err(|e| StepError::Failed(format!("snapshot serialisation failed: {}", e)))?;

        self.db
            .insert_backup(&record.id, &value)
            .await
            .map_err(|e| StepError::Failed(e.to_string()))?;

        run.history.backup = Some(value);
        run.history.backup_created = true;
        run.history.rollback_available = true;
        run.snapshot = Some(snapshot);
        run.log("captured pre-update snapshot");
        Ok(())
    }

    /// Poll the container's health until it passes or the gate gives up
    async fn health_gate(
        &self,
        ctx: &CancellationToken,
        record: &ContainerRecord,
        request: &UpdateRequest,
        container_id: &str,
        run: &mut Run,
    ) -> Result<(), StepError> {
        let mut checks = checks_from_config(&record.config)
            .map_err(|e| StepError::Failed(e.to_string()))?;
        checks.extend(request.health_checks.iter().cloned());

        let deadline = tokio::time::Instant::now() + self.config.health_check_timeout;
        let retries = self.config.health_check_retries.max(1);

        let mut last_failure = String::from("health never evaluated");
        for attempt in 1..=retries {
            if ctx.is_cancelled() {
                return Err(StepError::Cancelled);
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }

            let evaluation =
                evaluate(self.runtime.as_ref(), &self.http, container_id, &checks).await;

            for warning in &evaluation.warnings {
                self.emit(
                    Event::new(
                        EventType::SystemResourceAlert,
                        Severity::Warning,
                        "orchestrator",
                        "Resource pressure",
                        format!("{}: {}", record.name, warning),
                    )
                    .with_resource("container", record.id.clone()),
                );
            }

            if evaluation.healthy {
                run.log(format!("health check passed on attempt {}", attempt));
                return Ok(());
            }

            last_failure = evaluation.failures.join("; ");
            run.log(format!(
                "health attempt {}/{} failed: {}",
                attempt, retries, last_failure
            ));
            if let Some(streak) = evaluation.failing_streak {
                run.history
                    .logs
                    .push(format!("runtime failing streak: {}", streak));
            }

            if attempt < retries {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.health_poll_interval) => {}
                    _ = ctx.cancelled() => return Err(StepError::Cancelled),
                }
            }
        }

        Err(StepError::Failed(format!(
            "health gate failed: {}",
            last_failure
        )))
    }

    // ========================================================================
    // Completion & rollback
    // ========================================================================

    async fn finish(
        &self,
        record: &ContainerRecord,
        request: &UpdateRequest,
        new_image: &str,
        mut run: Run,
        outcome: Result<(), StepError>,
    ) -> Result<SingleContainerUpdateResult, OrchestratorError> {
        let status = match outcome {
            Ok(()) => {
                self.apply_success(record, new_image, &mut run).await;
                UpdateStatus::Success
            }
            Err(StepError::Cancelled) => {
                run.phase = UpdatePhase::Cancelled;
                run.history.error_message = Some("update cancelled".into());
                UpdateStatus::Cancelled
            }
            Err(StepError::Failed(message)) => {
                run.history.error_message = Some(message.clone());
                let rollback = request
                    .rollback_on_failure
                    .unwrap_or(self.config.rollback_on_failure);

                if rollback && run.snapshot.is_some() {
                    match self.roll_back(record, &mut run).await {
                        Ok(()) => {
                            run.phase = UpdatePhase::RolledBack;
                            UpdateStatus::Rollback
                        }
                        Err(e) => {
                            run.log(format!("rollback failed: {}", e));
                            run.phase = UpdatePhase::Failed;
                            UpdateStatus::Failed
                        }
                    }
                } else {
                    run.phase = UpdatePhase::Failed;
                    UpdateStatus::Failed
                }
            }
        };

        let duration = run.started.elapsed();
        run.history.status = status;
        run.history.duration_seconds = Some(duration.as_secs() as i64);
        run.history.completed_at = Some(Utc::now());
        self.db.update_update_history(&run.history).await?;

        match status {
            UpdateStatus::Success => {
                self.emit(
                    Event::new(
                        EventType::ImageUpdateCompleted,
                        Severity::Success,
                        "orchestrator",
                        "Update completed",
                        format!("{} now runs {}", record.name, new_image),
                    )
                    .with_resource("container", record.id.clone()),
                );
            }
            UpdateStatus::Cancelled => {
                self.emit(
                    Event::new(
                        EventType::ImageUpdateFailed,
                        Severity::Warning,
                        "orchestrator",
                        "Update cancelled",
                        format!("update of {} was cancelled", record.name),
                    )
                    .with_resource("container", record.id.clone()),
                );
            }
            _ => {
                self.emit(
                    Event::new(
                        EventType::ImageUpdateFailed,
                        Severity::Error,
                        "orchestrator",
                        "Update failed",
                        run.history
                            .error_message
                            .clone()
                            .unwrap_or_else(|| "update failed".into()),
                    )
                    .with_resource("container", record.id.clone()),
                );
            }
        }

        Ok(SingleContainerUpdateResult {
            container_id: record.id.clone(),
            history_id: run.history.id.clone(),
            status,
            final_phase: run.phase,
            error: run.history.error_message.clone(),
            duration,
        })
    }

    async fn apply_success(&self, record: &ContainerRecord, new_image: &str, run: &mut Run) {
        let mut updated = record.clone();
        if let Some(new_id) = &run.new_container_id {
            updated.container_id = Some(new_id.clone());
        }
        updated.status = ContainerStatus::Running;
        if let Ok(parsed) = ImageRef::parse(new_image) {
            updated.image = parsed.with_tag(crate::registry::DEFAULT_TAG).build();
            updated.tag = parsed.tag;
        }
        updated.updated_at = Utc::now();

        if let Err(e) = self.db.update_container(&updated).await {
            warn!("Failed to persist container record after update: {}", e);
        }

        // The running digest now matches the registry; clear the pending
        // flag on the cache row.
        let mut patch = serde_json::Map::new();
        patch.insert("update_available".into(), serde_json::Value::Bool(false));
        if let Err(e) = self
            .db
            .merge_image_version_metadata(
                &cache_key(record),
                &updated.tag,
                &registry_of(record),
                &patch,
            )
            .await
        {
            warn!("Failed to clear update flag: {}", e);
        }

        run.log(format!("{} updated to {}", record.name, new_image));
    }

    /// Recreate the previous container from its snapshot
    async fn roll_back(&self, record: &ContainerRecord, run: &mut Run) -> Result<(), String> {
        run.phase = UpdatePhase::RollingBack;
        run.log("rolling back to pre-update snapshot");

        let snapshot = run
            .snapshot
            .clone()
            .ok_or_else(|| "no snapshot available".to_string())?;

        if let Some(new_id) = run.new_container_id.take() {
            let _ = self.runtime.remove_container(&new_id, true).await;
        }

        let spec = spec_from_config(&snapshot.name, &snapshot.image, &snapshot.config)
            .map_err(|e| e.to_string())?;
        let restored_id = self
            .runtime
            .create_container(&spec)
            .await
            .map_err(|e| e.to_string())?;
        self.runtime
            .start_container(&restored_id)
            .await
            .map_err(|e| e.to_string())?;

        let mut restored = record.clone();
        restored.container_id = Some(restored_id.clone());
        restored.status = ContainerStatus::Running;
        restored.updated_at = Utc::now();
        if let Err(e) = self.db.update_container(&restored).await {
            warn!("Failed to persist rolled-back container record: {}", e);
        }

        run.log(format!("restored previous container as {}", restored_id));
        self.emit(
            Event::new(
                EventType::ContainerRestarted,
                Severity::Warning,
                "orchestrator",
                "Container rolled back",
                format!("{} restored from pre-update snapshot", record.name),
            )
            .with_resource("container", record.id.clone()),
        );
        Ok(())
    }

    fn build_spec(
        &self,
        record: &ContainerRecord,
        name: &str,
        image: &str,
    ) -> Result<ContainerSpec, StepError> {
        spec_from_config(name, image, &record.config).map_err(StepError::from)
    }

    fn emit(&self, event: Event) {
        self.bus.publish(event);
    }
}

fn cache_key(record: &ContainerRecord) -> String {
    match ImageRef::parse(&record.image_with_tag()) {
        Ok(parsed) => parsed.repo_path(),
        Err(_) => record.image.clone(),
    }
}

fn registry_of(record: &ContainerRecord) -> String {
    match ImageRef::parse(&record.image_with_tag()) {
        Ok(parsed) => parsed.registry,
        Err(_) => crate::registry::DEFAULT_REGISTRY.to_string(),
    }
}

#[cfg(test)]
mod tests;
