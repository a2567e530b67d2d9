//! Cron-driven scheduler service
//!
//! Owns the live collection of scheduled tasks, one timer per active task,
//! the hook pipeline and the durable execution history. Executions
//! themselves run through the [`TaskExecutor`](super::TaskExecutor).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use chrono_tz::Tz;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::database::{Database, DatabaseError};
use crate::events::{Event, EventBus, EventType, Severity};
use crate::types::{ExecutionStatus, ScheduledTask, TaskType};

use super::cron::{CronError, CronSchedule};
use super::executor::{TaskExecutor, TaskResult};
use super::task::{DependencyCondition, TaskDependencies, TaskParameters, TaskRegistry};

/// Scheduler errors
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Task already exists: {0}")]
    TaskExists(String),

    #[error(transparent)]
    InvalidCron(#[from] CronError),

    #[error("No task registered for type {0}")]
    UnknownTaskType(TaskType),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Hook points around task execution
#[async_trait]
pub trait TaskHook: Send + Sync {
    async fn before_execution(&self, _task: &ScheduledTask) {}
    async fn after_execution(&self, _task: &ScheduledTask, _result: &TaskResult) {}
    async fn on_error(&self, _task: &ScheduledTask, _error: &str) {}
}

/// Scheduler tuning knobs
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub cleanup_interval: Duration,
    pub history_retention: chrono::Duration,
    pub timezone: Tz,
    /// How long a dependency-gated fire may wait before it is abandoned
    pub dependency_deadline: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            cleanup_interval: Duration::from_secs(300),
            history_retention: chrono::Duration::days(30),
            timezone: Tz::UTC,
            dependency_deadline: Duration::from_secs(600),
        }
    }
}

/// Request to create a scheduled task
#[derive(Debug, Clone)]
pub struct CreateTaskRequest {
    pub name: String,
    pub task_type: TaskType,
    pub cron_expression: String,
    pub target_containers: Vec<String>,
    pub parameters: serde_json::Value,
    pub is_active: bool,
}

/// Partial update of a scheduled task
#[derive(Debug, Clone, Default)]
pub struct UpdateTaskRequest {
    pub name: Option<String>,
    pub cron_expression: Option<String>,
    pub target_containers: Option<Vec<String>>,
    pub parameters: Option<serde_json::Value>,
    pub is_active: Option<bool>,
}

/// Snapshot answer for status queries
#[derive(Debug, Clone)]
pub struct TaskStatus {
    pub task: ScheduledTask,
    pub running: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FireKind {
    Cron,
    Manual,
}

struct SchedulerInner {
    options: SchedulerOptions,
    db: Arc<Database>,
    registry: Arc<TaskRegistry>,
    executor: Arc<TaskExecutor>,
    bus: EventBus,
    tasks: tokio::sync::RwLock<HashMap<String, ScheduledTask>>,
    timers: tokio::sync::Mutex<HashMap<String, JoinHandle<()>>>,
    hooks: parking_lot::RwLock<Vec<Arc<dyn TaskHook>>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

/// The scheduler service
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(
        options: SchedulerOptions,
        db: Arc<Database>,
        registry: Arc<TaskRegistry>,
        executor: Arc<TaskExecutor>,
        bus: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                options,
                db,
                registry,
                executor,
                bus,
                tasks: tokio::sync::RwLock::new(HashMap::new()),
                timers: tokio::sync::Mutex::new(HashMap::new()),
                hooks: parking_lot::RwLock::new(Vec::new()),
                tracker: TaskTracker::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn add_hook(&self, hook: Arc<dyn TaskHook>) {
        self.inner.hooks.write().push(hook);
    }

    /// Load stored tasks, start timers for the active ones and the
    /// periodic cleanup worker
    pub async fn start(&self) -> Result<(), SchedulerError> {
        let stored = self.inner.db.list_tasks(false).await?;
        let mut started = 0usize;

        {
            let mut tasks = self.inner.tasks.write().await;
            for mut task in stored {
                if task.is_active {
                    // A restart may have slept through next_run_at; catch up.
                    let schedule = CronSchedule::parse(&task.cron_expression)?;
                    let stale = task
                        .next_run_at
                        .map(|next| next <= Utc::now())
                        .unwrap_or(true);
                    if stale {
                        task.next_run_at =
                            schedule.next_after(Utc::now(), self.inner.options.timezone);
                        self.inner
                            .db
                            .record_task_fire(
                                &task.id,
                                task.last_run_at.unwrap_or_else(Utc::now),
                                task.next_run_at,
                            )
                            .await?;
                    }
                    started += 1;
                }
                tasks.insert(task.id.clone(), task);
            }
        }

        {
            let tasks = self.inner.tasks.read().await;
            let mut timers = self.inner.timers.lock().await;
            for task in tasks.values().filter(|t| t.is_active) {
                timers.insert(
                    task.id.clone(),
                    tokio::spawn(run_timer(self.inner.clone(), task.id.clone())),
                );
            }
        }

        let _ = self.inner.tracker.spawn(run_cleanup(self.inner.clone()));

        info!("Scheduler started with {} active tasks", started);
        Ok(())
    }

    /// Create, persist and start a new task
    pub async fn add_task(
        &self,
        request: CreateTaskRequest,
    ) -> Result<ScheduledTask, SchedulerError> {
        if self.inner.db.get_task_by_name(&request.name).await?.is_some() {
            return Err(SchedulerError::TaskExists(request.name));
        }

        let schedule = CronSchedule::parse(&request.cron_expression)?;

        let now = Utc::now();
        let task = ScheduledTask {
            id: Uuid::new_v4().to_string(),
            name: request.name,
            task_type: request.task_type,
            cron_expression: request.cron_expression,
            target_containers: request.target_containers,
            parameters: request.parameters,
            is_active: request.is_active,
            last_run_at: None,
            next_run_at: request
                .is_active
                .then(|| schedule.next_after(now, self.inner.options.timezone))
                .flatten(),
            run_count: 0,
            failure_count: 0,
            created_at: now,
            updated_at: now,
        };

        self.validate_parameters(&task)?;
        self.inner.db.insert_task(&task).await?;
        self.inner
            .tasks
            .write()
            .await
            .insert(task.id.clone(), task.clone());

        if task.is_active {
            self.spawn_timer(&task.id).await;
        }

        info!("Added task {} ({})", task.name, task.id);
        Ok(task)
    }

    /// Apply a partial update; cron is re-validated and `next_run_at`
    /// recomputed and persisted
    pub async fn update_task(
        &self,
        id: &str,
        request: UpdateTaskRequest,
    ) -> Result<ScheduledTask, SchedulerError> {
        let mut task = self
            .inner
            .tasks
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SchedulerError::TaskNotFound(id.to_string()))?;

        if let Some(name) = request.name {
            task.name = name;
        }
        if let Some(cron_expression) = request.cron_expression {
            task.cron_expression = cron_expression;
        }
        if let Some(target_containers) = request.target_containers {
            task.target_containers = target_containers;
        }
        if let Some(parameters) = request.parameters {
            task.parameters = parameters;
        }
        if let Some(is_active) = request.is_active {
            task.is_active = is_active;
        }

        let schedule = CronSchedule::parse(&task.cron_expression)?;
        task.next_run_at = task
            .is_active
            .then(|| schedule.next_after(Utc::now(), self.inner.options.timezone))
            .flatten();
        task.updated_at = Utc::now();

        self.validate_parameters(&task)?;
        self.inner.db.update_task(&task).await?;
        self.inner
            .tasks
            .write()
            .await
            .insert(task.id.clone(), task.clone());

        self.cancel_timer(id).await;
        if task.is_active {
            self.spawn_timer(id).await;
        }

        Ok(task)
    }

    pub async fn remove_task(&self, id: &str) -> Result<(), SchedulerError> {
        self.cancel_timer(id).await;
        let removed = self.inner.tasks.write().await.remove(id).is_some();
        let deleted = self.inner.db.delete_task(id).await?;
        if !removed && !deleted {
            return Err(SchedulerError::TaskNotFound(id.to_string()));
        }
        info!("Removed task {}", id);
        Ok(())
    }

    /// Deactivate a task and cancel its pending fire; no-op when already
    /// paused
    pub async fn pause_task(&self, id: &str) -> Result<(), SchedulerError> {
        let mut task = self
            .inner
            .tasks
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SchedulerError::TaskNotFound(id.to_string()))?;

        if !task.is_active {
            return Ok(());
        }

        task.is_active = false;
        task.next_run_at = None;
        task.updated_at = Utc::now();
        self.inner.db.update_task(&task).await?;
        self.inner
            .tasks
            .write()
            .await
            .insert(task.id.clone(), task);
        self.cancel_timer(id).await;

        info!("Paused task {}", id);
        Ok(())
    }

    /// Reactivate a paused task; no-op when already active
    pub async fn resume_task(&self, id: &str) -> Result<(), SchedulerError> {
        let mut task = self
            .inner
            .tasks
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SchedulerError::TaskNotFound(id.to_string()))?;

        if task.is_active {
            return Ok(());
        }

        let schedule = CronSchedule::parse(&task.cron_expression)?;
        task.is_active = true;
        task.next_run_at = schedule.next_after(Utc::now(), self.inner.options.timezone);
        task.updated_at = Utc::now();
        self.inner.db.update_task(&task).await?;
        self.inner
            .tasks
            .write()
            .await
            .insert(task.id.clone(), task);
        self.spawn_timer(id).await;

        info!("Resumed task {}", id);
        Ok(())
    }

    /// Fire a task immediately, outside its cron schedule
    ///
    /// The concurrency contract still applies: a non-concurrent task with
    /// a running execution skips the fire.
    pub async fn trigger_task(&self, id: &str) -> Result<(), SchedulerError> {
        if !self.inner.tasks.read().await.contains_key(id) {
            return Err(SchedulerError::TaskNotFound(id.to_string()));
        }
        fire(self.inner.clone(), id.to_string(), FireKind::Manual).await;
        Ok(())
    }

    pub async fn get_task_status(&self, id: &str) -> Option<TaskStatus> {
        let task = self.inner.tasks.read().await.get(id).cloned()?;
        let running = self.inner.executor.has_active_for(id);
        Some(TaskStatus { task, running })
    }

    pub async fn list_tasks(&self) -> Vec<ScheduledTask> {
        self.inner.tasks.read().await.values().cloned().collect()
    }

    /// Executions currently in flight
    pub fn running_tasks(&self) -> Vec<super::executor::TaskExecution> {
        self.inner.executor.active_executions()
    }

    /// Refuse new fires, cancel running executions and wait for workers to
    /// drain, bounded by `grace`
    pub async fn stop(&self, grace: Duration) {
        info!("Scheduler stopping");
        self.inner.shutdown.cancel();

        {
            let mut timers = self.inner.timers.lock().await;
            for (_, handle) in timers.drain() {
                handle.abort();
            }
        }

        self.inner.executor.cancel_all();
        self.inner.tracker.close();

        if tokio::time::timeout(grace, self.inner.tracker.wait())
            .await
            .is_err()
        {
            warn!("Scheduler stop timed out with workers still draining");
        } else {
            info!("Scheduler stopped");
        }
    }

    fn validate_parameters(&self, task: &ScheduledTask) -> Result<(), SchedulerError> {
        let instance = self
            .inner
            .registry
            .create(task.task_type)
            .ok_or(SchedulerError::UnknownTaskType(task.task_type))?;
        let params = TaskParameters::from_scheduled(task)
            .map_err(|e| SchedulerError::InvalidParameters(e.to_string()))?;
        instance
            .validate(&params)
            .map_err(|e| SchedulerError::InvalidParameters(e.to_string()))
    }

    async fn spawn_timer(&self, id: &str) {
        let mut timers = self.inner.timers.lock().await;
        if let Some(old) = timers.remove(id) {
            old.abort();
        }
        timers.insert(
            id.to_string(),
            tokio::spawn(run_timer(self.inner.clone(), id.to_string())),
        );
    }

    async fn cancel_timer(&self, id: &str) {
        if let Some(handle) = self.inner.timers.lock().await.remove(id) {
            handle.abort();
        }
    }
}

/// Per-task timer loop: sleep until `next_run_at`, fire, repeat
async fn run_timer(inner: Arc<SchedulerInner>, task_id: String) {
    loop {
        let next = {
            let tasks = inner.tasks.read().await;
            match tasks.get(&task_id) {
                Some(task) if task.is_active => task.next_run_at,
                _ => None,
            }
        };
        let Some(next) = next else {
            debug!("Timer for task {} stopping (inactive)", task_id);
            break;
        };

        let delay = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {
                fire(inner.clone(), task_id.clone(), FireKind::Cron).await;
            }
            _ = inner.shutdown.cancelled() => break,
        }
    }
}

/// One tick of a task: bookkeeping, gating, then execution on a worker
async fn fire(inner: Arc<SchedulerInner>, task_id: String, kind: FireKind) {
    if inner.shutdown.is_cancelled() {
        return;
    }

    let Some(mut task) = inner.tasks.read().await.get(&task_id).cloned() else {
        return;
    };
    if kind == FireKind::Cron && !task.is_active {
        return;
    }

    // Fire bookkeeping: last run now, next run recomputed and persisted.
    let now = Utc::now();
    task.last_run_at = Some(now);
    if kind == FireKind::Cron {
        task.next_run_at = CronSchedule::parse(&task.cron_expression)
            .ok()
            .and_then(|s| s.next_after(now, inner.options.timezone));
    }
    if let Err(e) = inner
        .db
        .record_task_fire(&task_id, now, task.next_run_at)
        .await
    {
        error!("Failed to persist fire bookkeeping for {}: {}", task_id, e);
    }
    inner
        .tasks
        .write()
        .await
        .insert(task_id.clone(), task.clone());

    let Some(instance) = inner.registry.create(task.task_type) else {
        emit_task_event(
            &inner,
            &task,
            EventType::TaskFailed,
            Severity::Error,
            format!("no task registered for type {}", task.task_type),
            None,
        );
        return;
    };

    let params = match TaskParameters::from_scheduled(&task) {
        Ok(params) => params,
        Err(e) => {
            emit_task_event(
                &inner,
                &task,
                EventType::TaskFailed,
                Severity::Error,
                format!("invalid parameters: {}", e),
                None,
            );
            return;
        }
    };

    // The concurrency contract: a non-concurrent task skips this tick
    // while a previous execution is still running.
    if !instance.can_run_concurrently() && inner.executor.has_active_for(&task_id) {
        warn!("Task {} still running, skipping this tick", task.name);
        emit_task_event(
            &inner,
            &task,
            EventType::TaskCancelled,
            Severity::Warning,
            "previous execution still running".to_string(),
            None,
        );
        return;
    }

    let _ = inner.tracker.spawn(run_execution(
        inner.clone(),
        task,
        instance,
        params,
    ));
}

/// Worker half of a fire: dependency gate, hooks, execution, completion
async fn run_execution(
    inner: Arc<SchedulerInner>,
    task: ScheduledTask,
    instance: Arc<dyn super::task::Task>,
    params: TaskParameters,
) {
    if let Some(deps) = &params.dependencies {
        if !wait_for_dependencies(&inner, deps).await {
            emit_task_event(
                &inner,
                &task,
                EventType::TaskFailed,
                Severity::Error,
                "dependency deadline expired, fire abandoned".to_string(),
                None,
            );
            return;
        }
    }

    let hooks: Vec<_> = inner.hooks.read().clone();
    for hook in &hooks {
        hook.before_execution(&task).await;
    }

    emit_task_event(
        &inner,
        &task,
        EventType::TaskStarted,
        Severity::Info,
        format!("task {} started", task.name),
        None,
    );

    let result = inner
        .executor
        .execute(
            inner.shutdown.child_token(),
            instance,
            &task.id,
            params,
        )
        .await;

    // Durable history row for this execution.
    if let Some(execution) = inner.executor.get_execution(&result.execution_id) {
        if let Err(e) = inner.db.insert_execution_log(&execution.to_log()).await {
            error!("Failed to persist execution log: {}", e);
        }
    }
    if let Err(e) = inner.db.bump_task_counters(&task.id, !result.success()).await {
        error!("Failed to bump counters for {}: {}", task.id, e);
    }
    {
        let mut tasks = inner.tasks.write().await;
        if let Some(stored) = tasks.get_mut(&task.id) {
            stored.run_count += 1;
            if !result.success() {
                stored.failure_count += 1;
            }
        }
    }

    for hook in &hooks {
        match &result.error {
            Some(error) if !result.success() => hook.on_error(&task, error).await,
            _ => hook.after_execution(&task, &result).await,
        }
    }

    let (event_type, severity, message) = match result.status {
        ExecutionStatus::Success | ExecutionStatus::Running => (
            EventType::TaskCompleted,
            Severity::Success,
            format!("task {} completed", task.name),
        ),
        ExecutionStatus::Failed => (
            EventType::TaskFailed,
            Severity::Error,
            result
                .error
                .clone()
                .unwrap_or_else(|| "task failed".to_string()),
        ),
        ExecutionStatus::Timeout => (
            EventType::TaskTimeout,
            Severity::Error,
            format!("task {} timed out", task.name),
        ),
        ExecutionStatus::Cancelled => (
            EventType::TaskCancelled,
            Severity::Warning,
            format!("task {} cancelled", task.name),
        ),
    };
    emit_task_event(
        &inner,
        &task,
        event_type,
        severity,
        message,
        Some(&result),
    );

    // Bad credentials pause the task rather than spamming the registry.
    let unauthorized = result
        .error
        .as_deref()
        .map(|e| e.contains("Unauthorized"))
        .unwrap_or(false);
    if unauthorized {
        warn!("Task {} failed authorisation, pausing it", task.name);
        pause_for_auth_failure(&inner, &task).await;
    }
}

async fn pause_for_auth_failure(inner: &Arc<SchedulerInner>, task: &ScheduledTask) {
    {
        let mut tasks = inner.tasks.write().await;
        if let Some(stored) = tasks.get_mut(&task.id) {
            stored.is_active = false;
            stored.next_run_at = None;
            stored.updated_at = Utc::now();
            if let Err(e) = inner.db.update_task(stored).await {
                error!("Failed to pause task {}: {}", task.id, e);
            }
        }
    }
    if let Some(handle) = inner.timers.lock().await.remove(&task.id) {
        handle.abort();
    }

    inner.bus.publish(
        Event::new(
            EventType::SystemError,
            Severity::Error,
            "scheduler",
            "Registry authorisation failed",
            format!(
                "task {} was paused after an authorisation failure",
                task.name
            ),
        )
        .with_resource("task", task.id.clone()),
    );
    inner.bus.publish(
        Event::new(
            EventType::NotificationCreated,
            Severity::Warning,
            "scheduler",
            "Task paused",
            format!(
                "Scheduled task {:?} was paused because the registry rejected its credentials. \
                 Update the credentials and resume the task.",
                task.name
            ),
        )
        .with_resource("task", task.id.clone()),
    );
}

/// Block until every declared dependency satisfies its condition, bounded
/// by the configured deadline. Returns false when abandoned.
async fn wait_for_dependencies(inner: &Arc<SchedulerInner>, deps: &TaskDependencies) -> bool {
    let deadline = tokio::time::Instant::now() + inner.options.dependency_deadline;

    loop {
        if dependencies_satisfied(inner, deps).await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline || inner.shutdown.is_cancelled() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(500)) => {}
            _ = inner.shutdown.cancelled() => return false,
        }
    }
}

async fn dependencies_satisfied(inner: &Arc<SchedulerInner>, deps: &TaskDependencies) -> bool {
    for task_id in &deps.depends_on {
        match inner.db.latest_completed_execution(task_id).await {
            Ok(Some(log)) if condition_met(deps.condition, log.status) => {}
            _ => return false,
        }
    }

    for task_type in &deps.wait_for_types {
        let candidates: Vec<String> = {
            let tasks = inner.tasks.read().await;
            tasks
                .values()
                .filter(|t| t.task_type == *task_type)
                .map(|t| t.id.clone())
                .collect()
        };
        let mut satisfied = false;
        for candidate in candidates {
            if let Ok(Some(log)) = inner.db.latest_completed_execution(&candidate).await {
                if condition_met(deps.condition, log.status) {
                    satisfied = true;
                    break;
                }
            }
        }
        if !satisfied {
            return false;
        }
    }

    true
}

fn condition_met(condition: DependencyCondition, status: ExecutionStatus) -> bool {
    match condition {
        DependencyCondition::Success => status == ExecutionStatus::Success,
        DependencyCondition::Failure => {
            matches!(status, ExecutionStatus::Failed | ExecutionStatus::Timeout)
        }
        DependencyCondition::Completion => status.is_terminal(),
    }
}

fn emit_task_event(
    inner: &Arc<SchedulerInner>,
    task: &ScheduledTask,
    event_type: EventType,
    severity: Severity,
    message: String,
    result: Option<&TaskResult>,
) {
    let mut event = Event::new(
        event_type,
        severity,
        "scheduler",
        format!("Task {}", task.name),
        message,
    )
    .with_resource("task", task.id.clone());

    if let Some(result) = result {
        event = event
            .with_data(
                "execution_id",
                serde_json::Value::String(result.execution_id.clone()),
            )
            .with_data(
                "duration_ms",
                serde_json::Value::from(result.duration.as_millis() as u64),
            )
            .with_data(
                "retry_count",
                serde_json::Value::from(result.retry_count),
            );
    }

    inner.bus.publish(event);
}

/// Periodic history retention sweep
async fn run_cleanup(inner: Arc<SchedulerInner>) {
    let mut interval = tokio::time::interval(inner.options.cleanup_interval);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let cutoff = Utc::now() - inner.options.history_retention;
                match inner.db.prune_execution_logs(cutoff).await {
                    Ok(0) => {}
                    Ok(pruned) => info!("Pruned {} execution log rows", pruned),
                    Err(e) => error!("Execution log pruning failed: {}", e),
                }
                if let Err(e) = inner.db.prune_backups(cutoff).await {
                    error!("Backup pruning failed: {}", e);
                }
                let evicted = inner.executor.evict_stale();
                if evicted > 0 {
                    debug!("Evicted {} stale executions", evicted);
                }
            }
            _ = inner.shutdown.cancelled() => break,
        }
    }
}
