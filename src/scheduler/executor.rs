//! Task executor
//!
//! Runs tasks under a counting semaphore with per-execution retry, timeout
//! and cancellation. Panics inside a task are contained and recorded as
//! failed executions; the scheduler loop never sees them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::types::{ExecutionStatus, TaskExecutionLog, TaskType};

use super::task::{Task, TaskError, TaskParameters};

/// Executor tuning knobs
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub max_concurrent_tasks: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// How long finished executions stay visible in the live map
    pub retention_grace: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 10,
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
            retention_grace: Duration::from_secs(600),
        }
    }
}

/// One run of a task, as held in the live map
#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub id: String,
    pub task_id: String,
    pub task_type: TaskType,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub progress: u8,
    pub result: Option<String>,
    pub error: Option<String>,
}

impl TaskExecution {
    /// Durable form of this execution (everything but the cancel handle)
    pub fn to_log(&self) -> TaskExecutionLog {
        TaskExecutionLog {
            id: self.id.clone(),
            task_id: self.task_id.clone(),
            status: self.status,
            started_at: self.started_at,
            completed_at: self.completed_at,
            duration_ms: self.duration_ms,
            progress: self.progress,
            result: self.result.clone(),
            error: self.error.clone(),
        }
    }
}

/// Outcome of `execute`
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub error: Option<String>,
    pub duration: Duration,
    pub retry_count: u32,
}

impl TaskResult {
    pub fn success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Execution {0} is not running")]
    NotRunning(String),
}

struct LiveExecution {
    execution: TaskExecution,
    cancel: CancellationToken,
}

/// Bounded task runner with a live-execution map
pub struct TaskExecutor {
    config: ExecutorConfig,
    semaphore: parking_lot::RwLock<Arc<Semaphore>>,
    live: Arc<parking_lot::Mutex<HashMap<String, LiveExecution>>>,
}

impl TaskExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_tasks));
        Self {
            config,
            semaphore: parking_lot::RwLock::new(semaphore),
            live: Arc::new(parking_lot::Mutex::new(HashMap::new())),
        }
    }

    /// Run a task to completion under the concurrency bound
    ///
    /// Blocks until a slot frees up (or `parent` is cancelled), then runs
    /// the retry loop. The returned result always refers to a recorded
    /// execution.
    pub async fn execute(
        &self,
        parent: CancellationToken,
        task: Arc<dyn Task>,
        task_id: &str,
        params: TaskParameters,
    ) -> TaskResult {
        let execution_id = Uuid::new_v4().to_string();
        let started = tokio::time::Instant::now();

        // Slot acquisition respects cancellation so a stopping scheduler
        // does not queue up new work.
        let semaphore = self.semaphore.read().clone();
        let permit = tokio::select! {
            permit = semaphore.acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    return self.record_unstarted(
                        execution_id,
                        task_id,
                        task.task_type(),
                        ExecutionStatus::Cancelled,
                        "executor shut down",
                    );
                }
            },
            _ = parent.cancelled() => {
                return self.record_unstarted(
                    execution_id,
                    task_id,
                    task.task_type(),
                    ExecutionStatus::Cancelled,
                    "cancelled while waiting for a slot",
                );
            }
        };

        if let Err(e) = task.validate(&params) {
            drop(permit);
            return self.record_unstarted(
                execution_id,
                task_id,
                task.task_type(),
                ExecutionStatus::Failed,
                &e.to_string(),
            );
        }

        let cancel = parent.child_token();
        {
            let mut live = self.live.lock();
            live.insert(
                execution_id.clone(),
                LiveExecution {
                    execution: TaskExecution {
                        id: execution_id.clone(),
                        task_id: task_id.to_string(),
                        task_type: task.task_type(),
                        status: ExecutionStatus::Running,
                        started_at: Utc::now(),
                        completed_at: None,
                        duration_ms: None,
                        progress: 0,
                        result: None,
                        error: None,
                    },
                    cancel: cancel.clone(),
                },
            );
        }

        let timeout = params.timeout.or_else(|| task.default_timeout());
        let deadline = timeout.map(|t| started + t);
        let max_retries = params.max_retries.unwrap_or(self.config.max_retries);
        let retry_delay = params.retry_delay.unwrap_or(self.config.retry_delay);

        let mut retry_count: u32 = 0;
        let (status, error) = loop {
            let mut attempt = tokio::spawn({
                let task = task.clone();
                let params = params.clone();
                let token = cancel.child_token();
                async move { task.execute(token, &params).await }
            });

            let outcome = match deadline {
                Some(deadline) => tokio::select! {
                    result = &mut attempt => Outcome::Finished(result),
                    _ = tokio::time::sleep_until(deadline) => {
                        attempt.abort();
                        Outcome::TimedOut
                    }
                    _ = cancel.cancelled() => {
                        attempt.abort();
                        Outcome::Cancelled
                    }
                },
                None => tokio::select! {
                    result = &mut attempt => Outcome::Finished(result),
                    _ = cancel.cancelled() => {
                        attempt.abort();
                        Outcome::Cancelled
                    }
                },
            };

            match outcome {
                Outcome::Finished(Ok(Ok(()))) => break (ExecutionStatus::Success, None),
                Outcome::Finished(Ok(Err(TaskError::Cancelled))) => {
                    break (
                        ExecutionStatus::Cancelled,
                        Some("task cancelled".to_string()),
                    )
                }
                Outcome::Finished(result) => {
                    let (message, retryable, suggested_delay) = match result {
                        Ok(Err(e)) => {
                            let retryable = e.is_retryable();
                            let suggested = e.retry_after();
                            (e.to_string(), retryable, suggested)
                        }
                        Err(join_error) if join_error.is_panic() => {
                            warn!("Task {} panicked", task_id);
                            ("task panicked".to_string(), false, None)
                        }
                        Err(_) => ("task aborted".to_string(), false, None),
                        Ok(Ok(())) => unreachable!("handled above"),
                    };

                    if cancel.is_cancelled() {
                        break (ExecutionStatus::Cancelled, Some(message));
                    }
                    if !retryable || retry_count >= max_retries {
                        break (ExecutionStatus::Failed, Some(message));
                    }

                    retry_count += 1;
                    // A rate-limited attempt waits out the server's hint.
                    let delay = suggested_delay.unwrap_or(retry_delay).max(retry_delay);
                    debug!(
                        "Task {} attempt {} failed ({}), retrying in {:?}",
                        task_id, retry_count, message, delay
                    );

                    let slept = match deadline {
                        Some(deadline) => tokio::select! {
                            _ = tokio::time::sleep(delay) => true,
                            _ = tokio::time::sleep_until(deadline) => false,
                            _ = cancel.cancelled() => false,
                        },
                        None => tokio::select! {
                            _ = tokio::time::sleep(delay) => true,
                            _ = cancel.cancelled() => false,
                        },
                    };
                    if !slept {
                        if cancel.is_cancelled() {
                            break (ExecutionStatus::Cancelled, Some(message));
                        }
                        break (ExecutionStatus::Timeout, Some("execution timed out".into()));
                    }
                }
                Outcome::TimedOut => {
                    break (
                        ExecutionStatus::Timeout,
                        Some("execution timed out".to_string()),
                    )
                }
                Outcome::Cancelled => {
                    break (
                        ExecutionStatus::Cancelled,
                        Some("execution cancelled".to_string()),
                    )
                }
            }
        };

        drop(permit);

        let duration = started.elapsed();
        self.finalize(&execution_id, status, error.clone(), duration);

        TaskResult {
            execution_id,
            status,
            error,
            duration,
            retry_count,
        }
    }

    fn record_unstarted(
        &self,
        execution_id: String,
        task_id: &str,
        task_type: TaskType,
        status: ExecutionStatus,
        error: &str,
    ) -> TaskResult {
        let now = Utc::now();
        let execution = TaskExecution {
            id: execution_id.clone(),
            task_id: task_id.to_string(),
            task_type,
            status,
            started_at: now,
            completed_at: Some(now),
            duration_ms: Some(0),
            progress: 0,
            result: None,
            error: Some(error.to_string()),
        };
        self.live.lock().insert(
            execution_id.clone(),
            LiveExecution {
                execution,
                cancel: CancellationToken::new(),
            },
        );
        self.schedule_eviction(execution_id.clone());

        TaskResult {
            execution_id,
            status,
            error: Some(error.to_string()),
            duration: Duration::ZERO,
            retry_count: 0,
        }
    }

    fn finalize(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        error: Option<String>,
        duration: Duration,
    ) {
        {
            let mut live = self.live.lock();
            if let Some(entry) = live.get_mut(execution_id) {
                entry.execution.status = status;
                entry.execution.completed_at = Some(Utc::now());
                entry.execution.duration_ms = Some(duration.as_millis() as u64);
                entry.execution.error = error;
                if status == ExecutionStatus::Success {
                    entry.execution.progress = 100;
                    entry.execution.result = Some("ok".to_string());
                }
            }
        }
        self.schedule_eviction(execution_id.to_string());
    }

    fn schedule_eviction(&self, execution_id: String) {
        let live = self.live.clone();
        let grace = self.config.retention_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            live.lock().remove(&execution_id);
        });
    }

    /// Invoke the stored cancel handle of a running execution
    pub fn cancel_task(&self, execution_id: &str) -> Result<(), ExecutorError> {
        let live = self.live.lock();
        let entry = live
            .get(execution_id)
            .ok_or_else(|| ExecutorError::ExecutionNotFound(execution_id.to_string()))?;
        if entry.execution.status != ExecutionStatus::Running {
            return Err(ExecutorError::NotRunning(execution_id.to_string()));
        }
        entry.cancel.cancel();
        Ok(())
    }

    /// Cancel everything currently running
    pub fn cancel_all(&self) {
        for entry in self.live.lock().values() {
            if entry.execution.status == ExecutionStatus::Running {
                entry.cancel.cancel();
            }
        }
    }

    /// Copies of all executions still in flight
    pub fn active_executions(&self) -> Vec<TaskExecution> {
        self.live
            .lock()
            .values()
            .filter(|e| e.execution.completed_at.is_none())
            .map(|e| e.execution.clone())
            .collect()
    }

    pub fn get_execution(&self, execution_id: &str) -> Option<TaskExecution> {
        self.live
            .lock()
            .get(execution_id)
            .map(|e| e.execution.clone())
    }

    /// Whether any execution for the task is still running
    pub fn has_active_for(&self, task_id: &str) -> bool {
        self.live
            .lock()
            .values()
            .any(|e| e.execution.task_id == task_id && e.execution.completed_at.is_none())
    }

    /// Replace the semaphore; in-flight tasks keep their existing slots
    pub fn set_concurrency_limit(&self, limit: usize) {
        *self.semaphore.write() = Arc::new(Semaphore::new(limit.max(1)));
    }

    /// Evict finished executions older than the grace period
    ///
    /// Eviction normally happens on per-execution timers; this sweep backs
    /// them up for the cleanup task.
    pub fn evict_stale(&self) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.retention_grace)
                .unwrap_or_else(|_| chrono::Duration::seconds(600));
        let mut live = self.live.lock();
        let before = live.len();
        live.retain(|_, e| match e.execution.completed_at {
            Some(completed) => completed > cutoff,
            None => true,
        });
        before - live.len()
    }
}

enum Outcome {
    Finished(Result<Result<(), TaskError>, tokio::task::JoinError>),
    TimedOut,
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

    struct ScriptedTask {
        sleep: Duration,
        fail_first: u32,
        attempts: Arc<AtomicU32>,
        running: Arc<AtomicI32>,
        peak: Arc<AtomicI32>,
        panic: bool,
        terminal_failure: bool,
    }

    impl ScriptedTask {
        fn new(sleep: Duration) -> Self {
            Self {
                sleep,
                fail_first: 0,
                attempts: Arc::new(AtomicU32::new(0)),
                running: Arc::new(AtomicI32::new(0)),
                peak: Arc::new(AtomicI32::new(0)),
                panic: false,
                terminal_failure: false,
            }
        }
    }

    #[async_trait]
    impl Task for ScriptedTask {
        fn name(&self) -> &str {
            "scripted"
        }

        fn task_type(&self) -> TaskType {
            TaskType::Cleanup
        }

        fn validate(&self, _params: &TaskParameters) -> Result<(), TaskError> {
            Ok(())
        }

        async fn execute(
            &self,
            ctx: CancellationToken,
            _params: &TaskParameters,
        ) -> Result<(), TaskError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let result = tokio::select! {
                _ = tokio::time::sleep(self.sleep) => {
                    if self.panic {
                        panic!("scripted panic");
                    }
                    if self.terminal_failure {
                        Err(TaskError::InvalidParameters("scripted".into()))
                    } else if attempt < self.fail_first {
                        Err(TaskError::Failed("scripted failure".into()))
                    } else {
                        Ok(())
                    }
                }
                _ = ctx.cancelled() => Err(TaskError::Cancelled),
            };

            self.running.fetch_sub(1, Ordering::SeqCst);
            result
        }

        fn default_timeout(&self) -> Option<Duration> {
            None
        }

        fn can_run_concurrently(&self) -> bool {
            true
        }
    }

    fn executor(limit: usize) -> TaskExecutor {
        TaskExecutor::new(ExecutorConfig {
            max_concurrent_tasks: limit,
            max_retries: 3,
            retry_delay: Duration::from_millis(10),
            retention_grace: Duration::from_secs(60),
        })
    }

    #[tokio::test]
    async fn success_on_first_attempt() {
        let exec = executor(2);
        let task = Arc::new(ScriptedTask::new(Duration::from_millis(5)));

        let result = exec
            .execute(
                CancellationToken::new(),
                task.clone(),
                "t1",
                TaskParameters::default(),
            )
            .await;

        assert!(result.success());
        assert_eq!(result.retry_count, 0);
        let stored = exec.get_execution(&result.execution_id).unwrap();
        assert_eq!(stored.status, ExecutionStatus::Success);
        assert!(stored.completed_at.is_some());
    }

    #[tokio::test]
    async fn retries_until_success() {
        let exec = executor(2);
        let mut task = ScriptedTask::new(Duration::from_millis(1));
        task.fail_first = 2;
        let task = Arc::new(task);

        let result = exec
            .execute(
                CancellationToken::new(),
                task.clone(),
                "t1",
                TaskParameters::default(),
            )
            .await;

        assert!(result.success());
        assert_eq!(result.retry_count, 2);
        assert_eq!(task.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_fail() {
        let exec = executor(2);
        let mut task = ScriptedTask::new(Duration::from_millis(1));
        task.fail_first = 100;
        let task = Arc::new(task);

        let mut params = TaskParameters::default();
        params.max_retries = Some(1);
        params.retry_delay = Some(Duration::from_millis(1));

        let result = exec
            .execute(CancellationToken::new(), task.clone(), "t1", params)
            .await;

        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.retry_count, 1);
        assert_eq!(task.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrency_bound_holds() {
        let exec = Arc::new(executor(2));
        let task = Arc::new(ScriptedTask::new(Duration::from_millis(60)));

        let started = tokio::time::Instant::now();
        let mut handles = Vec::new();
        for i in 0..3 {
            let exec = exec.clone();
            let task = task.clone();
            handles.push(tokio::spawn(async move {
                exec.execute(
                    CancellationToken::new(),
                    task,
                    &format!("t{}", i),
                    TaskParameters::default(),
                )
                .await
            }));
        }

        for handle in handles {
            assert!(handle.await.unwrap().success());
        }

        // Two run at once, the third waits for a slot.
        assert_eq!(task.peak.load(Ordering::SeqCst), 2);
        assert!(started.elapsed() >= Duration::from_millis(120));
    }

    #[tokio::test]
    async fn non_retryable_failures_skip_the_retry_loop() {
        let exec = executor(2);
        let mut task = ScriptedTask::new(Duration::from_millis(1));
        task.terminal_failure = true;
        let task = Arc::new(task);

        let result = exec
            .execute(
                CancellationToken::new(),
                task.clone(),
                "t1",
                TaskParameters::default(),
            )
            .await;

        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.retry_count, 0);
        assert_eq!(task.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeout_produces_timeout_status() {
        let exec = executor(2);
        let task = Arc::new(ScriptedTask::new(Duration::from_secs(30)));

        let mut params = TaskParameters::default();
        params.timeout = Some(Duration::from_millis(30));

        let result = exec
            .execute(CancellationToken::new(), task, "t1", params)
            .await;

        assert_eq!(result.status, ExecutionStatus::Timeout);
    }

    #[tokio::test]
    async fn cancel_task_interrupts_execution() {
        let exec = Arc::new(executor(2));
        let task = Arc::new(ScriptedTask::new(Duration::from_secs(30)));

        let exec_clone = exec.clone();
        let handle = tokio::spawn(async move {
            exec_clone
                .execute(
                    CancellationToken::new(),
                    task,
                    "t1",
                    TaskParameters::default(),
                )
                .await
        });

        // Wait for the execution to appear, then cancel it.
        let execution_id = loop {
            let active = exec.active_executions();
            if let Some(e) = active.first() {
                break e.id.clone();
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        exec.cancel_task(&execution_id).unwrap();

        let result = handle.await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_unknown_execution_errors() {
        let exec = executor(2);
        assert!(matches!(
            exec.cancel_task("nope"),
            Err(ExecutorError::ExecutionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn panic_is_contained() {
        let exec = executor(2);
        let mut task = ScriptedTask::new(Duration::from_millis(1));
        task.panic = true;
        let task = Arc::new(task);

        let mut params = TaskParameters::default();
        params.max_retries = Some(0);

        let result = exec
            .execute(CancellationToken::new(), task, "t1", params)
            .await;

        assert_eq!(result.status, ExecutionStatus::Failed);
        assert!(result.error.unwrap().contains("panicked"));

        // The executor still works afterwards.
        let ok = exec
            .execute(
                CancellationToken::new(),
                Arc::new(ScriptedTask::new(Duration::from_millis(1))),
                "t2",
                TaskParameters::default(),
            )
            .await;
        assert!(ok.success());
    }

    #[tokio::test]
    async fn has_active_for_tracks_running_tasks() {
        let exec = Arc::new(executor(2));
        let task = Arc::new(ScriptedTask::new(Duration::from_millis(80)));

        let exec_clone = exec.clone();
        let task_clone = task.clone();
        let handle = tokio::spawn(async move {
            exec_clone
                .execute(
                    CancellationToken::new(),
                    task_clone,
                    "t1",
                    TaskParameters::default(),
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(exec.has_active_for("t1"));
        assert!(!exec.has_active_for("t2"));

        handle.await.unwrap();
        assert!(!exec.has_active_for("t1"));
    }
}
