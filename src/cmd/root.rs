//! Daemon bootstrap: wire the subsystems together and run until shutdown

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use drydock::config::Configuration;
use drydock::database::Database;
use drydock::events::{Event, EventBus, EventType, InMemoryEventStore, Severity};
use drydock::gateway::{GatewayConfig, SessionManager};
use drydock::orchestrator::{
    MaintenanceWindow, NoopTrafficSwitch, Orchestrator, OrchestratorConfig, PullPolicy,
};
use drydock::resolver::{SecretSealer, UpdateResolver};
use drydock::runtime::{ContainerRuntime, DockerRuntime};
use drydock::scheduler::tasks::{register_builtin, BuiltinTaskDeps};
use drydock::scheduler::{
    resolve_timezone, ExecutorConfig, Scheduler, SchedulerOptions, TaskExecutor, TaskRegistry,
};

/// Grace period for draining workers on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub async fn run(config_path: &str) -> Result<()> {
    let config = Configuration::load(config_path)?;

    let db = Arc::new(
        Database::open(&config.database.path)
            .with_context(|| format!("opening database at {}", config.database.path))?,
    );

    let bus = EventBus::with_store(Arc::new(InMemoryEventStore::default()));

    let runtime: Arc<dyn ContainerRuntime> =
        Arc::new(DockerRuntime::connect(&config.runtime).context("connecting to the runtime")?);
    if let Err(e) = runtime.ping().await {
        warn!("Runtime not reachable yet: {}", e);
    }

    let resolver = Arc::new(UpdateResolver::new(
        db.clone(),
        SecretSealer::new(&config.auth.jwt_secret),
    ));

    let orchestrator = Arc::new(Orchestrator::new(
        orchestrator_config(&config),
        runtime.clone(),
        db.clone(),
        bus.clone(),
        Arc::new(NoopTrafficSwitch),
    ));

    let executor = Arc::new(TaskExecutor::new(ExecutorConfig {
        max_concurrent_tasks: config.scheduler.max_concurrent_tasks,
        max_retries: config.scheduler.max_retries,
        retry_delay: Duration::from_secs(config.scheduler.retry_delay_seconds),
        retention_grace: Duration::from_secs(600),
    }));

    let registry = Arc::new(TaskRegistry::new());
    register_builtin(
        &registry,
        BuiltinTaskDeps {
            db: db.clone(),
            resolver: resolver.clone(),
            orchestrator: orchestrator.clone(),
            runtime: runtime.clone(),
            executor: executor.clone(),
            bus: bus.clone(),
            image_check: config.image_check.clone(),
            history_retention_days: config.scheduler.history_retention_days,
        },
    )
    .context("registering built-in tasks")?;

    let scheduler = Scheduler::new(
        SchedulerOptions {
            cleanup_interval: Duration::from_secs(config.scheduler.cleanup_interval_seconds),
            history_retention: chrono::Duration::days(
                config.scheduler.history_retention_days as i64,
            ),
            timezone: resolve_timezone(&config.scheduler.timezone),
            dependency_deadline: Duration::from_secs(600),
        },
        db.clone(),
        registry,
        executor,
        bus.clone(),
    );
    scheduler.start().await.context("starting the scheduler")?;

    let manager = Arc::new(SessionManager::new(
        bus.clone(),
        GatewayConfig::default(),
        &config.auth.jwt_secret,
    ));
    let session_cleanup = manager.spawn_cleanup(Duration::from_secs(
        config.scheduler.cleanup_interval_seconds,
    ));

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.app.port))
        .await
        .with_context(|| format!("binding port {}", config.app.port))?;
    info!("Gateway listening on port {}", config.app.port);

    bus.publish(Event::new(
        EventType::SystemStartup,
        Severity::Info,
        "daemon",
        "Daemon started",
        format!("drydock v{} is up", env!("CARGO_PKG_VERSION")),
    ));

    axum::serve(listener, manager.router())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("gateway server failed")?;

    info!("Shutting down");
    bus.publish(Event::new(
        EventType::SystemShutdown,
        Severity::Info,
        "daemon",
        "Daemon stopping",
        "shutdown signal received",
    ));

    scheduler.stop(SHUTDOWN_GRACE).await;
    session_cleanup.abort();
    manager.shutdown();
    bus.close();

    Ok(())
}

fn orchestrator_config(config: &Configuration) -> OrchestratorConfig {
    let section = &config.orchestrator;
    let pull_policy = section.pull_policy.parse::<PullPolicy>().unwrap_or_else(|e| {
        error!("{}; using always", e);
        PullPolicy::Always
    });

    OrchestratorConfig {
        stop_grace: Duration::from_secs(section.stop_grace_seconds),
        health_check_timeout: Duration::from_secs(section.health_check_timeout_seconds),
        health_check_retries: section.health_check_retries,
        max_concurrent: section.max_concurrent,
        windows: section
            .maintenance_windows
            .iter()
            .map(|w| MaintenanceWindow {
                start_time: w.start_time.clone(),
                end_time: w.end_time.clone(),
                days_of_week: w.days_of_week.clone(),
                timezone: w.timezone.clone(),
            })
            .collect(),
        default_pull_policy: pull_policy,
        pre_update_backup: section.pre_update_backup,
        rollback_on_failure: section.rollback_on_failure,
        ..Default::default()
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
}
