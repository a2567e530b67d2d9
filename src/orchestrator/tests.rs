use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::database::Database;
use crate::events::{EventBus, EventFilter, EventType, Severity};
use crate::runtime::mock::MockRuntime;
use crate::types::{ContainerRecord, ContainerStatus, ImageVersion, UpdatePolicy, UpdateStatus};

use super::testing::RecordingSwitch;
use super::*;

struct Fixture {
    orchestrator: Orchestrator,
    runtime: Arc<MockRuntime>,
    db: Arc<Database>,
    bus: EventBus,
}

fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        health_poll_interval: Duration::from_millis(5),
        health_check_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

fn fixture_with(config: OrchestratorConfig, traffic: Arc<dyn TrafficSwitch>) -> Fixture {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let runtime = Arc::new(MockRuntime::new());
    let bus = EventBus::new();
    let orchestrator = Orchestrator::new(
        config,
        runtime.clone(),
        db.clone(),
        bus.clone(),
        traffic,
    );
    Fixture {
        orchestrator,
        runtime,
        db,
        bus,
    }
}

fn fixture() -> Fixture {
    fixture_with(fast_config(), Arc::new(NoopTrafficSwitch))
}

async fn seed_container(f: &Fixture, id: &str, name: &str, policy: UpdatePolicy) {
    let record = ContainerRecord {
        id: id.to_string(),
        name: name.to_string(),
        image: "nginx".into(),
        tag: "1.24".into(),
        container_id: Some(format!("c-{}", name)),
        status: ContainerStatus::Running,
        update_policy: policy,
        registry_ref: None,
        config: json!({"labels": {"app": "web"}}),
        created_by: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    f.db.insert_container(&record).await.unwrap();
    f.runtime
        .add_container(&format!("c-{}", name), name, "nginx:1.24", ContainerStatus::Running);
}

async fn seed_update_available(f: &Fixture) {
    f.db.upsert_image_version(&ImageVersion {
        image_name: "library/nginx".into(),
        tag: "1.24".into(),
        registry_url: "docker.io".into(),
        digest: "sha256:bbb".into(),
        size_bytes: None,
        published_at: None,
        architecture: None,
        os: None,
        metadata: json!({"update_available": true, "previous_digest": "sha256:aaa"}),
        checked_at: Utc::now(),
        is_latest: true,
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn recreate_replaces_the_container() {
    let f = fixture();
    seed_container(&f, "web", "web", UpdatePolicy::Auto).await;
    seed_update_available(&f).await;

    let result = f
        .orchestrator
        .update_container(
            CancellationToken::new(),
            "web",
            UpdateRequest {
                trigger: crate::types::UpdateTrigger::Auto,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(result.status, UpdateStatus::Success);
    assert_eq!(result.final_phase, UpdatePhase::Succeeded);

    // The old container was stopped and removed, a new one started.
    let ops = f.runtime.ops();
    let pull = ops.iter().position(|o| o == "pull nginx:1.24").unwrap();
    let stop = ops.iter().position(|o| o == "stop c-web").unwrap();
    let remove = ops.iter().position(|o| o == "remove c-web").unwrap();
    let create = ops
        .iter()
        .position(|o| o.starts_with("create web"))
        .unwrap();
    assert!(pull < stop && stop < remove && remove < create);

    let record = f.db.get_container("web").await.unwrap().unwrap();
    assert_ne!(record.container_id.as_deref(), Some("c-web"));
    assert_eq!(record.status, ContainerStatus::Running);

    let history = f.db.get_update_history(&result.history_id).await.unwrap().unwrap();
    assert_eq!(history.status, UpdateStatus::Success);
    assert!(history.completed_at.is_some());
    assert!(history.duration_seconds.unwrap() >= 0);
    assert!(history.backup_created);

    // Running digest now matches the registry: the pending flag clears.
    let version = f
        .db
        .get_image_version("library/nginx", "1.24", "docker.io")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(version.metadata["update_available"], false);
}

#[tokio::test]
async fn health_failure_rolls_back() {
    let f = fixture();
    seed_container(&f, "web", "web", UpdatePolicy::Auto).await;
    seed_update_available(&f).await;

    let mut sub = f.bus.subscribe(EventFilter::any());

    // Three unhealthy probes exhaust the gate's retries.
    f.runtime.script_health(vec![false, false, false]);

    let result = f
        .orchestrator
        .update_container(
            CancellationToken::new(),
            "web",
            UpdateRequest {
                trigger: crate::types::UpdateTrigger::Auto,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(result.status, UpdateStatus::Rollback);
    assert_eq!(result.final_phase, UpdatePhase::RolledBack);

    let history = f.db.get_update_history(&result.history_id).await.unwrap().unwrap();
    assert_eq!(history.status, UpdateStatus::Rollback);
    assert!(history.rollback_available);
    assert!(history.backup.is_some());

    // The container runs again from the snapshot image.
    let record = f.db.get_container("web").await.unwrap().unwrap();
    assert_eq!(record.status, ContainerStatus::Running);
    let restored = f
        .runtime
        .container(record.container_id.as_deref().unwrap())
        .unwrap();
    assert_eq!(restored.image, "nginx:1.24");
    assert_eq!(restored.status, ContainerStatus::Running);

    // container.updated (info) precedes image.update_failed (error).
    let mut seen = Vec::new();
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_millis(50), sub.recv()).await
    {
        seen.push(event);
    }
    let updated = seen
        .iter()
        .position(|e| e.event_type == EventType::ContainerUpdated)
        .unwrap();
    let failed = seen
        .iter()
        .position(|e| e.event_type == EventType::ImageUpdateFailed)
        .unwrap();
    assert!(updated < failed);
    assert_eq!(seen[updated].severity, Severity::Info);
    assert_eq!(seen[failed].severity, Severity::Error);
}

#[tokio::test]
async fn cancelled_context_cancels_the_run() {
    let f = fixture();
    seed_container(&f, "web", "web", UpdatePolicy::Auto).await;
    seed_update_available(&f).await;

    let ctx = CancellationToken::new();
    ctx.cancel();

    let result = f
        .orchestrator
        .update_container(ctx, "web", UpdateRequest::default())
        .await
        .unwrap();

    assert_eq!(result.status, UpdateStatus::Cancelled);
    let history = f.db.get_update_history(&result.history_id).await.unwrap().unwrap();
    assert_eq!(history.status, UpdateStatus::Cancelled);
    assert!(history.completed_at.is_some());
}

#[tokio::test]
async fn maintenance_window_gates_automatic_triggers() {
    let mut config = fast_config();
    // A window that never admits anything.
    config.windows = vec![MaintenanceWindow {
        start_time: "00:00".into(),
        end_time: "00:00".into(),
        days_of_week: Vec::new(),
        timezone: "UTC".into(),
    }];
    let f = fixture_with(config, Arc::new(NoopTrafficSwitch));
    seed_container(&f, "web", "web", UpdatePolicy::Auto).await;
    seed_update_available(&f).await;

    let err = f
        .orchestrator
        .update_container(
            CancellationToken::new(),
            "web",
            UpdateRequest {
                trigger: crate::types::UpdateTrigger::Auto,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::NotEligible(_)));

    // Manual triggers bypass the window.
    let result = f
        .orchestrator
        .update_container(CancellationToken::new(), "web", UpdateRequest::default())
        .await
        .unwrap();
    assert_eq!(result.status, UpdateStatus::Success);
}

#[tokio::test]
async fn disabled_policy_refuses_all_triggers() {
    let f = fixture();
    seed_container(&f, "web", "web", UpdatePolicy::Disabled).await;
    seed_update_available(&f).await;

    let err = f
        .orchestrator
        .update_container(CancellationToken::new(), "web", UpdateRequest::default())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::NotEligible(_)));
}

#[tokio::test]
async fn no_recorded_update_requires_force() {
    let f = fixture();
    seed_container(&f, "web", "web", UpdatePolicy::Auto).await;
    // No image version row at all.

    let err = f
        .orchestrator
        .update_container(CancellationToken::new(), "web", UpdateRequest::default())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::NotEligible(_)));

    let result = f
        .orchestrator
        .update_container(
            CancellationToken::new(),
            "web",
            UpdateRequest {
                force_update: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(result.status, UpdateStatus::Success);
}

#[tokio::test]
async fn blue_green_swaps_then_removes_old() {
    let switch = Arc::new(RecordingSwitch::default());
    let f = fixture_with(fast_config(), switch.clone());
    seed_container(&f, "web", "web", UpdatePolicy::Auto).await;
    seed_update_available(&f).await;

    let result = f
        .orchestrator
        .update_container(
            CancellationToken::new(),
            "web",
            UpdateRequest {
                strategy: crate::types::UpdateStrategy::BlueGreen,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(result.status, UpdateStatus::Success);

    let ops = f.runtime.ops();
    assert!(ops.iter().any(|o| o.starts_with("create web-green")));
    // The old container goes away only after the swap.
    let remove = ops.iter().position(|o| o == "remove c-web").unwrap();
    let create = ops
        .iter()
        .position(|o| o.starts_with("create web-green"))
        .unwrap();
    assert!(create < remove);

    let calls = switch.calls.lock();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].starts_with("swap c-web -> "));
}

#[tokio::test]
async fn blue_green_health_failure_keeps_old_container() {
    let switch = Arc::new(RecordingSwitch::default());
    let f = fixture_with(fast_config(), switch.clone());
    seed_container(&f, "web", "web", UpdatePolicy::Auto).await;
    seed_update_available(&f).await;

    f.runtime.script_health(vec![false, false, false]);

    let result = f
        .orchestrator
        .update_container(
            CancellationToken::new(),
            "web",
            UpdateRequest {
                strategy: crate::types::UpdateStrategy::BlueGreen,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // No rollback needed: the shadow is discarded, the original untouched.
    assert_eq!(result.status, UpdateStatus::Failed);
    assert!(switch.calls.lock().is_empty());
    let old = f.runtime.container("c-web").unwrap();
    assert_eq!(old.status, ContainerStatus::Running);
    assert!(f.runtime.container_by_name("web-green").is_none());

    // And no rollback was attempted: exactly one create (the shadow), no
    // rollback trail in the history row.
    let creates = f
        .runtime
        .ops()
        .iter()
        .filter(|o| o.starts_with("create "))
        .count();
    assert_eq!(creates, 1);
    let history = f.db.get_update_history(&result.history_id).await.unwrap().unwrap();
    assert!(!history.logs.iter().any(|l| l.contains("rolling back")));
    assert!(!history
        .error_message
        .as_deref()
        .unwrap_or_default()
        .contains("rollback"));
}

#[tokio::test]
async fn canary_weight_failure_discards_shadow_without_rollback() {
    let switch = Arc::new(RecordingSwitch {
        fail_weight: true,
        ..Default::default()
    });
    let f = fixture_with(fast_config(), switch.clone());
    seed_container(&f, "web", "web", UpdatePolicy::Auto).await;
    seed_update_available(&f).await;

    let result = f
        .orchestrator
        .update_container(
            CancellationToken::new(),
            "web",
            UpdateRequest {
                strategy: crate::types::UpdateStrategy::Canary,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(result.status, UpdateStatus::Failed);

    // The original keeps running and the shadow is gone.
    let old = f.runtime.container("c-web").unwrap();
    assert_eq!(old.status, ContainerStatus::Running);
    assert!(f.runtime.container_by_name("web-canary").is_none());

    // One create only (the shadow); nothing was recreated on the way out.
    let creates = f
        .runtime
        .ops()
        .iter()
        .filter(|o| o.starts_with("create "))
        .count();
    assert_eq!(creates, 1);
    let history = f.db.get_update_history(&result.history_id).await.unwrap().unwrap();
    assert!(!history.logs.iter().any(|l| l.contains("rolling back")));
}

#[tokio::test]
async fn incapable_switch_falls_back_to_recreate() {
    let f = fixture();
    seed_container(&f, "web", "web", UpdatePolicy::Auto).await;
    seed_update_available(&f).await;

    let mut sub = f.bus.subscribe(EventFilter::for_types(vec![EventType::SystemError]));

    let result = f
        .orchestrator
        .update_container(
            CancellationToken::new(),
            "web",
            UpdateRequest {
                strategy: crate::types::UpdateStrategy::BlueGreen,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(result.status, UpdateStatus::Success);
    // Recreate path: no shadow container was made.
    assert!(!f.runtime.ops().iter().any(|o| o.contains("web-green")));

    let warning = tokio::time::timeout(Duration::from_millis(100), sub.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(warning.severity, Severity::Warning);
    assert!(warning.message.contains("recreate"));
}

#[tokio::test]
async fn canary_leaves_both_running_at_weight() {
    let switch = Arc::new(RecordingSwitch::default());
    let f = fixture_with(fast_config(), switch.clone());
    seed_container(&f, "web", "web", UpdatePolicy::Auto).await;
    seed_update_available(&f).await;

    let result = f
        .orchestrator
        .update_container(
            CancellationToken::new(),
            "web",
            UpdateRequest {
                strategy: crate::types::UpdateStrategy::Canary,
                canary_weight: 25,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(result.status, UpdateStatus::Success);
    // The original keeps running alongside the canary.
    assert!(f.runtime.container("c-web").is_some());
    assert!(f.runtime.container_by_name("web-canary").is_some());

    let calls = switch.calls.lock();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].ends_with("= 25"));
}

#[tokio::test]
async fn rolling_group_advances_member_by_member() {
    let f = fixture();
    seed_container(&f, "w1", "w1", UpdatePolicy::Auto).await;
    seed_container(&f, "w2", "w2", UpdatePolicy::Auto).await;
    seed_update_available(&f).await;

    let results = f
        .orchestrator
        .update_group(
            CancellationToken::new(),
            "app",
            UpdateRequest {
                trigger: crate::types::UpdateTrigger::Schedule,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.success()));
}

#[tokio::test]
async fn rolling_group_halts_on_failure() {
    let f = fixture();
    seed_container(&f, "w1", "w1", UpdatePolicy::Auto).await;
    seed_container(&f, "w2", "w2", UpdatePolicy::Auto).await;
    seed_update_available(&f).await;

    // First member fails health three times and rolls back; the rollout
    // must not touch the second member.
    f.runtime.script_health(vec![false, false, false]);
    // Rollback disabled so the failure is terminal and cheap to assert.
    let results = f
        .orchestrator
        .update_group(
            CancellationToken::new(),
            "app",
            UpdateRequest {
                trigger: crate::types::UpdateTrigger::Schedule,
                rollback_on_failure: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, UpdateStatus::Failed);
}
