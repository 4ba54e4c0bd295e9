//! End-to-end tests across the incident remediation pipeline: flapping,
//! idempotency, bounded-loop accounting, and the queue dispatcher wired
//! together the way `bin/wp-autoheal.rs` wires them, rather than exercised
//! in isolation as the per-module unit tests do.

use async_trait::async_trait;
use std::sync::Arc;
use wp_autoheal_core::collaborators::{
    InMemoryAuditSink, InMemoryKvStore, InMemoryRelationalStore, RelationalStore,
};
use wp_autoheal_core::config::{CircuitConfig as AppCircuitConfig, FlappingConfig};
use wp_autoheal_core::incident::{Incident, IncidentState, PhaseExecutor, PhaseResult};
use wp_autoheal_core::resilience::CircuitConfig;
use wp_autoheal_core::retention::PurgeRequest;
use wp_autoheal_core::{
    CircuitBreakerRegistry, FlappingTracker, IdempotencyStore, IncidentDispatcher, LoopGuard,
    QueueDispatcher, RetentionCoordinator,
};

/// Always-succeeds phase executor, so tests exercise the success-path state
/// mutation in `IncidentDispatcher::process` rather than the no-executor
/// failure fallback.
struct AlwaysSucceeds;

#[async_trait]
impl PhaseExecutor for AlwaysSucceeds {
    async fn execute(&self, _incident: &Incident) -> wp_autoheal_core::error::HealResult<PhaseResult> {
        Ok(PhaseResult { success: true, data: None, error: None })
    }
}

fn register_all_executors(dispatcher: &mut IncidentDispatcher) {
    use IncidentState::*;
    for state in [New, Discovery, Baseline, Backup, Observability, FixAttempt, Verify, Rollback] {
        dispatcher.register_executor(state, Arc::new(AlwaysSucceeds));
    }
}

fn app_circuit_config(cfg: AppCircuitConfig) -> CircuitConfig {
    CircuitConfig {
        failure_threshold: cfg.failure_threshold,
        recovery_timeout: std::time::Duration::from_millis(cfg.recovery_timeout_ms),
        monitoring_period: std::time::Duration::from_millis(cfg.monitoring_period_ms),
    }
}

fn make_dispatcher(flapping_cfg: FlappingConfig) -> (Arc<IncidentDispatcher>, Arc<QueueDispatcher>) {
    let kv = Arc::new(InMemoryKvStore::new());
    let idempotency = Arc::new(IdempotencyStore::new(kv, "test"));
    let loop_guard = Arc::new(LoopGuard::new());
    let circuit = Arc::new(CircuitBreakerRegistry::new(app_circuit_config(
        AppCircuitConfig {
            failure_threshold: 5,
            recovery_timeout_ms: 60_000,
            monitoring_period_ms: 300_000,
        },
    )));
    let flapping = Arc::new(FlappingTracker::new(flapping_cfg));
    let queue = Arc::new(QueueDispatcher::initialize_queues());
    let audit = Arc::new(InMemoryAuditSink::new());
    let dispatcher = Arc::new(IncidentDispatcher::new(
        circuit, flapping, idempotency, loop_guard, queue.clone(), audit,
    ));
    (dispatcher, queue)
}

/// Like `make_dispatcher`, but with a phase executor registered for every
/// non-terminal state so `process` takes the success-path mutation branch
/// instead of falling back to the no-executor failure path.
fn make_dispatcher_with_executors(
    flapping_cfg: FlappingConfig,
) -> (Arc<IncidentDispatcher>, Arc<QueueDispatcher>) {
    let kv = Arc::new(InMemoryKvStore::new());
    let idempotency = Arc::new(IdempotencyStore::new(kv, "test"));
    let loop_guard = Arc::new(LoopGuard::new());
    let circuit = Arc::new(CircuitBreakerRegistry::new(app_circuit_config(
        AppCircuitConfig {
            failure_threshold: 5,
            recovery_timeout_ms: 60_000,
            monitoring_period_ms: 300_000,
        },
    )));
    let flapping = Arc::new(FlappingTracker::new(flapping_cfg));
    let queue = Arc::new(QueueDispatcher::initialize_queues());
    let audit = Arc::new(InMemoryAuditSink::new());
    let mut dispatcher = IncidentDispatcher::new(circuit, flapping, idempotency, loop_guard, queue.clone(), audit);
    register_all_executors(&mut dispatcher);
    (Arc::new(dispatcher), queue)
}

fn new_incident(site_id: &str) -> Incident {
    Incident {
        id: uuid::Uuid::new_v4().to_string(),
        site_id: site_id.to_string(),
        server_id: "server-1".to_string(),
        state: IncidentState::New,
        fix_attempts: 0,
        max_fix_attempts: 15,
        payload: serde_json::json!({ "triggerType": "health-check-failure" }),
        metadata: serde_json::json!({}),
        correlation_id: uuid::Uuid::new_v4().to_string(),
    }
}

#[tokio::test]
async fn fresh_incident_advances_one_step_and_self_enqueues() {
    let (dispatcher, queue) = make_dispatcher(FlappingConfig::default());

    let outcome = dispatcher.process(new_incident("site-1")).await.unwrap();

    assert_eq!(outcome.from_state, IncidentState::New);
    assert_eq!(outcome.to_state, Some(IncidentState::Discovery));
    assert!(outcome.enqueued_job_id.is_some());

    let stats = queue.stats("incident-processing").await.unwrap();
    assert_eq!(stats.waiting + stats.delayed, 1);
}

#[tokio::test]
async fn self_enqueued_successor_advances_rather_than_replaying_as_cached() {
    let (dispatcher, _queue) = make_dispatcher_with_executors(FlappingConfig::default());
    let incident = new_incident("site-advance");

    let first = dispatcher.process(incident.clone()).await.unwrap();
    assert_eq!(first.from_state, IncidentState::New);
    assert_eq!(first.to_state, Some(IncidentState::Discovery));
    assert!(!first.cached);

    // Re-entering `process` with the same incident id, moved to the state
    // the successful transition just produced — exactly the shape of the
    // job `process` self-enqueues onto `incident-processing` — must
    // advance the machine, not be swallowed as an idempotent replay of the
    // NEW -> DISCOVERY transition just stored.
    let mut successor = incident;
    successor.state = IncidentState::Discovery;
    let second = dispatcher.process(successor).await.unwrap();
    assert!(!second.cached);
    assert_eq!(second.from_state, IncidentState::Discovery);
    assert_eq!(second.to_state, Some(IncidentState::Baseline));
}

#[tokio::test]
async fn replaying_the_same_job_is_idempotent() {
    let (dispatcher, _queue) = make_dispatcher(FlappingConfig::default());
    let incident = new_incident("site-2");

    let first = dispatcher.process(incident.clone()).await.unwrap();
    let replay = dispatcher.process(incident).await.unwrap();

    assert!(!first.cached);
    assert!(replay.cached);
    assert_eq!(replay.to_state, None);
}

#[tokio::test]
async fn flapping_site_is_denied_after_cooldown_trips() {
    let flapping_cfg = FlappingConfig {
        cooldown_window_ms: 60_000,
        max_incidents_per_window: 2,
        escalation_threshold: 3,
    };
    let (dispatcher, _queue) = make_dispatcher(flapping_cfg);

    for _ in 0..2 {
        let outcome = dispatcher.process(new_incident("flapping-site")).await.unwrap();
        assert!(outcome.to_state.is_some(), "incident within the window should be admitted");
    }

    let denied = dispatcher.process(new_incident("flapping-site")).await.unwrap();
    assert!(denied.to_state.is_none());
    assert!(denied.reason.is_some());
    assert!(denied.cooldown_until.is_some());
}

#[tokio::test]
async fn retention_purge_deletes_rows_older_than_cutoff_and_records_audit() {
    let store = Arc::new(InMemoryRelationalStore::new());
    let now = chrono::Utc::now();
    store
        .seed(
            "incidents",
            vec![
                wp_autoheal_core::collaborators::EntityRow {
                    id: "old-1".into(),
                    created_at: now - chrono::Duration::days(10),
                },
                wp_autoheal_core::collaborators::EntityRow {
                    id: "recent-1".into(),
                    created_at: now,
                },
            ],
        )
        .await;
    let audit = Arc::new(InMemoryAuditSink::new());
    let coordinator = RetentionCoordinator::new(store.clone(), audit);

    let request = PurgeRequest {
        retention_days: 3,
        table_name: None,
        scope: "integration-test".to_string(),
        max_records: 1_000,
        dry_run: false,
        cutoff_date: None,
        create_backup: true,
        verify_integrity: false,
        reason: "scheduled".to_string(),
        confirmed: true,
    };

    let results = coordinator
        .purge(&request, &["incidents".to_string()], "policy-1")
        .await
        .unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].records_affected, 1);
    assert_eq!(store.total_count("incidents").await.unwrap(), 1);
    assert_eq!(store.purge_audit_rows().await.len(), 1);
}
