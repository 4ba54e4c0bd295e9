//! Process entry point: wires config, collaborators, the queue workers, the
//! scheduled driver, and the HTTP control plane into one long-running
//! service. Adapted from the teacher's `bin/knhk-workflow.rs`, collapsed
//! from a multi-subcommand CLI to the single `serve` shape this crate needs.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

use clap::Parser;
use std::sync::Arc;
use tracing::info;
use wp_autoheal_core::collaborators::{InMemoryAuditSink, InMemoryRelationalStore};
#[cfg(not(feature = "sled-store"))]
use wp_autoheal_core::collaborators::InMemoryKvStore;
use wp_autoheal_core::resilience::CircuitConfig;
use wp_autoheal_core::incident::Incident;
use wp_autoheal_core::observability::health::HealthStatus;
use wp_autoheal_core::{
    AppConfig, CircuitBreakerRegistry, ConfigLoader, CoreMetrics, FlappingTracker, HealthChecker,
    IdempotencyStore, IncidentDispatcher, LoopGuard, QueueDispatcher, RetentionCoordinator,
    ScheduledDriver,
};

#[derive(Parser)]
#[command(name = "wp-autoheal")]
#[command(about = "WordPress auto-healing orchestrator")]
#[command(version)]
struct Cli {
    /// Address to bind the control-plane HTTP server to.
    #[arg(long, env = "WP_HEAL_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to bind the control-plane HTTP server to.
    #[arg(long, env = "WP_HEAL_PORT", default_value_t = 8080)]
    port: u16,

    /// Path to the sled database directory (ignored unless built with the
    /// `sled-store` feature).
    #[arg(long, env = "WP_HEAL_KV_PATH", default_value = "./wp-autoheal-kv")]
    kv_path: std::path::PathBuf,
}

const RETENTION_TABLES: &[&str] = &["incidents", "audit_log", "checkpoints"];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = ConfigLoader::load_from_env()?;
    info!(service = %config.service.name, version = %config.service.version, "starting");

    let kv_store = build_kv_store(&cli, &config).await?;
    let relational_store = build_relational_store().await?;
    let audit: Arc<dyn wp_autoheal_core::collaborators::AuditSink> = Arc::new(InMemoryAuditSink::new());

    let idempotency = Arc::new(IdempotencyStore::new(kv_store, "wp-heal"));
    let loop_guard = Arc::new(LoopGuard::new());
    let circuit = Arc::new(CircuitBreakerRegistry::new(CircuitConfig {
        failure_threshold: config.circuit.failure_threshold,
        recovery_timeout: std::time::Duration::from_millis(config.circuit.recovery_timeout_ms),
        monitoring_period: std::time::Duration::from_millis(config.circuit.monitoring_period_ms),
    }));
    let flapping = Arc::new(FlappingTracker::new(config.flapping));
    let queue = Arc::new(QueueDispatcher::initialize_queues());
    let retention = Arc::new(RetentionCoordinator::new(relational_store, audit.clone()));

    let incidents = Arc::new(IncidentDispatcher::new(
        circuit.clone(),
        flapping.clone(),
        idempotency.clone(),
        loop_guard.clone(),
        queue.clone(),
        audit,
    ));

    let health = Arc::new(HealthChecker::new(vec!["queue", "idempotency_store"]));
    health.update_component("queue", HealthStatus::Healthy, None);
    health.update_component("idempotency_store", HealthStatus::Healthy, None);
    let metrics = Arc::new(CoreMetrics::new());

    spawn_incident_worker(queue.clone(), incidents.clone(), metrics.clone());
    spawn_housekeeping_workers(queue.clone(), metrics.clone());

    let scheduler = Arc::new(ScheduledDriver::new(queue.clone())?);
    scheduler.spawn(std::time::Duration::from_secs(30));

    let state = wp_autoheal_core::AppState {
        incidents,
        queue,
        retention,
        flapping,
        health,
        metrics,
        retention_tables: RETENTION_TABLES.iter().map(|s| s.to_string()).collect(),
    };
    let app = wp_autoheal_core::api::router(state);

    let addr = format!("{}:{}", cli.host, cli.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "control plane listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn build_kv_store(
    cli: &Cli,
    _config: &AppConfig,
) -> anyhow::Result<Arc<dyn wp_autoheal_core::collaborators::KvStore>> {
    #[cfg(feature = "redis-store")]
    {
        if let Ok(url) = std::env::var("WP_HEAL_REDIS_URL") {
            let store = wp_autoheal_core::collaborators::RedisKvStore::connect(&url).await?;
            return Ok(Arc::new(store));
        }
    }
    #[cfg(feature = "sled-store")]
    {
        let store = wp_autoheal_core::collaborators::SledKvStore::open(&cli.kv_path)?;
        Ok(Arc::new(store))
    }
    #[cfg(not(feature = "sled-store"))]
    {
        let _ = &cli.kv_path;
        Ok(Arc::new(InMemoryKvStore::new()))
    }
}

async fn build_relational_store(
) -> anyhow::Result<Arc<dyn wp_autoheal_core::collaborators::RelationalStore>> {
    #[cfg(feature = "postgres-store")]
    {
        if let Ok(url) = std::env::var("WP_HEAL_DATABASE_URL") {
            let store = wp_autoheal_core::collaborators::PostgresRelationalStore::connect(&url).await?;
            return Ok(Arc::new(store));
        }
    }
    Ok(Arc::new(InMemoryRelationalStore::new()))
}

/// Drains `incident-processing`, re-hydrating each job's payload back into
/// an [`Incident`] and re-entering the dispatcher — the self-enqueue chain
/// `IncidentDispatcher::process` sets up for each non-terminal transition.
fn spawn_incident_worker(
    queue: Arc<QueueDispatcher>,
    incidents: Arc<IncidentDispatcher>,
    metrics: Arc<CoreMetrics>,
) {
    tokio::spawn(async move {
        let result = queue
            .run_worker("incident-processing", move |job| {
                let incidents = incidents.clone();
                let metrics = metrics.clone();
                async move {
                    let incident: Incident = serde_json::from_value(job.payload)?;
                    let outcome = incidents.process(incident).await?;
                    metrics.incident_processed();
                    if outcome.should_escalate {
                        metrics.incident_escalated();
                    }
                    Ok(())
                }
            })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "incident-processing worker exited");
        }
    });
}

/// Drains `data-retention` and `health-checks`. Both are housekeeping jobs
/// fired by the scheduled driver or the HTTP API; business rules for what a
/// health check actually probes are out of scope here (§1 Non-goals), so the
/// worker only accounts for the job and marks it done.
fn spawn_housekeeping_workers(queue: Arc<QueueDispatcher>, metrics: Arc<CoreMetrics>) {
    for queue_name in ["data-retention", "health-checks"] {
        let queue = queue.clone();
        let metrics = metrics.clone();
        tokio::spawn(async move {
            let result = queue
                .run_worker(queue_name, move |job| {
                    let metrics = metrics.clone();
                    async move {
                        info!(job_id = %job.id, queue = %job.queue, "housekeeping job handled");
                        metrics.job_completed();
                        Ok(())
                    }
                })
                .await;
            if let Err(e) = result {
                tracing::error!(queue = queue_name, error = %e, "housekeeping worker exited");
            }
        });
    }
}
