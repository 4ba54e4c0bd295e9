use crate::flapping::FlappingTracker;
use crate::incident::IncidentDispatcher;
use crate::observability::{CoreMetrics, HealthChecker};
use crate::queue::QueueDispatcher;
use crate::retention::RetentionCoordinator;
use std::sync::Arc;

/// Shared state for the control-plane router (§6.1). Holds an `Arc` to each
/// subsystem the HTTP handlers drive directly — no service-layer indirection.
#[derive(Clone)]
pub struct AppState {
    pub incidents: Arc<IncidentDispatcher>,
    pub queue: Arc<QueueDispatcher>,
    pub retention: Arc<RetentionCoordinator>,
    pub flapping: Arc<FlappingTracker>,
    pub health: Arc<HealthChecker>,
    pub metrics: Arc<CoreMetrics>,
    /// Entity tables the retention coordinator sweeps when a purge request
    /// doesn't name one explicitly (§4.8, §6.4).
    pub retention_tables: Vec<String>,
}
