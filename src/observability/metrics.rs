//! In-process counters for the incident/queue/retention operations.
//!
//! Adapted from the teacher's `MetricsCollector`, but backed by real atomics
//! instead of `record_*` no-op stubs — exposed as a snapshot for a future
//! `/metrics` route rather than wired to an external metrics backend.

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counters, cheap to share behind an `Arc`.
#[derive(Default)]
pub struct CoreMetrics {
    incidents_processed: AtomicU64,
    incidents_escalated: AtomicU64,
    phase_failures: AtomicU64,
    jobs_enqueued: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    circuit_opens: AtomicU64,
    purges_executed: AtomicU64,
    records_purged: AtomicU64,
}

/// Point-in-time snapshot, serializable for a status endpoint.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct MetricsSnapshot {
    pub incidents_processed: u64,
    pub incidents_escalated: u64,
    pub phase_failures: u64,
    pub jobs_enqueued: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub circuit_opens: u64,
    pub purges_executed: u64,
    pub records_purged: u64,
}

impl CoreMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incident_processed(&self) {
        self.incidents_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incident_escalated(&self) {
        self.incidents_escalated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn phase_failure(&self) {
        self.phase_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_enqueued(&self) {
        self.jobs_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_completed(&self) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn circuit_opened(&self) {
        self.circuit_opens.fetch_add(1, Ordering::Relaxed);
    }

    pub fn purge_executed(&self, records: u64) {
        self.purges_executed.fetch_add(1, Ordering::Relaxed);
        self.records_purged.fetch_add(records, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            incidents_processed: self.incidents_processed.load(Ordering::Relaxed),
            incidents_escalated: self.incidents_escalated.load(Ordering::Relaxed),
            phase_failures: self.phase_failures.load(Ordering::Relaxed),
            jobs_enqueued: self.jobs_enqueued.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            circuit_opens: self.circuit_opens.load(Ordering::Relaxed),
            purges_executed: self.purges_executed.load(Ordering::Relaxed),
            records_purged: self.records_purged.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_independently() {
        let metrics = CoreMetrics::new();
        metrics.incident_processed();
        metrics.incident_processed();
        metrics.incident_escalated();
        metrics.purge_executed(42);

        let snap = metrics.snapshot();
        assert_eq!(snap.incidents_processed, 2);
        assert_eq!(snap.incidents_escalated, 1);
        assert_eq!(snap.purges_executed, 1);
        assert_eq!(snap.records_purged, 42);
    }
}
