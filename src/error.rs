//! Error types for the incident remediation core.

use thiserror::Error;

/// Result type used throughout the crate.
pub type HealResult<T> = Result<T, HealError>;

/// Crate-wide error type.
///
/// Policy denials (flapping, idempotent hit, bounded-loop exceeded) are
/// represented as structured `Ok` results, never as errors — see the
/// `flapping`, `idempotency`, and `loopguard` modules. This enum covers
/// transient, operation, validation, and fatal failures only (§7).
#[derive(Error, Debug)]
pub enum HealError {
    /// Request failed validation (§7: fail the request immediately, no retry).
    #[error("validation error: {0}")]
    Validation(String),

    /// Referenced incident does not exist.
    #[error("incident not found: {0}")]
    IncidentNotFound(String),

    /// No transition is defined from the incident's current state.
    #[error("no valid transition from state {0}")]
    NoValidTransition(String),

    /// Admission to a circuit-protected operation was denied and no fallback
    /// was supplied.
    #[error("circuit breaker open for {0}")]
    CircuitOpen(String),

    /// A bounded loop exceeded one of its caps.
    #[error("loop bound exceeded for {loop_id}: {bound_type}")]
    LoopBoundExceeded {
        /// Loop identifier.
        loop_id: String,
        /// Which cap tripped (`iterations`, `retries`, `wall_clock`, `idle`).
        bound_type: String,
    },

    /// The queue dispatcher could not accept a job (enqueue errors propagate
    /// per §7 — the incident cannot progress without a successor job).
    #[error("queue error: {0}")]
    Queue(String),

    /// No such queue is registered.
    #[error("unknown queue: {0}")]
    UnknownQueue(String),

    /// Retention purge request violated a bound (§4.8).
    #[error("retention request rejected: {0}")]
    RetentionRejected(String),

    /// A phase executor or external collaborator failed.
    #[error("operation failed: {0}")]
    OperationFailed(String),

    /// Configuration was invalid at startup (§9: fatal, abort process).
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Wraps an arbitrary external-collaborator error (HTTP probe, relational
    /// store) that needs to keep its source chain.
    #[error("external system error: {0}")]
    ExternalSystem(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Catch-all for unexpected internal conditions.
    #[error("internal error: {0}")]
    Internal(String),
}

impl HealError {
    /// Whether this error represents a transient condition worth retrying
    /// (§7: transient failures are retried with backoff, counted by breakers).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            HealError::Queue(_) | HealError::OperationFailed(_) | HealError::ExternalSystem(_)
        )
    }
}

impl From<std::io::Error> for HealError {
    fn from(err: std::io::Error) -> Self {
        HealError::Internal(err.to_string())
    }
}
