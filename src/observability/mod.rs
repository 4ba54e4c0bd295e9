//! Health and metrics helpers (§10.1 ambient stack).
//!
//! Adapted from the teacher's `observability::{health, metrics}` pair,
//! trimmed to the two concerns SPEC_FULL names: a component health registry
//! for k8s-style probes, and counters for the dispatcher/queue/retention
//! operations.

pub mod health;
pub mod metrics;

pub use health::{ComponentHealth, HealthChecker, HealthStatus};
pub use metrics::CoreMetrics;
