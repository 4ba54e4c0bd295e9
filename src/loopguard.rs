//! Bounded loop accounting (C4, §4.4).
//!
//! `C4` is an accounting abstraction, not a control-flow loop (§9 "Coroutine
//! -> task contract"): callers call `start_loop` once per named activity,
//! then `record_iteration`/`record_retry` as work happens across separate
//! job invocations, checking `can_continue` before each phase executor runs.
//! Grounded on the counters/state-enum shape of the teacher's
//! `autonomic::loop_controller::MapeKController`.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Mutex;

/// Which cap tripped, reported by `can_continue` so callers can emit the
/// right diagnostic and shut down cleanly (§4.4: not fatal until checked).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoundType {
    Iterations,
    Retries,
    WallClock,
    IdleTime,
}

/// Per-kind caps (§4.4 defaults).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LoopCaps {
    pub max_iterations: u32,
    pub max_retries: u32,
    pub max_wall_clock: Duration,
    pub max_idle_time: Duration,
}

impl Default for LoopCaps {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            max_retries: 10,
            max_wall_clock: Duration::from_secs(600),
            max_idle_time: Duration::from_secs(120),
        }
    }
}

/// Result of `can_continue`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinueCheck {
    pub can_continue: bool,
    pub reason: Option<String>,
    pub bound_type: Option<BoundType>,
}

struct LoopContext {
    kind: String,
    caps: LoopCaps,
    iterations: u32,
    retries: u32,
    started_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
}

/// Registry of in-flight bounded loops, keyed by an opaque loop id (the
/// incident id, for C6's usage).
#[derive(Default)]
pub struct LoopGuard {
    loops: DashMap<String, Mutex<LoopContext>>,
}

impl LoopGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin accounting for `id`. Re-starting an existing id resets its counters.
    pub fn start_loop(&self, id: &str, kind: &str, caps: Option<LoopCaps>) {
        let now = Utc::now();
        self.loops.insert(
            id.to_string(),
            Mutex::new(LoopContext {
                kind: kind.to_string(),
                caps: caps.unwrap_or_default(),
                iterations: 0,
                retries: 0,
                started_at: now,
                last_activity_at: now,
            }),
        );
    }

    /// Check whether `id` may continue. Unknown ids are treated as having
    /// no bounds yet hit (`can_continue: true`) — callers are expected to
    /// have called `start_loop` first.
    pub async fn can_continue(&self, id: &str) -> ContinueCheck {
        let Some(entry) = self.loops.get(id) else {
            return ContinueCheck {
                can_continue: true,
                reason: None,
                bound_type: None,
            };
        };
        let ctx = entry.lock().await;
        let now = Utc::now();

        if ctx.iterations >= ctx.caps.max_iterations {
            return ContinueCheck {
                can_continue: false,
                reason: Some(format!(
                    "loop '{}' exceeded max_iterations ({})",
                    ctx.kind, ctx.caps.max_iterations
                )),
                bound_type: Some(BoundType::Iterations),
            };
        }
        if ctx.retries >= ctx.caps.max_retries {
            return ContinueCheck {
                can_continue: false,
                reason: Some(format!(
                    "loop '{}' exceeded max_retries ({})",
                    ctx.kind, ctx.caps.max_retries
                )),
                bound_type: Some(BoundType::Retries),
            };
        }
        if let Ok(elapsed) = (now - ctx.started_at).to_std() {
            if elapsed >= ctx.caps.max_wall_clock {
                return ContinueCheck {
                    can_continue: false,
                    reason: Some(format!("loop '{}' exceeded max_wall_clock", ctx.kind)),
                    bound_type: Some(BoundType::WallClock),
                };
            }
        }
        if let Ok(idle) = (now - ctx.last_activity_at).to_std() {
            if idle >= ctx.caps.max_idle_time {
                return ContinueCheck {
                    can_continue: false,
                    reason: Some(format!("loop '{}' exceeded max_idle_time", ctx.kind)),
                    bound_type: Some(BoundType::IdleTime),
                };
            }
        }

        ContinueCheck {
            can_continue: true,
            reason: None,
            bound_type: None,
        }
    }

    /// Record a completed iteration (`details` is accepted for parity with
    /// the spec's signature but only used for tracing today).
    pub async fn record_iteration(&self, id: &str, details: Option<&str>) {
        if let Some(entry) = self.loops.get(id) {
            let mut ctx = entry.lock().await;
            ctx.iterations += 1;
            ctx.last_activity_at = Utc::now();
            if let Some(details) = details {
                tracing::debug!(loop_id = %id, %details, "loop iteration recorded");
            }
        }
    }

    /// Record a retry and its cause.
    pub async fn record_retry(&self, id: &str, cause: &str) {
        if let Some(entry) = self.loops.get(id) {
            let mut ctx = entry.lock().await;
            ctx.retries += 1;
            ctx.last_activity_at = Utc::now();
            tracing::debug!(loop_id = %id, %cause, "loop retry recorded");
        }
    }

    /// Mark a loop finished and evict it from the registry.
    pub async fn complete_loop(&self, id: &str, success: bool, note: Option<&str>) {
        if let Some((_, entry)) = self.loops.remove(id) {
            let ctx = entry.into_inner();
            tracing::info!(
                loop_id = %id,
                kind = %ctx.kind,
                success,
                note,
                iterations = ctx.iterations,
                retries = ctx.retries,
                "loop completed"
            );
        }
    }

    /// Current iteration/retry counters, for tests and diagnostics.
    pub async fn counters(&self, id: &str) -> Option<(u32, u32)> {
        let entry = self.loops.get(id)?;
        let ctx = entry.lock().await;
        Some((ctx.iterations, ctx.retries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn iterations_cap_trips_boundtype() {
        let guard = LoopGuard::new();
        guard.start_loop(
            "I1",
            "fix-attempt",
            Some(LoopCaps {
                max_iterations: 3,
                ..LoopCaps::default()
            }),
        );
        for _ in 0..3 {
            assert!(guard.can_continue("I1").await.can_continue);
            guard.record_iteration("I1", None).await;
        }
        let check = guard.can_continue("I1").await;
        assert!(!check.can_continue);
        assert_eq!(check.bound_type, Some(BoundType::Iterations));
    }

    #[tokio::test]
    async fn complete_loop_evicts_context() {
        let guard = LoopGuard::new();
        guard.start_loop("I2", "fix-attempt", None);
        guard.record_iteration("I2", None).await;
        guard.complete_loop("I2", true, Some("done")).await;
        assert!(guard.counters("I2").await.is_none());
    }

    #[tokio::test]
    async fn retries_cap_independent_of_iterations() {
        let guard = LoopGuard::new();
        guard.start_loop(
            "I3",
            "fix-attempt",
            Some(LoopCaps {
                max_retries: 2,
                ..LoopCaps::default()
            }),
        );
        guard.record_retry("I3", "timeout").await;
        guard.record_retry("I3", "timeout").await;
        let check = guard.can_continue("I3").await;
        assert!(!check.can_continue);
        assert_eq!(check.bound_type, Some(BoundType::Retries));
    }
}
