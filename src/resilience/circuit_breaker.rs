//! Circuit breaker registry (C1).
//!
//! Per-operation admission control with CLOSED/OPEN/HALF_OPEN states and a
//! sliding monitoring window (§3 "Circuit record", §4.1).

use crate::error::{HealError, HealResult};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Admitting normally.
    Closed,
    /// Rejecting admission until `next_attempt_at`.
    Open,
    /// Admitting exactly one probe to test recovery.
    HalfOpen,
}

/// Per-key breaker configuration (§3 Circuit record Config).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Failures before CLOSED -> OPEN.
    pub failure_threshold: u32,
    /// How long OPEN lasts before admitting a probe.
    pub recovery_timeout: Duration,
    /// Sliding window after which stale counters reset.
    pub monitoring_period: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            monitoring_period: Duration::from_secs(300),
        }
    }
}

/// Defensive-copy snapshot returned by `stats()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitStats {
    /// Current breaker state.
    pub state: CircuitState,
    /// Failures counted within the current window.
    pub failures: u32,
    /// Successes counted within the current window.
    pub successes: u32,
    /// Last failure timestamp, if any.
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Last success timestamp, if any.
    pub last_success_at: Option<DateTime<Utc>>,
    /// Next time an OPEN breaker will admit a probe.
    pub next_attempt_at: Option<DateTime<Utc>>,
}

struct CircuitRecord {
    state: CircuitState,
    failures: u32,
    successes: u32,
    last_failure_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    next_attempt_at: Option<DateTime<Utc>>,
    config: CircuitConfig,
    /// Guards against more than one concurrent HALF_OPEN probe per key.
    probe_in_flight: bool,
}

/// `std::time::Duration` -> `chrono::Duration` for configured millisecond
/// spans, which always fit; avoids `unwrap`-ing `chrono::Duration::from_std`.
fn chrono_millis(d: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(d.as_millis() as i64)
}

impl CircuitRecord {
    fn new(config: CircuitConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            successes: 0,
            last_failure_at: None,
            last_success_at: None,
            next_attempt_at: None,
            config,
            probe_in_flight: false,
        }
    }

    fn roll_window(&mut self, now: DateTime<Utc>) {
        if let Some(last) = self.last_failure_at {
            if now - last > chrono_millis(self.config.monitoring_period) {
                self.failures = 0;
            }
        }
        if let Some(last) = self.last_success_at {
            if now - last > chrono_millis(self.config.monitoring_period) {
                self.successes = 0;
            }
        }
    }

    fn record_success(&mut self, now: DateTime<Utc>) {
        self.failures = 0;
        self.successes += 1;
        self.last_success_at = Some(now);
        if self.state == CircuitState::HalfOpen {
            self.state = CircuitState::Closed;
            self.successes = 0;
            self.probe_in_flight = false;
            self.next_attempt_at = None;
        }
    }

    fn record_failure(&mut self, now: DateTime<Utc>) {
        self.failures += 1;
        self.successes = 0;
        self.last_failure_at = Some(now);
        self.probe_in_flight = false;
        if self.state == CircuitState::HalfOpen || self.failures >= self.config.failure_threshold {
            self.state = CircuitState::Open;
            self.next_attempt_at =
                Some(now + chrono_millis(self.config.recovery_timeout));
        }
    }

    fn snapshot(&self) -> CircuitStats {
        CircuitStats {
            state: self.state,
            failures: self.failures,
            successes: self.successes,
            last_failure_at: self.last_failure_at,
            last_success_at: self.last_success_at,
            next_attempt_at: self.next_attempt_at,
        }
    }
}

/// Registry of per-key circuit breakers (§4.1).
///
/// Each key's record is guarded independently so admission decisions for
/// different keys proceed concurrently (§5 "Shared-resource policy").
pub struct CircuitBreakerRegistry {
    records: DashMap<String, Arc<Mutex<CircuitRecord>>>,
    default_config: CircuitConfig,
}

impl CircuitBreakerRegistry {
    /// Create a registry whose auto-registered breakers use `default_config`.
    pub fn new(default_config: CircuitConfig) -> Self {
        Self {
            records: DashMap::new(),
            default_config,
        }
    }

    /// Pre-register a breaker with custom configuration.
    pub fn register(&self, key: impl Into<String>, config: CircuitConfig) {
        self.records
            .entry(key.into())
            .or_insert_with(|| Arc::new(Mutex::new(CircuitRecord::new(config))));
    }

    fn record_for(&self, key: &str) -> Arc<Mutex<CircuitRecord>> {
        self.records
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(CircuitRecord::new(self.default_config))))
            .clone()
    }

    /// Execute `op` under the breaker for `key`, with an optional fallback.
    ///
    /// Returns `op`'s result when admitted and it succeeds, the fallback's
    /// result when admission is denied and a fallback is supplied, and
    /// [`HealError::CircuitOpen`] when denied with no fallback.
    pub async fn execute<F, Fut, Fb, FbFut, T>(
        &self,
        key: &str,
        op: F,
        fallback: Option<Fb>,
    ) -> HealResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = HealResult<T>>,
        Fb: FnOnce() -> FbFut,
        FbFut: std::future::Future<Output = HealResult<T>>,
    {
        let record = self.record_for(key);
        let now = Utc::now();

        let admitted = {
            let mut rec = record.lock().await;
            rec.roll_window(now);
            match rec.state {
                CircuitState::Closed => true,
                CircuitState::HalfOpen => {
                    if rec.probe_in_flight {
                        false
                    } else {
                        rec.probe_in_flight = true;
                        true
                    }
                }
                CircuitState::Open => {
                    if rec.next_attempt_at.map(|t| now >= t).unwrap_or(false) {
                        rec.state = CircuitState::HalfOpen;
                        rec.probe_in_flight = true;
                        true
                    } else {
                        false
                    }
                }
            }
        };

        if !admitted {
            return match fallback {
                Some(fb) => fb().await,
                None => Err(HealError::CircuitOpen(key.to_string())),
            };
        }

        match op().await {
            Ok(result) => {
                record.lock().await.record_success(Utc::now());
                Ok(result)
            }
            Err(e) => {
                record.lock().await.record_failure(Utc::now());
                Err(e)
            }
        }
    }

    /// Defensive-copy snapshot of a breaker's current stats.
    pub async fn stats(&self, key: &str) -> CircuitStats {
        let record = self.record_for(key);
        let rec = record.lock().await;
        rec.snapshot()
    }

    /// Operator override: force a breaker OPEN regardless of counters.
    pub async fn force_open(&self, key: &str) {
        let record = self.record_for(key);
        let mut rec = record.lock().await;
        rec.state = CircuitState::Open;
        rec.next_attempt_at =
            Some(Utc::now() + chrono_millis(rec.config.recovery_timeout));
    }

    /// Operator override: reset a breaker to CLOSED with zeroed counters.
    pub async fn reset(&self, key: &str) {
        let record = self.record_for(key);
        let mut rec = record.lock().await;
        rec.state = CircuitState::Closed;
        rec.failures = 0;
        rec.successes = 0;
        rec.next_attempt_at = None;
        rec.probe_in_flight = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> CircuitConfig {
        CircuitConfig {
            failure_threshold: 2,
            recovery_timeout: Duration::from_millis(50),
            monitoring_period: Duration::from_secs(300),
        }
    }

    #[tokio::test]
    async fn opens_after_threshold_and_denies_without_fallback() {
        let registry = CircuitBreakerRegistry::new(fast_config());

        for _ in 0..2 {
            let res: HealResult<()> = registry
                .execute::<_, _, fn() -> std::future::Ready<HealResult<()>>, _, ()>(
                    "k",
                    || async { Err(HealError::OperationFailed("boom".into())) },
                    None,
                )
                .await;
            assert!(res.is_err());
        }

        assert_eq!(registry.stats("k").await.state, CircuitState::Open);

        let res: HealResult<()> = registry
            .execute::<_, _, fn() -> std::future::Ready<HealResult<()>>, _, ()>(
                "k",
                || async { Ok(()) },
                None,
            )
            .await;
        assert!(matches!(res, Err(HealError::CircuitOpen(_))));
    }

    #[tokio::test]
    async fn half_open_recovers_to_closed() {
        let registry = CircuitBreakerRegistry::new(fast_config());
        for _ in 0..2 {
            let _: HealResult<()> = registry
                .execute::<_, _, fn() -> std::future::Ready<HealResult<()>>, _, ()>(
                    "k",
                    || async { Err(HealError::OperationFailed("boom".into())) },
                    None,
                )
                .await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        let res = registry
            .execute::<_, _, fn() -> std::future::Ready<HealResult<()>>, _, ()>(
                "k",
                || async { Ok(()) },
                None,
            )
            .await;
        assert!(res.is_ok());
        assert_eq!(registry.stats("k").await.state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn fallback_used_when_open() {
        let registry = CircuitBreakerRegistry::new(fast_config());
        for _ in 0..2 {
            let _: HealResult<()> = registry
                .execute::<_, _, fn() -> std::future::Ready<HealResult<()>>, _, ()>(
                    "k",
                    || async { Err(HealError::OperationFailed("boom".into())) },
                    None,
                )
                .await;
        }
        let res = registry
            .execute(
                "k",
                || async { Err::<i32, _>(HealError::OperationFailed("should not run".into())) },
                Some(|| async { Ok(7) }),
            )
            .await;
        assert_eq!(res.unwrap(), 7);
    }
}
