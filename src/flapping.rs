//! Flapping prevention (C2): per-site cooldown and escalation accounting
//! over a rolling window (§3 "Flapping record", §4.2).
//!
//! The source's partial-window rollover (halving `incidentCount` when
//! `firstIncidentAt` ages out but `lastIncidentAt` doesn't) is ambiguous —
//! see SPEC_FULL §9 Open Question 1. This implementation instead keeps a
//! bounded deque of per-incident timestamps and counts exactly, which the
//! spec recommends as a correctness improvement, not a behavior change.

use crate::config::FlappingConfig;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Result of a `can_create_incident` check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlappingDecision {
    /// Whether a new incident may be created.
    pub allowed: bool,
    /// Human-readable denial reason, set iff `!allowed`.
    pub reason: Option<String>,
    /// Cooldown expiry, set iff a cooldown is currently active.
    pub cooldown_until: Option<DateTime<Utc>>,
    /// Sticky escalation flag for the site.
    pub should_escalate: bool,
}

struct FlappingRecord {
    /// Per-incident creation timestamps within the rolling window, oldest first.
    incidents: VecDeque<DateTime<Utc>>,
    cooldown_until: Option<DateTime<Utc>>,
    is_flapping: bool,
    should_escalate: bool,
}

impl FlappingRecord {
    fn new() -> Self {
        Self {
            incidents: VecDeque::new(),
            cooldown_until: None,
            is_flapping: false,
            should_escalate: false,
        }
    }

    fn age_out(&mut self, now: DateTime<Utc>, window: chrono::Duration) {
        while let Some(&front) = self.incidents.front() {
            if now - front > window {
                self.incidents.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Per-site flapping tracker.
pub struct FlappingTracker {
    records: DashMap<String, Arc<Mutex<FlappingRecord>>>,
    config: FlappingConfig,
}

impl FlappingTracker {
    /// Create a tracker using `config`'s window/thresholds.
    pub fn new(config: FlappingConfig) -> Self {
        Self {
            records: DashMap::new(),
            config,
        }
    }

    fn record_for(&self, site_id: &str) -> Arc<Mutex<FlappingRecord>> {
        self.records
            .entry(site_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(FlappingRecord::new())))
            .clone()
    }

    /// Decide whether `site_id` may have a new incident created for it.
    pub async fn can_create_incident(&self, site_id: &str) -> FlappingDecision {
        let record = self.record_for(site_id);
        let mut rec = record.lock().await;
        let now = Utc::now();
        let window = chrono::Duration::milliseconds(self.config.cooldown_window_ms as i64);

        rec.age_out(now, window);
        if let Some(until) = rec.cooldown_until {
            if now >= until {
                rec.cooldown_until = None;
                rec.is_flapping = false;
            }
        }

        if let Some(until) = rec.cooldown_until {
            if now < until {
                return FlappingDecision {
                    allowed: false,
                    reason: Some("Site is flapping: in cooldown".to_string()),
                    cooldown_until: Some(until),
                    should_escalate: rec.should_escalate,
                };
            }
        }

        let count = rec.incidents.len() as u32;
        if count >= self.config.max_incidents_per_window {
            let until = now + window;
            rec.cooldown_until = Some(until);
            rec.is_flapping = true;
            if count >= self.config.escalation_threshold {
                rec.should_escalate = true;
            }
            return FlappingDecision {
                allowed: false,
                reason: Some("Site is flapping: incident rate exceeds window threshold".to_string()),
                cooldown_until: Some(until),
                should_escalate: rec.should_escalate,
            };
        }

        FlappingDecision {
            allowed: true,
            reason: None,
            cooldown_until: None,
            should_escalate: rec.should_escalate,
        }
    }

    /// Record that a new incident was created for `site_id`.
    pub async fn record_incident(&self, site_id: &str, _incident_id: &str) {
        let record = self.record_for(site_id);
        let mut rec = record.lock().await;
        rec.incidents.push_back(Utc::now());
    }

    /// Record the resolution of an incident. A successful resolution while
    /// not currently flapping forgives one prior incident (floored at 0).
    pub async fn record_resolution(&self, site_id: &str, _incident_id: &str, successful: bool) {
        let record = self.record_for(site_id);
        let mut rec = record.lock().await;
        if successful && !rec.is_flapping {
            rec.incidents.pop_front();
        }
    }

    /// Operator intervention: clear a site's cooldown without touching
    /// `should_escalate`.
    pub async fn clear_cooldown(&self, site_id: &str) {
        let record = self.record_for(site_id);
        let mut rec = record.lock().await;
        rec.cooldown_until = None;
        rec.is_flapping = false;
    }

    /// Operator intervention: fully reset a site, including the sticky
    /// escalation flag.
    pub async fn reset_site(&self, site_id: &str) {
        let record = self.record_for(site_id);
        let mut rec = record.lock().await;
        *rec = FlappingRecord::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> FlappingConfig {
        FlappingConfig {
            cooldown_window_ms: 600_000,
            max_incidents_per_window: 3,
            escalation_threshold: 5,
        }
    }

    #[tokio::test]
    async fn cooldown_trips_after_threshold() {
        let tracker = FlappingTracker::new(test_config());
        for _ in 0..3 {
            let decision = tracker.can_create_incident("site-1").await;
            assert!(decision.allowed);
            tracker.record_incident("site-1", "inc").await;
        }
        let decision = tracker.can_create_incident("site-1").await;
        assert!(!decision.allowed);
        assert!(decision.cooldown_until.is_some());
    }

    #[tokio::test]
    async fn should_escalate_is_sticky_until_reset() {
        let tracker = FlappingTracker::new(FlappingConfig {
            cooldown_window_ms: 600_000,
            max_incidents_per_window: 2,
            escalation_threshold: 2,
        });
        for _ in 0..2 {
            tracker.can_create_incident("site-2").await;
            tracker.record_incident("site-2", "inc").await;
        }
        let decision = tracker.can_create_incident("site-2").await;
        assert!(decision.should_escalate);

        tracker.clear_cooldown("site-2").await;
        let decision = tracker.can_create_incident("site-2").await;
        assert!(decision.should_escalate, "clear_cooldown must not clear should_escalate");

        tracker.reset_site("site-2").await;
        let decision = tracker.can_create_incident("site-2").await;
        assert!(!decision.should_escalate);
    }

    #[tokio::test]
    async fn zero_window_allows_unlimited() {
        let tracker = FlappingTracker::new(FlappingConfig {
            cooldown_window_ms: 0,
            max_incidents_per_window: 1,
            escalation_threshold: 5,
        });
        for _ in 0..10 {
            let decision = tracker.can_create_incident("site-3").await;
            assert!(decision.allowed);
            tracker.record_incident("site-3", "inc").await;
        }
    }
}
