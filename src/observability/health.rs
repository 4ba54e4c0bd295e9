//! Component health registry and Kubernetes-style probes.

use crate::error::{HealError, HealResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// Health status of a single component or of the process as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Health of one named component (a collaborator, the queue dispatcher, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub last_check: chrono::DateTime<chrono::Utc>,
    pub error: Option<String>,
}

/// Registry of component health, used to answer readiness/liveness/startup
/// probes the way the teacher's `HealthChecker` backs its HTTP health routes.
#[derive(Default)]
pub struct HealthChecker {
    components: Mutex<HashMap<String, ComponentHealth>>,
    /// Components that must be registered and non-`Unhealthy` for the
    /// startup probe to pass.
    required: Vec<&'static str>,
}

impl HealthChecker {
    pub fn new(required: Vec<&'static str>) -> Self {
        Self {
            components: Mutex::new(HashMap::new()),
            required,
        }
    }

    /// Record or update a component's health.
    pub fn update_component(&self, name: &str, status: HealthStatus, error: Option<String>) {
        let mut components = self.components.lock().unwrap_or_else(|e| e.into_inner());
        components.insert(
            name.to_string(),
            ComponentHealth {
                name: name.to_string(),
                status,
                last_check: chrono::Utc::now(),
                error,
            },
        );
    }

    /// Overall status: worst of all registered components.
    pub fn overall(&self) -> HealthStatus {
        let components = self.components.lock().unwrap_or_else(|e| e.into_inner());
        let mut worst = HealthStatus::Healthy;
        for component in components.values() {
            match component.status {
                HealthStatus::Unhealthy => return HealthStatus::Unhealthy,
                HealthStatus::Degraded => worst = HealthStatus::Degraded,
                HealthStatus::Healthy => {}
            }
        }
        worst
    }

    pub fn component(&self, name: &str) -> Option<ComponentHealth> {
        let components = self.components.lock().unwrap_or_else(|e| e.into_inner());
        components.get(name).cloned()
    }

    pub fn all(&self) -> Vec<ComponentHealth> {
        let components = self.components.lock().unwrap_or_else(|e| e.into_inner());
        components.values().cloned().collect()
    }

    /// `GET /health/ready` — serve traffic if healthy or degraded.
    pub fn readiness_probe(&self) -> bool {
        matches!(self.overall(), HealthStatus::Healthy | HealthStatus::Degraded)
    }

    /// `GET /health/live` — alive if the registry lock isn't poisoned.
    pub fn liveness_probe(&self) -> HealResult<bool> {
        self.components
            .lock()
            .map(|_| true)
            .map_err(|e| HealError::Internal(format!("health registry lock poisoned: {e}")))
    }

    /// `GET /health/startup` — every required component registered and not unhealthy.
    pub fn startup_probe(&self) -> bool {
        let components = self.components.lock().unwrap_or_else(|e| e.into_inner());
        self.required.iter().all(|name| {
            components
                .get(*name)
                .is_some_and(|c| c.status != HealthStatus::Unhealthy)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overall_is_worst_of_registered_components() {
        let checker = HealthChecker::new(vec!["queue", "kv_store"]);
        checker.update_component("queue", HealthStatus::Healthy, None);
        checker.update_component("kv_store", HealthStatus::Healthy, None);
        assert_eq!(checker.overall(), HealthStatus::Healthy);

        checker.update_component("kv_store", HealthStatus::Degraded, Some("slow".into()));
        assert_eq!(checker.overall(), HealthStatus::Degraded);

        checker.update_component("queue", HealthStatus::Unhealthy, Some("down".into()));
        assert_eq!(checker.overall(), HealthStatus::Unhealthy);
    }

    #[test]
    fn startup_probe_requires_all_required_components() {
        let checker = HealthChecker::new(vec!["queue", "kv_store"]);
        assert!(!checker.startup_probe());
        checker.update_component("queue", HealthStatus::Healthy, None);
        checker.update_component("kv_store", HealthStatus::Healthy, None);
        assert!(checker.startup_probe());
    }

    #[test]
    fn readiness_tolerates_degraded_but_not_unhealthy() {
        let checker = HealthChecker::new(vec![]);
        checker.update_component("queue", HealthStatus::Degraded, None);
        assert!(checker.readiness_probe());
        checker.update_component("queue", HealthStatus::Unhealthy, None);
        assert!(!checker.readiness_probe());
    }
}
