//! Incident state machine (C6, §4.6).
//!
//! Grounded on the teacher's `case::{Case, CaseState}` payload shape and
//! `executor::workflow`'s tagged-variant dispatch (§9 "Polymorphism": model
//! phase executors as a tagged variant, not inheritance).

use crate::collaborators::AuditSink;
use crate::error::{HealError, HealResult};
use crate::flapping::FlappingTracker;
use crate::idempotency::IdempotencyStore;
use crate::loopguard::LoopGuard;
use crate::queue::{JobOptions, JobPriority, QueueDispatcher};
use crate::resilience::CircuitBreakerRegistry;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// A state in the remediation state machine (§4.6 transition table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentState {
    New,
    Discovery,
    Baseline,
    Backup,
    Observability,
    FixAttempt,
    Verify,
    Fixed,
    Rollback,
    Escalated,
}

impl IncidentState {
    /// Lowercase name used for the breaker key `state-<lowercase>`.
    pub fn breaker_key(self) -> String {
        format!("state-{}", self.as_str().to_lowercase())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            IncidentState::New => "NEW",
            IncidentState::Discovery => "DISCOVERY",
            IncidentState::Baseline => "BASELINE",
            IncidentState::Backup => "BACKUP",
            IncidentState::Observability => "OBSERVABILITY",
            IncidentState::FixAttempt => "FIX_ATTEMPT",
            IncidentState::Verify => "VERIFY",
            IncidentState::Fixed => "FIXED",
            IncidentState::Rollback => "ROLLBACK",
            IncidentState::Escalated => "ESCALATED",
        }
    }

    /// FIXED and ESCALATED are terminal (§4.6).
    pub fn is_terminal(self) -> bool {
        matches!(self, IncidentState::Fixed | IncidentState::Escalated)
    }

    /// Per-transition delay (§4.6 "Per-transition delay").
    fn delay_for(target: IncidentState) -> Duration {
        match target {
            IncidentState::FixAttempt => Duration::from_secs(5),
            IncidentState::Verify => Duration::from_secs(10),
            _ => Duration::from_secs(1),
        }
    }
}

/// Resolve the next transition given the current state and context, per the
/// transition table in §4.6. Returns `None` when no guarded transition
/// applies (including from a terminal state).
pub fn next_transition(
    from: IncidentState,
    verification_passed: Option<bool>,
    fix_attempts: u32,
    max_fix_attempts: u32,
) -> Option<IncidentState> {
    use IncidentState::*;
    match from {
        New => Some(Discovery),
        Discovery => Some(Baseline),
        Baseline => Some(Backup),
        Backup => Some(Observability),
        Observability => Some(FixAttempt),
        FixAttempt => Some(Verify),
        Verify => match verification_passed {
            Some(true) => Some(Fixed),
            Some(false) if fix_attempts < max_fix_attempts => Some(FixAttempt),
            Some(false) => Some(Rollback),
            None => None,
        },
        Rollback => Some(Escalated),
        Fixed | Escalated => None,
    }
}

/// Outcome of a phase executor (§4.6 "Phase executor contract").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseResult {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
}

/// One non-terminal state's remediation logic. Implementations perform the
/// actual SSH/HTTP/DB work named as external collaborators in §1; they are
/// out of scope here and exercised through fakes in tests.
#[async_trait]
pub trait PhaseExecutor: Send + Sync {
    async fn execute(&self, incident: &Incident) -> HealResult<PhaseResult>;
}

/// An incident under remediation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: String,
    pub site_id: String,
    pub server_id: String,
    pub state: IncidentState,
    pub fix_attempts: u32,
    pub max_fix_attempts: u32,
    pub payload: serde_json::Value,
    pub metadata: serde_json::Value,
    pub correlation_id: String,
}

/// Result of processing one `PROCESS_INCIDENT` job (§4.6 "Processing algorithm").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessOutcome {
    pub incident_id: String,
    pub from_state: IncidentState,
    pub to_state: Option<IncidentState>,
    pub enqueued_job_id: Option<String>,
    pub cached: bool,
    /// Set when the incident was denied creation by the flapping tracker
    /// (§6.1 `POST /jobs/incidents` flapping-denial response shape).
    pub reason: Option<String>,
    pub cooldown_until: Option<chrono::DateTime<Utc>>,
    pub should_escalate: bool,
}

/// Coordinates C1/C2/C3/C4/C5 to drive one incident through the state
/// machine, one job at a time (§9: single-shot handlers, no in-process loop).
pub struct IncidentDispatcher {
    circuit: Arc<CircuitBreakerRegistry>,
    flapping: Arc<FlappingTracker>,
    idempotency: Arc<IdempotencyStore>,
    loop_guard: Arc<LoopGuard>,
    queue: Arc<QueueDispatcher>,
    audit: Arc<dyn AuditSink>,
    executors: HashMap<IncidentState, Arc<dyn PhaseExecutor>>,
}

impl IncidentDispatcher {
    pub fn new(
        circuit: Arc<CircuitBreakerRegistry>,
        flapping: Arc<FlappingTracker>,
        idempotency: Arc<IdempotencyStore>,
        loop_guard: Arc<LoopGuard>,
        queue: Arc<QueueDispatcher>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            circuit,
            flapping,
            idempotency,
            loop_guard,
            queue,
            audit,
            executors: HashMap::new(),
        }
    }

    /// Register the phase executor for a non-terminal state.
    pub fn register_executor(&mut self, state: IncidentState, executor: Arc<dyn PhaseExecutor>) {
        self.executors.insert(state, executor);
    }

    /// Process one job for `incident` currently sitting in its `state`.
    pub async fn process(&self, mut incident: Incident) -> HealResult<ProcessOutcome> {
        let loop_id = format!("incident-{}-{}", incident.id, incident.state.as_str());
        self.loop_guard
            .start_loop(&loop_id, "incident-processing", None);

        // Step 2: flapping check (only meaningful for a fresh incident at NEW).
        if incident.state == IncidentState::New {
            let decision = self.flapping.can_create_incident(&incident.site_id).await;
            if !decision.allowed {
                self.loop_guard
                    .complete_loop(&loop_id, false, Some("flapping denied"))
                    .await;
                if decision.should_escalate {
                    self.enqueue_escalation(&incident, "flapping: site should escalate")
                        .await?;
                }
                return Ok(ProcessOutcome {
                    incident_id: incident.id,
                    from_state: incident.state,
                    to_state: None,
                    enqueued_job_id: None,
                    cached: false,
                    reason: decision.reason,
                    cooldown_until: decision.cooldown_until,
                    should_escalate: decision.should_escalate,
                });
            }
            self.flapping
                .record_incident(&incident.site_id, &incident.id)
                .await;
        }

        // Step 3: idempotency.
        let check = self
            .idempotency
            .check_idempotency(
                &incident.id,
                incident.state.as_str(),
                incident.fix_attempts,
                Some(&incident.payload),
            )
            .await;
        if check.is_idempotent {
            self.loop_guard
                .complete_loop(&loop_id, true, Some("idempotent replay"))
                .await;
            return Ok(ProcessOutcome {
                incident_id: incident.id,
                from_state: incident.state,
                to_state: None,
                enqueued_job_id: None,
                cached: true,
                reason: None,
                cooldown_until: None,
                should_escalate: false,
            });
        }

        // Step 4: checkpoint at 10%.
        self.idempotency
            .create_checkpoint(
                &incident.id,
                incident.state.as_str(),
                incident.fix_attempts,
                10,
                incident.payload.clone(),
            )
            .await;

        // Step 5: resolve transition.
        let verification_passed = incident
            .metadata
            .get("verificationPassed")
            .and_then(|v| v.as_bool());
        let Some(to) = next_transition(
            incident.state,
            verification_passed,
            incident.fix_attempts,
            incident.max_fix_attempts,
        ) else {
            self.loop_guard
                .complete_loop(&loop_id, false, Some("no valid transition"))
                .await;
            return Err(HealError::NoValidTransition(incident.state.as_str().to_string()));
        };

        // Step 6: record iteration, checkpoint at 30%.
        self.loop_guard.record_iteration(&loop_id, None).await;
        self.idempotency
            .create_checkpoint(
                &incident.id,
                incident.state.as_str(),
                incident.fix_attempts,
                30,
                serde_json::json!({ "to": to.as_str() }),
            )
            .await;

        // Step 7: invoke the phase executor through C1, gated by C4.
        let continue_check = self.loop_guard.can_continue(&loop_id).await;
        if !continue_check.can_continue {
            self.loop_guard
                .complete_loop(&loop_id, false, continue_check.reason.as_deref())
                .await;
            return Err(HealError::LoopBoundExceeded {
                loop_id,
                bound_type: format!("{:?}", continue_check.bound_type),
            });
        }

        let state_result = self.execute_phase(&incident).await?;

        // Step 8: checkpoint at 70%.
        self.idempotency
            .create_checkpoint(
                &incident.id,
                incident.state.as_str(),
                incident.fix_attempts,
                70,
                serde_json::to_value(&state_result).unwrap_or(serde_json::Value::Null),
            )
            .await;

        let from_state = incident.state;
        let enqueued_job_id;
        if state_result.success {
            let mut metadata = incident.metadata.clone();
            merge_metadata(&mut metadata, incident.state, &state_result);
            incident.metadata = metadata;
            incident.state = to;

            let priority = if to.is_terminal() {
                JobPriority::Low
            } else {
                JobPriority::Medium
            };
            let job_id = self
                .queue
                .enqueue(
                    "incident-processing",
                    serde_json::to_value(&incident).unwrap_or(serde_json::Value::Null),
                    JobOptions {
                        delay: Some(IncidentState::delay_for(to)),
                        priority,
                        ..Default::default()
                    },
                )
                .await
                .map_err(|e| HealError::Queue(e.to_string()))?;
            enqueued_job_id = Some(job_id);

            self.flapping
                .record_resolution(&incident.site_id, &incident.id, true)
                .await;
        } else {
            enqueued_job_id = self.handle_state_failure(&mut incident, &state_result).await?;
            self.flapping
                .record_resolution(&incident.site_id, &incident.id, false)
                .await;
            self.loop_guard
                .record_retry(&loop_id, state_result.error.as_deref().unwrap_or("unknown"))
                .await;
        }

        // Step 11: store outcome under the step-3 coordinate, progress 100%, complete loop.
        self.idempotency
            .store_result(&check.key, &serde_json::to_value(&state_result).unwrap_or_default())
            .await;
        self.loop_guard.complete_loop(&loop_id, state_result.success, None).await;

        Ok(ProcessOutcome {
            incident_id: incident.id,
            from_state,
            to_state: Some(to),
            enqueued_job_id,
            cached: false,
            reason: None,
            cooldown_until: None,
            should_escalate: false,
        })
    }

    async fn execute_phase(&self, incident: &Incident) -> HealResult<PhaseResult> {
        let Some(executor) = self.executors.get(&incident.state).cloned() else {
            return Ok(PhaseResult {
                success: false,
                data: None,
                error: Some(format!("no phase executor registered for {:?}", incident.state)),
            });
        };
        let key = incident.state.breaker_key();
        let incident_for_op = incident.clone();
        self.circuit
            .execute(
                &key,
                move || {
                    let executor = executor.clone();
                    let incident = incident_for_op.clone();
                    async move { executor.execute(&incident).await }
                },
                Some(|| async {
                    Ok(PhaseResult {
                        success: false,
                        data: None,
                        error: Some("Circuit breaker activated".to_string()),
                    })
                }),
            )
            .await
    }

    /// `handleStateFailure` (§4.6).
    async fn handle_state_failure(
        &self,
        incident: &mut Incident,
        state_result: &PhaseResult,
    ) -> HealResult<Option<String>> {
        if incident.state == IncidentState::FixAttempt {
            incident.fix_attempts += 1;
        }

        if incident.fix_attempts >= incident.max_fix_attempts {
            self.enqueue_escalation(
                incident,
                state_result.error.as_deref().unwrap_or("max fix attempts exceeded"),
            )
            .await?;
            return Ok(None);
        }

        let delay_ms = (1000u64.saturating_mul(2u64.saturating_pow(incident.fix_attempts)))
            .min(30_000);
        let job_id = self
            .queue
            .enqueue(
                "incident-processing",
                serde_json::to_value(&incident).unwrap_or(serde_json::Value::Null),
                JobOptions {
                    delay: Some(Duration::from_millis(delay_ms)),
                    priority: JobPriority::High,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| HealError::Queue(e.to_string()))?;
        warn!(incident_id = %incident.id, fix_attempts = incident.fix_attempts, "state failed, re-enqueued");
        Ok(Some(job_id))
    }

    async fn enqueue_escalation(&self, incident: &Incident, reason: &str) -> HealResult<String> {
        let payload = serde_json::json!({
            "incidentId": incident.id,
            "escalationReason": reason,
            "escalationTime": Utc::now(),
        });
        let job_id = self
            .queue
            .enqueue(
                "incident-processing",
                payload,
                JobOptions {
                    job_id: Some(format!("{}-escalate", incident.id)),
                    priority: JobPriority::Critical,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| HealError::Queue(e.to_string()))?;

        crate::collaborators::audit::record_best_effort(
            self.audit.as_ref(),
            crate::collaborators::AuditEvent {
                user_id: None,
                action: "escalate".to_string(),
                resource: "incident".to_string(),
                resource_id: incident.id.clone(),
                details: serde_json::json!({ "reason": reason }),
                ip_address: None,
                user_agent: None,
                recorded_at: Utc::now(),
            },
        )
        .await;

        info!(incident_id = %incident.id, reason, "incident escalated");
        Ok(job_id)
    }
}

fn merge_metadata(metadata: &mut serde_json::Value, previous_state: IncidentState, result: &PhaseResult) {
    if !metadata.is_object() {
        *metadata = serde_json::json!({});
    }
    let obj = match metadata.as_object_mut() {
        Some(obj) => obj,
        None => return,
    };
    obj.insert(
        "previousState".to_string(),
        serde_json::Value::String(previous_state.as_str().to_string()),
    );
    obj.insert(
        "transitionTime".to_string(),
        serde_json::Value::String(Utc::now().to_rfc3339()),
    );
    if let Some(data) = &result.data {
        if let Some(data_obj) = data.as_object() {
            for (k, v) in data_obj {
                obj.insert(k.clone(), v.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions_match_table() {
        use IncidentState::*;
        assert_eq!(next_transition(New, None, 0, 3), Some(Discovery));
        assert_eq!(next_transition(Discovery, None, 0, 3), Some(Baseline));
        assert_eq!(next_transition(Baseline, None, 0, 3), Some(Backup));
        assert_eq!(next_transition(Backup, None, 0, 3), Some(Observability));
        assert_eq!(next_transition(Observability, None, 0, 3), Some(FixAttempt));
        assert_eq!(next_transition(FixAttempt, None, 0, 3), Some(Verify));
        assert_eq!(next_transition(Verify, Some(true), 0, 3), Some(Fixed));
    }

    #[test]
    fn verify_failure_retries_until_max_then_rolls_back() {
        use IncidentState::*;
        assert_eq!(next_transition(Verify, Some(false), 1, 3), Some(FixAttempt));
        assert_eq!(next_transition(Verify, Some(false), 3, 3), Some(Rollback));
    }

    #[test]
    fn terminal_states_have_no_transition() {
        use IncidentState::*;
        assert_eq!(next_transition(Fixed, None, 0, 3), None);
        assert_eq!(next_transition(Escalated, None, 0, 3), None);
        assert!(Fixed.is_terminal());
        assert!(Escalated.is_terminal());
        assert!(!Verify.is_terminal());
    }

    #[test]
    fn rollback_always_escalates() {
        assert_eq!(
            next_transition(IncidentState::Rollback, None, 0, 3),
            Some(IncidentState::Escalated)
        );
    }
}
