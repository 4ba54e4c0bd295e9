//! Scheduled driver (C7, §4.7): cron-triggered housekeeping.
//!
//! Grounded on the timer-firing shape of the teacher's
//! `services::timer::TimerService`, generalized from per-case transient/
//! persistent timers to a fixed set of cron-triggered housekeeping actions
//! using the `cron` crate for schedule parsing.

use crate::queue::{JobOptions, JobPriority, QueueDispatcher};
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// One housekeeping action named in §4.7's cron table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HousekeepingAction {
    DailyPurgeSchedule,
    SystemHealthCheck,
    QueueMaintenance,
    QueueAutoResume,
    WeeklyAnonymization,
    PurgeMonitoring,
    DailyPurgeAuditSummary,
    WeeklyQueueStatsReport,
}

impl HousekeepingAction {
    fn label(self) -> &'static str {
        match self {
            Self::DailyPurgeSchedule => "daily-purge-schedule",
            Self::SystemHealthCheck => "system-health-check",
            Self::QueueMaintenance => "queue-maintenance",
            Self::QueueAutoResume => "queue-auto-resume",
            Self::WeeklyAnonymization => "weekly-anonymization",
            Self::PurgeMonitoring => "purge-monitoring",
            Self::DailyPurgeAuditSummary => "daily-purge-audit-summary",
            Self::WeeklyQueueStatsReport => "weekly-queue-stats-report",
        }
    }
}

struct Trigger {
    schedule: Schedule,
    action: HousekeepingAction,
}

/// Parse a 5-field quartz-style cron expression (as used throughout §4.7)
/// into a [`cron::Schedule`], which expects a leading seconds field.
fn parse_five_field(expr: &str) -> anyhow::Result<Schedule> {
    Schedule::from_str(&format!("0 {expr}")).map_err(|e| anyhow::anyhow!("invalid cron '{expr}': {e}"))
}

fn default_triggers() -> anyhow::Result<Vec<Trigger>> {
    use HousekeepingAction::*;
    // `cron`'s day-of-week field is 1=Sunday..7=Saturday, not the 0=Sunday
    // convention §4.7's table is written in.
    let specs: &[(&str, HousekeepingAction)] = &[
        ("0 2 * * *", DailyPurgeSchedule),
        ("*/5 * * * *", SystemHealthCheck),
        ("0 * * * *", QueueMaintenance),
        ("*/30 * * * *", QueueAutoResume),
        ("0 3 * * 1", WeeklyAnonymization),
        ("0 * * * *", PurgeMonitoring),
        ("0 6 * * *", DailyPurgeAuditSummary),
        ("0 6 * * 1", WeeklyQueueStatsReport),
    ];
    specs
        .iter()
        .map(|(expr, action)| {
            Ok(Trigger {
                schedule: parse_five_field(expr)?,
                action: *action,
            })
        })
        .collect()
}

/// Drives the §4.7 housekeeping cron table against the queue dispatcher.
pub struct ScheduledDriver {
    triggers: Vec<Trigger>,
    queue: Arc<QueueDispatcher>,
}

impl ScheduledDriver {
    pub fn new(queue: Arc<QueueDispatcher>) -> anyhow::Result<Self> {
        Ok(Self {
            triggers: default_triggers()?,
            queue,
        })
    }

    /// Actions whose schedule has an occurrence in `(after, at]`. Exposed
    /// standalone so the firing logic is testable without a live clock.
    pub fn due_actions(&self, after: DateTime<Utc>, at: DateTime<Utc>) -> Vec<HousekeepingAction> {
        self.triggers
            .iter()
            .filter(|t| t.schedule.after(&after).take_while(|fire| *fire <= at).next().is_some())
            .map(|t| t.action)
            .collect()
    }

    /// Run one tick: enqueue the housekeeping job for each action due in
    /// `(last_run, now]`.
    pub async fn tick(&self, last_run: DateTime<Utc>, now: DateTime<Utc>) {
        for action in self.due_actions(last_run, now) {
            self.dispatch(action).await;
        }
    }

    async fn dispatch(&self, action: HousekeepingAction) {
        use HousekeepingAction::*;
        if action == QueueAutoResume {
            match self.queue.auto_resume_sweep().await {
                Ok(resumed) if !resumed.is_empty() => {
                    info!(queues = ?resumed, "auto-resumed queues after breaker-originated pause")
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "queue auto-resume sweep failed"),
            }
            return;
        }
        let (queue_name, priority) = match action {
            SystemHealthCheck => ("health-checks", JobPriority::Low),
            _ => ("data-retention", JobPriority::Low),
        };
        let payload = serde_json::json!({ "action": action.label(), "firedAt": Utc::now() });
        match self
            .queue
            .enqueue(queue_name, payload, JobOptions { priority, ..Default::default() })
            .await
        {
            Ok(job_id) => info!(action = action.label(), %job_id, "housekeeping job enqueued"),
            Err(e) => warn!(action = action.label(), error = %e, "failed to enqueue housekeeping job"),
        }
    }

    /// Run `tick` on a fixed real-time cadence until the returned handle is
    /// dropped or aborted. `period` should be shorter than the tightest
    /// cron trigger (`*/5 * * * *`) to avoid missing a firing window.
    pub fn spawn(self: Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut last_run = Utc::now();
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let now = Utc::now();
                self.tick(last_run, now).await;
                last_run = now;
            }
        })
    }
}
