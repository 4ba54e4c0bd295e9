//! Queue dispatcher (C5, §4.5).
//!
//! In-process multi-queue with priority, delay, an idempotency-friendly
//! `job_id`, per-queue concurrency, exponential backoff, and lifecycle
//! (`initialize_queues`/`close`). Grounded on the teacher's
//! `connectors::message_queue` `Message`/config shape, generalized from a
//! single-broker connector into the three named in-process queues §4.5
//! names (`incident-processing`, `data-retention`, `health-checks`).

use crate::resilience::backoff_delay;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info, warn};

/// Priority map (§4.5): lower value = higher priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum JobPriority {
    Critical = 1,
    High = 2,
    #[default]
    Medium = 3,
    Low = 4,
}

/// Per-job options (§4.5 "Per-queue job-options").
#[derive(Debug, Clone)]
pub struct JobOptions {
    pub delay: Option<Duration>,
    pub priority: JobPriority,
    pub job_id: Option<String>,
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            delay: None,
            priority: JobPriority::default(),
            job_id: None,
            max_attempts: 3,
            backoff_base: Duration::from_secs(2),
        }
    }
}

impl JobOptions {
    /// Incident jobs override attempts/backoff per §4.5.
    pub fn for_incident(max_fix_attempts: u32, circuit_breaker_threshold: u32) -> Self {
        Self {
            max_attempts: max_fix_attempts.min(circuit_breaker_threshold),
            backoff_base: Duration::from_secs(5),
            ..Self::default()
        }
    }
}

/// A unit of queued work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub queue: String,
    pub payload: serde_json::Value,
    pub priority: JobPriority,
    pub ready_at: DateTime<Utc>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub enqueued_at: DateTime<Utc>,
}

/// Ordering for the ready queue's binary heap: earliest-ready, then
/// highest-priority (lowest numeric value) first. `BinaryHeap` is a max-heap,
/// so this `Ord` impl is inverted (smaller priority/ready_at compares greater).
#[derive(Debug, Clone)]
struct Scheduled(Job);

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.0.priority as i32 == other.0.priority as i32 && self.0.ready_at == other.0.ready_at
    }
}
impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .0
            .ready_at
            .cmp(&self.0.ready_at)
            .then_with(|| other.0.priority_rank().cmp(&self.0.priority_rank()))
    }
}

impl Job {
    fn priority_rank(&self) -> i32 {
        self.priority as i32
    }
}

/// Terminal outcome retained for completed/failed history (§4.5 retain caps).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub finished_at: DateTime<Utc>,
    pub succeeded: bool,
    pub error: Option<String>,
}

/// Per-queue snapshot returned by `GET /jobs/queues/stats` (§6.1).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct QueueStats {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub delayed: usize,
}

/// Static per-queue configuration (§4.5).
#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    pub concurrency: usize,
    pub retain_completed: usize,
    pub retain_failed: usize,
}

struct NamedQueue {
    config: QueueConfig,
    ready: Mutex<BinaryHeap<Scheduled>>,
    known_ids: Mutex<HashSet<String>>,
    active: Arc<Semaphore>,
    active_count: Mutex<usize>,
    completed: Mutex<Vec<JobRecord>>,
    failed: Mutex<Vec<JobRecord>>,
    paused: AtomicBool,
    /// Set when `pause_auto` (not operator `pause`) took this queue down,
    /// so the auto-resume sweep never reverses an operator's own pause.
    auto_paused: AtomicBool,
}

impl NamedQueue {
    fn new(config: QueueConfig) -> Self {
        Self {
            active: Arc::new(Semaphore::new(config.concurrency)),
            config,
            ready: Mutex::new(BinaryHeap::new()),
            known_ids: Mutex::new(HashSet::new()),
            active_count: Mutex::new(0),
            completed: Mutex::new(Vec::new()),
            failed: Mutex::new(Vec::new()),
            paused: AtomicBool::new(false),
            auto_paused: AtomicBool::new(false),
        }
    }
}

/// In-process dispatcher over the three named queues.
pub struct QueueDispatcher {
    queues: DashMap<String, Arc<NamedQueue>>,
    closed: AtomicBool,
}

impl QueueDispatcher {
    /// `initializeQueues`: create the three named streams from §4.5.
    pub fn initialize_queues() -> Self {
        let dispatcher = Self {
            queues: DashMap::new(),
            closed: AtomicBool::new(false),
        };
        dispatcher.queues.insert(
            "incident-processing".to_string(),
            Arc::new(NamedQueue::new(QueueConfig {
                concurrency: 3,
                retain_completed: 100,
                retain_failed: 50,
            })),
        );
        dispatcher.queues.insert(
            "data-retention".to_string(),
            Arc::new(NamedQueue::new(QueueConfig {
                concurrency: 1,
                retain_completed: 100,
                retain_failed: 50,
            })),
        );
        dispatcher.queues.insert(
            "health-checks".to_string(),
            Arc::new(NamedQueue::new(QueueConfig {
                concurrency: 5,
                retain_completed: 100,
                retain_failed: 50,
            })),
        );
        dispatcher
    }

    fn queue(&self, name: &str) -> anyhow::Result<Arc<NamedQueue>> {
        self.queues
            .get(name)
            .map(|q| q.clone())
            .ok_or_else(|| anyhow::anyhow!("unknown queue '{name}'"))
    }

    /// Enqueue `payload` onto `queue_name`. Reusing an in-flight `job_id`
    /// returns the existing id without duplicating the job (§4.5
    /// "idempotency-friendly jobId").
    pub async fn enqueue(
        &self,
        queue_name: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> anyhow::Result<String> {
        let queue = self.queue(queue_name)?;
        let id = options
            .job_id
            .clone()
            .unwrap_or_else(|| format!("{queue_name}-{}", uuid::Uuid::new_v4()));

        {
            let mut known = queue.known_ids.lock().await;
            if !known.insert(id.clone()) {
                return Ok(id);
            }
        }

        let now = Utc::now();
        let ready_at = options
            .delay
            .map(|d| now + chrono::Duration::from_std(d).unwrap_or_default())
            .unwrap_or(now);

        let job = Job {
            id: id.clone(),
            queue: queue_name.to_string(),
            payload,
            priority: options.priority,
            ready_at,
            attempts: 0,
            max_attempts: options.max_attempts,
            backoff_base_ms: options.backoff_base.as_millis() as u64,
            enqueued_at: now,
        };
        queue.ready.lock().await.push(Scheduled(job));
        Ok(id)
    }

    /// Pull the next ready job, honoring pause and delay; blocks the caller
    /// only by virtue of returning `None` (callers poll or back off).
    async fn try_dequeue(&self, queue_name: &str) -> anyhow::Result<Option<Job>> {
        let queue = self.queue(queue_name)?;
        if queue.paused.load(AtomicOrdering::SeqCst) {
            return Ok(None);
        }
        let now = Utc::now();
        let mut ready = queue.ready.lock().await;
        if let Some(top) = ready.peek() {
            if top.0.ready_at > now {
                return Ok(None);
            }
        } else {
            return Ok(None);
        }
        Ok(ready.pop().map(|s| s.0))
    }

    /// Run one queue's worker loop against `handler` until `close()` is
    /// called. Intended to be spawned as a background task per queue.
    pub async fn run_worker<F, Fut>(&self, queue_name: &str, handler: F) -> anyhow::Result<()>
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send,
    {
        let queue = self.queue(queue_name)?;
        loop {
            if self.closed.load(AtomicOrdering::SeqCst) {
                return Ok(());
            }
            let Some(mut job) = self.try_dequeue(queue_name).await? else {
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            };

            let permit = queue.active.clone().acquire_owned().await?;
            {
                let mut active = queue.active_count.lock().await;
                *active += 1;
            }

            job.attempts += 1;
            let result = handler(job.clone()).await;

            {
                let mut active = queue.active_count.lock().await;
                *active = active.saturating_sub(1);
            }
            drop(permit);

            match result {
                Ok(()) => {
                    let mut completed = queue.completed.lock().await;
                    completed.push(JobRecord {
                        id: job.id.clone(),
                        finished_at: Utc::now(),
                        succeeded: true,
                        error: None,
                    });
                    if completed.len() > queue.config.retain_completed {
                        let excess = completed.len() - queue.config.retain_completed;
                        completed.drain(0..excess);
                    }
                    queue.known_ids.lock().await.remove(&job.id);
                }
                Err(e) => {
                    if job.attempts < job.max_attempts {
                        let delay = backoff_delay(
                            Duration::from_millis(job.backoff_base_ms),
                            Duration::from_secs(300),
                            job.attempts.saturating_sub(1),
                        );
                        job.ready_at = Utc::now() + chrono::Duration::from_std(delay)?;
                        warn!(job_id = %job.id, attempts = job.attempts, error = %e, "job failed, retrying");
                        queue.ready.lock().await.push(Scheduled(job));
                    } else {
                        let mut failed = queue.failed.lock().await;
                        failed.push(JobRecord {
                            id: job.id.clone(),
                            finished_at: Utc::now(),
                            succeeded: false,
                            error: Some(e.to_string()),
                        });
                        if failed.len() > queue.config.retain_failed {
                            let excess = failed.len() - queue.config.retain_failed;
                            failed.drain(0..excess);
                        }
                        queue.known_ids.lock().await.remove(&job.id);
                    }
                }
            }
        }
    }

    /// Pause a queue: workers stop pulling new jobs. Operator-initiated,
    /// so it does not mark the queue eligible for the auto-resume sweep.
    pub fn pause(&self, queue_name: &str) -> anyhow::Result<()> {
        self.queue(queue_name)?.paused.store(true, AtomicOrdering::SeqCst);
        Ok(())
    }

    /// Pause a queue on the dispatcher's own initiative (breaker escalation,
    /// flapping lockout). Marks it as a candidate for `auto_resume_sweep`.
    pub fn pause_auto(&self, queue_name: &str) -> anyhow::Result<()> {
        let queue = self.queue(queue_name)?;
        queue.paused.store(true, AtomicOrdering::SeqCst);
        queue.auto_paused.store(true, AtomicOrdering::SeqCst);
        Ok(())
    }

    /// Resume a paused queue, operator- or auto-initiated alike.
    pub fn resume(&self, queue_name: &str) -> anyhow::Result<()> {
        let queue = self.queue(queue_name)?;
        queue.paused.store(false, AtomicOrdering::SeqCst);
        queue.auto_paused.store(false, AtomicOrdering::SeqCst);
        Ok(())
    }

    /// Whether `queue_name` is currently paused.
    pub fn is_paused(&self, queue_name: &str) -> anyhow::Result<bool> {
        Ok(self.queue(queue_name)?.paused.load(AtomicOrdering::SeqCst))
    }

    /// The names of every queue this dispatcher knows about.
    pub fn queue_names(&self) -> Vec<String> {
        self.queues.iter().map(|e| e.key().clone()).collect()
    }

    /// §4.7's `*/30 * * * *` probe (Q4): resume queues with 0 active + >0
    /// failed + 0 waiting, but only those this dispatcher itself paused —
    /// an operator-initiated pause is never silently reversed.
    pub async fn auto_resume_sweep(&self) -> anyhow::Result<Vec<String>> {
        let mut resumed = Vec::new();
        for name in self.queue_names() {
            let queue = self.queue(&name)?;
            if !queue.auto_paused.load(AtomicOrdering::SeqCst) {
                continue;
            }
            let stats = self.stats(&name).await?;
            if stats.active == 0 && stats.failed > 0 && stats.waiting == 0 {
                self.resume(&name)?;
                resumed.push(name);
            }
        }
        Ok(resumed)
    }

    /// Drop completed/failed records older than `grace_period`.
    pub async fn clean(&self, queue_name: &str, grace_period: Duration) -> anyhow::Result<usize> {
        let queue = self.queue(queue_name)?;
        let cutoff = Utc::now() - chrono::Duration::from_std(grace_period)?;
        let mut removed = 0usize;

        let mut completed = queue.completed.lock().await;
        let before = completed.len();
        completed.retain(|r| r.finished_at >= cutoff);
        removed += before - completed.len();
        drop(completed);

        let mut failed = queue.failed.lock().await;
        let before = failed.len();
        failed.retain(|r| r.finished_at >= cutoff);
        removed += before - failed.len();

        Ok(removed)
    }

    /// Snapshot stats for one queue, as exposed by `GET /jobs/queues/stats`.
    pub async fn stats(&self, queue_name: &str) -> anyhow::Result<QueueStats> {
        let queue = self.queue(queue_name)?;
        let now = Utc::now();
        let ready = queue.ready.lock().await;
        let waiting = ready.iter().filter(|s| s.0.ready_at <= now).count();
        let delayed = ready.len() - waiting;
        let active = *queue.active_count.lock().await;
        let completed = queue.completed.lock().await.len();
        let failed = queue.failed.lock().await.len();
        Ok(QueueStats {
            waiting,
            active,
            completed,
            failed,
            delayed,
        })
    }

    /// `close`: signal workers to stop after their current job.
    pub fn close(&self) {
        self.closed.store(true, AtomicOrdering::SeqCst);
        info!("queue dispatcher closing");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enqueue_is_idempotent_on_job_id() {
        let dispatcher = QueueDispatcher::initialize_queues();
        let opts = JobOptions {
            job_id: Some("fixed-id".to_string()),
            ..Default::default()
        };
        let id1 = dispatcher
            .enqueue("incident-processing", serde_json::json!({}), opts.clone())
            .await
            .unwrap();
        let id2 = dispatcher
            .enqueue("incident-processing", serde_json::json!({}), opts)
            .await
            .unwrap();
        assert_eq!(id1, id2);
        let stats = dispatcher.stats("incident-processing").await.unwrap();
        assert_eq!(stats.waiting, 1);
    }

    #[tokio::test]
    async fn unknown_queue_errors() {
        let dispatcher = QueueDispatcher::initialize_queues();
        let result = dispatcher
            .enqueue("not-a-queue", serde_json::json!({}), JobOptions::default())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn delayed_jobs_report_as_delayed_until_ready() {
        let dispatcher = QueueDispatcher::initialize_queues();
        dispatcher
            .enqueue(
                "health-checks",
                serde_json::json!({}),
                JobOptions {
                    delay: Some(Duration::from_secs(60)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let stats = dispatcher.stats("health-checks").await.unwrap();
        assert_eq!(stats.delayed, 1);
        assert_eq!(stats.waiting, 0);
    }

    #[tokio::test]
    async fn pause_prevents_dequeue() {
        let dispatcher = QueueDispatcher::initialize_queues();
        dispatcher.pause("incident-processing").unwrap();
        dispatcher
            .enqueue("incident-processing", serde_json::json!({}), JobOptions::default())
            .await
            .unwrap();
        assert!(dispatcher.try_dequeue("incident-processing").await.unwrap().is_none());
        dispatcher.resume("incident-processing").unwrap();
        assert!(dispatcher.try_dequeue("incident-processing").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn auto_resume_sweep_only_touches_dispatcher_paused_queues() {
        let dispatcher = Arc::new(QueueDispatcher::initialize_queues());
        dispatcher
            .enqueue(
                "data-retention",
                serde_json::json!({}),
                JobOptions { max_attempts: 1, ..Default::default() },
            )
            .await
            .unwrap();
        let d = dispatcher.clone();
        tokio::spawn(async move {
            let _ = d
                .run_worker("data-retention", |_job| async { Err(anyhow::anyhow!("boom")) })
                .await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        dispatcher.close();

        let stats = dispatcher.stats("data-retention").await.unwrap();
        assert_eq!(stats.failed, 1);

        // An operator pause is never touched by the sweep.
        dispatcher.pause("incident-processing").unwrap();
        let resumed = dispatcher.auto_resume_sweep().await.unwrap();
        assert!(resumed.is_empty());
        assert!(dispatcher.is_paused("incident-processing").unwrap());

        // A dispatcher-initiated pause on a queue matching the probe is resumed.
        dispatcher.pause_auto("data-retention").unwrap();
        let resumed = dispatcher.auto_resume_sweep().await.unwrap();
        assert_eq!(resumed, vec!["data-retention".to_string()]);
        assert!(!dispatcher.is_paused("data-retention").unwrap());
    }

    #[tokio::test]
    async fn for_incident_caps_attempts_at_breaker_threshold() {
        let opts = JobOptions::for_incident(15, 5);
        assert_eq!(opts.max_attempts, 5);
        assert_eq!(opts.backoff_base, Duration::from_secs(5));
    }
}
