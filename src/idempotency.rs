//! Idempotency & checkpoint store (C3, §4.3).
//!
//! Grounded on the teacher's `state::store::StateStore` cache/durable split
//! (here the durable side is the [`KvStore`](crate::collaborators::KvStore)
//! collaborator rather than `sled` directly, so the store is swappable).

use crate::collaborators::KvStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::warn;

const IDEMPOTENCY_TTL: Duration = Duration::from_secs(24 * 3600);
const CHECKPOINT_TTL: Duration = Duration::from_secs(24 * 3600);
const SWEEP_MIN_REMAINING: Duration = Duration::from_secs(3600);

/// Outcome of `check_idempotency`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyCheck {
    pub is_idempotent: bool,
    pub existing_result: Option<serde_json::Value>,
    pub key: String,
}

/// A durable progress snapshot within one `(incidentId, state, attempt)` coordinate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub incident_id: String,
    pub state: String,
    pub attempt: u32,
    pub progress: u8,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub checksum: String,
}

/// Compute the canonical-JSON form of `value`: object keys sorted
/// recursively, used both for the idempotency hash and checkpoint checksum.
fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut sorted: Vec<_> = map.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = serde_json::Map::new();
            for (k, v) in sorted {
                out.insert(k.clone(), canonicalize(v));
            }
            serde_json::Value::Object(out)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(canonicalize).collect())
        }
        other => other.clone(),
    }
}

fn short_hash(data: Option<&serde_json::Value>) -> String {
    let Some(data) = data else {
        return String::new();
    };
    let canonical = canonicalize(data);
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    hex::encode(digest)[..16].to_string()
}

/// Build an idempotency key: `prefix || incidentId || state || attempt || shortHash`.
pub fn idempotency_key(
    prefix: &str,
    incident_id: &str,
    state: &str,
    attempt: u32,
    data: Option<&serde_json::Value>,
) -> String {
    format!(
        "{prefix}:idempotency:{incident_id}:{state}:{attempt}:{}",
        short_hash(data)
    )
}

fn checkpoint_key(prefix: &str, incident_id: &str, state: &str, attempt: u32) -> String {
    format!("{prefix}:checkpoint:{incident_id}:{state}:{attempt}")
}

/// Idempotency and checkpoint operations backed by a [`KvStore`].
pub struct IdempotencyStore {
    kv: std::sync::Arc<dyn KvStore>,
    prefix: String,
}

impl IdempotencyStore {
    pub fn new(kv: std::sync::Arc<dyn KvStore>, prefix: impl Into<String>) -> Self {
        Self {
            kv,
            prefix: prefix.into(),
        }
    }

    /// KV errors degrade to `is_idempotent=false` so the caller proceeds
    /// with the operation (§4.3: "KV errors MUST NOT surface to callers").
    pub async fn check_idempotency(
        &self,
        incident_id: &str,
        state: &str,
        attempt: u32,
        data: Option<&serde_json::Value>,
    ) -> IdempotencyCheck {
        let key = idempotency_key(&self.prefix, incident_id, state, attempt, data);
        match self.kv.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(existing) => {
                    return IdempotencyCheck {
                        is_idempotent: true,
                        existing_result: Some(existing),
                        key,
                    }
                }
                Err(e) => warn!(error = %e, %key, "idempotency value decode failed, proceeding"),
            },
            Ok(None) => {}
            Err(e) => warn!(error = %e, %key, "idempotency lookup failed, proceeding"),
        }
        IdempotencyCheck {
            is_idempotent: false,
            existing_result: None,
            key,
        }
    }

    /// Store `result` under `key` with a 24h TTL. Errors are logged, not propagated.
    pub async fn store_result(&self, key: &str, result: &serde_json::Value) {
        let payload = match serde_json::to_string(result) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to serialize idempotent result");
                return;
            }
        };
        if let Err(e) = self.kv.set_ex(key, &payload, IDEMPOTENCY_TTL).await {
            warn!(error = %e, %key, "idempotency store failed");
        }
    }

    /// Write a checkpoint, overwriting any prior checkpoint at the same coordinate.
    pub async fn create_checkpoint(
        &self,
        incident_id: &str,
        state: &str,
        attempt: u32,
        progress: u8,
        data: serde_json::Value,
    ) {
        let checksum = short_hash(Some(&data));
        let checkpoint = Checkpoint {
            incident_id: incident_id.to_string(),
            state: state.to_string(),
            attempt,
            progress: progress.min(100),
            data,
            timestamp: Utc::now(),
            checksum,
        };
        let key = checkpoint_key(&self.prefix, incident_id, state, attempt);
        match serde_json::to_string(&checkpoint) {
            Ok(payload) => {
                if let Err(e) = self.kv.set_ex(&key, &payload, CHECKPOINT_TTL).await {
                    warn!(error = %e, %key, "checkpoint write failed");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize checkpoint"),
        }
    }

    /// Fetch the current checkpoint for a coordinate, if any.
    pub async fn get_latest_checkpoint(
        &self,
        incident_id: &str,
        state: &str,
        attempt: u32,
    ) -> Option<Checkpoint> {
        let key = checkpoint_key(&self.prefix, incident_id, state, attempt);
        match self.kv.get(&key).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).ok(),
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, %key, "checkpoint read failed");
                None
            }
        }
    }

    /// Sweep: delete idempotency entries with <1h TTL remaining and
    /// checkpoints older than `older_than_hours`.
    pub async fn cleanup(&self, older_than_hours: i64) -> usize {
        let mut removed = 0usize;
        let idempotency_prefix = format!("{}:idempotency:", self.prefix);
        if let Ok(keys) = self.kv.keys(&idempotency_prefix).await {
            for key in keys {
                if let Ok(Some(ttl)) = self.kv.ttl(&key).await {
                    if ttl < SWEEP_MIN_REMAINING && self.kv.del(&key).await.is_ok() {
                        removed += 1;
                    }
                }
            }
        }

        let checkpoint_prefix = format!("{}:checkpoint:", self.prefix);
        let cutoff = Utc::now() - chrono::Duration::hours(older_than_hours);
        if let Ok(keys) = self.kv.keys(&checkpoint_prefix).await {
            for key in keys {
                if let Ok(Some(raw)) = self.kv.get(&key).await {
                    if let Ok(checkpoint) = serde_json::from_str::<Checkpoint>(&raw) {
                        if checkpoint.timestamp < cutoff && self.kv.del(&key).await.is_ok() {
                            removed += 1;
                        }
                    }
                }
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::InMemoryKvStore;

    fn store() -> IdempotencyStore {
        IdempotencyStore::new(std::sync::Arc::new(InMemoryKvStore::new()), "wp")
    }

    #[tokio::test]
    async fn key_round_trips_regardless_of_field_order() {
        let data_a = serde_json::json!({"a": 1, "b": 2});
        let data_b = serde_json::json!({"b": 2, "a": 1});
        let key_a = idempotency_key("wp", "I1", "VERIFY", 1, Some(&data_a));
        let key_b = idempotency_key("wp", "I1", "VERIFY", 1, Some(&data_b));
        assert_eq!(key_a, key_b);
    }

    #[tokio::test]
    async fn replay_returns_cached_result() {
        let store = store();
        let data_a = serde_json::json!({"a": 1, "b": 2});
        let first = store
            .check_idempotency("I1", "VERIFY", 1, Some(&data_a))
            .await;
        assert!(!first.is_idempotent);

        store
            .store_result(&first.key, &serde_json::json!({"verificationPassed": true}))
            .await;

        let data_b = serde_json::json!({"b": 2, "a": 1});
        let second = store
            .check_idempotency("I1", "VERIFY", 1, Some(&data_b))
            .await;
        assert!(second.is_idempotent);
        assert_eq!(
            second.existing_result,
            Some(serde_json::json!({"verificationPassed": true}))
        );
    }

    #[tokio::test]
    async fn checkpoint_overwrites_at_same_coordinate() {
        let store = store();
        store
            .create_checkpoint("I1", "BACKUP", 0, 30, serde_json::json!({"step": 1}))
            .await;
        store
            .create_checkpoint("I1", "BACKUP", 0, 70, serde_json::json!({"step": 2}))
            .await;
        let latest = store.get_latest_checkpoint("I1", "BACKUP", 0).await.unwrap();
        assert_eq!(latest.progress, 70);
        assert_eq!(latest.data, serde_json::json!({"step": 2}));
    }

    #[tokio::test]
    async fn missing_checkpoint_is_none() {
        let store = store();
        assert!(store.get_latest_checkpoint("I1", "BACKUP", 0).await.is_none());
    }
}
