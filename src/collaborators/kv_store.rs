//! Key-value store collaborator (§6.3).
//!
//! Byte-string keys, JSON values, per-key TTL. Namespaces used by C3 are
//! `<prefix>:idempotency:…` and `<prefix>:checkpoint:…`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::time::Duration;

/// Minimal KV contract: `GET` / `SET EX` / `DEL` / `TTL` / `KEYS pattern`.
///
/// Implementations MUST tolerate transient backend errors (the teacher's
/// connectors reconnect on error containing "READONLY"); callers of this
/// trait degrade gracefully on `Err`, never surfacing KV failures as
/// incident failures (§4.3).
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Fetch the raw JSON value stored at `key`, if present and unexpired.
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;

    /// Store `value` at `key` with a time-to-live.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()>;

    /// Delete `key`, if present.
    async fn del(&self, key: &str) -> anyhow::Result<()>;

    /// Remaining time-to-live for `key`, or `None` if absent/expired.
    async fn ttl(&self, key: &str) -> anyhow::Result<Option<Duration>>;

    /// List keys whose name starts with `prefix` (a cheap substitute for
    /// `KEYS pattern` backed by a prefix scan).
    async fn keys(&self, prefix: &str) -> anyhow::Result<Vec<String>>;
}

struct Entry {
    value: String,
    expires_at: DateTime<Utc>,
}

/// In-process fake, used by tests and by the default dev configuration.
#[derive(Default)]
pub struct InMemoryKvStore {
    entries: DashMap<String, Entry>,
}

impl InMemoryKvStore {
    /// Construct an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let now = Utc::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > now {
                return Ok(Some(entry.value.clone()));
            }
        }
        Ok(None)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Utc::now() + chrono::Duration::from_std(ttl)?,
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> anyhow::Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn ttl(&self, key: &str) -> anyhow::Result<Option<Duration>> {
        let now = Utc::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > now {
                return Ok((entry.expires_at - now).to_std().ok());
            }
        }
        Ok(None)
    }

    async fn keys(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let now = Utc::now();
        Ok(self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix) && e.value().expires_at > now)
            .map(|e| e.key().clone())
            .collect())
    }
}

/// Durable backend over `sled`, the default per `[features] default =
/// ["sled-store"]`. Packs `expires_at` alongside the value so a single KV
/// get can reject stale entries without a second round trip.
#[cfg(feature = "sled-store")]
pub struct SledKvStore {
    db: sled::Db,
}

#[cfg(feature = "sled-store")]
#[derive(serde::Serialize, serde::Deserialize)]
struct StoredEntry {
    value: String,
    expires_at: DateTime<Utc>,
}

#[cfg(feature = "sled-store")]
impl SledKvStore {
    pub fn open(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        Ok(Self { db: sled::open(path)? })
    }
}

#[cfg(feature = "sled-store")]
#[async_trait]
impl KvStore for SledKvStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let Some(raw) = self.db.get(key)? else { return Ok(None) };
        let entry: StoredEntry = serde_json::from_slice(&raw)?;
        if entry.expires_at > Utc::now() {
            Ok(Some(entry.value))
        } else {
            self.db.remove(key)?;
            Ok(None)
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
        let entry = StoredEntry {
            value: value.to_string(),
            expires_at: Utc::now() + chrono::Duration::from_std(ttl)?,
        };
        self.db.insert(key, serde_json::to_vec(&entry)?)?;
        Ok(())
    }

    async fn del(&self, key: &str) -> anyhow::Result<()> {
        self.db.remove(key)?;
        Ok(())
    }

    async fn ttl(&self, key: &str) -> anyhow::Result<Option<Duration>> {
        let Some(raw) = self.db.get(key)? else { return Ok(None) };
        let entry: StoredEntry = serde_json::from_slice(&raw)?;
        let now = Utc::now();
        if entry.expires_at > now {
            Ok((entry.expires_at - now).to_std().ok())
        } else {
            Ok(None)
        }
    }

    async fn keys(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let now = Utc::now();
        let mut out = Vec::new();
        for item in self.db.scan_prefix(prefix) {
            let (key, raw) = item?;
            let entry: StoredEntry = serde_json::from_slice(&raw)?;
            if entry.expires_at > now {
                out.push(String::from_utf8_lossy(&key).to_string());
            }
        }
        Ok(out)
    }
}

/// Durable backend over `redis`, selected with the `redis-store` feature
/// instead of the default `sled-store` one. TTL and expiry are delegated to
/// Redis's own `SET EX` / `TTL` rather than packed alongside the value.
#[cfg(feature = "redis-store")]
pub struct RedisKvStore {
    conn: tokio::sync::Mutex<redis::aio::ConnectionManager>,
}

#[cfg(feature = "redis-store")]
impl RedisKvStore {
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn: tokio::sync::Mutex::new(conn) })
    }
}

#[cfg(feature = "redis-store")]
#[async_trait]
impl KvStore for RedisKvStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        use redis::AsyncCommands;
        let mut conn = self.conn.lock().await;
        Ok(conn.get(key).await?)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
        use redis::AsyncCommands;
        let mut conn = self.conn.lock().await;
        let _: () = conn.set_ex(key, value, ttl.as_secs().max(1)).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> anyhow::Result<()> {
        use redis::AsyncCommands;
        let mut conn = self.conn.lock().await;
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn ttl(&self, key: &str) -> anyhow::Result<Option<Duration>> {
        use redis::AsyncCommands;
        let mut conn = self.conn.lock().await;
        let secs: i64 = conn.ttl(key).await?;
        Ok((secs > 0).then(|| Duration::from_secs(secs as u64)))
    }

    async fn keys(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        use futures::StreamExt;
        use redis::AsyncCommands;
        let mut conn = self.conn.lock().await;
        let mut iter: redis::AsyncIter<'_, String> =
            conn.scan_match(format!("{prefix}*")).await?;
        let mut out = Vec::new();
        while let Some(key) = iter.next().await {
            out.push(key);
        }
        Ok(out)
    }
}

#[cfg(all(test, feature = "sled-store"))]
mod sled_tests {
    use super::*;

    #[tokio::test]
    async fn sled_store_roundtrips_and_expires() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledKvStore::open(dir.path()).unwrap();
        store.set_ex("k", "v", Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));

        store.set_ex("expired", "v", Duration::from_millis(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.get("expired").await.unwrap(), None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_roundtrip() {
        let store = InMemoryKvStore::new();
        store.set_ex("k", "v", Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
    }

    #[tokio::test]
    async fn expired_entries_read_as_absent() {
        let store = InMemoryKvStore::new();
        store
            .set_ex("k", "v", Duration::from_millis(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn keys_filters_by_prefix() {
        let store = InMemoryKvStore::new();
        store.set_ex("a:1", "x", Duration::from_secs(60)).await.unwrap();
        store.set_ex("b:1", "x", Duration::from_secs(60)).await.unwrap();
        let keys = store.keys("a:").await.unwrap();
        assert_eq!(keys, vec!["a:1".to_string()]);
    }
}
