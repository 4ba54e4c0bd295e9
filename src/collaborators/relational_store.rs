//! Relational store collaborator (§6.4), accessed only through
//! transactional operations for purge/audit writes (§5 "Shared-resource
//! policy"). Tables: `retention_policy`, `purge_audit`, `audit_event`, plus
//! whatever entity tables the retention coordinator counts/deletes from.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;

/// One row appended to `purge_audit` per table per retention run (§4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurgeAuditRow {
    pub policy_id: String,
    pub table_name: String,
    pub records_purged: u64,
    pub cutoff_date: DateTime<Utc>,
    pub executed_at: DateTime<Utc>,
    pub executed_by: String,
    pub reason: String,
}

/// A logical entity row as counted/deleted by the retention coordinator.
/// `created_at` drives the cutoff comparison; `id` identifies the row for
/// deletion.
#[derive(Debug, Clone)]
pub struct EntityRow {
    pub id: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait RelationalStore: Send + Sync {
    /// Count rows in `table` with `created_at < cutoff`.
    async fn count_older_than(&self, table: &str, cutoff: DateTime<Utc>) -> anyhow::Result<u64>;

    /// Delete up to `limit` of the oldest rows in `table` older than
    /// `cutoff`. Returns the number actually deleted.
    async fn delete_older_than(
        &self,
        table: &str,
        cutoff: DateTime<Utc>,
        limit: u64,
    ) -> anyhow::Result<u64>;

    /// Total row count in `table`, used for the ">80% of table" risk check.
    async fn total_count(&self, table: &str) -> anyhow::Result<u64>;

    /// Append a purge-audit row within the same transaction as the delete.
    async fn record_purge_audit(&self, row: PurgeAuditRow) -> anyhow::Result<()>;
}

/// In-process fake backed by per-table in-memory vectors, for tests and the
/// default dev configuration.
#[derive(Default)]
pub struct InMemoryRelationalStore {
    tables: Mutex<HashMap<String, Vec<EntityRow>>>,
    purge_audit: Mutex<Vec<PurgeAuditRow>>,
}

impl InMemoryRelationalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed `table` with `rows`, for test setup.
    pub async fn seed(&self, table: &str, rows: Vec<EntityRow>) {
        self.tables.lock().await.insert(table.to_string(), rows);
    }

    /// Snapshot of purge-audit rows recorded so far, for test assertions.
    pub async fn purge_audit_rows(&self) -> Vec<PurgeAuditRow> {
        self.purge_audit.lock().await.clone()
    }
}

#[async_trait]
impl RelationalStore for InMemoryRelationalStore {
    async fn count_older_than(&self, table: &str, cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
        let tables = self.tables.lock().await;
        Ok(tables
            .get(table)
            .map(|rows| rows.iter().filter(|r| r.created_at < cutoff).count() as u64)
            .unwrap_or(0))
    }

    async fn delete_older_than(
        &self,
        table: &str,
        cutoff: DateTime<Utc>,
        limit: u64,
    ) -> anyhow::Result<u64> {
        let mut tables = self.tables.lock().await;
        let Some(rows) = tables.get_mut(table) else {
            return Ok(0);
        };
        rows.sort_by_key(|r| r.created_at);
        let mut deleted = 0u64;
        rows.retain(|r| {
            if deleted < limit && r.created_at < cutoff {
                deleted += 1;
                false
            } else {
                true
            }
        });
        Ok(deleted)
    }

    async fn total_count(&self, table: &str) -> anyhow::Result<u64> {
        let tables = self.tables.lock().await;
        Ok(tables.get(table).map(|rows| rows.len() as u64).unwrap_or(0))
    }

    async fn record_purge_audit(&self, row: PurgeAuditRow) -> anyhow::Result<()> {
        self.purge_audit.lock().await.push(row);
        Ok(())
    }
}

/// Durable backend over Postgres, selected with the `postgres-store`
/// feature. Table names come from the retention coordinator's fixed
/// `retention_tables` allow-list (§4.8), never from request bodies, so
/// interpolating them into the query text does not admit caller-controlled
/// SQL.
#[cfg(feature = "postgres-store")]
pub struct PostgresRelationalStore {
    pool: sqlx::PgPool,
}

#[cfg(feature = "postgres-store")]
impl PostgresRelationalStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }
}

#[cfg(feature = "postgres-store")]
#[async_trait]
impl RelationalStore for PostgresRelationalStore {
    async fn count_older_than(&self, table: &str, cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
        let query = format!("SELECT count(*) FROM {table} WHERE created_at < $1");
        let (count,): (i64,) = sqlx::query_as(&query).bind(cutoff).fetch_one(&self.pool).await?;
        Ok(count.max(0) as u64)
    }

    async fn delete_older_than(
        &self,
        table: &str,
        cutoff: DateTime<Utc>,
        limit: u64,
    ) -> anyhow::Result<u64> {
        let query = format!(
            "DELETE FROM {table} WHERE id IN \
             (SELECT id FROM {table} WHERE created_at < $1 ORDER BY created_at LIMIT $2)"
        );
        let result = sqlx::query(&query)
            .bind(cutoff)
            .bind(limit as i64)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn total_count(&self, table: &str) -> anyhow::Result<u64> {
        let query = format!("SELECT count(*) FROM {table}");
        let (count,): (i64,) = sqlx::query_as(&query).fetch_one(&self.pool).await?;
        Ok(count.max(0) as u64)
    }

    async fn record_purge_audit(&self, row: PurgeAuditRow) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO purge_audit \
             (policy_id, table_name, records_purged, cutoff_date, executed_at, executed_by, reason) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(row.policy_id)
        .bind(row.table_name)
        .bind(row.records_purged as i64)
        .bind(row.cutoff_date)
        .bind(row.executed_at)
        .bind(row.executed_by)
        .bind(row.reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn delete_older_than_respects_limit_and_cutoff() {
        let store = InMemoryRelationalStore::new();
        let now = Utc::now();
        store
            .seed(
                "incidents",
                vec![
                    EntityRow { id: "1".into(), created_at: now - Duration::days(10) },
                    EntityRow { id: "2".into(), created_at: now - Duration::days(5) },
                    EntityRow { id: "3".into(), created_at: now },
                ],
            )
            .await;

        let cutoff = now - Duration::days(3);
        let deleted = store.delete_older_than("incidents", cutoff, 100).await.unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(store.total_count("incidents").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn records_purge_audit_rows() {
        let store = InMemoryRelationalStore::new();
        store
            .record_purge_audit(PurgeAuditRow {
                policy_id: "p1".into(),
                table_name: "incidents".into(),
                records_purged: 3,
                cutoff_date: Utc::now(),
                executed_at: Utc::now(),
                executed_by: "scheduler".into(),
                reason: "scheduled".into(),
            })
            .await
            .unwrap();
        assert_eq!(store.purge_audit_rows().await.len(), 1);
    }
}
