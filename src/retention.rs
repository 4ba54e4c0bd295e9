//! Retention coordinator (C8, §4.8 "Core Subset").
//!
//! Grounded on the teacher's `compliance::retention::RetentionManager`
//! policy/cutoff shape, generalized from a single per-resource-type
//! retain/delete check into a bounded, auditable bulk-purge request against
//! the relational store collaborator.

use crate::collaborators::{AuditSink, PurgeAuditRow, RelationalStore};
use crate::error::{HealError, HealResult};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// Maximum rows a single purge request may touch (§4.8: `maxRecords≤100_000`).
pub const MAX_RECORDS_CAP: u64 = 100_000;

/// Risk tier produced by [`assess_risk`] (§4.8 "Risk assessment").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// HIGH/CRITICAL require explicit confirmation before a real (non-dry-run) purge.
    pub fn requires_confirmation(self) -> bool {
        matches!(self, RiskLevel::High | RiskLevel::Critical)
    }
}

/// A bounded purge request (§4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurgeRequest {
    pub retention_days: u32,
    pub table_name: Option<String>,
    pub scope: String,
    pub max_records: u64,
    pub dry_run: bool,
    pub cutoff_date: Option<DateTime<Utc>>,
    pub create_backup: bool,
    pub verify_integrity: bool,
    pub reason: String,
    pub confirmed: bool,
}

impl PurgeRequest {
    /// Validate the request's caps before any table is touched.
    pub fn validate(&self) -> HealResult<()> {
        if !(1..=7).contains(&self.retention_days) {
            return Err(HealError::RetentionRejected(
                "retentionDays must be in 1..=7".to_string(),
            ));
        }
        if self.max_records > MAX_RECORDS_CAP {
            return Err(HealError::RetentionRejected(format!(
                "maxRecords must be <= {MAX_RECORDS_CAP}"
            )));
        }
        if let Some(cutoff) = self.cutoff_date {
            // Open Question 2 (§9): we reject a future cutoffDate outright.
            if cutoff > Utc::now() {
                return Err(HealError::RetentionRejected(
                    "cutoffDate must not be in the future".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn cutoff(&self) -> DateTime<Utc> {
        self.cutoff_date
            .unwrap_or_else(|| Utc::now() - ChronoDuration::hours(24 * self.retention_days as i64))
    }
}

/// Outcome of one table's purge within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TablePurgeResult {
    pub table_name: String,
    pub risk: RiskLevel,
    pub records_affected: u64,
    pub dry_run: bool,
}

/// Assess risk for a candidate purge of `rows` out of `total_rows` total,
/// per §4.8's CRITICAL triggers (checked in order; first match wins, else HIGH/MEDIUM/LOW below).
pub fn assess_risk(
    rows: u64,
    total_rows: u64,
    create_backup: bool,
    retention_days: u32,
) -> RiskLevel {
    let pct_of_table = if total_rows > 0 {
        rows as f64 / total_rows as f64
    } else {
        0.0
    };

    if rows > 50_000
        || pct_of_table > 0.8
        || (!create_backup && rows > 1_000)
        || (retention_days == 1 && rows > 10_000)
    {
        return RiskLevel::Critical;
    }
    if rows > 10_000 || pct_of_table > 0.5 {
        return RiskLevel::High;
    }
    if rows > 1_000 || pct_of_table > 0.2 {
        return RiskLevel::Medium;
    }
    RiskLevel::Low
}

/// Coordinates bounded purges across the relational store, writing an
/// audit row per table per run.
pub struct RetentionCoordinator {
    store: Arc<dyn RelationalStore>,
    audit: Arc<dyn AuditSink>,
}

impl RetentionCoordinator {
    pub fn new(store: Arc<dyn RelationalStore>, audit: Arc<dyn AuditSink>) -> Self {
        Self { store, audit }
    }

    /// Run a bounded purge against one or more tables.
    pub async fn purge(
        &self,
        request: &PurgeRequest,
        tables: &[String],
        policy_id: &str,
    ) -> HealResult<Vec<TablePurgeResult>> {
        request.validate()?;
        let cutoff = request.cutoff();
        let candidate_tables: Vec<String> = match &request.table_name {
            Some(t) => vec![t.clone()],
            None => tables.to_vec(),
        };

        let mut results = Vec::with_capacity(candidate_tables.len());
        for table in candidate_tables {
            let matching = self
                .store
                .count_older_than(&table, cutoff)
                .await
                .map_err(|e| HealError::ExternalSystem(e.into()))?;
            let total = self
                .store
                .total_count(&table)
                .await
                .map_err(|e| HealError::ExternalSystem(e.into()))?;
            let bounded = matching.min(request.max_records);
            let risk = assess_risk(bounded, total, request.create_backup, request.retention_days);

            if risk.requires_confirmation() && !request.confirmed && !request.dry_run {
                return Err(HealError::RetentionRejected(format!(
                    "purge of '{table}' assessed as {risk:?}; explicit confirmation required"
                )));
            }

            let affected = if request.dry_run {
                bounded
            } else {
                self.store
                    .delete_older_than(&table, cutoff, bounded)
                    .await
                    .map_err(|e| HealError::ExternalSystem(e.into()))?
            };

            if !request.dry_run {
                if let Err(e) = self
                    .store
                    .record_purge_audit(PurgeAuditRow {
                        policy_id: policy_id.to_string(),
                        table_name: table.clone(),
                        records_purged: affected,
                        cutoff_date: cutoff,
                        executed_at: Utc::now(),
                        executed_by: "retention-coordinator".to_string(),
                        reason: request.reason.clone(),
                    })
                    .await
                {
                    warn!(error = %e, table, "purge audit write failed");
                }

                crate::collaborators::audit::record_best_effort(
                    self.audit.as_ref(),
                    crate::collaborators::AuditEvent {
                        user_id: None,
                        action: "retention-purge".to_string(),
                        resource: table.clone(),
                        resource_id: policy_id.to_string(),
                        details: serde_json::json!({ "recordsPurged": affected, "risk": risk }),
                        ip_address: None,
                        user_agent: None,
                        recorded_at: Utc::now(),
                    },
                )
                .await;
            }

            results.push(TablePurgeResult {
                table_name: table,
                risk,
                records_affected: affected,
                dry_run: request.dry_run,
            });
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{EntityRow, InMemoryAuditSink, InMemoryRelationalStore};

    fn base_request() -> PurgeRequest {
        PurgeRequest {
            retention_days: 3,
            table_name: Some("incidents".to_string()),
            scope: "all".to_string(),
            max_records: 1_000,
            dry_run: true,
            cutoff_date: None,
            create_backup: true,
            verify_integrity: false,
            reason: "scheduled".to_string(),
            confirmed: false,
        }
    }

    #[test]
    fn retention_days_out_of_range_rejected() {
        let mut request = base_request();
        request.retention_days = 0;
        assert!(request.validate().is_err());
        request.retention_days = 8;
        assert!(request.validate().is_err());
        request.retention_days = 3;
        assert!(request.validate().is_ok());
    }

    #[test]
    fn future_cutoff_rejected() {
        let mut request = base_request();
        request.cutoff_date = Some(Utc::now() + ChronoDuration::days(1));
        assert!(request.validate().is_err());
    }

    #[test]
    fn risk_escalates_to_critical_without_backup() {
        assert_eq!(assess_risk(1_500, 10_000, false, 3), RiskLevel::Critical);
        assert_eq!(assess_risk(1_500, 10_000, true, 3), RiskLevel::Medium);
    }

    #[test]
    fn risk_escalates_to_critical_over_80pct_of_table() {
        assert_eq!(assess_risk(900, 1_000, true, 3), RiskLevel::Critical);
    }

    #[tokio::test]
    async fn dry_run_counts_without_deleting() {
        let store = Arc::new(InMemoryRelationalStore::new());
        let now = Utc::now();
        store
            .seed(
                "incidents",
                vec![EntityRow { id: "1".into(), created_at: now - ChronoDuration::days(10) }],
            )
            .await;
        let coordinator = RetentionCoordinator::new(store.clone(), Arc::new(InMemoryAuditSink::new()));
        let results = coordinator
            .purge(&base_request(), &["incidents".to_string()], "policy-1")
            .await
            .unwrap();
        assert_eq!(results[0].records_affected, 1);
        assert_eq!(store.total_count("incidents").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn high_risk_purge_without_confirmation_is_rejected() {
        let store = Arc::new(InMemoryRelationalStore::new());
        let now = Utc::now();
        let rows: Vec<_> = (0..2000)
            .map(|i| EntityRow { id: i.to_string(), created_at: now - ChronoDuration::days(10) })
            .collect();
        store.seed("incidents", rows).await;
        let coordinator = RetentionCoordinator::new(store, Arc::new(InMemoryAuditSink::new()));
        let mut request = base_request();
        request.dry_run = false;
        request.create_backup = false;
        request.max_records = 2000;
        let result = coordinator
            .purge(&request, &["incidents".to_string()], "policy-1")
            .await;
        assert!(result.is_err());
    }
}
