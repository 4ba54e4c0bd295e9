//! Request/response bodies for §6.1, camelCase over the wire per the data
//! model's field naming.

use crate::incident::IncidentState;
use crate::queue::JobPriority;
use crate::retention::TablePurgeResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateIncidentRequest {
    pub site_id: String,
    pub server_id: String,
    pub trigger_type: String,
    #[serde(default)]
    pub priority: Option<JobPriority>,
    #[serde(default)]
    pub max_fix_attempts: Option<u32>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateIncidentResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incident_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<IncidentState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_until: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub should_escalate: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeRequestBody {
    pub retention_days: u32,
    #[serde(default)]
    pub table_name: Option<String>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "default_max_records")]
    pub max_records: u64,
    #[serde(default = "default_true")]
    pub create_backup: bool,
    #[serde(default)]
    pub verify_integrity: bool,
    #[serde(default)]
    pub cutoff_date: Option<DateTime<Utc>>,
    #[serde(default = "default_reason")]
    pub reason: String,
    #[serde(default)]
    pub confirmed: bool,
}

fn default_max_records() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}

fn default_reason() -> String {
    "manual-purge".to_string()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeResponse {
    pub success: bool,
    pub results: Vec<TablePurgeResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckRequest {
    #[serde(default)]
    pub priority: Option<JobPriority>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanQueueQuery {
    #[serde(default = "default_grace_period_hours")]
    pub grace_period_hours: u64,
}

fn default_grace_period_hours() -> u64 {
    24
}

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub success: bool,
    pub job_id: String,
}
