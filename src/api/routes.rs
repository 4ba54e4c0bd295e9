//! Route handlers for §6.1.

use crate::api::dto::{
    CleanQueueQuery, CreateIncidentRequest, CreateIncidentResponse, EnqueueResponse,
    HealthCheckRequest, PurgeRequestBody, PurgeResponse,
};
use crate::api::error::ApiError;
use crate::api::state::AppState;
use crate::incident::{Incident, IncidentState};
use crate::queue::{JobOptions, JobPriority};
use crate::retention::PurgeRequest;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use std::time::Duration;

/// Incident processing defaults to 15 fix attempts (§6.7) when the caller
/// doesn't override it.
const DEFAULT_MAX_FIX_ATTEMPTS: u32 = 15;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/jobs/incidents", post(create_incident))
        .route("/jobs/data-retention/purge", post(purge))
        .route("/jobs/data-retention/cleanup-artifacts", post(cleanup_artifacts))
        .route("/jobs/data-retention/anonymize", post(anonymize))
        .route("/jobs/health-checks/sites/:id", post(health_check_site))
        .route("/jobs/health-checks/servers/:id", post(health_check_server))
        .route("/jobs/health-checks/system", post(health_check_system))
        .route("/jobs/queues/stats", get(queue_stats))
        .route("/jobs/queues/:name/pause", put(pause_queue))
        .route("/jobs/queues/:name/resume", put(resume_queue))
        .route("/jobs/queues/:name/clean", put(clean_queue))
        .route("/health/ready", get(readiness))
        .route("/health/live", get(liveness))
        .route("/health/startup", get(startup))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn create_incident(
    State(state): State<AppState>,
    Json(body): Json<CreateIncidentRequest>,
) -> Result<Json<CreateIncidentResponse>, ApiError> {
    let correlation_id = uuid::Uuid::new_v4().to_string();
    let mut metadata = body.metadata.unwrap_or_else(|| serde_json::json!({}));
    if let Some(obj) = metadata.as_object_mut() {
        if let Some(priority) = body.priority {
            obj.insert("priority".to_string(), serde_json::to_value(priority).unwrap_or_default());
        }
    }

    let incident = Incident {
        id: uuid::Uuid::new_v4().to_string(),
        site_id: body.site_id,
        server_id: body.server_id,
        state: IncidentState::New,
        fix_attempts: 0,
        max_fix_attempts: body.max_fix_attempts.unwrap_or(DEFAULT_MAX_FIX_ATTEMPTS),
        payload: serde_json::json!({ "triggerType": body.trigger_type }),
        metadata,
        correlation_id: correlation_id.clone(),
    };
    let incident_id = incident.id.clone();

    let outcome = state.incidents.process(incident).await?;
    state.metrics.incident_processed();
    if outcome.should_escalate {
        state.metrics.incident_escalated();
    }

    Ok(Json(CreateIncidentResponse {
        success: outcome.to_state.is_some() || outcome.cached,
        incident_id: Some(incident_id),
        job_id: outcome.enqueued_job_id,
        correlation_id: Some(correlation_id.clone()),
        trace_id: Some(correlation_id),
        state: outcome.to_state,
        reason: outcome.reason,
        cooldown_until: outcome.cooldown_until,
        should_escalate: Some(outcome.should_escalate),
    }))
}

async fn purge(
    State(state): State<AppState>,
    Json(body): Json<PurgeRequestBody>,
) -> Result<Json<PurgeResponse>, ApiError> {
    let request = PurgeRequest {
        retention_days: body.retention_days,
        table_name: body.table_name,
        scope: "api".to_string(),
        max_records: body.max_records,
        dry_run: body.dry_run,
        cutoff_date: body.cutoff_date,
        create_backup: body.create_backup,
        verify_integrity: body.verify_integrity,
        reason: body.reason,
        confirmed: body.confirmed,
    };
    let results = state
        .retention
        .purge(&request, &state.retention_tables, "api-triggered")
        .await?;
    for result in &results {
        state.metrics.purge_executed(result.records_affected);
    }
    Ok(Json(PurgeResponse { success: true, results }))
}

async fn cleanup_artifacts(State(state): State<AppState>) -> Result<Json<EnqueueResponse>, ApiError> {
    enqueue_housekeeping(&state, "data-retention", serde_json::json!({ "action": "cleanup-artifacts" })).await
}

async fn anonymize(State(state): State<AppState>) -> Result<Json<EnqueueResponse>, ApiError> {
    enqueue_housekeeping(&state, "data-retention", serde_json::json!({ "action": "anonymize" })).await
}

async fn health_check_site(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<HealthCheckRequest>,
) -> Result<Json<EnqueueResponse>, ApiError> {
    enqueue_health_check(&state, "site", &id, body).await
}

async fn health_check_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<HealthCheckRequest>,
) -> Result<Json<EnqueueResponse>, ApiError> {
    enqueue_health_check(&state, "server", &id, body).await
}

async fn health_check_system(
    State(state): State<AppState>,
    Json(body): Json<HealthCheckRequest>,
) -> Result<Json<EnqueueResponse>, ApiError> {
    enqueue_health_check(&state, "system", "all", body).await
}

async fn enqueue_health_check(
    state: &AppState,
    target_kind: &str,
    target_id: &str,
    body: HealthCheckRequest,
) -> Result<Json<EnqueueResponse>, ApiError> {
    let job_id = state
        .queue
        .enqueue(
            "health-checks",
            serde_json::json!({ "targetKind": target_kind, "targetId": target_id }),
            JobOptions {
                priority: body.priority.unwrap_or(JobPriority::Medium),
                ..Default::default()
            },
        )
        .await?;
    state.metrics.job_enqueued();
    Ok(Json(EnqueueResponse { success: true, job_id }))
}

async fn enqueue_housekeeping(
    state: &AppState,
    queue_name: &str,
    payload: serde_json::Value,
) -> Result<Json<EnqueueResponse>, ApiError> {
    let job_id = state.queue.enqueue(queue_name, payload, JobOptions::default()).await?;
    state.metrics.job_enqueued();
    Ok(Json(EnqueueResponse { success: true, job_id }))
}

async fn queue_stats(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let mut stats = serde_json::Map::new();
    for name in ["incident-processing", "data-retention", "health-checks"] {
        let snapshot = state.queue.stats(name).await?;
        stats.insert(name.to_string(), serde_json::to_value(snapshot).unwrap_or_default());
    }
    Ok(Json(serde_json::Value::Object(stats)))
}

async fn pause_queue(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.queue.pause(&name)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn resume_queue(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.queue.resume(&name)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn clean_queue(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<CleanQueueQuery>,
) -> Result<StatusCode, ApiError> {
    state
        .queue
        .clean(&name, Duration::from_secs(query.grace_period_hours * 3600))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn readiness(State(state): State<AppState>) -> StatusCode {
    if state.health.readiness_probe() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn liveness(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    if state.health.liveness_probe()? {
        Ok(StatusCode::OK)
    } else {
        Ok(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

async fn startup(State(state): State<AppState>) -> StatusCode {
    if state.health.startup_probe() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn metrics(State(state): State<AppState>) -> Json<crate::observability::metrics::MetricsSnapshot> {
    Json(state.metrics.snapshot())
}
