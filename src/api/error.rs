//! Maps [`HealError`] (and the queue dispatcher's `anyhow::Error`) onto HTTP
//! status codes for the control plane, the way the teacher's middleware
//! turns `WorkflowError` into a response status.

use crate::error::HealError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

pub struct ApiError(pub HealError);

impl From<HealError> for ApiError {
    fn from(err: HealError) -> Self {
        Self(err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self(HealError::Queue(err.to_string()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            HealError::Validation(_) => StatusCode::BAD_REQUEST,
            HealError::IncidentNotFound(_) => StatusCode::NOT_FOUND,
            HealError::UnknownQueue(_) => StatusCode::NOT_FOUND,
            HealError::NoValidTransition(_) => StatusCode::CONFLICT,
            HealError::CircuitOpen(_) => StatusCode::SERVICE_UNAVAILABLE,
            HealError::LoopBoundExceeded { .. } => StatusCode::CONFLICT,
            HealError::RetentionRejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
            HealError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            HealError::Queue(_) | HealError::OperationFailed(_) | HealError::ExternalSystem(_) => {
                StatusCode::BAD_GATEWAY
            }
            HealError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({
            "success": false,
            "error": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}
