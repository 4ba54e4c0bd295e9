//! Control-plane HTTP surface (§6.1). Adapted from the teacher's
//! `api::{rest, middleware}` (axum + tower-http), wired to the subsystems
//! directly instead of through the teacher's service-layer indirection.

pub mod dto;
pub mod error;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use routes::router;
pub use state::AppState;
