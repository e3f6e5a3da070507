use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Semantic error taxonomy shared across every component. Validation and
/// NotFound are surfaced to HTTP callers; BrokerTransient/SchemaViolation/
/// SpawnFailure/WatcherLost are logged and turned into domain events or
/// connection teardowns by their owning component rather than bubbled here.
#[derive(Debug, thiserror::Error)]
pub enum SwitchboardError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("broker transient error: {0}")]
    BrokerTransient(#[source] anyhow::Error),

    #[error("schema violation: {0}")]
    SchemaViolation(String),

    #[error("spawn failure: {0}")]
    SpawnFailure(String),

    #[error("watcher lost: {0}")]
    WatcherLost(String),

    #[error("conflict: {0}")]
    Conflict(String),
}

impl IntoResponse for SwitchboardError {
    fn into_response(self) -> Response {
        let status = match &self {
            SwitchboardError::Validation(_) => StatusCode::BAD_REQUEST,
            SwitchboardError::NotFound(_) => StatusCode::NOT_FOUND,
            SwitchboardError::BrokerTransient(_) => StatusCode::INTERNAL_SERVER_ERROR,
            SwitchboardError::SchemaViolation(_) => StatusCode::BAD_REQUEST,
            SwitchboardError::SpawnFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            SwitchboardError::WatcherLost(_) => StatusCode::INTERNAL_SERVER_ERROR,
            SwitchboardError::Conflict(_) => StatusCode::CONFLICT,
        };
        let body = serde_json::json!({ "error": self.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, SwitchboardError>;
