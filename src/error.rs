//! Engine error type and its HTTP mapping.

use std::collections::BTreeMap;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::engine::domain::runs::RunStatus;

/// Errors surfaced by the orchestration core.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Missing or invalid subject, unknown user, no caller context.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Authenticated, but neither owner nor team member of the target.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Run, chat item, or undoable effect absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Illegal request or state transition.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Submitted answers failed validation; the run keeps waiting.
    #[error("validation failed for {} field(s)", .0.len())]
    Validation(BTreeMap<String, String>),

    /// Enqueue to the work queue failed after a status transition.
    #[error("dispatch failed for run `{run_id}`: {source}")]
    Dispatch {
        run_id: String,
        #[source]
        source: anyhow::Error,
    },

    /// Anything raised by an external boundary that is not one of the above.
    #[error("internal error: {0}")]
    Internal(anyhow::Error),
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Illegal transition; names the actual and the expected status.
    pub fn invalid_transition(run_id: &str, actual: RunStatus, expected: &[RunStatus]) -> Self {
        let expected = expected
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" | ");
        Self::BadRequest(format!(
            "run `{run_id}` is {actual}, expected {expected}"
        ))
    }

    pub fn run_not_found(run_id: &str) -> Self {
        Self::NotFound(format!("run `{run_id}` not found"))
    }

    /// Short machine-readable code used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::BadRequest(_) => "bad_request",
            Self::Validation(_) => "validation_failed",
            Self::Dispatch { .. } => "dispatch_failed",
            Self::Internal(_) => "internal",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Dispatch { .. } => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Boundary errors are `anyhow`; an `EngineError` raised inside an atomic
/// update closure travels through them and is recovered here.
impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<EngineError>() {
            Ok(engine) => engine,
            Err(other) => Self::Internal(other),
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let mut body = json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        });
        if let Self::Validation(errors) = &self {
            body["error"]["fields"] = json!(errors);
        }

        (status, Json(body)).into_response()
    }
}
