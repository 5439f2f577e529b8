//! Error taxonomy for the guardrail pipeline.
//!
//! Mirrors the error kinds from the pipeline design: `InvalidInput` and
//! `ConfigurationError` are the only variants the public API raises as a
//! `Result::Err` — everything else (`GuardrailError`, `RemoteUnavailable`,
//! `AuditError`) is caught internally and folded into a `Decision` or
//! surfaced through `PipelineResult` instead. `RateLimitExceeded` is
//! deliberately not a variant here: it is a normal blocked result, not an
//! error (see `crate::pipeline`).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("configuration error in guardrail '{name}' ({kind}): {cause}")]
    Configuration {
        name: String,
        kind: String,
        cause: String,
    },

    #[error("unknown preset: {0}")]
    UnknownPreset(String),

    #[error("guardrail '{name}' failed: {cause}")]
    Guardrail { name: String, cause: String },

    #[error("remote classifier unavailable for guardrail '{name}': {cause}")]
    RemoteUnavailable { name: String, cause: String },

    #[error("audit sink error: {0}")]
    Audit(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn configuration(name: impl Into<String>, kind: impl Into<String>, cause: impl Into<String>) -> Self {
        Error::Configuration {
            name: name.into(),
            kind: kind.into(),
            cause: cause.into(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_type, msg) = match &self {
            Error::InvalidInput(msg) => (StatusCode::BAD_REQUEST, "invalid_request_error", msg.clone()),
            Error::UnknownPreset(name) => (
                StatusCode::NOT_FOUND,
                "not_found_error",
                format!("unknown preset: {name}"),
            ),
            Error::Configuration { name, kind, cause } => (
                StatusCode::BAD_REQUEST,
                "configuration_error",
                format!("guardrail '{name}' ({kind}): {cause}"),
            ),
            Error::Guardrail { .. } | Error::RemoteUnavailable { .. } | Error::Audit(_) => {
                tracing::error!(error = %self, "internal pipeline fault");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal server error".to_string(),
                )
            }
            Error::Internal(cause) => {
                tracing::error!(%cause, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "message": msg,
                "type": error_type,
            }
        }));
        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, Error>;
