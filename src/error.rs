//! Crate-wide error type and HTTP mapping.
//!
//! Mirrors the teacher's `Error` enum shape (`Error::KubeError`,
//! `Error::ConfigError`, `Error::ValidationError`, `is_retriable`) but with
//! variants for the kinds this control plane actually raises (spec §7)
//! instead of Kubernetes API errors.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("unauthenticated")]
    Unauthenticated,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("upstream provider error (transient): {0}")]
    UpstreamTransient(String),

    #[error("upstream provider error (permanent): {0}")]
    UpstreamPermanent(String),

    #[error("quota exhausted")]
    QuotaExhausted,

    #[error("no capacity available for the requested instance types/regions")]
    CapacityUnavailable,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

impl Error {
    /// Whether a tick/retry loop should treat this as transient and retry,
    /// vs. surface it as a terminal failure. Mirrors the teacher's
    /// `error.is_retriable()` used to pick the reconcile requeue delay.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::UpstreamTransient(_) | Error::Internal(_))
    }

    fn status(&self) -> StatusCode {
        match self {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Unauthenticated => StatusCode::UNAUTHORIZED,
            Error::Forbidden(_) | Error::QuotaExhausted => StatusCode::FORBIDDEN,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            // Spec §6.1 exit codes enumerate 400/401/403/404/405/500 only;
            // conflicts (duplicate in-flight request, already-terminated VM)
            // and no-capacity are both surfaced as 400 validation failures.
            Error::Conflict(_) => StatusCode::BAD_REQUEST,
            Error::CapacityUnavailable => StatusCode::BAD_REQUEST,
            // Upstream provider failures have no status of their own in the
            // §6.1 exit-code table (200/201/202/400/401/403/404/405/500) --
            // they surface to the caller as a plain internal error rather
            // than leaking a gateway-specific code the spec never mentions.
            Error::UpstreamTransient(_)
            | Error::UpstreamPermanent(_)
            | Error::ConfigError(_)
            | Error::Internal(_)
            | Error::Serde(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        // Never leak raw upstream text past the UpstreamTransient/Permanent
        // wrapper; the Display impl above already produces a short message.
        let status = self.status();
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
