//! Typed pipeline errors and their mapping onto HTTP responses.
//!
//! Deep pipeline code never raises HTTP-flavored exceptions (see
//! DESIGN.md's "exceptions for control flow" note) — it returns
//! `IngestError`, and only the transport edge (`transports::http`) knows
//! how to turn one into a status code and JSON body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("malformed payload: {0}")]
    ParseError(String),

    #[error("validation failed: {0}")]
    ValidationError(String),

    #[error("authentication failed")]
    Unauthenticated,

    #[error("not authorized for this source/domain")]
    Forbidden,

    #[error("unknown sensor or stream")]
    UnknownSensor,

    #[error("not found: {0}")]
    NotFound(&'static str),

    #[error("rate limit exceeded for {scope}: {approx_count}/{limit} per minute")]
    RateLimited {
        scope: &'static str,
        approx_count: u64,
        limit: u64,
    },

    #[error("circuit breaker '{name}' is open, retry in {remaining_secs}s")]
    CircuitOpen { name: String, remaining_secs: u64 },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("transient storage error: {0}")]
    Transient(String),

    #[error("domain '{0}' must use the device packet endpoint")]
    IotOnPacketEndpointOnly(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(&'static str),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IngestError {
    /// `true` for errors that a `RetryPolicy` should retry (transient
    /// connection/operational failures), `false` for anything that will
    /// fail identically on a second attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, IngestError::Transient(_))
            || matches!(self, IngestError::Database(e) if is_retryable_db_error(e))
    }
}

fn is_retryable_db_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => {
            // Postgres: 40001 serialization_failure, 40P01 deadlock_detected,
            // 08xxx connection exceptions.
            matches!(db_err.code().as_deref(), Some("40001") | Some("40P01"))
                || matches!(db_err.code().as_deref(), Some(code) if code.starts_with("08"))
        }
        _ => false,
    }
}

impl IntoResponse for IngestError {
    fn into_response(self) -> axum::response::Response {
        let (status, body) = match &self {
            IngestError::ParseError(msg) => (StatusCode::BAD_REQUEST, json!({"error": msg})),
            IngestError::ValidationError(msg) => (StatusCode::BAD_REQUEST, json!({"error": msg})),
            IngestError::Unauthenticated => {
                (StatusCode::UNAUTHORIZED, json!({"error": "unauthenticated"}))
            }
            IngestError::Forbidden => (StatusCode::FORBIDDEN, json!({"error": "forbidden"})),
            IngestError::UnknownSensor => {
                (StatusCode::NOT_FOUND, json!({"error": "unknown_sensor"}))
            }
            IngestError::NotFound(what) => {
                (StatusCode::NOT_FOUND, json!({"error": "not_found", "resource": what}))
            }
            IngestError::RateLimited {
                scope,
                approx_count,
                limit,
            } => (
                StatusCode::TOO_MANY_REQUESTS,
                json!({
                    "error": "rate_limit_exceeded",
                    "scope": scope,
                    "approx_count": approx_count,
                    "limit": limit,
                }),
            ),
            IngestError::CircuitOpen { name, remaining_secs } => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({"error": "circuit_breaker_open", "breaker": name, "retry_after_secs": remaining_secs}),
            ),
            IngestError::IotOnPacketEndpointOnly(domain) => (
                StatusCode::BAD_REQUEST,
                json!({"error": format!("domain '{domain}' must use /ingest/packets")}),
            ),
            IngestError::ServiceUnavailable(reason) => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({"error": "service_unavailable", "reason": reason}),
            ),
            IngestError::Database(_) | IngestError::Transient(_) | IngestError::Internal(_) => {
                tracing::error!(error = %self, "internal ingest error");
                (StatusCode::INTERNAL_SERVER_ERROR, json!({"error": "internal_error"}))
            }
        };

        let mut response = (status, Json(body)).into_response();
        if let IngestError::RateLimited { .. } = self {
            response
                .headers_mut()
                .insert("Retry-After", "60".parse().unwrap());
        }
        response
    }
}

pub type IngestResult<T> = Result<T, IngestError>;
