//! One error taxonomy for every relay endpoint, mapped onto HTTP statuses in
//! a single place. Internal detail goes to the log, never to the client.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use katulong_core::auth::AuthError;
use katulong_core::client::RpcError;
use tracing::error;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("{0}")]
    Forbidden(String),
    #[error("not found")]
    NotFound,
    #[error("{0}")]
    Conflict(String),
    #[error("locked out")]
    LockedOut { retry_after_secs: u64 },
    #[error("{0}")]
    Upstream(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Unauthenticated => ApiError::Unauthenticated,
            AuthError::Forbidden => ApiError::Forbidden("forbidden".into()),
            AuthError::LockedOut { retry_after_secs } => ApiError::LockedOut { retry_after_secs },
            AuthError::BadRequest(msg) => ApiError::BadRequest(msg),
            AuthError::NotFound => ApiError::NotFound,
            AuthError::Conflict => ApiError::Conflict("conflict".into()),
            AuthError::Internal(msg) => ApiError::Internal(anyhow::anyhow!(msg)),
        }
    }
}

impl From<RpcError> for ApiError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Unavailable => ApiError::Upstream("daemon disconnected".into()),
            RpcError::Timeout => ApiError::Upstream("daemon rpc timed out".into()),
            RpcError::Daemon(msg) => {
                // The daemon reports failures as text; classify the known ones.
                if msg.contains("already exists") {
                    ApiError::Conflict(msg)
                } else if msg.contains("no such session") {
                    ApiError::NotFound
                } else {
                    ApiError::BadRequest(msg)
                }
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::Unauthenticated => (StatusCode::UNAUTHORIZED, "unauthenticated".into()),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg.clone()),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "not found".into()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            ApiError::LockedOut { retry_after_secs } => {
                let body = Json(serde_json::json!({
                    "error": "too many failed attempts",
                    "retryAfterSeconds": retry_after_secs,
                }));
                return (
                    StatusCode::TOO_MANY_REQUESTS,
                    [(header::RETRY_AFTER, retry_after_secs.to_string())],
                    body,
                )
                    .into_response();
            }
            ApiError::Upstream(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            ApiError::Internal(err) => {
                error!(error = ?err, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal server error".into())
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}
