use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde_json::json;

use crate::error::{ConfigError, RevokeError, StoreError};
use crate::service::ServiceError;

/// Error type of the HTTP handlers.
///
/// Renders as `{"error": message, "code": CODE}`. Revoke failures add a
/// `degraded` flag telling the operator the proxy may be down.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Revoke(#[from] RevokeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Session(#[from] tower_sessions::session::Error),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("authentication required")]
    Unauthorized,

    #[error("invalid username or password, {remaining_attempts} attempts remaining")]
    InvalidCredentials { remaining_attempts: u32 },

    #[error("too many failed login attempts, try again later")]
    Throttled { until: DateTime<Utc> },

    #[error("access from this address is blocked")]
    Blocked,
}

pub type ApiResult<T> = Result<T, ApiError>;

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::Revoke(err) => revoke_status(err),
            ApiError::Store(err) => store_status(err),
            ApiError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "CONFIG_ERROR"),
            ApiError::Service(_) => (StatusCode::BAD_GATEWAY, "SERVICE_ERROR"),
            ApiError::Session(_) => (StatusCode::INTERNAL_SERVER_ERROR, "SESSION_ERROR"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            ApiError::InvalidCredentials { .. } => {
                (StatusCode::UNAUTHORIZED, "INVALID_CREDENTIALS")
            }
            ApiError::Throttled { .. } => (StatusCode::TOO_MANY_REQUESTS, "TOO_MANY_ATTEMPTS"),
            ApiError::Blocked => (StatusCode::FORBIDDEN, "ADDRESS_BLOCKED"),
        };

        if status.is_server_error() {
            tracing::error!(error = %self, code, "Request failed");
        }

        let mut body = json!({
            "error": self.to_string(),
            "code": code,
        });
        match &self {
            ApiError::Revoke(err) => {
                body["degraded"] = json!(err.is_degraded());
            }
            ApiError::InvalidCredentials { remaining_attempts } => {
                body["remaining_attempts"] = json!(remaining_attempts);
            }
            ApiError::Throttled { until } => {
                body["blocked_until"] = json!(until);
            }
            _ => {}
        }

        let mut response = (status, Json(body)).into_response();
        if let ApiError::Throttled { until } = &self {
            let secs = (*until - Utc::now()).num_seconds().max(1);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

fn revoke_status(err: &RevokeError) -> (StatusCode, &'static str) {
    match err {
        RevokeError::NotFound { .. } => (StatusCode::NOT_FOUND, "SESSION_NOT_FOUND"),
        RevokeError::ServiceStop(_) => (StatusCode::BAD_GATEWAY, "SERVICE_STOP_FAILED"),
        RevokeError::Mutation { source, .. } => match store_status(source) {
            (StatusCode::SERVICE_UNAVAILABLE, code) => (StatusCode::SERVICE_UNAVAILABLE, code),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "MUTATION_FAILED"),
        },
        RevokeError::RestartAfterMutation(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "SERVICE_RESTART_FAILED_AFTER_MUTATION",
        ),
        RevokeError::Restart(_) => (StatusCode::BAD_GATEWAY, "SERVICE_RESTART_FAILED"),
        RevokeError::CoordinatorStopped => {
            (StatusCode::SERVICE_UNAVAILABLE, "COORDINATOR_STOPPED")
        }
    }
}

fn store_status(err: &StoreError) -> (StatusCode, &'static str) {
    match err {
        StoreError::Locked(_) | StoreError::Unavailable(_) => {
            (StatusCode::SERVICE_UNAVAILABLE, "STORE_UNAVAILABLE")
        }
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "STORE_ERROR"),
    }
}
