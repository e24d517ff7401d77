//! Panel login, logout and the guard for `/api`.

use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};

use axum::extract::{ConnectInfo, FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use axum::{Form, Json};
use serde::{Deserialize, Serialize};
use tower_sessions::Session;

use super::error::{ApiError, ApiResult};
use super::AppState;
use crate::throttle::{FailureOutcome, ThrottleStatus};

/// Session key holding the name of the logged-in administrator.
pub const AUTH_USER_KEY: &str = "authenticated_user";

/// Address of the client as seen through a reverse proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIp(pub String);

impl<S> FromRequestParts<S> for ClientIp
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        Ok(ClientIp(client_ip(&parts.headers, peer)))
    }
}

/// First `X-Forwarded-For` hop, then `X-Real-IP`, then the socket peer.
pub fn client_ip(headers: &HeaderMap, peer: Option<IpAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());
    if let Some(ip) = forwarded {
        return ip.to_string();
    }

    let real_ip = headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());
    if let Some(ip) = real_ip {
        return ip.to_string();
    }

    peer.map_or_else(|| "unknown".to_string(), |ip| ip.to_string())
}

#[derive(Debug, Deserialize)]
pub struct LoginForm {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub success: bool,
    pub username: String,
}

pub async fn login(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    session: Session,
    Form(form): Form<LoginForm>,
) -> ApiResult<Json<LoginResponse>> {
    if state.throttle.is_durably_blocked(&ip).await {
        tracing::warn!(%ip, "Login attempt from blocked address");
        return Err(ApiError::Blocked);
    }

    if let ThrottleStatus::Blocked { until, .. } = state.throttle.check(&ip).await {
        tracing::warn!(%ip, %until, "Login attempt while throttled");
        return Err(ApiError::Throttled { until });
    }

    let config = state.config.current().await;
    if form.username == config.username && form.password == config.password {
        session.cycle_id().await?;
        session.insert(AUTH_USER_KEY, &form.username).await?;
        state.throttle.clear(&ip).await;
        tracing::info!(%ip, username = %form.username, "Panel login succeeded");
        return Ok(Json(LoginResponse {
            success: true,
            username: form.username,
        }));
    }

    match state.throttle.record_failure(&ip).await {
        FailureOutcome::Counting {
            attempts,
            remaining_attempts,
        } => {
            tracing::warn!(%ip, attempts, remaining_attempts, "Panel login failed");
            Err(ApiError::InvalidCredentials { remaining_attempts })
        }
        FailureOutcome::Blocked { until, .. } => Err(ApiError::Throttled { until }),
    }
}

pub async fn logout(session: Session) -> ApiResult<Json<serde_json::Value>> {
    session.flush().await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

/// Rejects requests without a logged-in panel session.
pub async fn require_login(session: Session, request: Request, next: Next) -> ApiResult<Response> {
    match session.get::<String>(AUTH_USER_KEY).await? {
        Some(_) => Ok(next.run(request).await),
        None => Err(ApiError::Unauthorized),
    }
}
