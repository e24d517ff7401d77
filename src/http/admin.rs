use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::error::{ApiError, ApiResult};
use super::AppState;
use crate::config::PanelConfig;
use crate::service::ServiceController;
use crate::throttle::{LoginAttempt, ThrottlePolicy};

/// Delay before the panel restarts itself, so the response gets out first.
const PANEL_RESTART_DELAY: Duration = Duration::from_millis(500);

/// Upper bound for the throttle window and block duration (ten years).
const MAX_THROTTLE_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Editable subset of [`PanelConfig`]. Absent fields keep their value; an
/// empty password keeps the current one. The block list is managed through
/// the login-blocks endpoints only.
#[derive(Debug, Default, Deserialize)]
pub struct PanelConfigUpdate {
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub logging: Option<bool>,
    pub max_login_attempts: Option<u32>,
    #[serde(alias = "login_attempt_window_seconds")]
    pub login_attempt_window: Option<u64>,
    #[serde(alias = "block_duration_seconds")]
    pub block_duration: Option<u64>,
    pub theme: Option<String>,
}

impl PanelConfigUpdate {
    fn apply(self, mut config: PanelConfig) -> Result<PanelConfig, ApiError> {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(username) = self.username {
            if username.trim().is_empty() {
                return Err(ApiError::BadRequest("username must not be empty".into()));
            }
            config.username = username;
        }
        if let Some(password) = self.password.filter(|p| !p.is_empty()) {
            config.password = password;
        }
        if let Some(logging) = self.logging {
            config.logging = logging;
        }
        if let Some(max) = self.max_login_attempts {
            if max == 0 {
                return Err(ApiError::BadRequest(
                    "max_login_attempts must be at least 1".into(),
                ));
            }
            config.max_login_attempts = max;
        }
        if let Some(window) = self.login_attempt_window {
            config.login_attempt_window = bounded_secs("login_attempt_window", window)?;
        }
        if let Some(block) = self.block_duration {
            config.block_duration = bounded_secs("block_duration", block)?;
        }
        if let Some(theme) = self.theme {
            config.theme = theme;
        }
        Ok(config)
    }
}

fn bounded_secs(field: &str, secs: u64) -> Result<u64, ApiError> {
    if secs > MAX_THROTTLE_SECS {
        return Err(ApiError::BadRequest(format!(
            "{field} must be at most {MAX_THROTTLE_SECS} seconds"
        )));
    }
    Ok(secs)
}

/// Body of `GET /api/login-attempts`.
#[derive(Debug, Serialize)]
pub struct LoginAttempts {
    /// Live throttle records, ordered by address.
    pub attempts: Vec<LoginAttempt>,
}

/// Current config with the password blanked.
pub async fn get_panel_config(State(state): State<AppState>) -> Json<PanelConfig> {
    Json(state.config.current().await.redacted())
}

/// Saves an edit, applies the new throttle policy and schedules a panel
/// restart so the remaining settings take effect.
pub async fn update_panel_config(
    State(state): State<AppState>,
    Json(update): Json<PanelConfigUpdate>,
) -> ApiResult<Json<Value>> {
    let config = update.apply(state.config.current().await)?;
    state.config.replace(config.clone()).await?;
    state
        .throttle
        .set_policy(ThrottlePolicy::from_config(&config))
        .await;
    tracing::info!("Panel config updated");

    schedule_restart(state.panel_service.clone());
    Ok(Json(json!({ "success": true, "restart_scheduled": true })))
}

/// Durable block list.
pub async fn list_login_blocks(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "blocked_ips": state.config.blocked_ips().await }))
}

/// Lifts a durable block and forgets the address's throttle record.
pub async fn lift_login_block(
    State(state): State<AppState>,
    Path(ip): Path<String>,
) -> ApiResult<Json<Value>> {
    if !state.config.unblock_ip(&ip).await? {
        return Err(ApiError::NotFound(format!("address '{ip}' is not blocked")));
    }
    state.throttle.clear(&ip).await;
    Ok(Json(json!({ "success": true, "ip": ip })))
}

/// Transient throttle records.
pub async fn list_login_attempts(State(state): State<AppState>) -> Json<LoginAttempts> {
    Json(LoginAttempts {
        attempts: state.throttle.entries().await,
    })
}

/// Restarts the proxy; queued behind any revoke in flight.
pub async fn restart_server_service(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    state.revoker.restart_proxy().await?;
    tracing::info!("Proxy service restarted from panel");
    Ok(Json(json!({ "success": true })))
}

/// Answers `202 Accepted` and restarts the panel shortly after.
pub async fn restart_panel_service(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    schedule_restart(state.panel_service.clone());
    (
        StatusCode::ACCEPTED,
        Json(json!({ "success": true, "restart_scheduled": true })),
    )
}

fn schedule_restart(panel: Arc<dyn ServiceController>) {
    tokio::spawn(async move {
        tokio::time::sleep(PANEL_RESTART_DELAY).await;
        tracing::info!(service = %panel.name(), "Restarting panel service");
        if let Err(e) = panel.restart().await {
            tracing::error!(error = %e, "Failed to restart panel service");
        }
    });
}
