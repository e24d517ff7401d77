use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;

use super::error::{ApiError, ApiResult};
use super::AppState;
use crate::sessions::{RevokePhase, SessionRecord};

/// Body of `GET /api/sessions`.
#[derive(Debug, Serialize)]
pub struct SessionList {
    pub count: usize,
    pub sessions: Vec<SessionRecord>,
}

/// Body of `GET /api/sessions/count`.
#[derive(Debug, Serialize)]
pub struct SessionCount {
    pub count: usize,
}

/// Body of a successful revoke, carrying the record as rewritten.
#[derive(Debug, Serialize)]
pub struct RevokeResponse {
    pub success: bool,
    pub session: SessionRecord,
}

/// Summary shown on the panel's landing page.
#[derive(Debug, Serialize)]
pub struct Dashboard {
    /// Non-revoked sessions in the snapshot; zero when it cannot be read.
    pub active_sessions: usize,
    /// Size of the durable block list.
    pub blocked_ips: usize,
    /// Addresses with a live throttle record.
    pub throttled_addresses: usize,
    pub revoke_phase: RevokePhase,
    pub snapshot_interval_secs: u64,
}

/// Active sessions from the snapshot, in key order.
pub async fn list(State(state): State<AppState>) -> ApiResult<Json<SessionList>> {
    let sessions = state.reader.active_sessions().await?;
    Ok(Json(SessionList {
        count: sessions.len(),
        sessions,
    }))
}

/// Active session count. Read failures count as zero instead of erroring.
pub async fn count(State(state): State<AppState>) -> Json<SessionCount> {
    Json(SessionCount {
        count: state.reader.active_session_count().await,
    })
}

/// One record by id, revoked or not.
pub async fn detail(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<SessionRecord>> {
    state
        .reader
        .find_session(&session_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("session '{session_id}' not found")))
}

/// Revokes a session through the mutation coordinator. The proxy is
/// stopped and started again around the write.
pub async fn revoke(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<RevokeResponse>> {
    let session = state.revoker.revoke(&session_id).await?;
    Ok(Json(RevokeResponse {
        success: true,
        session,
    }))
}

pub async fn dashboard(State(state): State<AppState>) -> Json<Dashboard> {
    Json(Dashboard {
        active_sessions: state.reader.active_session_count().await,
        blocked_ips: state.config.blocked_ips().await.len(),
        throttled_addresses: state.throttle.entries().await.len(),
        revoke_phase: state.revoker.phase(),
        snapshot_interval_secs: state.snapshots.interval().as_secs(),
    })
}
