//! JSON API of the panel.
//!
//! Everything under `/api` requires a panel login, kept in a
//! [`tower_sessions`] cookie session over the in-memory store.

use std::sync::Arc;

use axum::middleware;
use axum::routing::{delete, get, post};
use axum::Router;
use time::Duration;
use tower_http::trace::TraceLayer;
use tower_sessions::{Expiry, MemoryStore, SessionManagerLayer};

use crate::config::PanelConfigStore;
use crate::service::ServiceController;
use crate::sessions::{MutationCoordinator, SessionReader, SnapshotManager};
use crate::throttle::{ThrottlePolicy, ThrottleStore};

mod admin;
mod auth;
mod error;
mod sessions;

pub use auth::{client_ip, ClientIp, AUTH_USER_KEY};
pub use error::{ApiError, ApiResult};

/// Name of the panel's login cookie.
pub const SESSION_COOKIE: &str = "panel_session";

/// Shared handles of the running panel.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<PanelConfigStore>,
    pub throttle: Arc<ThrottleStore>,
    pub snapshots: Arc<SnapshotManager>,
    pub reader: SessionReader,
    pub revoker: MutationCoordinator,
    pub panel_service: Arc<dyn ServiceController>,
}

impl AppState {
    /// Wires the session bridge and the throttle store from the current
    /// config. Spawns the mutation worker, so it must run inside a Tokio
    /// runtime.
    pub async fn new(
        config: Arc<PanelConfigStore>,
        proxy_service: Arc<dyn ServiceController>,
        panel_service: Arc<dyn ServiceController>,
    ) -> Self {
        let current = config.current().await;
        let timings = current.sessions.timings;

        let snapshots = Arc::new(SnapshotManager::from_config(&current.sessions));
        let reader = SessionReader::new(snapshots.clone(), timings);
        let revoker = MutationCoordinator::spawn(
            &current.sessions.live_path,
            proxy_service,
            timings,
            Some(snapshots.clone()),
        );
        let throttle = Arc::new(ThrottleStore::new(
            ThrottlePolicy::from_config(&current),
            config.clone(),
        ));

        Self {
            config,
            throttle,
            snapshots,
            reader,
            revoker,
            panel_service,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let session_layer = SessionManagerLayer::new(MemoryStore::default())
        .with_name(SESSION_COOKIE)
        .with_secure(false)
        .with_http_only(true)
        .with_expiry(Expiry::OnInactivity(Duration::hours(24)));

    let api = Router::new()
        .route("/sessions", get(sessions::list))
        .route("/sessions/count", get(sessions::count))
        .route(
            "/sessions/{id}",
            get(sessions::detail).delete(sessions::revoke),
        )
        .route("/dashboard", get(sessions::dashboard))
        .route(
            "/panel-config",
            get(admin::get_panel_config).put(admin::update_panel_config),
        )
        .route("/login-blocks", get(admin::list_login_blocks))
        .route("/login-blocks/{ip}", delete(admin::lift_login_block))
        .route("/login-attempts", get(admin::list_login_attempts))
        .route(
            "/restart-server-service",
            post(admin::restart_server_service),
        )
        .route("/restart-panel-service", post(admin::restart_panel_service))
        .route_layer(middleware::from_fn(auth::require_login));

    Router::new()
        .route("/login", post(auth::login))
        .route("/logout", get(auth::logout).post(auth::logout))
        .nest("/api", api)
        .with_state(state)
        .layer(session_layer)
        .layer(TraceLayer::new_for_http())
}
