//! # Proxy Panel
//!
//! Administration panel for a proxy process that keeps its client sessions
//! in an embedded [SQLite](https://sqlite.org) file, accessed through
//! [Sea-ORM](https://crates.io/crates/sea-orm).
//!
//! The proxy holds an exclusive lock on that file while it runs, so the
//! panel bridges it in two directions:
//!
//! - Reads go to a periodically refreshed read-only snapshot
//!   ([`SnapshotManager`], [`SessionReader`]). The snapshot may be stale or
//!   torn; readers skip what they cannot decode.
//! - The only write, revoking a session, goes through the
//!   [`MutationCoordinator`], which stops the proxy, waits for the lock to be
//!   released, patches the record and always starts the proxy again.
//!
//! Panel logins are throttled per client address by the [`ThrottleStore`];
//! addresses that exhaust their attempts are also added to a durable block
//! list kept in the [`PanelConfig`] file.
//!
//! ## Features
//!
//! - Snapshot-based session listing that never contends with the proxy
//! - Serialized stop/mutate/start revoke with precise failure reporting
//! - Per-address login throttling with a persistent block list
//! - JSON API built on [axum](https://crates.io/crates/axum) and
//!   [`tower-sessions`](https://crates.io/crates/tower-sessions)
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use proxy_panel::{router, AppState, PanelConfigStore, SystemServiceController};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Arc::new(PanelConfigStore::load_or_default("abdal-4iproto-panel.json").await?);
//! let services = config.current().await.services;
//!
//! let proxy = Arc::new(SystemServiceController::new(services.proxy_service)?);
//! let panel = Arc::new(SystemServiceController::new(services.panel_service)?);
//! let state = AppState::new(config, proxy, panel).await;
//!
//! let app = router(state);
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//! axum::serve(listener, app).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Revoking a session
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use proxy_panel::sessions::{MutationCoordinator, StoreTimings};
//! use proxy_panel::SystemServiceController;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let proxy = Arc::new(SystemServiceController::new("abdal-4iproto-server")?);
//! let revoker = MutationCoordinator::spawn(
//!     "data/sessions/sessions.db",
//!     proxy,
//!     StoreTimings::default(),
//!     None,
//! );
//!
//! match revoker.revoke("9f2c").await {
//!     Ok(record) => println!("revoked session of {}", record.username),
//!     Err(e) if e.is_degraded() => eprintln!("proxy may be down: {e}"),
//!     Err(e) => eprintln!("nothing changed: {e}"),
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod entity;
pub mod error;
pub mod http;
pub mod service;
pub mod sessions;
pub mod throttle;

/// Panel configuration and its persistent store.
pub use config::{PanelConfig, PanelConfigStore};

/// Error types of the session bridge.
pub use error::{ConfigError, RevokeError, StoreError};

/// Router and shared state of the JSON API.
pub use http::{router, AppState};

/// Service control used to stop and start the proxy.
pub use service::{ServiceController, ServiceError, SystemServiceController};

pub use sessions::{MutationCoordinator, SessionReader, SessionRecord, SnapshotManager};

pub use throttle::{ThrottlePolicy, ThrottleStore};
