//! Bridge to the proxy's session store.
//!
//! The proxy keeps its sessions in an embedded database file that it writes
//! continuously. The panel never reads that file directly:
//!
//! - [`SnapshotManager`] periodically copies it to a read-only snapshot,
//! - [`SessionReader`] lists sessions from the snapshot only,
//! - [`MutationCoordinator`] is the single write path, stopping the proxy,
//!   patching the live file, and starting the proxy again.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::entity::session;
use crate::error::StoreError;

mod reader;
mod revoke;
mod snapshot;
mod store;

pub use reader::SessionReader;
pub use revoke::{MutationCoordinator, RevokePhase};
pub use snapshot::{RefreshOutcome, SnapshotManager};

/// Default location of the proxy's live session store.
pub const DEFAULT_LIVE_PATH: &str = "data/sessions/sessions.db";

/// Default location of the read-only snapshot.
pub const DEFAULT_SNAPSHOT_PATH: &str = "data/sessions/sessions-temp.db";

/// Default snapshot refresh interval in seconds.
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 15;

/// One authenticated client connection of the proxy.
///
/// Records are created and touched by the proxy; the panel only ever flips
/// `revoked`. Fields the proxy adds beyond the known ones are kept in
/// `extra` so that rewriting a record does not drop them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionRecord {
    pub session_id: String,
    pub username: String,
    #[serde(rename = "ip")]
    pub client_ip: String,
    pub client_version: String,
    /// Unix timestamp in seconds.
    pub created_at: i64,
    /// Unix timestamp in seconds.
    pub last_seen: i64,
    pub revoked: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl SessionRecord {
    pub(crate) fn decode(model: &session::Model) -> Result<Self, StoreError> {
        serde_json::from_slice(&model.data).map_err(|e| StoreError::Decode {
            id: model.id.clone(),
            reason: e.to_string(),
        })
    }

    pub(crate) fn encode(&self, id: &str) -> Result<Vec<u8>, StoreError> {
        serde_json::to_vec(self).map_err(|e| StoreError::Encode {
            id: id.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Locations and refresh cadence of the session store, as stored in the
/// panel configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    pub live_path: PathBuf,
    pub snapshot_path: PathBuf,
    pub refresh_interval_secs: u64,
    #[serde(skip)]
    pub timings: StoreTimings,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            live_path: PathBuf::from(DEFAULT_LIVE_PATH),
            snapshot_path: PathBuf::from(DEFAULT_SNAPSHOT_PATH),
            refresh_interval_secs: DEFAULT_REFRESH_INTERVAL_SECS,
            timings: StoreTimings::default(),
        }
    }
}

impl SessionsConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }
}

/// Bounded waits used when opening the store files.
///
/// Unix defaults are much longer for reads because the proxy holds its
/// file lock more aggressively there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreTimings {
    /// First attempt at opening the snapshot.
    pub read_timeout: Duration,
    /// Pause before the single retry after lock contention.
    pub read_retry_delay: Duration,
    /// Bound for the retry.
    pub read_retry_timeout: Duration,
    /// Grace period after stopping the proxy, for the OS to release its lock.
    pub settle: Duration,
    /// Bound for opening the live store during a revoke.
    pub write_timeout: Duration,
}

impl Default for StoreTimings {
    fn default() -> Self {
        if cfg!(unix) {
            Self {
                read_timeout: Duration::from_secs(120),
                read_retry_delay: Duration::from_secs(2),
                read_retry_timeout: Duration::from_secs(180),
                settle: Duration::from_secs(2),
                write_timeout: Duration::from_secs(15),
            }
        } else {
            Self {
                read_timeout: Duration::from_secs(10),
                read_retry_delay: Duration::from_secs(2),
                read_retry_timeout: Duration::from_secs(60),
                settle: Duration::from_secs(2),
                write_timeout: Duration::from_secs(10),
            }
        }
    }
}
