use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::SessionsConfig;
use crate::error::StoreError;

/// Result of a successful [`SnapshotManager::refresh`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The live store was copied; `bytes` is the size of the copy.
    Copied { bytes: u64 },
    /// There is no live store, so there is no snapshot either.
    LiveMissing,
}

/// Maintains a read-only copy of the live session store.
///
/// The copy is taken without any locking, so it can capture a write the
/// proxy had in flight. Readers skip what they cannot decode instead.
#[derive(Debug)]
pub struct SnapshotManager {
    live_path: PathBuf,
    snapshot_path: PathBuf,
    interval: Duration,
    refresh_lock: Mutex<()>,
}

impl SnapshotManager {
    pub fn new(live_path: impl Into<PathBuf>, snapshot_path: impl Into<PathBuf>) -> Self {
        Self {
            live_path: live_path.into(),
            snapshot_path: snapshot_path.into(),
            interval: Duration::from_secs(super::DEFAULT_REFRESH_INTERVAL_SECS),
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn from_config(config: &SessionsConfig) -> Self {
        Self::new(&config.live_path, &config.snapshot_path).with_interval(config.refresh_interval())
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn live_path(&self) -> &Path {
        &self.live_path
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Replaces the snapshot with a fresh copy of the live store.
    ///
    /// The copy is staged next to the snapshot and renamed over it, so a
    /// failed refresh leaves the previous snapshot in place. When the live
    /// store does not exist the snapshot is removed as well.
    pub async fn refresh(&self) -> Result<RefreshOutcome, StoreError> {
        let _guard = self.refresh_lock.lock().await;

        if let Some(dir) = self.snapshot_path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir).await?;
            }
        }

        if !fs::try_exists(&self.live_path).await? {
            remove_file_if_exists(&self.snapshot_path).await?;
            tracing::debug!(live = %self.live_path.display(), "No live session store, snapshot cleared");
            return Ok(RefreshOutcome::LiveMissing);
        }

        let staging = self.staging_path();
        remove_file_if_exists(&staging).await?;

        let bytes = match fs::copy(&self.live_path, &staging).await {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = remove_file_if_exists(&staging).await;
                return Err(e.into());
            }
        };

        if let Err(e) = set_read_only(&staging).await {
            tracing::warn!(path = %staging.display(), error = %e, "Failed to mark snapshot read-only");
        }

        // Windows refuses to rename over an existing (read-only) file.
        #[cfg(windows)]
        remove_file_if_exists(&self.snapshot_path).await?;

        if let Err(e) = fs::rename(&staging, &self.snapshot_path).await {
            let _ = remove_file_if_exists(&staging).await;
            return Err(e.into());
        }

        tracing::debug!(bytes, snapshot = %self.snapshot_path.display(), "Session store snapshot refreshed");
        Ok(RefreshOutcome::Copied { bytes })
    }

    /// Refreshes immediately, then on every interval tick until `cancel`
    /// fires. Failures are logged and retried on the next tick.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            live = %self.live_path.display(),
            "Session snapshot job started"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Session snapshot job stopping");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.refresh().await {
                        tracing::warn!(error = %e, "Failed to refresh session store snapshot");
                    }
                }
            }
        }
    }

    /// Deletes the snapshot, used on shutdown.
    pub async fn remove(&self) -> Result<(), StoreError> {
        let _guard = self.refresh_lock.lock().await;
        remove_file_if_exists(&self.snapshot_path).await?;
        remove_file_if_exists(&self.staging_path()).await?;
        Ok(())
    }

    fn staging_path(&self) -> PathBuf {
        let mut name = self
            .snapshot_path
            .file_name()
            .map(OsString::from)
            .unwrap_or_else(|| OsString::from("sessions-snapshot"));
        name.push(".tmp");
        self.snapshot_path.with_file_name(name)
    }
}

async fn set_read_only(path: &Path) -> io::Result<()> {
    let mut permissions = fs::metadata(path).await?.permissions();
    permissions.set_readonly(true);
    fs::set_permissions(path, permissions).await
}

async fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    #[cfg(windows)]
    {
        if let Ok(meta) = fs::metadata(path).await {
            let mut permissions = meta.permissions();
            if permissions.readonly() {
                #[allow(clippy::permissions_set_readonly_false)]
                permissions.set_readonly(false);
                fs::set_permissions(path, permissions).await?;
            }
        }
    }

    match fs::remove_file(path).await {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
