use std::sync::Arc;

use futures::StreamExt;
use sea_orm::{DatabaseConnection, EntityTrait, QueryOrder};
use tokio::fs;

use super::store::{self, AccessMode};
use super::{SessionRecord, SnapshotManager, StoreTimings};
use crate::entity::session::{self, Entity as SessionEntity};
use crate::error::StoreError;

/// Lists sessions from the snapshot, never from the live store.
///
/// The snapshot may be stale or a torn copy. Undecodable records are
/// skipped, a corrupt file reads as empty, and a missing snapshot (after an
/// on-demand refresh) is simply "no sessions".
#[derive(Debug, Clone)]
pub struct SessionReader {
    snapshots: Arc<SnapshotManager>,
    timings: StoreTimings,
}

impl SessionReader {
    pub fn new(snapshots: Arc<SnapshotManager>, timings: StoreTimings) -> Self {
        Self { snapshots, timings }
    }

    /// All non-revoked sessions, in key order.
    pub async fn active_sessions(&self) -> Result<Vec<SessionRecord>, StoreError> {
        let Some((conn, has_table)) = self.open_snapshot().await? else {
            return Ok(Vec::new());
        };

        let sessions = if has_table {
            collect_active(&conn).await
        } else {
            tracing::debug!("Sessions table does not exist in snapshot");
            Vec::new()
        };
        store::close(conn, self.snapshots.snapshot_path()).await;

        tracing::debug!(count = sessions.len(), "Loaded active sessions from snapshot");
        Ok(sessions)
    }

    /// Number of active sessions; errors are logged and count as zero.
    pub async fn active_session_count(&self) -> usize {
        match self.active_sessions().await {
            Ok(sessions) => sessions.len(),
            Err(e) => {
                tracing::error!(error = %e, "Failed to get active sessions count");
                0
            }
        }
    }

    /// Looks up one record in the snapshot, revoked or not.
    pub async fn find_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let Some((conn, has_table)) = self.open_snapshot().await? else {
            return Ok(None);
        };
        if !has_table {
            store::close(conn, self.snapshots.snapshot_path()).await;
            return Ok(None);
        }

        let result = SessionEntity::find_by_id(session_id.to_string())
            .one(&conn)
            .await;
        store::close(conn, self.snapshots.snapshot_path()).await;

        match result.map_err(StoreError::from) {
            Ok(Some(model)) => SessionRecord::decode(&model).map(Some),
            Ok(None) => Ok(None),
            Err(StoreError::Corrupt(reason)) => {
                tracing::warn!(%reason, "Snapshot unreadable while looking up session");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Opens the snapshot read-only and checks for the sessions table.
    ///
    /// Returns `None` when there is no snapshot and none can be made. Lock
    /// contention gets exactly one retry with the longer bound.
    async fn open_snapshot(&self) -> Result<Option<(DatabaseConnection, bool)>, StoreError> {
        let path = self.snapshots.snapshot_path();

        if !fs::try_exists(path).await? {
            match self.snapshots.refresh().await {
                Ok(_) if fs::try_exists(path).await? => {}
                Ok(_) => return Ok(None),
                Err(e) => {
                    tracing::debug!(error = %e, "Snapshot missing and refresh failed");
                    return Ok(None);
                }
            }
        }

        match self.try_open(self.timings.read_timeout).await {
            Ok(opened) => Ok(Some(opened)),
            Err(e) if e.is_transient() => {
                tracing::debug!(error = %e, "Snapshot locked, waiting and retrying with longer timeout");
                tokio::time::sleep(self.timings.read_retry_delay).await;
                match self.try_open(self.timings.read_retry_timeout).await {
                    Ok(opened) => Ok(Some(opened)),
                    Err(e) if e.is_transient() => {
                        tracing::error!(error = %e, "Snapshot still locked after retry");
                        Err(StoreError::Unavailable(e.to_string()))
                    }
                    Err(e) => absorb_corruption(e),
                }
            }
            Err(e) => absorb_corruption(e),
        }
    }

    async fn try_open(
        &self,
        wait: std::time::Duration,
    ) -> Result<(DatabaseConnection, bool), StoreError> {
        let path = self.snapshots.snapshot_path();
        let conn = store::open(path, AccessMode::ReadOnly, wait).await?;
        match store::has_sessions_table(&conn).await {
            Ok(has_table) => Ok((conn, has_table)),
            Err(e) => {
                store::close(conn, path).await;
                Err(e)
            }
        }
    }
}

fn absorb_corruption(
    err: StoreError,
) -> Result<Option<(DatabaseConnection, bool)>, StoreError> {
    match err {
        StoreError::Corrupt(reason) => {
            tracing::warn!(%reason, "Snapshot is not readable, treating as empty");
            Ok(None)
        }
        other => {
            tracing::error!(error = %other, "Failed to open session snapshot");
            Err(other)
        }
    }
}

/// Scans the table in key order, skipping rows and records that fail to
/// decode. Only a corrupt or locked file ends the scan early.
async fn collect_active(conn: &DatabaseConnection) -> Vec<SessionRecord> {
    let mut sessions = Vec::new();

    let rows = match SessionEntity::find()
        .order_by_asc(session::Column::Id)
        .stream(conn)
        .await
    {
        Ok(rows) => rows,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to scan session snapshot");
            return sessions;
        }
    };
    let mut rows = std::pin::pin!(rows);

    while let Some(row) = rows.next().await {
        let model = match row {
            Ok(model) => model,
            // Cursor failures end the underlying stream on their own; what
            // reaches here with a live cursor is a per-row column decode error.
            Err(e) => match StoreError::from(e) {
                e @ (StoreError::Corrupt(_) | StoreError::Locked(_)) => {
                    tracing::warn!(error = %e, "Session snapshot unreadable, stopping scan");
                    break;
                }
                e => {
                    tracing::warn!(error = %e, "Skipping unreadable session row");
                    continue;
                }
            },
        };

        match SessionRecord::decode(&model) {
            Ok(record) if !record.revoked => sessions.push(record),
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Failed to parse session entry"),
        }
    }

    sessions
}
