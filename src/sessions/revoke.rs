use std::path::PathBuf;
use std::sync::Arc;

use sea_orm::{
    ActiveModelTrait, DatabaseConnection, EntityTrait, IntoActiveModel, Set, TransactionTrait,
};
use serde::Serialize;
use tokio::fs;
use tokio::sync::{mpsc, oneshot, watch};

use super::store::{self, AccessMode};
use super::{SessionRecord, SnapshotManager, StoreTimings};
use crate::entity::session::Entity as SessionEntity;
use crate::error::{RevokeError, StoreError};
use crate::service::{ServiceController, ServiceError};

/// Step of the stop/mutate/start sequence currently in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RevokePhase {
    Idle,
    Quiescing,
    Settling,
    Mutating,
    Resuming,
}

enum Job {
    Revoke {
        session_id: String,
        reply: oneshot::Sender<Result<SessionRecord, RevokeError>>,
    },
    RestartProxy {
        reply: oneshot::Sender<Result<(), ServiceError>>,
    },
}

/// The only write path into the live session store.
///
/// Jobs are executed one at a time by a dedicated worker task behind a
/// channel of capacity one: concurrent callers queue in arrival order, and a
/// caller that goes away mid-sequence cannot leave the proxy stopped because
/// the worker finishes the sequence regardless. Proxy restarts requested
/// from the panel go through the same queue so they never interleave with a
/// revoke.
#[derive(Debug, Clone)]
pub struct MutationCoordinator {
    jobs: mpsc::Sender<Job>,
    phase: watch::Receiver<RevokePhase>,
}

impl MutationCoordinator {
    /// Spawns the worker on the current Tokio runtime.
    ///
    /// When `snapshots` is given, a successful revoke refreshes the snapshot
    /// right away so listings reflect it without waiting for the next tick.
    pub fn spawn(
        live_path: impl Into<PathBuf>,
        controller: Arc<dyn ServiceController>,
        timings: StoreTimings,
        snapshots: Option<Arc<SnapshotManager>>,
    ) -> Self {
        let (jobs, rx) = mpsc::channel(1);
        let (phase_tx, phase) = watch::channel(RevokePhase::Idle);

        let worker = Worker {
            live_path: live_path.into(),
            controller,
            timings,
            snapshots,
            phase: phase_tx,
        };
        tokio::spawn(worker.run(rx));

        Self { jobs, phase }
    }

    /// Marks `session_id` revoked in the live store.
    ///
    /// On success the proxy is running again and the revoked record is
    /// returned. Every failure after the proxy was stopped still attempts
    /// to start it; see [`RevokeError::is_degraded`].
    pub async fn revoke(&self, session_id: &str) -> Result<SessionRecord, RevokeError> {
        let (reply, rx) = oneshot::channel();
        self.jobs
            .send(Job::Revoke {
                session_id: session_id.to_string(),
                reply,
            })
            .await
            .map_err(|_| RevokeError::CoordinatorStopped)?;
        rx.await.map_err(|_| RevokeError::CoordinatorStopped)?
    }

    /// Restarts the proxy once no revoke is in flight.
    pub async fn restart_proxy(&self) -> Result<(), RevokeError> {
        let (reply, rx) = oneshot::channel();
        self.jobs
            .send(Job::RestartProxy { reply })
            .await
            .map_err(|_| RevokeError::CoordinatorStopped)?;
        rx.await
            .map_err(|_| RevokeError::CoordinatorStopped)?
            .map_err(RevokeError::Restart)
    }

    pub fn phase(&self) -> RevokePhase {
        *self.phase.borrow()
    }
}

struct Worker {
    live_path: PathBuf,
    controller: Arc<dyn ServiceController>,
    timings: StoreTimings,
    snapshots: Option<Arc<SnapshotManager>>,
    phase: watch::Sender<RevokePhase>,
}

impl Worker {
    async fn run(self, mut jobs: mpsc::Receiver<Job>) {
        while let Some(job) = jobs.recv().await {
            match job {
                Job::Revoke { session_id, reply } => {
                    let result = self.revoke(&session_id).await;
                    let _ = reply.send(result);
                }
                Job::RestartProxy { reply } => {
                    let result = self.controller.restart().await;
                    if let Err(e) = &result {
                        tracing::error!(service = %self.controller.name(), error = %e, "Proxy restart failed");
                    }
                    let _ = reply.send(result);
                }
            }
        }
        tracing::debug!("Session mutation worker stopped");
    }

    fn enter(&self, phase: RevokePhase) {
        tracing::debug!(?phase, "Revoke phase");
        self.phase.send_replace(phase);
    }

    async fn revoke(&self, session_id: &str) -> Result<SessionRecord, RevokeError> {
        tracing::info!(session_id, "Starting session revoke");

        self.enter(RevokePhase::Quiescing);
        tracing::info!(service = %self.controller.name(), "Stopping proxy service to unlock session store");
        if let Err(e) = self.controller.stop().await {
            tracing::error!(error = %e, "Failed to stop proxy service, nothing changed");
            self.enter(RevokePhase::Idle);
            return Err(RevokeError::ServiceStop(e));
        }

        self.enter(RevokePhase::Settling);
        tokio::time::sleep(self.timings.settle).await;

        self.enter(RevokePhase::Mutating);
        let mutation = self.mark_revoked(session_id).await;
        match &mutation {
            Ok(Some(_)) => tracing::info!(session_id, "Session marked as revoked"),
            Ok(None) => tracing::warn!(session_id, "Session to revoke not found"),
            Err(e) => tracing::error!(session_id, error = %e, "Failed to revoke session"),
        }

        self.enter(RevokePhase::Resuming);
        tracing::info!(service = %self.controller.name(), "Starting proxy service again");
        let restart = self.controller.start().await;
        if let Err(e) = &restart {
            tracing::error!(error = %e, "Failed to start proxy service after revoke");
        }
        self.enter(RevokePhase::Idle);

        let service_restarted = restart.is_ok();
        match (mutation, restart) {
            (Ok(Some(record)), Ok(())) => {
                self.refresh_snapshot().await;
                tracing::info!(session_id, "Session revoke completed");
                Ok(record)
            }
            (Ok(Some(_)), Err(e)) => Err(RevokeError::RestartAfterMutation(e)),
            (Ok(None), _) => Err(RevokeError::NotFound {
                session_id: session_id.to_string(),
                service_restarted,
            }),
            (Err(source), _) => Err(RevokeError::Mutation {
                source,
                service_restarted,
            }),
        }
    }

    /// Rewrites the record with `revoked = true`; `None` when it (or the
    /// store, or its table) does not exist.
    async fn mark_revoked(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        if !fs::try_exists(&self.live_path).await? {
            return Ok(None);
        }

        let conn = store::open(&self.live_path, AccessMode::ReadWrite, self.timings.write_timeout)
            .await?;
        let result = revoke_in(&conn, session_id).await;
        store::close(conn, &self.live_path).await;
        result
    }

    async fn refresh_snapshot(&self) {
        if let Some(snapshots) = &self.snapshots {
            if let Err(e) = snapshots.refresh().await {
                tracing::warn!(error = %e, "Failed to refresh snapshot after revoke");
            }
        }
    }
}

async fn revoke_in(
    conn: &DatabaseConnection,
    session_id: &str,
) -> Result<Option<SessionRecord>, StoreError> {
    if !store::has_sessions_table(conn).await? {
        return Ok(None);
    }

    let txn = conn.begin().await?;

    let Some(existing) = SessionEntity::find_by_id(session_id.to_string())
        .one(&txn)
        .await?
    else {
        txn.rollback().await?;
        return Ok(None);
    };

    let mut record = SessionRecord::decode(&existing)?;
    record.revoked = true;
    let data = record.encode(session_id)?;

    let mut active_model = existing.into_active_model();
    active_model.data = Set(data);
    active_model.update(&txn).await?;

    txn.commit().await?;
    Ok(Some(record))
}
