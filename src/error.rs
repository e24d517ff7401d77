use sea_orm::DbErr;

use crate::service::ServiceError;

/// Errors raised while touching the live store or its snapshot.
///
/// Sea-ORM errors are classified by [`StoreError::from`] so that callers can
/// tell lock contention (retryable) apart from corruption (absorbed by the
/// reader) and everything else.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The file is locked by another process or the bounded wait elapsed.
    #[error("session store is locked: {0}")]
    Locked(String),

    /// Lock contention persisted through the retry.
    #[error("session store is temporarily unavailable, try again in a few moments: {0}")]
    Unavailable(String),

    /// The file is not a readable database (typically a torn snapshot copy).
    #[error("session store is corrupt: {0}")]
    Corrupt(String),

    #[error("failed to decode session record '{id}': {reason}")]
    Decode { id: String, reason: String },

    #[error("failed to encode session record '{id}': {reason}")]
    Encode { id: String, reason: String },

    #[error("session store error: {0}")]
    Backend(String),

    #[error("session store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Whether the error is lock contention worth one more attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Locked(_))
    }
}

impl From<DbErr> for StoreError {
    fn from(err: DbErr) -> Self {
        classify(err.to_string())
    }
}

impl From<sea_orm::sqlx::Error> for StoreError {
    fn from(err: sea_orm::sqlx::Error) -> Self {
        classify(err.to_string())
    }
}

/// Sorts a SQLite failure by its message: contention, torn file, or other.
fn classify(message: String) -> StoreError {
    let lowered = message.to_ascii_lowercase();

    if lowered.contains("locked")
        || lowered.contains("busy")
        || lowered.contains("timed out")
        || lowered.contains("timeout")
    {
        StoreError::Locked(message)
    } else if lowered.contains("malformed") || lowered.contains("not a database") {
        StoreError::Corrupt(message)
    } else {
        StoreError::Backend(message)
    }
}

/// Outcome of a failed revoke, one variant per failing step.
///
/// `NotFound` and `Mutation` carry whether the proxy was started again, so
/// the caller can distinguish "nothing changed" from "the proxy may be down".
#[derive(Debug, thiserror::Error)]
pub enum RevokeError {
    #[error("session '{session_id}' not found")]
    NotFound {
        session_id: String,
        service_restarted: bool,
    },

    #[error("failed to stop proxy service: {0}")]
    ServiceStop(#[source] ServiceError),

    #[error("failed to revoke session: {source}")]
    Mutation {
        #[source]
        source: StoreError,
        service_restarted: bool,
    },

    #[error("session revoked but proxy service did not restart: {0}")]
    RestartAfterMutation(#[source] ServiceError),

    #[error("failed to restart proxy service: {0}")]
    Restart(#[source] ServiceError),

    /// The worker task is gone; the state of the proxy is unknown.
    #[error("session mutation worker is not running")]
    CoordinatorStopped,
}

impl RevokeError {
    /// Whether the proxy process may have been left stopped.
    pub fn is_degraded(&self) -> bool {
        match self {
            RevokeError::NotFound {
                service_restarted, ..
            }
            | RevokeError::Mutation {
                service_restarted, ..
            } => !service_restarted,
            RevokeError::ServiceStop(_) => false,
            RevokeError::RestartAfterMutation(_)
            | RevokeError::Restart(_)
            | RevokeError::CoordinatorStopped => true,
        }
    }
}

/// Errors loading or saving the panel configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to access config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize config: {0}")]
    Serialize(#[source] serde_json::Error),
}
