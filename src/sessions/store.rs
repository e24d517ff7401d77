use std::path::Path;
use std::time::Duration;

use sea_orm::sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sea_orm::sqlx::ConnectOptions as _;
use sea_orm::{
    ConnectionTrait, DatabaseConnection, DbBackend, SqlxSqliteConnector, Statement,
};

use crate::entity::session::SESSIONS_TABLE;
use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AccessMode {
    ReadOnly,
    /// Existing file only: the panel never creates the proxy's store.
    ReadWrite,
}

/// Opens a store file with a single connection whose waits are bounded by
/// `wait`, both for acquiring the connection and for SQLite's busy handler.
///
/// The path is handed to SQLite as a filename rather than spliced into a
/// URL, so names containing `?`, `#` or `%` open the file they name.
pub(crate) async fn open(
    path: &Path,
    mode: AccessMode,
    wait: Duration,
) -> Result<DatabaseConnection, StoreError> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .read_only(mode == AccessMode::ReadOnly)
        .create_if_missing(false)
        .busy_timeout(wait)
        .disable_statement_logging();

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .acquire_timeout(wait)
        .connect_with(options)
        .await?;

    Ok(SqlxSqliteConnector::from_sqlx_sqlite_pool(pool))
}

/// Whether the sessions table ("bucket") exists yet.
pub(crate) async fn has_sessions_table(conn: &DatabaseConnection) -> Result<bool, StoreError> {
    let stmt = Statement::from_sql_and_values(
        DbBackend::Sqlite,
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?",
        [SESSIONS_TABLE.into()],
    );
    Ok(conn.query_one(stmt).await?.is_some())
}

/// Closes a connection, logging instead of failing.
pub(crate) async fn close(conn: DatabaseConnection, path: &Path) {
    if let Err(e) = conn.close().await {
        tracing::error!(path = %path.display(), error = %e, "Failed to close session store");
    }
}
