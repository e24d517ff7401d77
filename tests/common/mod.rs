#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, Response};
use http_body_util::BodyExt;
use proxy_panel::entity::session;
use proxy_panel::service::{ServiceController, ServiceError};
use proxy_panel::sessions::{SessionsConfig, StoreTimings};
use proxy_panel::{PanelConfig, SessionRecord};
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbBackend, EntityTrait, Schema,
    Set,
};
use tempfile::TempDir;

/// Waits short enough to keep the suite fast.
pub fn fast_timings() -> StoreTimings {
    StoreTimings {
        read_timeout: Duration::from_secs(1),
        read_retry_delay: Duration::from_millis(10),
        read_retry_timeout: Duration::from_secs(2),
        settle: Duration::from_millis(10),
        write_timeout: Duration::from_secs(2),
    }
}

/// Scratch directory holding a live store path and its snapshot path.
pub struct Paths {
    pub dir: TempDir,
    pub live: PathBuf,
    pub snapshot: PathBuf,
    pub config: PathBuf,
}

impl Paths {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let live = dir.path().join("sessions.db");
        let snapshot = dir.path().join("snapshot").join("sessions-temp.db");
        let config = dir.path().join("panel.json");
        Self {
            dir,
            live,
            snapshot,
            config,
        }
    }

    pub fn panel_config(&self) -> PanelConfig {
        PanelConfig {
            sessions: SessionsConfig {
                live_path: self.live.clone(),
                snapshot_path: self.snapshot.clone(),
                refresh_interval_secs: 1,
                timings: fast_timings(),
            },
            ..PanelConfig::default()
        }
    }
}

/// Creates the live store with an empty sessions table, as the proxy would.
pub async fn create_live_store(path: &Path) -> DatabaseConnection {
    let url = format!("sqlite://{}?mode=rwc", path.display());
    let conn = Database::connect(url.as_str()).await.unwrap();

    let schema = Schema::new(DbBackend::Sqlite);
    let stmt = schema.create_table_from_entity(session::Entity);
    conn.execute(conn.get_database_backend().build(&stmt))
        .await
        .unwrap();
    conn
}

pub fn record(id: &str, username: &str) -> SessionRecord {
    SessionRecord {
        session_id: id.to_string(),
        username: username.to_string(),
        client_ip: "10.8.0.2".to_string(),
        client_version: "SSH-2.0-Go".to_string(),
        created_at: 1_700_000_000,
        last_seen: 1_700_000_060,
        revoked: false,
        extra: Default::default(),
    }
}

pub async fn insert_raw(conn: &DatabaseConnection, id: &str, data: Vec<u8>) {
    session::Entity::insert(session::ActiveModel {
        id: Set(id.to_string()),
        data: Set(data),
    })
    .exec(conn)
    .await
    .unwrap();
}

pub async fn insert_record(conn: &DatabaseConnection, record: &SessionRecord) {
    insert_raw(conn, &record.session_id, serde_json::to_vec(record).unwrap()).await;
}

/// Reads a record straight from the live store.
pub async fn live_record(path: &Path, id: &str) -> Option<SessionRecord> {
    let url = format!("sqlite://{}?mode=ro", path.display());
    let conn = Database::connect(url.as_str()).await.unwrap();
    let model = session::Entity::find_by_id(id.to_string())
        .one(&conn)
        .await
        .unwrap();
    conn.close().await.unwrap();
    model.map(|m| serde_json::from_slice(&m.data).unwrap())
}

/// Opens `path` on a single connection and keeps an exclusive lock on it
/// until the returned connection is closed, as a busy proxy would.
pub async fn lock_exclusively(path: &Path) -> DatabaseConnection {
    let mut permissions = std::fs::metadata(path).unwrap().permissions();
    #[allow(clippy::permissions_set_readonly_false)]
    permissions.set_readonly(false);
    std::fs::set_permissions(path, permissions).unwrap();

    let mut opt = ConnectOptions::new(format!("sqlite://{}?mode=rw", path.display()));
    opt.max_connections(1).min_connections(1);
    let conn = Database::connect(opt).await.unwrap();
    conn.execute_unprepared("PRAGMA locking_mode = EXCLUSIVE")
        .await
        .unwrap();
    // The first write takes the exclusive lock; exclusive mode never drops it.
    conn.execute_unprepared("CREATE TABLE lock_holder (x INTEGER)")
        .await
        .unwrap();
    conn
}

/// Service controller that records calls instead of running anything.
#[derive(Default)]
pub struct FakeService {
    events: Mutex<Vec<&'static str>>,
    pub fail_stop: AtomicBool,
    pub fail_start: AtomicBool,
    pub stop_delay: Mutex<Duration>,
}

impl FakeService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().clone()
    }

    pub fn set_stop_delay(&self, delay: Duration) {
        *self.stop_delay.lock().unwrap() = delay;
    }

    fn failure(&self, action: &'static str) -> ServiceError {
        ServiceError::Failed {
            action,
            service: "fake-proxy".to_string(),
            code: 1,
            stderr: "simulated failure".to_string(),
        }
    }
}

#[async_trait]
impl ServiceController for FakeService {
    fn name(&self) -> &str {
        "fake-proxy"
    }

    async fn stop(&self) -> Result<(), ServiceError> {
        let delay = *self.stop_delay.lock().unwrap();
        tokio::time::sleep(delay).await;
        self.events.lock().unwrap().push("stop");
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(self.failure("stop"));
        }
        Ok(())
    }

    async fn start(&self) -> Result<(), ServiceError> {
        self.events.lock().unwrap().push("start");
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(self.failure("start"));
        }
        Ok(())
    }

    async fn restart(&self) -> Result<(), ServiceError> {
        self.events.lock().unwrap().push("restart");
        Ok(())
    }
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// The `name=value` pair of the login cookie set by `response`.
pub fn session_cookie(response: &Response<Body>) -> String {
    let set_cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .expect("no session cookie set")
        .to_str()
        .unwrap();
    set_cookie.split(';').next().unwrap().to_string()
}

pub fn login_request(ip: &str, username: &str, password: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/login")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .header("x-forwarded-for", ip)
        .body(Body::from(format!("username={username}&password={password}")))
        .unwrap()
}

pub fn authed(method: &str, uri: &str, cookie: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::COOKIE, cookie)
        .body(Body::empty())
        .unwrap()
}
