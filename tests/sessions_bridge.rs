//! Integration tests for the snapshot reader and the revoke sequence
//! against real SQLite store files.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{
    create_live_store, fast_timings, insert_raw, insert_record, live_record, lock_exclusively,
    record, FakeService, Paths,
};
use proxy_panel::sessions::{
    MutationCoordinator, RevokePhase, SessionReader, SnapshotManager, StoreTimings,
};
use proxy_panel::{RevokeError, StoreError};
use sea_orm::ConnectionTrait;

struct Bridge {
    paths: Paths,
    service: Arc<FakeService>,
    snapshots: Arc<SnapshotManager>,
    reader: SessionReader,
    revoker: MutationCoordinator,
}

impl Bridge {
    fn new(paths: Paths) -> Self {
        let service = FakeService::new();
        let snapshots = Arc::new(SnapshotManager::new(&paths.live, &paths.snapshot));
        let reader = SessionReader::new(snapshots.clone(), fast_timings());
        let revoker = MutationCoordinator::spawn(
            &paths.live,
            service.clone(),
            fast_timings(),
            Some(snapshots.clone()),
        );
        Self {
            paths,
            service,
            snapshots,
            reader,
            revoker,
        }
    }
}

async fn bridge_with(records: &[(&str, &str)]) -> Bridge {
    let paths = Paths::new();
    let conn = create_live_store(&paths.live).await;
    for (id, user) in records {
        insert_record(&conn, &record(id, user)).await;
    }
    conn.close().await.unwrap();
    Bridge::new(paths)
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

#[tokio::test]
async fn lists_active_sessions_in_key_order() {
    let bridge = bridge_with(&[("s-2", "bob"), ("s-1", "alice")]).await;

    let sessions = bridge.reader.active_sessions().await.unwrap();

    let ids: Vec<_> = sessions.iter().map(|s| s.session_id.as_str()).collect();
    assert_eq!(ids, ["s-1", "s-2"]);
    assert_eq!(bridge.reader.active_session_count().await, 2);
    // The first read made the snapshot on demand.
    assert!(bridge.paths.snapshot.exists());
}

#[tokio::test]
async fn skips_revoked_and_undecodable_records() {
    let paths = Paths::new();
    let conn = create_live_store(&paths.live).await;
    insert_record(&conn, &record("s-1", "alice")).await;
    let mut revoked = record("s-2", "bob");
    revoked.revoked = true;
    insert_record(&conn, &revoked).await;
    insert_raw(&conn, "s-3", b"{\"session_id\":\"s-3\",\"user".to_vec()).await;
    insert_record(&conn, &record("s-4", "carol")).await;
    conn.close().await.unwrap();
    let bridge = Bridge::new(paths);

    let sessions = bridge.reader.active_sessions().await.unwrap();

    let users: Vec<_> = sessions.iter().map(|s| s.username.as_str()).collect();
    assert_eq!(users, ["alice", "carol"]);
}

#[tokio::test]
async fn skips_rows_with_mistyped_values() {
    let paths = Paths::new();
    let conn = create_live_store(&paths.live).await;
    insert_record(&conn, &record("s-1", "alice")).await;
    conn.execute_unprepared("INSERT INTO sessions (id, data) VALUES ('s-2', 42)")
        .await
        .unwrap();
    insert_record(&conn, &record("s-3", "carol")).await;
    conn.close().await.unwrap();
    let bridge = Bridge::new(paths);

    let sessions = bridge.reader.active_sessions().await.unwrap();

    let users: Vec<_> = sessions.iter().map(|s| s.username.as_str()).collect();
    assert_eq!(users, ["alice", "carol"]);
}

/// Timings small enough that a held lock exhausts the retry quickly.
fn contended_timings(read_retry_timeout: Duration) -> StoreTimings {
    StoreTimings {
        read_timeout: Duration::from_millis(50),
        read_retry_delay: Duration::from_millis(10),
        read_retry_timeout,
        ..fast_timings()
    }
}

#[tokio::test]
async fn locked_snapshot_is_unavailable_after_one_retry() {
    let bridge = bridge_with(&[("s-1", "alice")]).await;
    bridge.snapshots.refresh().await.unwrap();
    let locker = lock_exclusively(&bridge.paths.snapshot).await;
    let reader = SessionReader::new(
        bridge.snapshots.clone(),
        contended_timings(Duration::from_millis(100)),
    );

    let result = reader.active_sessions().await;

    assert!(
        matches!(result, Err(StoreError::Unavailable(_))),
        "unexpected result: {result:?}"
    );
    assert_eq!(reader.active_session_count().await, 0);
    locker.close().await.unwrap();
}

#[tokio::test]
async fn lock_released_during_retry_reads_normally() {
    let bridge = bridge_with(&[("s-1", "alice"), ("s-2", "bob")]).await;
    bridge.snapshots.refresh().await.unwrap();
    let locker = lock_exclusively(&bridge.paths.snapshot).await;
    let reader = SessionReader::new(
        bridge.snapshots.clone(),
        contended_timings(Duration::from_secs(5)),
    );

    let release = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        locker.close().await.unwrap();
    });
    let sessions = reader.active_sessions().await.unwrap();
    release.await.unwrap();

    let users: Vec<_> = sessions.iter().map(|s| s.username.as_str()).collect();
    assert_eq!(users, ["alice", "bob"]);
}

#[tokio::test]
async fn missing_live_store_reads_as_empty() {
    let bridge = Bridge::new(Paths::new());

    assert!(bridge.reader.active_sessions().await.unwrap().is_empty());
    assert_eq!(bridge.reader.active_session_count().await, 0);
    assert!(bridge.reader.find_session("s-1").await.unwrap().is_none());
}

#[tokio::test]
async fn store_without_sessions_table_reads_as_empty() {
    let paths = Paths::new();
    let url = format!("sqlite://{}?mode=rwc", paths.live.display());
    let conn = sea_orm::Database::connect(url.as_str()).await.unwrap();
    conn.execute_unprepared("CREATE TABLE other (id INTEGER)")
        .await
        .unwrap();
    conn.close().await.unwrap();
    let bridge = Bridge::new(paths);

    assert!(bridge.reader.active_sessions().await.unwrap().is_empty());
}

#[tokio::test]
async fn garbage_snapshot_reads_as_empty() {
    let paths = Paths::new();
    std::fs::write(&paths.live, vec![0x5a; 8192]).unwrap();
    let bridge = Bridge::new(paths);

    assert!(bridge.reader.active_sessions().await.unwrap().is_empty());
}

#[tokio::test]
async fn reads_stay_consistent_while_snapshot_refreshes() {
    let bridge = bridge_with(&[("s-1", "alice"), ("s-2", "bob"), ("s-3", "carol")]).await;
    bridge.snapshots.refresh().await.unwrap();

    let snapshots = bridge.snapshots.clone();
    let refresher = tokio::spawn(async move {
        for _ in 0..20 {
            snapshots.refresh().await.unwrap();
            tokio::task::yield_now().await;
        }
    });

    let mut readers = Vec::new();
    for _ in 0..4 {
        let reader = bridge.reader.clone();
        readers.push(tokio::spawn(async move {
            for _ in 0..10 {
                let sessions = reader.active_sessions().await.unwrap();
                assert!(sessions.len() <= 3);
            }
        }));
    }

    refresher.await.unwrap();
    for reader in readers {
        reader.await.unwrap();
    }
}

// ---------------------------------------------------------------------------
// Revoke
// ---------------------------------------------------------------------------

#[tokio::test]
async fn revoke_marks_record_and_restarts_proxy() {
    let paths = Paths::new();
    let conn = create_live_store(&paths.live).await;
    insert_raw(
        &conn,
        "s-1",
        br#"{"session_id":"s-1","username":"alice","ip":"10.8.0.2","created_at":5,"last_seen":9,"revoked":false,"bytes_in":42}"#.to_vec(),
    )
    .await;
    insert_record(&conn, &record("s-2", "bob")).await;
    conn.close().await.unwrap();
    let bridge = Bridge::new(paths);

    let revoked = bridge.revoker.revoke("s-1").await.unwrap();

    assert!(revoked.revoked);
    assert_eq!(bridge.service.events(), ["stop", "start"]);
    assert_eq!(bridge.revoker.phase(), RevokePhase::Idle);

    let live = live_record(&bridge.paths.live, "s-1").await.unwrap();
    assert!(live.revoked);
    assert_eq!(live.username, "alice");
    assert_eq!(live.last_seen, 9);
    assert_eq!(live.extra.get("bytes_in"), Some(&serde_json::json!(42)));

    // The snapshot is refreshed right after a successful revoke.
    let listed = bridge.reader.active_sessions().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].session_id, "s-2");
    let found = bridge.reader.find_session("s-1").await.unwrap().unwrap();
    assert!(found.revoked);
}

#[tokio::test]
async fn unknown_session_changes_nothing_but_restarts_proxy() {
    let bridge = bridge_with(&[("s-1", "alice")]).await;

    let err = bridge.revoker.revoke("nope").await.unwrap_err();

    assert!(matches!(
        err,
        RevokeError::NotFound {
            service_restarted: true,
            ..
        }
    ));
    assert!(!err.is_degraded());
    assert_eq!(bridge.service.events(), ["stop", "start"]);
    assert!(!live_record(&bridge.paths.live, "s-1").await.unwrap().revoked);
}

#[tokio::test]
async fn missing_live_store_is_not_found() {
    let bridge = Bridge::new(Paths::new());

    let err = bridge.revoker.revoke("s-1").await.unwrap_err();

    assert!(matches!(err, RevokeError::NotFound { .. }));
    assert_eq!(bridge.service.events(), ["stop", "start"]);
    assert!(!bridge.paths.live.exists());
}

#[tokio::test]
async fn stop_failure_leaves_store_and_proxy_alone() {
    let bridge = bridge_with(&[("s-1", "alice")]).await;
    bridge.service.fail_stop.store(true, Ordering::SeqCst);

    let err = bridge.revoker.revoke("s-1").await.unwrap_err();

    assert!(matches!(err, RevokeError::ServiceStop(_)));
    assert!(!err.is_degraded());
    assert_eq!(bridge.service.events(), ["stop"]);
    assert!(!live_record(&bridge.paths.live, "s-1").await.unwrap().revoked);
}

#[tokio::test]
async fn start_failure_after_mutation_is_reported_as_degraded() {
    let bridge = bridge_with(&[("s-1", "alice")]).await;
    bridge.service.fail_start.store(true, Ordering::SeqCst);

    let err = bridge.revoker.revoke("s-1").await.unwrap_err();

    assert!(matches!(err, RevokeError::RestartAfterMutation(_)));
    assert!(err.is_degraded());
    assert!(live_record(&bridge.paths.live, "s-1").await.unwrap().revoked);
}

#[tokio::test]
async fn corrupt_target_record_fails_mutation_and_restarts_proxy() {
    let paths = Paths::new();
    let conn = create_live_store(&paths.live).await;
    insert_raw(&conn, "s-1", b"not json".to_vec()).await;
    conn.close().await.unwrap();
    let bridge = Bridge::new(paths);

    let err = bridge.revoker.revoke("s-1").await.unwrap_err();

    assert!(matches!(
        err,
        RevokeError::Mutation {
            service_restarted: true,
            ..
        }
    ));
    assert_eq!(bridge.service.events(), ["stop", "start"]);
}

#[tokio::test]
async fn concurrent_revokes_never_interleave() {
    let bridge = bridge_with(&[("s-1", "a"), ("s-2", "b"), ("s-3", "c")]).await;
    bridge.service.set_stop_delay(Duration::from_millis(20));

    let mut tasks = Vec::new();
    for id in ["s-1", "s-2", "s-3"] {
        let revoker = bridge.revoker.clone();
        tasks.push(tokio::spawn(async move { revoker.revoke(id).await }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(
        bridge.service.events(),
        ["stop", "start", "stop", "start", "stop", "start"]
    );
    assert!(bridge.reader.active_sessions().await.unwrap().is_empty());
}

#[tokio::test]
async fn abandoned_revoke_still_restarts_proxy() {
    let bridge = bridge_with(&[("s-1", "alice")]).await;
    bridge.service.set_stop_delay(Duration::from_millis(50));

    let revoker = bridge.revoker.clone();
    let caller = tokio::spawn(async move { revoker.revoke("s-1").await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    caller.abort();

    for _ in 0..100 {
        if bridge.service.events().contains(&"start") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(bridge.service.events(), ["stop", "start"]);
    assert!(live_record(&bridge.paths.live, "s-1").await.unwrap().revoked);
}

#[tokio::test]
async fn proxy_restart_waits_for_revoke() {
    let bridge = bridge_with(&[("s-1", "alice")]).await;
    bridge.service.set_stop_delay(Duration::from_millis(20));

    let revoker = bridge.revoker.clone();
    let revoke = tokio::spawn(async move { revoker.revoke("s-1").await });
    tokio::time::sleep(Duration::from_millis(5)).await;
    bridge.revoker.restart_proxy().await.unwrap();
    revoke.await.unwrap().unwrap();

    assert_eq!(bridge.service.events(), ["stop", "start", "restart"]);
}
