//! ---
//! warden_section: "03-persistence-logging"
//! warden_subsection: "tests"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Persistence abstractions and storage bindings."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use warden_common::config::DatabaseConfig;
use warden_persistence::{
    enable_host, HostStatus, NewFencer, PersistenceError, SharedStore, SqlDialect, SqlStore, Store,
};

const TERM: Duration = Duration::from_secs(30);

/// Rows keep millisecond precision.
fn now_ms() -> DateTime<Utc> {
    DateTime::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap()
}

async fn open(path: &Path) -> SqlStore {
    let config = DatabaseConfig {
        url: format!("sqlite://{}?mode=rwc", path.display()),
        max_connections: 4,
    };
    let store = SqlStore::connect(&config).await.unwrap();
    store.sync_schema().await.unwrap();
    store
}

#[tokio::test]
async fn hosts_states_and_fencers_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir.path().join("warden.db")).await;
    assert_eq!(store.dialect(), SqlDialect::Sqlite);
    let now = now_ms();

    let mut host = store.insert_host("compute-1", now).await.unwrap();
    assert_eq!(host.status, HostStatus::Initial);
    assert!(matches!(
        store.insert_host("compute-1", now).await,
        Err(PersistenceError::Conflict(_))
    ));

    host.transition(HostStatus::Checking, now + ChronoDuration::seconds(6));
    host.disabled = true;
    store.update_host(&host).await.unwrap();
    let loaded = store.host_by_name("compute-1").await.unwrap().unwrap();
    assert_eq!(loaded, host);
    assert_eq!(store.host_by_id(host.id).await.unwrap(), Some(host.clone()));

    let mut state = store.insert_host_state(host.id, "storage", now).await.unwrap();
    assert!(matches!(
        store.insert_host_state(host.id, "storage", now).await,
        Err(PersistenceError::Conflict(_))
    ));
    state.record_failure(now);
    state.record_failure(now);
    store.update_host_state(&state).await.unwrap();
    assert_eq!(store.host_states(host.id).await.unwrap(), vec![state]);

    let first = store
        .insert_fencer(NewFencer::ipmi(host.id, "10.20.0.1", "root", "calvin"))
        .await
        .unwrap();
    let second = store
        .insert_fencer(NewFencer::ipmi(host.id, "10.20.0.2", "root", "calvin"))
        .await
        .unwrap();
    assert_eq!(first.port, 623);
    assert_eq!(
        store.fencers_for_host(host.id).await.unwrap(),
        vec![first.clone(), second]
    );
    store.delete_fencer(first.id).await.unwrap();
    assert!(matches!(
        store.delete_fencer(first.id).await,
        Err(PersistenceError::NotFound { .. })
    ));
    assert_eq!(store.fencers_for_host(host.id).await.unwrap().len(), 1);

    let reenabled = enable_host(&store, "compute-1", now).await.unwrap();
    assert!(!reenabled.disabled);
    assert!(store
        .host_states(host.id)
        .await
        .unwrap()
        .iter()
        .all(|state| state.failed_times == 0));
}

#[tokio::test]
async fn fencer_for_unknown_host_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir.path().join("warden.db")).await;
    assert!(matches!(
        store
            .insert_fencer(NewFencer::ipmi(404, "10.20.0.1", "root", "calvin"))
            .await,
        Err(PersistenceError::NotFound { kind: "host", .. })
    ));
}

#[tokio::test]
async fn schema_sync_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("warden.db");
    let store = open(&path).await;
    store.insert_host("compute-1", Utc::now()).await.unwrap();
    store.sync_schema().await.unwrap();
    assert_eq!(store.hosts().await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn controllers_on_one_database_elect_a_single_holder() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("warden.db");
    let a: SharedStore = Arc::new(open(&path).await);
    let b: SharedStore = Arc::new(open(&path).await);
    let now = Utc::now();

    let mut handles = Vec::new();
    for idx in 0..8 {
        let store = if idx % 2 == 0 { a.clone() } else { b.clone() };
        handles.push(tokio::spawn(async move {
            let name = format!("controller-{idx}");
            let won = store
                .claim_lease("warden-leader", &name, now, TERM)
                .await
                .unwrap();
            (name, won)
        }));
    }
    let mut winners = Vec::new();
    for handle in handles {
        let (name, won) = handle.await.unwrap();
        if won {
            winners.push(name);
        }
    }
    assert_eq!(winners.len(), 1);
    let lease = b.lease("warden-leader").await.unwrap().unwrap();
    assert_eq!(lease.leader_name, winners[0]);
}

#[tokio::test]
async fn lease_refresh_takeover_and_release() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("warden.db");
    let a = open(&path).await;
    let b = open(&path).await;
    let now = now_ms();

    assert!(a.claim_lease("e", "a", now, TERM).await.unwrap());
    let refreshed = now + ChronoDuration::seconds(10);
    assert!(!b.claim_lease("e", "b", refreshed, TERM).await.unwrap());
    assert!(a.claim_lease("e", "a", refreshed, TERM).await.unwrap());

    // A late refresh from a lagging clock keeps the newer timestamp.
    assert!(a.claim_lease("e", "a", now, TERM).await.unwrap());
    let lease = b.lease("e").await.unwrap().unwrap();
    assert_eq!(lease.last_update.timestamp_millis(), refreshed.timestamp_millis());

    // 30s after the refresh the lease is not yet expired; past it, b takes over.
    let boundary = refreshed + ChronoDuration::seconds(30);
    assert!(!b.claim_lease("e", "b", boundary, TERM).await.unwrap());
    let lapsed = refreshed + ChronoDuration::seconds(31);
    assert!(b.claim_lease("e", "b", lapsed, TERM).await.unwrap());
    assert_eq!(a.lease("e").await.unwrap().unwrap().leader_name, "b");
    assert!(!a.claim_lease("e", "a", lapsed, TERM).await.unwrap());

    assert!(!a.release_lease("e", "a").await.unwrap());
    assert!(b.release_lease("e", "b").await.unwrap());
    assert!(a.lease("e").await.unwrap().is_none());
}
