//! End-to-end passes over file-backed storage and a shared-directory
//! remote, the way the daemon wires them.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tempfile::TempDir;

use logbook_core::entry::{EntryDraft, EntryPatch, EntryType, Piece};
use logbook_core::remote::{AuthState, RemoteAuthority, StaticAuth};
use logbook_core::store::LogbookStore;
use logbook_core::sync::SyncOutcome;
use logbook_core::sync_engine::SyncEngine;

use logbook_daemon::scheduler::{SyncRequest, SyncScheduler, SyncTrigger};
use logbook_daemon::{FileRemote, FileStorage};

struct Device {
    store: Arc<LogbookStore<FileStorage>>,
    engine: Arc<SyncEngine<FileStorage>>,
    auth: Arc<StaticAuth>,
}

async fn device(data_dir: &std::path::Path, remote_dir: &std::path::Path) -> Device {
    let storage = Arc::new(FileStorage::new(data_dir).unwrap());
    let remote: Arc<dyn RemoteAuthority> = Arc::new(FileRemote::new(remote_dir));
    let auth = StaticAuth::new(true);
    let store = Arc::new(
        LogbookStore::open(
            storage,
            Arc::clone(&remote),
            auth.clone() as Arc<dyn AuthState>,
        )
        .await,
    );
    let engine = Arc::new(SyncEngine::new(
        Arc::clone(&store),
        remote,
        auth.clone() as Arc<dyn AuthState>,
    ));
    Device { store, engine, auth }
}

fn draft(title: &str, at_secs: i64) -> EntryDraft {
    let mut draft = EntryDraft::new(30, EntryType::Practice, "piano");
    draft.timestamp = Some(Utc.timestamp_opt(at_secs, 0).unwrap());
    draft.pieces = vec![Piece::new(title, Some("Beethoven"))];
    draft
}

#[tokio::test]
async fn test_create_queue_sync_pass_persists_across_restart() {
    let data = TempDir::new().unwrap();
    let remote_dir = TempDir::new().unwrap();

    {
        let dev = device(data.path(), remote_dir.path()).await;
        dev.store
            .create_entry(draft("Moonlight Sonata", 1_700_000_100))
            .await
            .unwrap();
        dev.store
            .create_entry(draft("Waldstein Sonata", 1_700_010_000))
            .await
            .unwrap();

        let outcome = dev.engine.sync().await;
        let report = outcome.report().unwrap();
        assert_eq!(report.changes_pushed, 2);
        assert!(report.error.is_none());
        assert!(dev.store.queue().is_empty().await);
    }

    // A fresh process over the same data directory sees everything
    let reopened = device(data.path(), remote_dir.path()).await;
    assert_eq!(reopened.store.entry_count(), 2);
    assert!(reopened.store.queue().is_empty().await);

    let remote = FileRemote::new(remote_dir.path());
    assert_eq!(remote.pull().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_two_devices_converge_through_shared_remote() {
    let data_a = TempDir::new().unwrap();
    let data_b = TempDir::new().unwrap();
    let remote_dir = TempDir::new().unwrap();

    let a = device(data_a.path(), remote_dir.path()).await;
    let b = device(data_b.path(), remote_dir.path()).await;

    let id = a
        .store
        .create_entry(draft("Appassionata", 1_700_000_100))
        .await
        .unwrap()
        .created_id()
        .unwrap()
        .to_string();
    a.engine.sync().await;

    // Device B picks the entry up on its next pass
    let report_b = b.engine.sync().await.report().unwrap().clone();
    assert_eq!(report_b.changes_applied, 1);
    assert!(b.store.get_entry(&id).is_some());

    // B edits it; A's stale copy loses to the confirmed remote version
    b.store
        .update_entry(
            &id,
            EntryPatch {
                duration: Some(75),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    b.engine.sync().await;

    let report_a = a.engine.sync().await.report().unwrap().clone();
    assert_eq!(report_a.conflicts, 1);
    assert_eq!(a.store.get_entry(&id).unwrap().duration, 75);
}

#[tokio::test]
async fn test_offline_mutations_sync_after_authentication() {
    let data = TempDir::new().unwrap();
    let remote_dir = TempDir::new().unwrap();

    let dev = device(data.path(), remote_dir.path()).await;
    dev.auth.set_authenticated(false);

    dev.store
        .create_entry(draft("Pathetique", 1_700_000_100))
        .await
        .unwrap();
    assert_eq!(dev.engine.sync().await, SyncOutcome::NotAuthenticated);
    assert_eq!(dev.store.queue().len().await, 1);

    dev.auth.set_authenticated(true);
    let report = dev.engine.sync().await.report().unwrap().clone();
    assert_eq!(report.changes_pushed, 1);
    assert!(dev.store.queue().is_empty().await);

    let remote = FileRemote::new(remote_dir.path());
    assert_eq!(remote.pull().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_scheduler_drives_engine_through_manual_trigger() {
    let data = TempDir::new().unwrap();
    let remote_dir = TempDir::new().unwrap();

    let dev = device(data.path(), remote_dir.path()).await;
    dev.store
        .create_entry(draft("Emperor Concerto", 1_700_000_100))
        .await
        .unwrap();

    let scheduler = SyncScheduler::new(
        Arc::clone(&dev.engine),
        Duration::from_secs(5),
        Duration::from_secs(12),
    );

    let request = scheduler.request(SyncTrigger::Manual).await;
    match request {
        SyncRequest::Ran(SyncOutcome::Completed(report)) => {
            assert_eq!(report.changes_pushed, 1);
        }
        other => panic!("unexpected scheduler result: {:?}", other),
    }

    // A follow-up trigger inside the window is debounced
    assert_eq!(
        scheduler.request(SyncTrigger::Focus).await,
        SyncRequest::Deferred
    );
}
