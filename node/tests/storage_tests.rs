// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use std::path::Path;
use std::time::Duration;

use tempfile::tempdir;
use thl::error::{StorageError, ThlError};
use thl::event::{EventStatus, LogEvent, StatusUpdate};
use thl_node::config::{StorageKind, ThlConfig};
use thl_node::storage::{LogStore, SqliteOptions, StorageBackend};
use thl_node::thl::Thl;

fn backend(path: &Path) -> StorageBackend {
    StorageBackend::Sqlite(SqliteOptions {
        path: path.join("thl.db"),
        fragment_wait: Duration::from_millis(50),
        delete_batch_size: 2,
        busy_timeout: Duration::from_secs(1),
    })
}

fn event(seqno: u64) -> LogEvent {
    LogEvent::new(seqno, 0, true, "db1", 1, format!("bin.000001:{}", seqno * 100), vec![seqno as u8; 8])
}

fn store_all(store: &mut Box<dyn LogStore>, seqnos: std::ops::RangeInclusive<u64>) {
    for seqno in seqnos {
        store.store(&event(seqno), true, false).unwrap();
    }
}

#[test]
fn test_store_and_find_round_trip() {
    let dir = tempdir().unwrap();
    let mut store = backend(dir.path()).open(0, None).unwrap();

    let original = event(1).with_shard("orders");
    store.store(&original, true, true).unwrap();

    let found = store.find(1).unwrap().expect("stored event");
    assert_eq!(found.payload, original.payload);
    assert_eq!(found.event_id, "bin.000001:100");
    assert_eq!(found.shard_id, "orders");
    assert_eq!(found.source_tstamp, original.source_tstamp);

    let position = store.last_commit_position(0).unwrap().expect("commit row");
    assert_eq!(position.seqno, Some(1));
    assert_eq!(position.event_id.as_deref(), Some("bin.000001:100"));
}

#[test]
fn test_duplicate_is_rejected() {
    let dir = tempdir().unwrap();
    let mut store = backend(dir.path()).open(0, None).unwrap();
    store.store(&event(1), true, false).unwrap();

    let err = store.store(&event(1), true, false).unwrap_err();
    assert!(matches!(
        err,
        ThlError::Storage(StorageError::DuplicateEntry { seqno: 1, fragno: 0 })
    ));
}

#[test]
fn test_duplicate_releases_write_lock() {
    let dir = tempdir().unwrap();
    let backend = backend(dir.path());
    let mut first = backend.open(0, None).unwrap();
    let mut second = backend.open(1, None).unwrap();
    first.store(&event(1), true, false).unwrap();
    assert!(first.store(&event(1), true, false).is_err());

    // Another handle can still write, and so can the one that failed.
    second.store(&event(2), true, true).unwrap();
    first.store(&event(3), true, false).unwrap();
    assert_eq!(second.max_seqno().unwrap(), Some(3));
    assert_eq!(first.last_commit_position(1).unwrap().unwrap().seqno, Some(2));
}

#[test]
fn test_status_read_back_through_connections() {
    let dir = tempdir().unwrap();
    let config = ThlConfig {
        storage: StorageKind::Sqlite,
        db_path: dir.path().join("thl.db"),
        fragment_wait: Duration::from_millis(50),
        ..ThlConfig::default()
    };
    let thl = Thl::open(config.clone(), StorageBackend::from_config(&config)).unwrap();
    let mut writer = thl.connect(0).unwrap();
    let reader = thl.connect(1).unwrap();
    for seqno in 1..=2 {
        writer.store(&event(seqno), true, false).unwrap();
    }
    assert_eq!(reader.find(1).unwrap().unwrap().status, EventStatus::Pending);

    writer.set_status(1, 0, EventStatus::InProcess, None).unwrap();
    assert_eq!(writer.find(1).unwrap().unwrap().status, EventStatus::InProcess);
    assert_eq!(reader.find(1).unwrap().unwrap().status, EventStatus::InProcess);

    writer.set_status(2, 0, EventStatus::InProcess, None).unwrap();
    writer
        .update_failed_status(&StatusUpdate::new(2), &[StatusUpdate::new(1)])
        .unwrap();
    let rolled_back = reader.find(1).unwrap().unwrap();
    assert_eq!(rolled_back.status, EventStatus::Failed);
    assert!(rolled_back.comment.unwrap().contains("event#2"));
    assert_eq!(reader.find(2).unwrap().unwrap().status, EventStatus::Failed);
}

#[test]
fn test_uncommitted_rows_roll_back() {
    let dir = tempdir().unwrap();
    let mut store = backend(dir.path()).open(0, None).unwrap();
    store.store(&event(1), true, false).unwrap();
    store.store(&event(2), false, false).unwrap();
    store.rollback().unwrap();

    assert_eq!(store.max_seqno().unwrap(), Some(1));
    assert!(store.find(2).unwrap().is_none());
}

#[test]
fn test_committed_rows_visible_to_second_handle() {
    let dir = tempdir().unwrap();
    let backend = backend(dir.path());
    let mut writer = backend.open(0, None).unwrap();
    let reader = backend.open(0, None).unwrap();

    store_all(&mut writer, 1..=3);
    let range = reader.min_max_seqno().unwrap();
    assert_eq!(range.min_seqno, Some(1));
    assert_eq!(range.max_seqno, Some(3));
    assert_eq!(reader.max_event_id(Some("db1")).unwrap().as_deref(), Some("bin.000001:300"));
    assert_eq!(reader.max_event_id(Some("db2")).unwrap(), None);
}

#[test]
fn test_missing_fragment_waits_then_gives_up() {
    let dir = tempdir().unwrap();
    let mut store = backend(dir.path()).open(0, None).unwrap();
    store
        .store(&LogEvent::new(1, 0, false, "db1", 1, "", vec![1]), true, false)
        .unwrap();

    let started = std::time::Instant::now();
    assert!(store.find_fragment(1, 1).unwrap().is_none());
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(store.max_fragno(1).unwrap(), Some(0));
}

#[test]
fn test_delete_keeps_newest_row() {
    let dir = tempdir().unwrap();
    let mut store = backend(dir.path()).open(0, None).unwrap();
    store_all(&mut store, 1..=5);

    let deleted = store.delete(None, None, None).unwrap();
    assert_eq!(deleted, 4);
    assert_eq!(store.min_seqno().unwrap(), Some(5));
    assert_eq!(store.max_seqno().unwrap(), Some(5));
}

#[test]
fn test_delete_range() {
    let dir = tempdir().unwrap();
    let mut store = backend(dir.path()).open(0, None).unwrap();
    store_all(&mut store, 1..=6);

    assert_eq!(store.delete(Some(2), Some(4), None).unwrap(), 3);
    assert!(store.find(1).unwrap().is_some());
    assert!(store.find(3).unwrap().is_none());
    assert!(store.find(5).unwrap().is_some());
}

#[test]
fn test_delete_by_age_skips_unprocessed_rows() {
    let dir = tempdir().unwrap();
    let mut store = backend(dir.path()).open(0, None).unwrap();
    store_all(&mut store, 1..=3);

    let deleted = store
        .delete(None, None, Some(Duration::from_secs(3600)))
        .unwrap();
    assert_eq!(deleted, 0);
    assert_eq!(store.min_seqno().unwrap(), Some(1));
}

#[test]
fn test_status_lifecycle() {
    let dir = tempdir().unwrap();
    let mut store = backend(dir.path()).open(0, None).unwrap();
    store_all(&mut store, 1..=2);

    store.set_status(1, 0, EventStatus::InProcess, None).unwrap();
    // Same status again is accepted.
    store.set_status(1, 0, EventStatus::InProcess, None).unwrap();
    store
        .update_success_status(&[StatusUpdate::new(1)], &[])
        .unwrap();
    assert_eq!(store.find(1).unwrap().unwrap().status, EventStatus::Completed);
    assert!(store.find(1).unwrap().unwrap().processed_tstamp.is_some());
    assert_eq!(store.max_completed_seqno().unwrap(), Some(1));

    let err = store
        .set_status(2, 0, EventStatus::Completed, None)
        .unwrap_err();
    assert!(matches!(
        err,
        ThlError::Storage(StorageError::InvalidTransition { seqno: 2, .. })
    ));
}

#[test]
fn test_failed_status_marks_rolled_back_block() {
    let dir = tempdir().unwrap();
    let mut store = backend(dir.path()).open(0, None).unwrap();
    store_all(&mut store, 1..=3);
    for seqno in 1..=3 {
        store.set_status(seqno, 0, EventStatus::InProcess, None).unwrap();
    }

    store
        .update_failed_status(
            &StatusUpdate::new(3).with_comment("duplicate key"),
            &[StatusUpdate::new(1), StatusUpdate::new(2)],
        )
        .unwrap();

    let failed = store.find(3).unwrap().unwrap();
    assert_eq!(failed.status, EventStatus::Failed);
    assert_eq!(failed.comment.as_deref(), Some("duplicate key"));
    let rolled_back = store.find(1).unwrap().unwrap();
    assert_eq!(rolled_back.status, EventStatus::Failed);
    assert!(rolled_back.comment.unwrap().contains("event#3"));
}

#[test]
fn test_failed_status_update_is_atomic() {
    let dir = tempdir().unwrap();
    let mut store = backend(dir.path()).open(0, None).unwrap();
    store_all(&mut store, 1..=2);
    store.set_status(1, 0, EventStatus::InProcess, None).unwrap();

    // Seqno 2 is still pending, so the whole update is refused.
    assert!(store
        .update_failed_status(&StatusUpdate::new(2), &[StatusUpdate::new(1)])
        .is_err());
    assert_eq!(store.find(1).unwrap().unwrap().status, EventStatus::InProcess);
}

#[test]
fn test_corrupt_payload_is_detected() {
    let dir = tempdir().unwrap();
    let backend = backend(dir.path());
    let mut store = backend.open(0, None).unwrap();
    store_all(&mut store, 1..=1);
    drop(store);

    let conn = rusqlite::Connection::open(dir.path().join("thl.db")).unwrap();
    conn.execute("UPDATE history SET event = X'DEADBEEF' WHERE seqno = 1", [])
        .unwrap();
    drop(conn);

    let store = backend.open(0, None).unwrap();
    let err = store.find(1).unwrap_err();
    assert!(matches!(
        err,
        ThlError::Storage(StorageError::Corrupt { seqno: 1, fragno: 0, .. })
    ));
}
