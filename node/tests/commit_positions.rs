// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::tempdir;
use thl::event::LogEvent;
use thl::position::CommitPosition;
use thl_node::storage::memory::MemoryLog;
use thl_node::storage::{LogStore, NativeSlaveSync, SqliteOptions, StorageBackend};

#[derive(Default)]
struct RecordingSync {
    synced: Mutex<Vec<String>>,
}

impl NativeSlaveSync for RecordingSync {
    fn sync_native_slave(&self, event_id: &str) -> thl::Result<()> {
        self.synced.lock().unwrap().push(event_id.to_string());
        Ok(())
    }
}

fn position(task_id: u32, seqno: u64) -> CommitPosition {
    let header = LogEvent::new(seqno, 0, true, "db1", 1, format!("bin.000002:{}", seqno), vec![]).header();
    CommitPosition::from_header(task_id, &header, 0)
}

fn open_tasks(
    backend: &StorageBackend,
    tasks: u32,
    sync: Option<Arc<dyn NativeSlaveSync>>,
) -> Vec<Box<dyn LogStore>> {
    (0..tasks)
        .map(|task| backend.open(task, sync.clone()).unwrap())
        .collect()
}

fn sqlite_backend(dir: &std::path::Path) -> StorageBackend {
    StorageBackend::Sqlite(SqliteOptions {
        path: dir.join("thl.db"),
        fragment_wait: Duration::from_millis(10),
        delete_batch_size: 100,
        busy_timeout: Duration::from_secs(1),
    })
}

fn check_reduces_when_aligned(backend: StorageBackend) {
    let recorder = Arc::new(RecordingSync::default());
    let mut stores = open_tasks(&backend, 3, Some(recorder.clone()));
    for (task, store) in (0u32..).zip(stores.iter_mut()) {
        store.update_commit_position(&position(task, 100)).unwrap();
    }

    assert!(stores[0].reduce_tasks().unwrap());
    let rows = stores[0].commit_positions().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].task_id, 0);
    assert_eq!(rows[0].seqno, Some(100));
    assert_eq!(*recorder.synced.lock().unwrap(), vec!["bin.000002:100".to_string()]);
}

fn check_refuses_when_misaligned(backend: StorageBackend) {
    let mut stores = open_tasks(&backend, 2, None);
    stores[0].update_commit_position(&position(0, 100)).unwrap();
    stores[1].update_commit_position(&position(1, 99)).unwrap();

    assert!(!stores[0].reduce_tasks().unwrap());
    assert_eq!(stores[0].commit_positions().unwrap().len(), 2);
}

#[test]
fn test_sqlite_reduce_aligned_tasks() {
    let dir = tempdir().unwrap();
    check_reduces_when_aligned(sqlite_backend(dir.path()));
}

#[test]
fn test_sqlite_reduce_refused_on_mismatch() {
    let dir = tempdir().unwrap();
    check_refuses_when_misaligned(sqlite_backend(dir.path()));
}

#[test]
fn test_memory_reduce_aligned_tasks() {
    check_reduces_when_aligned(StorageBackend::Memory(Arc::new(MemoryLog::new())));
}

#[test]
fn test_memory_reduce_refused_on_mismatch() {
    check_refuses_when_misaligned(StorageBackend::Memory(Arc::new(MemoryLog::new())));
}

#[test]
fn test_new_task_starts_from_primary_position() {
    let dir = tempdir().unwrap();
    let backend = sqlite_backend(dir.path());
    let mut primary = backend.open(0, None).unwrap();
    primary.update_commit_position(&position(0, 42)).unwrap();

    let secondary = backend.open(5, None).unwrap();
    let row = secondary.last_commit_position(5).unwrap().unwrap();
    assert_eq!(row.task_id, 5);
    assert_eq!(row.seqno, Some(42));
}
