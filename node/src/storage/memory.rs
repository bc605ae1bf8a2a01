// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! In-process log store.
//!
//! A [`MemoryLog`] is an ordinary value: each test (or embedded user) builds
//! its own and hands clones of the `Arc` to the handles that should share it.
//! Fragments stored without `commit` stay private to the storing handle until
//! it commits, mirroring transaction visibility in the SQLite backend.

use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use thl::config::{DEFAULT_FRAGMENT_WAIT, DELETE_BATCH_SIZE};
use thl::error::{Result, StorageError};
use thl::event::{now_millis, EventStatus, LogEvent, StatusUpdate};
use thl::position::{applied_latency_secs, CommitPosition};

use super::commit_table::{finish_reduction, plan_reduction, Reduction};
use super::{check_transition, rollback_comment, CommitPositions, LogStore, NativeSlaveSync};

type Key = (u64, u16);

#[derive(Default)]
struct MemoryState {
    events: BTreeMap<Key, LogEvent>,
    commits: BTreeMap<u32, CommitPosition>,
}

pub struct MemoryLog {
    state: Mutex<MemoryState>,
    arrived: Condvar,
    fragment_wait: Duration,
    delete_batch_size: usize,
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::with_settings(DEFAULT_FRAGMENT_WAIT, DELETE_BATCH_SIZE)
    }
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_settings(fragment_wait: Duration, delete_batch_size: usize) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            arrived: Condvar::new(),
            fragment_wait,
            delete_batch_size: delete_batch_size.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of committed fragments.
    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct MemoryLogStore {
    log: Arc<MemoryLog>,
    task_id: u32,
    pending: Vec<LogEvent>,
    pending_position: Option<CommitPosition>,
    native_sync: Option<Arc<dyn NativeSlaveSync>>,
}

impl MemoryLogStore {
    pub fn open(
        log: Arc<MemoryLog>,
        task_id: u32,
        native_sync: Option<Arc<dyn NativeSlaveSync>>,
    ) -> Result<Self> {
        let mut store = Self {
            log,
            task_id,
            pending: Vec::new(),
            pending_position: None,
            native_sync,
        };
        store.prepare_task(task_id)?;
        Ok(store)
    }

    fn transaction_keys(state: &MemoryState, seqno: u64) -> Vec<Key> {
        state
            .events
            .range((seqno, 0)..=(seqno, u16::MAX))
            .map(|(k, _)| *k)
            .collect()
    }

    /// Validates every fragment of every listed transaction, then applies the
    /// changes. Nothing is written when any check fails.
    fn apply_bulk(&mut self, changes: &[(u64, EventStatus, Option<String>)]) -> Result<()> {
        let mut state = self.log.lock();
        for (seqno, status, _) in changes {
            for key in Self::transaction_keys(&state, *seqno) {
                let current = state.events[&key].status;
                check_transition(key.0, key.1, current, *status)?;
            }
        }
        let now = now_millis();
        for (seqno, status, comment) in changes {
            for key in Self::transaction_keys(&state, *seqno) {
                if let Some(event) = state.events.get_mut(&key) {
                    event.status = *status;
                    event.processed_tstamp = Some(now);
                    if comment.is_some() {
                        event.comment = comment.clone();
                    }
                }
            }
        }
        Ok(())
    }
}

impl LogStore for MemoryLogStore {
    fn task_id(&self) -> u32 {
        self.task_id
    }

    fn store(&mut self, event: &LogEvent, commit: bool, sync: bool) -> Result<()> {
        let key = (event.seqno, event.fragno);
        let duplicate = self.log.lock().events.contains_key(&key)
            || self.pending.iter().any(|e| (e.seqno, e.fragno) == key);
        if duplicate {
            return Err(StorageError::DuplicateEntry {
                seqno: event.seqno,
                fragno: event.fragno,
            }
            .into());
        }
        self.pending.push(event.clone());
        if sync {
            let latency = applied_latency_secs(event.source_tstamp, now_millis());
            self.pending_position = Some(CommitPosition::from_header(
                self.task_id,
                &event.header(),
                latency,
            ));
        }
        if commit {
            self.commit()?;
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if self.pending.is_empty() && self.pending_position.is_none() {
            return Ok(());
        }
        let mut state = self.log.lock();
        for event in self.pending.drain(..) {
            state.events.insert((event.seqno, event.fragno), event);
        }
        if let Some(position) = self.pending_position.take() {
            state.commits.insert(position.task_id, position);
        }
        drop(state);
        self.log.arrived.notify_all();
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.pending.clear();
        self.pending_position = None;
        Ok(())
    }

    fn find_fragment(&self, seqno: u64, fragno: u16) -> Result<Option<LogEvent>> {
        let deadline = Instant::now() + self.log.fragment_wait;
        let mut state = self.log.lock();
        loop {
            if let Some(event) = state.events.get(&(seqno, fragno)) {
                return Ok(Some(event.clone()));
            }
            let now = Instant::now();
            if fragno == 0 || now >= deadline {
                return Ok(None);
            }
            state = self
                .log
                .arrived
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn try_find_fragment(&self, seqno: u64, fragno: u16) -> Result<Option<LogEvent>> {
        Ok(self.log.lock().events.get(&(seqno, fragno)).cloned())
    }

    fn min_seqno(&self) -> Result<Option<u64>> {
        Ok(self.log.lock().events.keys().next().map(|k| k.0))
    }

    fn max_seqno(&self) -> Result<Option<u64>> {
        Ok(self.log.lock().events.keys().next_back().map(|k| k.0))
    }

    fn max_fragno(&self, seqno: u64) -> Result<Option<u16>> {
        let state = self.log.lock();
        Ok(state
            .events
            .range((seqno, 0)..=(seqno, u16::MAX))
            .next_back()
            .map(|(k, _)| k.1))
    }

    fn max_completed_seqno(&self) -> Result<Option<u64>> {
        let state = self.log.lock();
        if let Some(min) = state.commits.values().filter_map(|c| c.seqno).min() {
            return Ok(Some(min));
        }
        Ok(state
            .events
            .values()
            .filter(|e| matches!(e.status, EventStatus::Completed | EventStatus::Skipped))
            .map(|e| e.seqno)
            .max())
    }

    fn event_id(&self, seqno: u64) -> Result<Option<String>> {
        Ok(self
            .log
            .lock()
            .events
            .get(&(seqno, 0))
            .map(|e| e.event_id.clone()))
    }

    fn max_event_id(&self, source_id: Option<&str>) -> Result<Option<String>> {
        let state = self.log.lock();
        Ok(state
            .events
            .values()
            .rev()
            .filter(|e| !e.event_id.is_empty())
            .find(|e| source_id.map_or(true, |s| e.source_id == s))
            .map(|e| e.event_id.clone()))
    }

    fn delete(
        &mut self,
        low: Option<u64>,
        high: Option<u64>,
        older_than: Option<Duration>,
    ) -> Result<usize> {
        let (Some(min), Some(max)) = (self.min_seqno()?, self.max_seqno()?) else {
            return Ok(0);
        };
        if max == 0 {
            return Ok(0);
        }
        let stop = high.unwrap_or(u64::MAX).min(max - 1);
        let mut cursor = low.unwrap_or(min).max(min);
        let cutoff = older_than
            .and_then(|age| chrono::Duration::from_std(age).ok())
            .map(|age| now_millis() - age);
        let batch = self.log.delete_batch_size as u64;

        let mut deleted = 0;
        while cursor <= stop {
            let upper = cursor.saturating_add(batch - 1).min(stop);
            let mut state = self.log.lock();
            let window = (cursor, 0)..=(upper, u16::MAX);
            let in_window = state.events.range(window.clone()).count();
            let doomed: Vec<Key> = state
                .events
                .range(window)
                .filter(|(_, e)| match cutoff {
                    Some(cutoff) => e.processed_tstamp.map_or(false, |t| t < cutoff),
                    None => true,
                })
                .map(|(k, _)| *k)
                .collect();
            for key in &doomed {
                state.events.remove(key);
            }
            deleted += doomed.len();
            // Rows are processed in seqno order; survivors mean the rest are newer.
            if (cutoff.is_some() && doomed.len() < in_window) || upper == u64::MAX {
                break;
            }
            cursor = upper + 1;
        }
        Ok(deleted)
    }

    fn set_status(
        &mut self,
        seqno: u64,
        fragno: u16,
        status: EventStatus,
        comment: Option<&str>,
    ) -> Result<()> {
        let mut state = self.log.lock();
        let event = state
            .events
            .get_mut(&(seqno, fragno))
            .ok_or(StorageError::NotFound { seqno, fragno })?;
        check_transition(seqno, fragno, event.status, status)?;
        event.status = status;
        event.processed_tstamp = Some(now_millis());
        if let Some(comment) = comment {
            event.comment = Some(comment.to_string());
        }
        Ok(())
    }

    fn update_success_status(
        &mut self,
        succeeded: &[StatusUpdate],
        skipped: &[StatusUpdate],
    ) -> Result<()> {
        let changes: Vec<_> = succeeded
            .iter()
            .map(|u| (u.seqno, EventStatus::Completed, u.comment.clone()))
            .chain(skipped.iter().map(|u| {
                let comment = u
                    .comment
                    .clone()
                    .unwrap_or_else(|| "Unknown event failure".to_string());
                (u.seqno, EventStatus::Skipped, Some(comment))
            }))
            .collect();
        self.apply_bulk(&changes)
    }

    fn update_failed_status(
        &mut self,
        failed: &StatusUpdate,
        rolled_back: &[StatusUpdate],
    ) -> Result<()> {
        let failed_comment = failed
            .comment
            .clone()
            .unwrap_or_else(|| "Unknown failure".to_string());
        let changes: Vec<_> = rolled_back
            .iter()
            .map(|u| (u.seqno, EventStatus::Failed, Some(rollback_comment(failed.seqno))))
            .chain(std::iter::once((
                failed.seqno,
                EventStatus::Failed,
                Some(failed_comment),
            )))
            .collect();
        self.apply_bulk(&changes)
    }
}

impl CommitPositions for MemoryLogStore {
    fn prepare_task(&mut self, task_id: u32) -> Result<()> {
        let mut state = self.log.lock();
        if state.commits.contains_key(&task_id) {
            return Ok(());
        }
        let position = match state.commits.get(&0) {
            Some(primary) if task_id != 0 && primary.seqno.is_some() => {
                tracing::info!("Propagating commit position from task 0 to task {}", task_id);
                primary.copy_for(task_id)
            }
            _ => CommitPosition::initial(task_id),
        };
        state.commits.insert(task_id, position);
        Ok(())
    }

    fn last_commit_position(&self, task_id: u32) -> Result<Option<CommitPosition>> {
        Ok(self.log.lock().commits.get(&task_id).cloned())
    }

    fn update_commit_position(&mut self, position: &CommitPosition) -> Result<()> {
        self.log
            .lock()
            .commits
            .insert(position.task_id, position.clone());
        Ok(())
    }

    fn commit_positions(&self) -> Result<Vec<CommitPosition>> {
        Ok(self.log.lock().commits.values().cloned().collect())
    }

    fn reduce_tasks(&mut self) -> Result<bool> {
        let (reduction, reduced) = {
            let mut state = self.log.lock();
            let rows: Vec<_> = state.commits.values().cloned().collect();
            let reduction = plan_reduction(&rows);
            let mut reduced = 0;
            if matches!(reduction, Reduction::Reduce { .. }) {
                let before = state.commits.len();
                state.commits.retain(|task_id, _| *task_id == 0);
                reduced = before - state.commits.len();
            }
            (reduction, reduced)
        };
        finish_reduction(&reduction, reduced, self.native_sync.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(log: &Arc<MemoryLog>, task_id: u32) -> MemoryLogStore {
        MemoryLogStore::open(log.clone(), task_id, None).unwrap()
    }

    fn event(seqno: u64, fragno: u16, last: bool) -> LogEvent {
        LogEvent::new(seqno, fragno, last, "db1", 1, format!("mysql-bin.000001:{}", seqno), vec![1, 2, 3])
    }

    #[test]
    fn test_uncommitted_fragments_are_private() {
        let log = Arc::new(MemoryLog::new());
        let mut writer = open(&log, 0);
        let reader = open(&log, 1);

        writer.store(&event(1, 0, false), false, false).unwrap();
        assert!(reader.try_find_fragment(1, 0).unwrap().is_none());

        writer.store(&event(1, 1, true), true, false).unwrap();
        assert!(reader.try_find_fragment(1, 0).unwrap().is_some());
        assert_eq!(reader.max_fragno(1).unwrap(), Some(1));
    }

    #[test]
    fn test_duplicate_in_open_transaction() {
        let log = Arc::new(MemoryLog::new());
        let mut writer = open(&log, 0);
        writer.store(&event(1, 0, false), false, false).unwrap();
        let err = writer.store(&event(1, 0, false), false, false).unwrap_err();
        assert!(matches!(
            err,
            thl::ThlError::Storage(StorageError::DuplicateEntry { seqno: 1, fragno: 0 })
        ));
    }

    #[test]
    fn test_fragment_wait_sees_late_commit() {
        let log = Arc::new(MemoryLog::with_settings(Duration::from_secs(5), 1000));
        let mut writer = open(&log, 0);
        writer.store(&event(1, 0, false), true, false).unwrap();

        let reader = open(&log, 1);
        let handle = std::thread::spawn(move || reader.find_fragment(1, 1).unwrap());
        std::thread::sleep(Duration::from_millis(50));
        writer.store(&event(1, 1, true), true, false).unwrap();

        let found = handle.join().unwrap();
        assert_eq!(found.map(|e| e.fragno), Some(1));
    }

    #[test]
    fn test_fragment_wait_times_out() {
        let log = Arc::new(MemoryLog::with_settings(Duration::from_millis(20), 1000));
        let reader = open(&log, 0);
        let started = Instant::now();
        assert!(reader.find_fragment(9, 2).unwrap().is_none());
        assert!(started.elapsed() >= Duration::from_millis(20));
        // Fragment 0 never waits.
        assert!(reader.find_fragment(9, 0).unwrap().is_none());
    }

    #[test]
    fn test_bulk_status_is_all_or_nothing() {
        let log = Arc::new(MemoryLog::new());
        let mut store = open(&log, 0);
        for s in 1..=3 {
            store.store(&event(s, 0, true), true, false).unwrap();
        }
        store.set_status(1, 0, EventStatus::InProcess, None).unwrap();
        store.set_status(2, 0, EventStatus::InProcess, None).unwrap();

        // seqno 3 is still pending, so Completed is not reachable.
        let err = store
            .update_success_status(&[StatusUpdate::new(1), StatusUpdate::new(3)], &[])
            .unwrap_err();
        assert!(matches!(
            err,
            thl::ThlError::Storage(StorageError::InvalidTransition { seqno: 3, .. })
        ));
        assert_eq!(store.find(1).unwrap().unwrap().status, EventStatus::InProcess);

        store
            .update_failed_status(&StatusUpdate::new(2).with_comment("boom"), &[StatusUpdate::new(1)])
            .unwrap();
        let one = store.find(1).unwrap().unwrap();
        assert_eq!(one.status, EventStatus::Failed);
        assert!(one.comment.unwrap().contains("event#2"));
        assert_eq!(store.find(2).unwrap().unwrap().comment.as_deref(), Some("boom"));
    }
}
