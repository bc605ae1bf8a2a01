// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! The log facade.
//!
//! [`Thl`] ties a storage backend to the sequencer, the events cache and the
//! log server. Writers go through a [`LogConnection`]; each one owns its
//! own store handle, and a commit on any of them advances the sequencer so
//! cursors and server handlers see the new head.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;

use thl::config::PRIMARY_TASK_ID;
use thl::error::{Result, ThlError};
use thl::event::{EventStatus, LogEvent, StatusUpdate};
use thl::position::{CommitPosition, SeqNoRange, StorePosition};

use crate::cache::{CacheStats, EventsCache};
use crate::config::ThlConfig;
use crate::cursor::{LogCursor, LogSource, Sequencer};
use crate::network::server::Server;
use crate::storage::{LogStore, NativeSlaveSync, StorageBackend};
use crate::telemetry;
use crate::watermark::Watermark;

#[derive(Clone, Debug, Serialize)]
pub struct ThlStatus {
    pub storage: &'static str,
    pub range: SeqNoRange,
    pub sequencer: Option<StorePosition>,
    pub max_completed_seqno: Option<u64>,
    pub server_addr: Option<SocketAddr>,
    pub connected_clients: usize,
    pub cache: CacheStats,
    pub commit_positions: Vec<CommitPosition>,
}

pub struct Thl {
    config: ThlConfig,
    source: LogSource,
    native_sync: Option<Arc<dyn NativeSlaveSync>>,
    admin: Mutex<Box<dyn LogStore>>,
    server: tokio::sync::Mutex<Option<Server>>,
}

impl Thl {
    pub fn open(config: ThlConfig, backend: StorageBackend) -> Result<Arc<Self>> {
        Self::open_with_native_sync(config, backend, None)
    }

    pub fn open_with_native_sync(
        config: ThlConfig,
        backend: StorageBackend,
        native_sync: Option<Arc<dyn NativeSlaveSync>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let admin = backend.open(PRIMARY_TASK_ID, native_sync.clone())?;
        let head = match admin.max_seqno()? {
            Some(seqno) => Some(StorePosition::new(seqno, admin.max_fragno(seqno)?.unwrap_or(0))),
            None => None,
        };
        tracing::info!(
            "Opened {} log; head position {:?}",
            backend.name(),
            head
        );

        let source = LogSource::new(
            backend,
            Arc::new(Watermark::new(head)),
            Arc::new(EventsCache::new(config.cache_size)),
            config.fragment_wait,
        );
        Ok(Arc::new(Self {
            config,
            source,
            native_sync,
            admin: Mutex::new(admin),
            server: tokio::sync::Mutex::new(None),
        }))
    }

    pub fn config(&self) -> &ThlConfig {
        &self.config
    }

    pub fn source(&self) -> &LogSource {
        &self.source
    }

    pub fn sequencer(&self) -> &Arc<Sequencer> {
        self.source.sequencer()
    }

    pub fn max_committed_seqno(&self) -> Option<u64> {
        self.source.max_committed_seqno()
    }

    /// Handle used for queries that do not belong to any task.
    pub fn admin(&self) -> MutexGuard<'_, Box<dyn LogStore>> {
        self.admin.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Opens a writer owned by `task_id`, creating its commit row on first use.
    pub fn connect(&self, task_id: u32) -> Result<LogConnection> {
        let store = self
            .source
            .backend()
            .open(task_id, self.native_sync.clone())?;
        Ok(LogConnection {
            store,
            sequencer: self.source.sequencer().clone(),
            cache: self.source.cache().clone(),
            pending: Vec::new(),
            pending_head: None,
        })
    }

    pub fn cursor(&self, seqno: u64) -> Result<LogCursor> {
        self.source.cursor(seqno)
    }

    pub fn min_max_seqno(&self) -> Result<SeqNoRange> {
        self.admin().min_max_seqno()
    }

    /// Waits until the sequencer covers `position`.
    pub async fn wait_for_position(
        &self,
        position: StorePosition,
        timeout: Duration,
    ) -> Result<StorePosition> {
        let reached = self
            .sequencer()
            .wait_at_least_for(Some(position), timeout)
            .await?;
        reached.ok_or(ThlError::Cancelled)
    }

    /// Purges a seqno range through the admin handle. Cached entries are
    /// dropped since they may no longer exist.
    pub fn purge(
        &self,
        low: Option<u64>,
        high: Option<u64>,
        older_than: Option<Duration>,
    ) -> Result<usize> {
        let deleted = self.admin().delete(low, high, older_than)?;
        self.source.cache().clear();
        metrics::counter!(telemetry::EVENTS_PURGED, deleted as u64);
        tracing::info!("Purged {} log rows", deleted);
        Ok(deleted)
    }

    pub async fn start_server(&self) -> Result<SocketAddr> {
        let mut slot = self.server.lock().await;
        if let Some(server) = slot.as_ref() {
            return Ok(server.local_addr());
        }
        let server = Server::start(self.source.clone(), self.config.clone()).await?;
        let addr = server.local_addr();
        *slot = Some(server);
        Ok(addr)
    }

    pub async fn server_addr(&self) -> Option<SocketAddr> {
        self.server.lock().await.as_ref().map(Server::local_addr)
    }

    /// Stops the log server, if running.
    pub async fn stop(&self) {
        let server = self.server.lock().await.take();
        if let Some(server) = server {
            server.stop().await;
        }
    }

    pub async fn status(&self) -> Result<ThlStatus> {
        let (server_addr, connected_clients) = match self.server.lock().await.as_ref() {
            Some(server) => (Some(server.local_addr()), server.connected_clients()),
            None => (None, 0),
        };
        let admin = self.admin();
        Ok(ThlStatus {
            storage: self.source.backend().name(),
            range: admin.min_max_seqno()?,
            sequencer: self.sequencer().current(),
            max_completed_seqno: admin.max_completed_seqno()?,
            server_addr,
            connected_clients,
            cache: self.source.cache().stats(),
            commit_positions: admin.commit_positions()?,
        })
    }
}

/// A writer's view of the log.
pub struct LogConnection {
    store: Box<dyn LogStore>,
    sequencer: Arc<Sequencer>,
    cache: Arc<EventsCache>,
    pending: Vec<LogEvent>,
    pending_head: Option<StorePosition>,
}

impl LogConnection {
    pub fn task_id(&self) -> u32 {
        self.store.task_id()
    }

    pub fn store(&mut self, event: &LogEvent, commit: bool, sync: bool) -> Result<()> {
        self.store.store(event, commit, sync)?;
        metrics::counter!(telemetry::EVENTS_STORED, 1);
        let position = StorePosition::new(event.seqno, event.fragno);
        self.pending_head = self.pending_head.max(Some(position));
        if event.is_unfragmented() {
            self.pending.push(event.clone());
        }
        if commit {
            self.publish();
        }
        Ok(())
    }

    pub fn commit(&mut self) -> Result<()> {
        self.store.commit()?;
        self.publish();
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<()> {
        self.pending.clear();
        self.pending_head = None;
        self.store.rollback()
    }

    fn publish(&mut self) {
        for event in self.pending.drain(..) {
            self.cache.put(&event);
        }
        if let Some(head) = self.pending_head.take() {
            self.sequencer.advance(Some(head));
        }
    }

    pub fn find(&self, seqno: u64) -> Result<Option<LogEvent>> {
        if let Some(event) = self.cache.get(seqno) {
            return Ok(Some(event));
        }
        self.store.find(seqno)
    }

    pub fn find_fragment(&self, seqno: u64, fragno: u16) -> Result<Option<LogEvent>> {
        if fragno == 0 {
            return self.find(seqno);
        }
        self.store.find_fragment(seqno, fragno)
    }

    pub fn set_status(
        &mut self,
        seqno: u64,
        fragno: u16,
        status: EventStatus,
        comment: Option<&str>,
    ) -> Result<()> {
        self.store.set_status(seqno, fragno, status, comment)?;
        self.cache.remove(seqno);
        Ok(())
    }

    pub fn update_success_status(
        &mut self,
        succeeded: &[StatusUpdate],
        skipped: &[StatusUpdate],
    ) -> Result<()> {
        self.store.update_success_status(succeeded, skipped)?;
        self.evict(succeeded.iter().chain(skipped));
        Ok(())
    }

    pub fn update_failed_status(
        &mut self,
        failed: &StatusUpdate,
        rolled_back: &[StatusUpdate],
    ) -> Result<()> {
        self.store.update_failed_status(failed, rolled_back)?;
        self.evict(std::iter::once(failed).chain(rolled_back));
        Ok(())
    }

    /// Cached copies carry the status at store time.
    fn evict<'a>(&self, updates: impl Iterator<Item = &'a StatusUpdate>) {
        for update in updates {
            self.cache.remove(update.seqno);
        }
    }

    pub fn last_commit_position(&self) -> Result<Option<CommitPosition>> {
        self.store.last_commit_position(self.store.task_id())
    }

    pub fn update_commit_position(&mut self, position: &CommitPosition) -> Result<()> {
        self.store.update_commit_position(position)
    }

    pub fn reduce_tasks(&mut self) -> Result<bool> {
        self.store.reduce_tasks()
    }

    /// Underlying handle, for queries not mirrored here.
    pub fn log(&self) -> &dyn LogStore {
        self.store.as_ref()
    }

    pub fn log_mut(&mut self) -> &mut dyn LogStore {
        self.store.as_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageKind;

    fn memory_thl() -> Arc<Thl> {
        let config = ThlConfig {
            storage: StorageKind::Memory,
            fragment_wait: Duration::from_millis(100),
            ..ThlConfig::default()
        };
        let backend = StorageBackend::from_config(&config);
        Thl::open(config, backend).unwrap()
    }

    #[tokio::test]
    async fn test_commit_advances_sequencer() {
        let thl = memory_thl();
        let mut conn = thl.connect(0).unwrap();
        conn.store(&LogEvent::new(1, 0, false, "src", 1, "", vec![1]), false, false)
            .unwrap();
        conn.store(&LogEvent::new(1, 1, true, "src", 1, "", vec![2]), false, false)
            .unwrap();
        assert_eq!(thl.max_committed_seqno(), None);

        conn.commit().unwrap();
        assert_eq!(thl.sequencer().current(), Some(StorePosition::new(1, 1)));
    }

    #[tokio::test]
    async fn test_rollback_leaves_sequencer() {
        let thl = memory_thl();
        let mut conn = thl.connect(0).unwrap();
        conn.store(&LogEvent::new(1, 0, true, "src", 1, "", vec![]), false, false)
            .unwrap();
        conn.rollback().unwrap();
        assert_eq!(thl.max_committed_seqno(), None);
        assert!(conn.find(1).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cursor_waits_for_store() {
        let thl = memory_thl();
        let mut cursor = thl.cursor(1).unwrap();
        assert!(cursor.try_next().unwrap().is_none());

        let mut conn = thl.connect(0).unwrap();
        let reader = tokio::spawn(async move { cursor.next().await.map(|r| r.header().seqno) });
        conn.store(&LogEvent::new(1, 0, true, "src", 1, "", vec![]), true, false)
            .unwrap();
        assert_eq!(reader.await.unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cursor_skips_filtered_range() {
        use thl::event::FilteredRange;

        let thl = memory_thl();
        let mut conn = thl.connect(0).unwrap();
        let aggregated = LogEvent::new(1, 0, true, "src", 1, "", vec![]).with_filtered(FilteredRange {
            seqno_end: 4,
            fragno_end: 0,
        });
        conn.store(&aggregated, true, false).unwrap();
        conn.store(&LogEvent::new(5, 0, true, "src", 1, "", vec![]), true, false)
            .unwrap();

        let mut cursor = thl.cursor(1).unwrap();
        cursor.next().await.unwrap();
        assert_eq!(cursor.position(), StorePosition::new(5, 0));
        assert_eq!(cursor.next().await.unwrap().header().seqno, 5);
    }

    #[tokio::test]
    async fn test_missing_fragment_times_out() {
        let thl = memory_thl();
        let mut conn = thl.connect(0).unwrap();
        conn.store(&LogEvent::new(1, 0, false, "src", 1, "", vec![]), true, false)
            .unwrap();

        let mut cursor = thl.cursor(1).unwrap();
        cursor.next().await.unwrap();
        let err = cursor.next().await.unwrap_err();
        assert!(matches!(err, ThlError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_wait_for_position() {
        let thl = memory_thl();
        let waiter = {
            let thl = thl.clone();
            tokio::spawn(async move {
                thl.wait_for_position(StorePosition::new(2, 0), Duration::from_secs(5))
                    .await
            })
        };
        let mut conn = thl.connect(0).unwrap();
        for seqno in 1..=2 {
            conn.store(&LogEvent::new(seqno, 0, true, "src", 1, "", vec![]), true, false)
                .unwrap();
        }
        assert_eq!(waiter.await.unwrap().unwrap(), StorePosition::new(2, 0));

        let err = thl
            .wait_for_position(StorePosition::new(9, 0), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, ThlError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_status_change_visible_through_cache() {
        let thl = memory_thl();
        let mut conn = thl.connect(0).unwrap();
        let other = thl.connect(1).unwrap();
        for seqno in 1..=4 {
            conn.store(&LogEvent::new(seqno, 0, true, "src", 1, "", vec![]), true, false)
                .unwrap();
        }
        assert_eq!(other.find(1).unwrap().unwrap().status, EventStatus::Pending);

        conn.set_status(1, 0, EventStatus::InProcess, None).unwrap();
        assert_eq!(conn.find(1).unwrap().unwrap().status, EventStatus::InProcess);
        assert_eq!(conn.find_fragment(1, 0).unwrap().unwrap().status, EventStatus::InProcess);
        assert_eq!(other.find(1).unwrap().unwrap().status, EventStatus::InProcess);

        conn.set_status(2, 0, EventStatus::Skip, None).unwrap();
        conn.update_success_status(&[StatusUpdate::new(1)], &[StatusUpdate::new(2)])
            .unwrap();
        assert_eq!(other.find(1).unwrap().unwrap().status, EventStatus::Completed);
        assert_eq!(other.find(2).unwrap().unwrap().status, EventStatus::Skipped);

        for seqno in 3..=4 {
            conn.set_status(seqno, 0, EventStatus::InProcess, None).unwrap();
        }
        assert_eq!(other.find(3).unwrap().unwrap().status, EventStatus::InProcess);
        conn.update_failed_status(&StatusUpdate::new(4), &[StatusUpdate::new(3)])
            .unwrap();
        assert_eq!(other.find(3).unwrap().unwrap().status, EventStatus::Failed);
        assert_eq!(other.find(4).unwrap().unwrap().status, EventStatus::Failed);
    }

    #[tokio::test]
    async fn test_purge_drops_cached_events() {
        let thl = memory_thl();
        let mut conn = thl.connect(0).unwrap();
        for seqno in 1..=3 {
            conn.store(&LogEvent::new(seqno, 0, true, "src", 1, "", vec![]), true, false)
                .unwrap();
        }
        assert_eq!(thl.purge(None, Some(1), None).unwrap(), 1);
        assert!(conn.find(1).unwrap().is_none());
        assert_eq!(thl.min_max_seqno().unwrap().min_seqno, Some(2));
    }
}
