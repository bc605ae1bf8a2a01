// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Sequential reads over the log.
//!
//! A [`LogCursor`] owns its own store handle and walks fragments in
//! `(seqno, fragno)` order. When it reaches the head it waits on the
//! sequencer instead of polling the store.

use std::sync::Arc;
use std::time::Duration;

use thl::config::PRIMARY_TASK_ID;
use thl::error::{Result, StorageError, ThlError};
use thl::event::{EventHeader, LogEvent};
use thl::position::StorePosition;

use crate::cache::EventsCache;
use crate::storage::{LogStore, StorageBackend};
use crate::watermark::Watermark;

/// Highest fragment committed through the facade.
pub type Sequencer = Watermark<Option<StorePosition>>;

/// Accepts or rejects a record by header before the payload is handed out.
pub type ReadFilter = Arc<dyn Fn(&EventHeader) -> bool + Send + Sync>;

/// Everything a reader needs to open its own handle and follow the head.
#[derive(Clone)]
pub struct LogSource {
    backend: StorageBackend,
    sequencer: Arc<Sequencer>,
    cache: Arc<EventsCache>,
    fragment_wait: Duration,
}

impl LogSource {
    pub fn new(
        backend: StorageBackend,
        sequencer: Arc<Sequencer>,
        cache: Arc<EventsCache>,
        fragment_wait: Duration,
    ) -> Self {
        Self {
            backend,
            sequencer,
            cache,
            fragment_wait,
        }
    }

    pub fn backend(&self) -> &StorageBackend {
        &self.backend
    }

    pub fn sequencer(&self) -> &Arc<Sequencer> {
        &self.sequencer
    }

    pub fn cache(&self) -> &Arc<EventsCache> {
        &self.cache
    }

    pub fn open_store(&self, task_id: u32) -> Result<Box<dyn LogStore>> {
        self.backend.open(task_id, None)
    }

    pub fn max_committed_seqno(&self) -> Option<u64> {
        self.sequencer.current().map(|p| p.seqno)
    }

    /// Cursor on a read-only handle, starting at the first fragment of `seqno`.
    pub fn cursor(&self, seqno: u64) -> Result<LogCursor> {
        self.cursor_for_task(PRIMARY_TASK_ID, seqno)
    }

    pub fn cursor_for_task(&self, task_id: u32, seqno: u64) -> Result<LogCursor> {
        Ok(LogCursor {
            store: self.open_store(task_id)?,
            position: StorePosition::new(seqno, 0),
            filter: None,
            sequencer: self.sequencer.clone(),
            cache: self.cache.clone(),
            fragment_wait: self.fragment_wait,
        })
    }
}

#[derive(Debug)]
pub enum CursorRead {
    Event(LogEvent),
    /// Rejected by the read filter; only the header is returned so the
    /// caller can track its position.
    Filtered(EventHeader),
}

impl CursorRead {
    pub fn header(&self) -> EventHeader {
        match self {
            CursorRead::Event(e) => e.header(),
            CursorRead::Filtered(h) => h.clone(),
        }
    }
}

pub struct LogCursor {
    store: Box<dyn LogStore>,
    position: StorePosition,
    filter: Option<ReadFilter>,
    sequencer: Arc<Sequencer>,
    cache: Arc<EventsCache>,
    fragment_wait: Duration,
}

impl LogCursor {
    pub fn with_filter(mut self, filter: ReadFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Position of the next fragment to be read.
    pub fn position(&self) -> StorePosition {
        self.position
    }

    pub fn seek(&mut self, seqno: u64) {
        self.position = StorePosition::new(seqno, 0);
    }

    /// Positions the cursor just after `header`.
    pub fn seek_after(&mut self, header: &EventHeader) {
        self.position = if header.last_frag {
            StorePosition::new(header.end_seqno() + 1, 0)
        } else {
            let end_fragno = header.filtered.map_or(header.fragno, |f| f.fragno_end);
            StorePosition::new(header.seqno, end_fragno + 1)
        };
    }

    pub fn store(&self) -> &dyn LogStore {
        self.store.as_ref()
    }

    fn lookup(&self) -> Result<Option<LogEvent>> {
        let StorePosition { seqno, fragno } = self.position;
        if fragno == 0 {
            if let Some(event) = self.cache.get(seqno) {
                return Ok(Some(event));
            }
        }
        self.store.try_find_fragment(seqno, fragno)
    }

    fn step(&mut self, event: &LogEvent) {
        self.position = if event.last_frag {
            StorePosition::new(event.end_seqno() + 1, 0)
        } else {
            StorePosition::new(event.seqno, event.end_fragno() + 1)
        };
    }

    fn accept(&mut self, event: LogEvent) -> CursorRead {
        self.step(&event);
        match &self.filter {
            Some(filter) if !filter(&event.header()) => CursorRead::Filtered(event.header()),
            _ => CursorRead::Event(event),
        }
    }

    /// Reads the next fragment if it is already visible.
    pub fn try_next(&mut self) -> Result<Option<CursorRead>> {
        Ok(self.lookup()?.map(|event| self.accept(event)))
    }

    /// Waits for the next fragment. A missing fragment behind the head is an
    /// error; a fragment > 0 that does not show up within the fragment wait
    /// fails with `Timeout`.
    pub async fn next(&mut self) -> Result<CursorRead> {
        loop {
            if let Some(read) = self.try_next()? {
                return Ok(read);
            }
            let wanted = Some(self.position);
            if self.sequencer.current() >= wanted {
                // Committed before the sequencer moved, so it should be visible.
                return Err(StorageError::NotFound {
                    seqno: self.position.seqno,
                    fragno: self.position.fragno,
                }
                .into());
            }
            if self.position.fragno > 0 {
                self.sequencer
                    .wait_at_least_for(wanted, self.fragment_wait)
                    .await
                    .map_err(|_| ThlError::Timeout {
                        what: format!(
                            "fragment seqno={} fragno={}",
                            self.position.seqno, self.position.fragno
                        ),
                        waited: self.fragment_wait,
                    })?;
            } else {
                self.sequencer.wait_at_least(wanted).await;
            }
        }
    }

    /// As [`Self::next`], giving up with `None` once `timeout` passes
    /// without new data.
    pub async fn next_within(&mut self, timeout: Duration) -> Result<Option<CursorRead>> {
        match tokio::time::timeout(timeout, self.next()).await {
            Ok(read) => read.map(Some),
            Err(_) => Ok(None),
        }
    }
}
