// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Local log as a pipeline stage.

use std::sync::Arc;

use async_trait::async_trait;

use thl::error::{Result, StorageError};
use thl::event::{EventHeader, LogEvent};

use super::{Applier, Extractor};
use crate::cursor::{CursorRead, LogCursor};
use crate::parallel::ParallelEvent;
use crate::thl::{LogConnection, Thl};

/// Stores events into the local log through its own connection.
pub struct ThlStoreApplier {
    thl: Arc<Thl>,
    conn: LogConnection,
}

impl ThlStoreApplier {
    pub fn new(thl: Arc<Thl>, task_id: u32) -> Result<Self> {
        let conn = thl.connect(task_id)?;
        tracing::info!("Storage applier prepared for task {}", task_id);
        Ok(Self { thl, conn })
    }

    pub fn connection(&self) -> &LogConnection {
        &self.conn
    }
}

#[async_trait]
impl Applier for ThlStoreApplier {
    async fn apply(&mut self, event: &LogEvent, commit: bool, sync: bool) -> Result<()> {
        self.conn.store(event, commit, sync)?;
        tracing::debug!("Stored event {}:{}", event.seqno, event.fragno);
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.conn.commit()
    }

    async fn rollback(&mut self) -> Result<()> {
        self.conn.rollback()
    }

    /// Last fragment of the highest stored seqno; an empty log falls back to
    /// the recorded commit position.
    async fn last_event(&mut self) -> Result<Option<EventHeader>> {
        let store = self.thl.admin();
        match store.max_seqno()? {
            Some(seqno) => {
                let fragno = store.max_fragno(seqno)?.unwrap_or(0);
                Ok(store.try_find_fragment(seqno, fragno)?.map(|e| e.header()))
            }
            None => self.conn.log().last_applied_event(),
        }
    }
}

/// Reads the local log in order and can also store into it.
pub struct ThlStoreAdapter {
    thl: Arc<Thl>,
    cursor: Option<LogCursor>,
    last_event: Option<EventHeader>,
    applier: ThlStoreApplier,
}

impl ThlStoreAdapter {
    pub fn new(thl: Arc<Thl>, task_id: u32) -> Result<Self> {
        let applier = ThlStoreApplier::new(thl.clone(), task_id)?;
        Ok(Self {
            thl,
            cursor: None,
            last_event: None,
            applier,
        })
    }

    fn open_cursor(&self) -> Result<LogCursor> {
        match &self.last_event {
            Some(header) => {
                let mut cursor = self.thl.cursor(header.seqno)?;
                cursor.seek_after(header);
                Ok(cursor)
            }
            None => {
                let start = self.thl.min_max_seqno()?.min_seqno.unwrap_or(0);
                self.thl.cursor(start)
            }
        }
    }
}

#[async_trait]
impl Extractor for ThlStoreAdapter {
    async fn set_last_event(&mut self, header: Option<EventHeader>) -> Result<()> {
        self.last_event = header;
        self.cursor = None;
        Ok(())
    }

    async fn extract(&mut self) -> Result<ParallelEvent> {
        let cursor = match self.cursor.take() {
            Some(cursor) => cursor,
            None => self.open_cursor()?,
        };
        let cursor = self.cursor.insert(cursor);
        let event = match cursor.next().await? {
            CursorRead::Event(event) => event,
            // No filter is installed here, but read the full record anyway.
            CursorRead::Filtered(header) => cursor
                .store()
                .try_find_fragment(header.seqno, header.fragno)?
                .ok_or(StorageError::NotFound {
                    seqno: header.seqno,
                    fragno: header.fragno,
                })?,
        };
        self.last_event = Some(event.header());
        Ok(ParallelEvent::Data(event))
    }
}

#[async_trait]
impl Applier for ThlStoreAdapter {
    async fn apply(&mut self, event: &LogEvent, commit: bool, sync: bool) -> Result<()> {
        self.applier.apply(event, commit, sync).await
    }

    async fn commit(&mut self) -> Result<()> {
        self.applier.commit().await
    }

    async fn rollback(&mut self) -> Result<()> {
        self.applier.rollback().await
    }

    async fn last_event(&mut self) -> Result<Option<EventHeader>> {
        self.applier.last_event().await
    }
}
