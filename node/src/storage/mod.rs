// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Log storage.
//!
//! Every consumer (the facade, one server handler, one parallel reader)
//! owns its own [`LogStore`] handle opened through [`StorageBackend`]. Handles
//! are `Send` so they can move into a task, but are never shared between
//! tasks.

pub mod commit_table;
pub mod memory;
pub mod sqlite;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thl::error::Result;
use thl::event::{EventHeader, EventStatus, LogEvent, StatusUpdate};
use thl::position::{CommitPosition, SeqNoRange};

use crate::config::{StorageKind, ThlConfig};
use memory::MemoryLog;

/// Durable append-mostly log keyed by `(seqno, fragno)`.
pub trait LogStore: CommitPositions + Send {
    fn task_id(&self) -> u32;

    /// Appends one fragment. Fails with `DuplicateEntry` when the key exists.
    /// `commit` closes the open transaction; `sync` also records the fragment
    /// as this task's commit position.
    fn store(&mut self, event: &LogEvent, commit: bool, sync: bool) -> Result<()>;

    /// Commits fragments stored with `commit == false`.
    fn commit(&mut self) -> Result<()>;

    /// Discards fragments stored with `commit == false`.
    fn rollback(&mut self) -> Result<()>;

    /// First fragment of `seqno`.
    fn find(&self, seqno: u64) -> Result<Option<LogEvent>> {
        self.find_fragment(seqno, 0)
    }

    /// Looks a fragment up; for `fragno > 0` waits up to the configured
    /// fragment wait for it to become visible.
    fn find_fragment(&self, seqno: u64, fragno: u16) -> Result<Option<LogEvent>>;

    /// Looks a fragment up without waiting.
    fn try_find_fragment(&self, seqno: u64, fragno: u16) -> Result<Option<LogEvent>>;

    fn min_seqno(&self) -> Result<Option<u64>>;

    fn max_seqno(&self) -> Result<Option<u64>>;

    fn min_max_seqno(&self) -> Result<SeqNoRange> {
        Ok(SeqNoRange {
            min_seqno: self.min_seqno()?,
            max_seqno: self.max_seqno()?,
        })
    }

    /// Highest fragno stored for `seqno`.
    fn max_fragno(&self, seqno: u64) -> Result<Option<u16>>;

    /// Lowest commit position over all tasks, or failing that the highest
    /// completed or skipped seqno.
    fn max_completed_seqno(&self) -> Result<Option<u64>>;

    fn event_id(&self, seqno: u64) -> Result<Option<String>>;

    /// Native event ID of the newest record that has one, optionally limited
    /// to one source.
    fn max_event_id(&self, source_id: Option<&str>) -> Result<Option<String>>;

    /// Purges `[low, high]` in batches, never touching the newest row. With
    /// `older_than`, rows processed more recently than that age survive.
    fn delete(
        &mut self,
        low: Option<u64>,
        high: Option<u64>,
        older_than: Option<Duration>,
    ) -> Result<usize>;

    fn set_status(
        &mut self,
        seqno: u64,
        fragno: u16,
        status: EventStatus,
        comment: Option<&str>,
    ) -> Result<()>;

    /// Moves `succeeded` to Completed and `skipped` to Skipped in one
    /// transaction.
    fn update_success_status(
        &mut self,
        succeeded: &[StatusUpdate],
        skipped: &[StatusUpdate],
    ) -> Result<()>;

    /// Marks `failed` as Failed, and every transaction of the same apply
    /// block in `rolled_back` as Failed with a rollback comment, in one
    /// transaction.
    fn update_failed_status(
        &mut self,
        failed: &StatusUpdate,
        rolled_back: &[StatusUpdate],
    ) -> Result<()>;

    /// Position to resume from after a restart: this task's commit row, or
    /// the last fragment stored for the highest seqno.
    fn last_applied_event(&self) -> Result<Option<EventHeader>> {
        if let Some(header) = self
            .last_commit_position(self.task_id())?
            .and_then(|p| p.header())
        {
            return Ok(Some(header));
        }
        let Some(max) = self.max_seqno()? else {
            return Ok(None);
        };
        let fragno = self.max_fragno(max)?.unwrap_or(0);
        Ok(self.try_find_fragment(max, fragno)?.map(|e| e.header()))
    }
}

/// Per-task commit rows.
pub trait CommitPositions {
    /// Creates the row for `task_id` if missing, seeding it from task 0.
    fn prepare_task(&mut self, task_id: u32) -> Result<()>;

    fn last_commit_position(&self, task_id: u32) -> Result<Option<CommitPosition>>;

    fn update_commit_position(&mut self, position: &CommitPosition) -> Result<()>;

    fn commit_positions(&self) -> Result<Vec<CommitPosition>>;

    /// Collapses all rows into task 0's when every row agrees on the seqno.
    /// Returns whether the rows were reduced.
    fn reduce_tasks(&mut self) -> Result<bool>;
}

/// Hook into the source database's own replication, re-pointed at a native
/// event ID once task rows have been reduced.
pub trait NativeSlaveSync: Send + Sync {
    fn supports_native_slave_sync(&self) -> bool {
        true
    }

    fn sync_native_slave(&self, event_id: &str) -> Result<()>;
}

#[derive(Clone, Debug)]
pub struct SqliteOptions {
    pub path: PathBuf,
    pub fragment_wait: Duration,
    pub delete_batch_size: usize,
    pub busy_timeout: Duration,
}

/// Constructor table for log stores, picked once from configuration.
#[derive(Clone)]
pub enum StorageBackend {
    Sqlite(SqliteOptions),
    Memory(Arc<MemoryLog>),
}

impl StorageBackend {
    pub fn from_config(config: &ThlConfig) -> Self {
        match config.storage {
            StorageKind::Sqlite => StorageBackend::Sqlite(SqliteOptions {
                path: config.db_path.clone(),
                fragment_wait: config.fragment_wait,
                delete_batch_size: config.delete_batch_size,
                busy_timeout: config.busy_timeout,
            }),
            StorageKind::Memory => StorageBackend::Memory(Arc::new(MemoryLog::with_settings(
                config.fragment_wait,
                config.delete_batch_size,
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StorageBackend::Sqlite(_) => "sqlite",
            StorageBackend::Memory(_) => "memory",
        }
    }

    /// Opens a handle owned by `task_id`, preparing its commit row.
    pub fn open(
        &self,
        task_id: u32,
        native_sync: Option<Arc<dyn NativeSlaveSync>>,
    ) -> Result<Box<dyn LogStore>> {
        match self {
            StorageBackend::Sqlite(options) => Ok(Box::new(sqlite::SqliteLogStore::open(
                options,
                task_id,
                native_sync,
            )?)),
            StorageBackend::Memory(log) => Ok(Box::new(memory::MemoryLogStore::open(
                log.clone(),
                task_id,
                native_sync,
            )?)),
        }
    }
}

/// Rejects status changes the lifecycle does not allow. Re-applying the
/// current status is accepted as a no-op.
pub(crate) fn check_transition(
    seqno: u64,
    fragno: u16,
    from: EventStatus,
    to: EventStatus,
) -> Result<()> {
    if from == to || from.can_transition_to(to) {
        Ok(())
    } else {
        Err(thl::error::StorageError::InvalidTransition {
            seqno,
            fragno,
            from,
            to,
        }
        .into())
    }
}

pub(crate) fn rollback_comment(failed_seqno: u64) -> String {
    format!(
        "Event was rolled back due to failure while processing event#{}",
        failed_seqno
    )
}
