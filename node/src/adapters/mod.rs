// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Pipeline roles over the log.
//!
//! A replication pipeline moves events from an [`Extractor`] to an
//! [`Applier`]. The adapters here let the log sit at either end: read from
//! the local log, from a partitioned parallel queue, or from a remote
//! server, and store into the local log.

pub mod parallel_extractor;
pub mod remote;
pub mod store_adapter;

use async_trait::async_trait;

use thl::error::Result;
use thl::event::{EventHeader, LogEvent};

use crate::parallel::ParallelEvent;

pub use parallel_extractor::ParallelQueueExtractor;
pub use remote::RemoteThlExtractor;
pub use store_adapter::{ThlStoreAdapter, ThlStoreApplier};

#[async_trait]
pub trait Extractor: Send {
    /// Resume after `header`; `None` restarts from the default position.
    async fn set_last_event(&mut self, header: Option<EventHeader>) -> Result<()>;

    /// Waits for and returns the next event.
    async fn extract(&mut self) -> Result<ParallelEvent>;
}

#[async_trait]
pub trait Applier: Send {
    /// Stores `event`. With `commit` the transaction is committed, and with
    /// `sync` the commit position is recorded as well.
    async fn apply(&mut self, event: &LogEvent, commit: bool, sync: bool) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;

    /// Header of the last event this applier made durable.
    async fn last_event(&mut self) -> Result<Option<EventHeader>>;
}
