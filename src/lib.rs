// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.

//! thl: the data model, wire protocol and ordering rules of a replicated,
//! totally ordered transaction history log.
//!
//! The runtime pieces (storage backends, server, client connector and the
//! partitioned readers) live in the `thl-node` crate and build on the types
//! defined here.

pub mod config;
pub mod error;
pub mod event;
pub mod event_id;
pub mod partition;
pub mod position;
pub mod protocol;

pub use error::{Result, ThlError};
pub use event::{EventHeader, EventStatus, EventType, FilteredRange, LogEvent};
pub use position::{CommitPosition, LogPosition, SeqNoRange, StorePosition};

#[cfg(test)]
pub mod tests;
