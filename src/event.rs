// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Log records.
//!
//! A transaction is stored as one or more fragments that share a `seqno`.
//! Fragments carry increasing `fragno` values and exactly one of them is
//! flagged `last_frag`. The pair `(seqno, fragno)` is unique across the log.
//!
//! # Status lifecycle
//! ```text
//! Pending ──> InProcess ──> Completed
//!    │             └──────> Failed
//!    └──────> Skip ───────> Skipped
//! ```
//! Completed, Failed and Skipped are terminal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    Data,
    StartMaster,
    StopMaster,
    Heartbeat,
}

impl EventType {
    pub fn code(self) -> u8 {
        match self {
            EventType::Data => 0,
            EventType::StartMaster => 1,
            EventType::StopMaster => 2,
            EventType::Heartbeat => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(EventType::Data),
            1 => Some(EventType::StartMaster),
            2 => Some(EventType::StopMaster),
            3 => Some(EventType::Heartbeat),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventStatus {
    Pending,
    InProcess,
    Completed,
    Failed,
    Skip,
    Skipped,
}

impl EventStatus {
    pub fn code(self) -> u8 {
        match self {
            EventStatus::Pending => 0,
            EventStatus::InProcess => 1,
            EventStatus::Completed => 2,
            EventStatus::Failed => 3,
            EventStatus::Skip => 4,
            EventStatus::Skipped => 5,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(EventStatus::Pending),
            1 => Some(EventStatus::InProcess),
            2 => Some(EventStatus::Completed),
            3 => Some(EventStatus::Failed),
            4 => Some(EventStatus::Skip),
            5 => Some(EventStatus::Skipped),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EventStatus::Completed | EventStatus::Failed | EventStatus::Skipped
        )
    }

    /// Whether the lifecycle has an edge from `self` to `next`.
    pub fn can_transition_to(self, next: EventStatus) -> bool {
        use EventStatus::*;
        matches!(
            (self, next),
            (Pending, InProcess)
                | (InProcess, Completed)
                | (InProcess, Failed)
                | (Pending, Skip)
                | (Skip, Skipped)
        )
    }
}

/// Marks an aggregated event standing in for `seqno..=seqno_end`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilteredRange {
    pub seqno_end: u64,
    pub fragno_end: u16,
}

/// Positional metadata of a record, without its payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHeader {
    pub seqno: u64,
    pub fragno: u16,
    pub last_frag: bool,
    pub source_id: String,
    pub epoch_number: u64,
    pub event_id: String,
    pub shard_id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub extract_tstamp: DateTime<Utc>,
    pub filtered: Option<FilteredRange>,
}

impl EventHeader {
    /// Last seqno covered by this record.
    pub fn end_seqno(&self) -> u64 {
        self.filtered.map_or(self.seqno, |f| f.seqno_end)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub seqno: u64,
    pub fragno: u16,
    pub last_frag: bool,
    pub source_id: String,
    pub event_type: EventType,
    pub epoch_number: u64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub source_tstamp: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub local_enqueue_tstamp: Option<DateTime<Utc>>,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub processed_tstamp: Option<DateTime<Utc>>,
    pub status: EventStatus,
    pub event_id: String,
    pub comment: Option<String>,
    pub shard_id: String,
    pub filtered: Option<FilteredRange>,
    pub payload: Vec<u8>,
}

impl LogEvent {
    /// A pending data fragment stamped with the current time.
    pub fn new(
        seqno: u64,
        fragno: u16,
        last_frag: bool,
        source_id: impl Into<String>,
        epoch_number: u64,
        event_id: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        let now = now_millis();
        Self {
            seqno,
            fragno,
            last_frag,
            source_id: source_id.into(),
            event_type: EventType::Data,
            epoch_number,
            source_tstamp: now,
            local_enqueue_tstamp: Some(now),
            processed_tstamp: None,
            status: EventStatus::Pending,
            event_id: event_id.into(),
            comment: None,
            shard_id: String::new(),
            filtered: None,
            payload,
        }
    }

    pub fn with_type(mut self, event_type: EventType) -> Self {
        self.event_type = event_type;
        self
    }

    pub fn with_status(mut self, status: EventStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_shard(mut self, shard_id: impl Into<String>) -> Self {
        self.shard_id = shard_id.into();
        self
    }

    pub fn with_filtered(mut self, range: FilteredRange) -> Self {
        self.filtered = Some(range);
        self
    }

    pub fn with_processed_tstamp(mut self, tstamp: DateTime<Utc>) -> Self {
        self.processed_tstamp = Some(truncate_millis(tstamp));
        self
    }

    pub fn header(&self) -> EventHeader {
        EventHeader {
            seqno: self.seqno,
            fragno: self.fragno,
            last_frag: self.last_frag,
            source_id: self.source_id.clone(),
            epoch_number: self.epoch_number,
            event_id: self.event_id.clone(),
            shard_id: self.shard_id.clone(),
            extract_tstamp: self.source_tstamp,
            filtered: self.filtered,
        }
    }

    pub fn end_seqno(&self) -> u64 {
        self.filtered.map_or(self.seqno, |f| f.seqno_end)
    }

    pub fn end_fragno(&self) -> u16 {
        self.filtered.map_or(self.fragno, |f| f.fragno_end)
    }

    /// Number of transactions this record completes. Non-final fragments
    /// complete none; a filtered record completes its whole range, and an
    /// inverted range counts as the record alone.
    pub fn transaction_weight(&self) -> u64 {
        if self.last_frag {
            1 + self.end_seqno().saturating_sub(self.seqno)
        } else {
            0
        }
    }

    /// Fragments that fit in the cache: complete single-fragment transactions.
    pub fn is_unfragmented(&self) -> bool {
        self.fragno == 0 && self.last_frag
    }
}

/// Status change for every fragment of one transaction, used by the bulk
/// status operations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusUpdate {
    pub seqno: u64,
    pub comment: Option<String>,
}

impl StatusUpdate {
    pub fn new(seqno: u64) -> Self {
        Self {
            seqno,
            comment: None,
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

/// Timestamps travel and persist at millisecond precision.
pub fn truncate_millis(tstamp: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(tstamp.timestamp_millis()).unwrap_or(tstamp)
}

pub fn now_millis() -> DateTime<Utc> {
    truncate_millis(Utc::now())
}
