// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Positions in the log: advertised ranges, client resume points and
//! per-task commit rows.
//!
//! The relational tables keep `-1` for "no seqno yet"; in Rust that sentinel
//! is `None`, and [`SEQNO_NONE`] is only used at the SQL boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::EventHeader;

/// Column value standing for "no seqno".
pub const SEQNO_NONE: i64 = -1;

pub fn seqno_to_sql(seqno: Option<u64>) -> i64 {
    seqno.map_or(SEQNO_NONE, |s| s as i64)
}

pub fn seqno_from_sql(value: i64) -> Option<u64> {
    if value < 0 {
        None
    } else {
        Some(value as u64)
    }
}

/// Sequence numbers currently available in a log, `[min, max]`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeqNoRange {
    pub min_seqno: Option<u64>,
    pub max_seqno: Option<u64>,
}

impl SeqNoRange {
    pub const EMPTY: SeqNoRange = SeqNoRange {
        min_seqno: None,
        max_seqno: None,
    };

    pub fn new(min_seqno: u64, max_seqno: u64) -> Self {
        Self {
            min_seqno: Some(min_seqno),
            max_seqno: Some(max_seqno),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.max_seqno.is_none()
    }

    pub fn contains(&self, seqno: u64) -> bool {
        match (self.min_seqno, self.max_seqno) {
            (Some(min), Some(max)) => min <= seqno && seqno <= max,
            _ => false,
        }
    }
}

/// Last (epoch, seqno) a client holds, sent during the handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPosition {
    pub epoch_number: u64,
    pub seqno: u64,
}

/// Key of a stored fragment; ordered by seqno, then fragno.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StorePosition {
    pub seqno: u64,
    pub fragno: u16,
}

impl StorePosition {
    pub fn new(seqno: u64, fragno: u16) -> Self {
        Self { seqno, fragno }
    }
}

/// One row of the commit-position table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitPosition {
    pub task_id: u32,
    pub seqno: Option<u64>,
    pub fragno: u16,
    pub last_frag: bool,
    pub source_id: Option<String>,
    pub epoch_number: u64,
    pub event_id: Option<String>,
    pub shard_id: Option<String>,
    /// Seconds between the source timestamp and the commit, always positive.
    pub applied_latency: u64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub update_tstamp: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub extract_tstamp: Option<DateTime<Utc>>,
}

impl CommitPosition {
    /// Row written the first time a task is seen and task 0 has nothing to copy.
    pub fn initial(task_id: u32) -> Self {
        Self {
            task_id,
            seqno: None,
            fragno: 0,
            last_frag: false,
            source_id: None,
            epoch_number: 0,
            event_id: None,
            shard_id: None,
            applied_latency: 0,
            update_tstamp: crate::event::now_millis(),
            extract_tstamp: None,
        }
    }

    pub fn from_header(task_id: u32, header: &EventHeader, applied_latency: u64) -> Self {
        Self {
            task_id,
            seqno: Some(header.seqno),
            fragno: header.fragno,
            last_frag: header.last_frag,
            source_id: Some(header.source_id.clone()),
            epoch_number: header.epoch_number,
            event_id: Some(header.event_id.clone()),
            shard_id: Some(header.shard_id.clone()),
            applied_latency,
            update_tstamp: crate::event::now_millis(),
            extract_tstamp: Some(header.extract_tstamp),
        }
    }

    /// Same position, owned by another task.
    pub fn copy_for(&self, task_id: u32) -> Self {
        Self {
            task_id,
            update_tstamp: crate::event::now_millis(),
            ..self.clone()
        }
    }

    /// Header of the committed record, if the task has committed anything.
    pub fn header(&self) -> Option<EventHeader> {
        let seqno = self.seqno?;
        Some(EventHeader {
            seqno,
            fragno: self.fragno,
            last_frag: self.last_frag,
            source_id: self.source_id.clone().unwrap_or_default(),
            epoch_number: self.epoch_number,
            event_id: self.event_id.clone().unwrap_or_default(),
            shard_id: self.shard_id.clone().unwrap_or_default(),
            extract_tstamp: self.extract_tstamp.unwrap_or(self.update_tstamp),
            filtered: None,
        })
    }
}

/// Absolute latency in whole seconds between `source` and `now`.
pub fn applied_latency_secs(source: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    (now - source).num_seconds().unsigned_abs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_sql_sentinel() {
        assert_eq!(seqno_to_sql(None), -1);
        assert_eq!(seqno_from_sql(-1), None);
        assert_eq!(seqno_from_sql(seqno_to_sql(Some(42))), Some(42));
    }

    #[test]
    fn test_range_contains() {
        assert!(!SeqNoRange::EMPTY.contains(0));
        let range = SeqNoRange::new(3, 7);
        assert!(range.contains(3) && range.contains(7));
        assert!(!range.contains(8));
    }

    #[test]
    fn test_latency_is_absolute() {
        let now = Utc::now();
        assert_eq!(applied_latency_secs(now - Duration::seconds(4), now), 4);
        assert_eq!(applied_latency_secs(now + Duration::seconds(4), now), 4);
    }
}
