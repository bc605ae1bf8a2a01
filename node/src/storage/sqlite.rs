// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! SQLite log store.
//!
//! # Tables
//! ```text
//! history            (seqno, fragno) PRIMARY KEY, header columns, crc64, event BLOB
//! trep_commit_seqno  task_id PRIMARY KEY, last committed header per task
//! ```
//! Each handle owns one connection. The database runs in WAL mode so
//! readers (server handlers, parallel readers) never block the writer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};

use thl::error::{Result, StorageError, ThlError};
use thl::event::{now_millis, EventStatus, EventType, FilteredRange, LogEvent, StatusUpdate};
use thl::position::{applied_latency_secs, seqno_from_sql, CommitPosition};

use super::commit_table::{self, finish_reduction, plan_reduction, Reduction};
use super::{
    check_transition, rollback_comment, CommitPositions, LogStore, NativeSlaveSync, SqliteOptions,
};
use crate::errors::SqlResultExt;

const FRAGMENT_POLL: Duration = Duration::from_millis(10);

pub fn tstamp_to_millis(tstamp: DateTime<Utc>) -> i64 {
    tstamp.timestamp_millis()
}

pub fn millis_to_tstamp(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

fn payload_crc(payload: &[u8]) -> i64 {
    let mut digest = crc64fast::Digest::new();
    digest.write(payload);
    digest.sum64() as i64
}

pub fn create_history_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS history (
            seqno                INTEGER NOT NULL,
            fragno               INTEGER NOT NULL,
            last_frag            INTEGER NOT NULL,
            source_id            TEXT NOT NULL,
            type                 INTEGER NOT NULL,
            epoch_number         INTEGER NOT NULL,
            source_tstamp        INTEGER NOT NULL,
            local_enqueue_tstamp INTEGER,
            processed_tstamp     INTEGER,
            status               INTEGER NOT NULL,
            comments             TEXT,
            eventid              TEXT,
            shard_id             TEXT NOT NULL,
            seqno_end            INTEGER,
            fragno_end           INTEGER,
            crc                  INTEGER NOT NULL,
            event                BLOB NOT NULL,
            PRIMARY KEY (seqno, fragno)
        );
        CREATE INDEX IF NOT EXISTS history_eventid ON history (eventid);",
    )
    .sql_context("create history table")
}

const EVENT_COLUMNS: &str = "seqno, fragno, last_frag, source_id, type, epoch_number, source_tstamp, \
     local_enqueue_tstamp, processed_tstamp, status, comments, eventid, shard_id, seqno_end, \
     fragno_end, crc, event";

/// Raw row; decoded in a second step so checksum and code errors can name
/// the offending key.
struct HistoryRow {
    seqno: i64,
    fragno: i64,
    last_frag: bool,
    source_id: String,
    event_type: u8,
    epoch_number: i64,
    source_tstamp: i64,
    local_enqueue_tstamp: Option<i64>,
    processed_tstamp: Option<i64>,
    status: u8,
    comment: Option<String>,
    event_id: Option<String>,
    shard_id: String,
    seqno_end: Option<i64>,
    fragno_end: Option<i64>,
    crc: i64,
    payload: Vec<u8>,
}

impl HistoryRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seqno: row.get(0)?,
            fragno: row.get(1)?,
            last_frag: row.get(2)?,
            source_id: row.get(3)?,
            event_type: row.get(4)?,
            epoch_number: row.get(5)?,
            source_tstamp: row.get(6)?,
            local_enqueue_tstamp: row.get(7)?,
            processed_tstamp: row.get(8)?,
            status: row.get(9)?,
            comment: row.get(10)?,
            event_id: row.get(11)?,
            shard_id: row.get(12)?,
            seqno_end: row.get(13)?,
            fragno_end: row.get(14)?,
            crc: row.get(15)?,
            payload: row.get(16)?,
        })
    }

    fn into_event(self) -> Result<LogEvent> {
        let seqno = self.seqno as u64;
        let fragno = self.fragno as u16;
        let corrupt = |reason: String| -> ThlError {
            StorageError::Corrupt {
                seqno,
                fragno,
                reason,
            }
            .into()
        };
        let found = payload_crc(&self.payload);
        if found != self.crc {
            return Err(corrupt(format!(
                "payload checksum mismatch: expected {:#018x}, found {:#018x}",
                self.crc, found
            )));
        }
        let event_type = EventType::from_code(self.event_type)
            .ok_or_else(|| corrupt(format!("unknown event type {}", self.event_type)))?;
        let status = EventStatus::from_code(self.status)
            .ok_or_else(|| corrupt(format!("unknown status {}", self.status)))?;
        let filtered = self.seqno_end.map(|end| FilteredRange {
            seqno_end: end as u64,
            fragno_end: self.fragno_end.unwrap_or(self.fragno) as u16,
        });
        Ok(LogEvent {
            seqno,
            fragno,
            last_frag: self.last_frag,
            source_id: self.source_id,
            event_type,
            epoch_number: self.epoch_number as u64,
            source_tstamp: millis_to_tstamp(self.source_tstamp),
            local_enqueue_tstamp: self.local_enqueue_tstamp.map(millis_to_tstamp),
            processed_tstamp: self.processed_tstamp.map(millis_to_tstamp),
            status,
            event_id: self.event_id.unwrap_or_default(),
            comment: self.comment,
            shard_id: self.shard_id,
            filtered,
            payload: self.payload,
        })
    }
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _) if f.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

pub struct SqliteLogStore {
    conn: Connection,
    task_id: u32,
    in_transaction: bool,
    fragment_wait: Duration,
    delete_batch_size: usize,
    native_sync: Option<Arc<dyn NativeSlaveSync>>,
}

impl SqliteLogStore {
    pub fn open(
        options: &SqliteOptions,
        task_id: u32,
        native_sync: Option<Arc<dyn NativeSlaveSync>>,
    ) -> Result<Self> {
        let conn = Connection::open_with_flags(
            &options.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )
        .sql_context("open log database")?;
        conn.busy_timeout(options.busy_timeout)
            .sql_context("set busy timeout")?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .sql_context("enable WAL journal")?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .sql_context("set synchronous mode")?;

        create_history_table(&conn)?;
        commit_table::create_table(&conn)?;

        let mut store = Self {
            conn,
            task_id,
            in_transaction: false,
            fragment_wait: options.fragment_wait,
            delete_batch_size: options.delete_batch_size.max(1),
            native_sync,
        };
        store.prepare_task(task_id)?;
        tracing::debug!(
            "Opened SQLite log store {:?} for task {}",
            options.path,
            task_id
        );
        Ok(store)
    }

    /// Connection for collaborators that need their own statements, such as
    /// the consistency check.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn begin(&mut self) -> Result<()> {
        if !self.in_transaction {
            self.conn
                .execute_batch("BEGIN IMMEDIATE")
                .sql_context("begin log transaction")?;
            self.in_transaction = true;
        }
        Ok(())
    }

    fn write_event(&self, event: &LogEvent, sync: bool) -> Result<()> {
        let inserted = self.conn.execute(
            &format!(
                "INSERT INTO history ({EVENT_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
            ),
            params![
                event.seqno as i64,
                event.fragno as i64,
                event.last_frag,
                event.source_id,
                event.event_type.code(),
                event.epoch_number as i64,
                tstamp_to_millis(event.source_tstamp),
                event.local_enqueue_tstamp.map(tstamp_to_millis),
                event.processed_tstamp.map(tstamp_to_millis),
                event.status.code(),
                event.comment,
                event.event_id,
                event.shard_id,
                event.filtered.map(|f| f.seqno_end as i64),
                event.filtered.map(|f| f.fragno_end as i64),
                payload_crc(&event.payload),
                event.payload,
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(e) if is_constraint_violation(&e) => {
                return Err(StorageError::DuplicateEntry {
                    seqno: event.seqno,
                    fragno: event.fragno,
                }
                .into())
            }
            Err(e) => return Err(StorageError::backend("store log event", e).into()),
        }

        if sync {
            let latency = applied_latency_secs(event.source_tstamp, now_millis());
            commit_table::write(
                &self.conn,
                &CommitPosition::from_header(self.task_id, &event.header(), latency),
            )?;
        }
        Ok(())
    }

    /// Ends a transaction this handle opened after `original` failed inside
    /// it, so the write lock is not held past the error.
    fn abandon_transaction(&mut self, original: ThlError) -> ThlError {
        self.in_transaction = false;
        match self.conn.execute_batch("ROLLBACK") {
            Ok(()) => original,
            Err(rollback) => StorageError::RollbackFailed {
                original: Box::new(original),
                rollback: Box::new(rollback),
            }
            .into(),
        }
    }

    /// Runs `f` under a savepoint. On failure the savepoint is rolled back;
    /// if that fails too, both errors are reported.
    fn with_savepoint<T>(&mut self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        self.conn
            .execute_batch("SAVEPOINT thl_bulk")
            .sql_context("open savepoint")?;
        match f(&self.conn) {
            Ok(value) => {
                self.conn
                    .execute_batch("RELEASE thl_bulk")
                    .sql_context("release savepoint")?;
                Ok(value)
            }
            Err(original) => {
                match self
                    .conn
                    .execute_batch("ROLLBACK TO thl_bulk; RELEASE thl_bulk")
                {
                    Ok(()) => Err(original),
                    Err(rollback) => Err(StorageError::RollbackFailed {
                        original: Box::new(original),
                        rollback: Box::new(rollback),
                    }
                    .into()),
                }
            }
        }
    }

    fn query_event(&self, seqno: u64, fragno: u16) -> Result<Option<LogEvent>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {EVENT_COLUMNS} FROM history WHERE seqno = ?1 AND fragno = ?2"),
                params![seqno as i64, fragno as i64],
                HistoryRow::from_row,
            )
            .optional()
            .sql_context("find log event")?;
        row.map(HistoryRow::into_event).transpose()
    }

    fn query_optional_i64(&self, sql: &str, context: &str) -> Result<Option<i64>> {
        self.conn
            .query_row(sql, [], |row| row.get::<_, Option<i64>>(0))
            .sql_context(context)
    }
}

fn transaction_statuses(conn: &Connection, seqno: u64) -> Result<Vec<(u16, u8)>> {
    let mut stmt = conn
        .prepare_cached("SELECT fragno, status FROM history WHERE seqno = ?1")
        .sql_context("prepare status scan")?;
    let rows = stmt
        .query_map(params![seqno as i64], |row| {
            Ok((row.get::<_, i64>(0)? as u16, row.get::<_, u8>(1)?))
        })
        .sql_context("scan transaction status")?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .sql_context("scan transaction status")
}

/// Validates and applies a status change to every fragment of `seqno`.
fn update_transaction(
    conn: &Connection,
    seqno: u64,
    status: EventStatus,
    comment: Option<&str>,
    now: i64,
) -> Result<()> {
    for (fragno, code) in transaction_statuses(conn, seqno)? {
        let from = EventStatus::from_code(code).ok_or_else(|| StorageError::Corrupt {
            seqno,
            fragno,
            reason: format!("unknown status {}", code),
        })?;
        check_transition(seqno, fragno, from, status)?;
    }
    conn.execute(
        "UPDATE history SET status = ?1, comments = COALESCE(?2, comments), processed_tstamp = ?3
         WHERE seqno = ?4",
        params![status.code(), comment, now, seqno as i64],
    )
    .sql_context("update transaction status")?;
    Ok(())
}

impl LogStore for SqliteLogStore {
    fn task_id(&self) -> u32 {
        self.task_id
    }

    fn store(&mut self, event: &LogEvent, commit: bool, sync: bool) -> Result<()> {
        let opened = !self.in_transaction;
        self.begin()?;
        let written = match self.write_event(event, sync) {
            Ok(()) if commit => self.commit(),
            other => other,
        };
        match written {
            Err(e) if opened => Err(self.abandon_transaction(e)),
            other => other,
        }
    }

    fn commit(&mut self) -> Result<()> {
        if self.in_transaction {
            self.conn
                .execute_batch("COMMIT")
                .sql_context("commit log transaction")?;
            self.in_transaction = false;
        }
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        if self.in_transaction {
            self.in_transaction = false;
            self.conn
                .execute_batch("ROLLBACK")
                .sql_context("roll back log transaction")?;
        }
        Ok(())
    }

    fn find_fragment(&self, seqno: u64, fragno: u16) -> Result<Option<LogEvent>> {
        let deadline = Instant::now() + self.fragment_wait;
        loop {
            if let Some(event) = self.query_event(seqno, fragno)? {
                return Ok(Some(event));
            }
            if fragno == 0 || Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(FRAGMENT_POLL);
        }
    }

    fn try_find_fragment(&self, seqno: u64, fragno: u16) -> Result<Option<LogEvent>> {
        self.query_event(seqno, fragno)
    }

    fn min_seqno(&self) -> Result<Option<u64>> {
        Ok(self
            .query_optional_i64("SELECT MIN(seqno) FROM history", "query min seqno")?
            .map(|s| s as u64))
    }

    fn max_seqno(&self) -> Result<Option<u64>> {
        Ok(self
            .query_optional_i64("SELECT MAX(seqno) FROM history", "query max seqno")?
            .map(|s| s as u64))
    }

    fn max_fragno(&self, seqno: u64) -> Result<Option<u16>> {
        self.conn
            .query_row(
                "SELECT MAX(fragno) FROM history WHERE seqno = ?1",
                params![seqno as i64],
                |row| row.get::<_, Option<i64>>(0),
            )
            .map(|f| f.map(|f| f as u16))
            .sql_context("query max fragno")
    }

    fn max_completed_seqno(&self) -> Result<Option<u64>> {
        let committed = self.query_optional_i64(
            &format!(
                "SELECT MIN(seqno) FROM {} WHERE seqno >= 0",
                commit_table::TABLE_NAME
            ),
            "query committed seqno",
        )?;
        if let Some(seqno) = committed {
            return Ok(seqno_from_sql(seqno));
        }
        Ok(self
            .conn
            .query_row(
                "SELECT MAX(seqno) FROM history WHERE status IN (?1, ?2)",
                params![EventStatus::Completed.code(), EventStatus::Skipped.code()],
                |row| row.get::<_, Option<i64>>(0),
            )
            .sql_context("query completed seqno")?
            .map(|s| s as u64))
    }

    fn event_id(&self, seqno: u64) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT eventid FROM history WHERE seqno = ?1 AND fragno = 0",
                params![seqno as i64],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()
            .map(Option::flatten)
            .sql_context("query event ID")
    }

    fn max_event_id(&self, source_id: Option<&str>) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT eventid FROM history
                 WHERE eventid IS NOT NULL AND eventid <> '' AND (?1 IS NULL OR source_id = ?1)
                 ORDER BY seqno DESC, fragno DESC LIMIT 1",
                params![source_id],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .sql_context("query max event ID")
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
            .map(|age| tstamp_to_millis(now_millis() - age));
        let batch = self.delete_batch_size as u64;

        let mut deleted = 0;
        while cursor <= stop {
            let upper = cursor.saturating_add(batch - 1).min(stop);
            let (in_window, removed) = self.with_savepoint(|conn| {
                let in_window: i64 = conn
                    .query_row(
                        "SELECT COUNT(*) FROM history WHERE seqno >= ?1 AND seqno <= ?2",
                        params![cursor as i64, upper as i64],
                        |row| row.get(0),
                    )
                    .sql_context("count purge window")?;
                let removed = match cutoff {
                    Some(cutoff) => conn.execute(
                        "DELETE FROM history WHERE seqno >= ?1 AND seqno <= ?2
                         AND processed_tstamp IS NOT NULL AND processed_tstamp < ?3",
                        params![cursor as i64, upper as i64, cutoff],
                    ),
                    None => conn.execute(
                        "DELETE FROM history WHERE seqno >= ?1 AND seqno <= ?2",
                        params![cursor as i64, upper as i64],
                    ),
                }
                .sql_context("purge log rows")?;
                Ok((in_window as usize, removed))
            })?;
            deleted += removed;
            tracing::debug!("Purged {} rows in seqno window {}..={}", removed, cursor, upper);
            // Rows are processed in seqno order; survivors mean the rest are newer.
            if (cutoff.is_some() && removed < in_window) || upper == u64::MAX {
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
        self.with_savepoint(|conn| {
            let current: Option<u8> = conn
                .query_row(
                    "SELECT status FROM history WHERE seqno = ?1 AND fragno = ?2",
                    params![seqno as i64, fragno as i64],
                    |row| row.get(0),
                )
                .optional()
                .sql_context("read event status")?;
            let code = current.ok_or(StorageError::NotFound { seqno, fragno })?;
            let from = EventStatus::from_code(code).ok_or_else(|| StorageError::Corrupt {
                seqno,
                fragno,
                reason: format!("unknown status {}", code),
            })?;
            check_transition(seqno, fragno, from, status)?;
            conn.execute(
                "UPDATE history SET status = ?1, comments = COALESCE(?2, comments), processed_tstamp = ?3
                 WHERE seqno = ?4 AND fragno = ?5",
                params![
                    status.code(),
                    comment,
                    tstamp_to_millis(now_millis()),
                    seqno as i64,
                    fragno as i64
                ],
            )
            .sql_context("update event status")?;
            Ok(())
        })
    }

    fn update_success_status(
        &mut self,
        succeeded: &[StatusUpdate],
        skipped: &[StatusUpdate],
    ) -> Result<()> {
        let now = tstamp_to_millis(now_millis());
        self.with_savepoint(|conn| {
            for update in succeeded {
                update_transaction(
                    conn,
                    update.seqno,
                    EventStatus::Completed,
                    update.comment.as_deref(),
                    now,
                )?;
            }
            for update in skipped {
                let comment = update.comment.as_deref().unwrap_or("Unknown event failure");
                update_transaction(conn, update.seqno, EventStatus::Skipped, Some(comment), now)?;
            }
            Ok(())
        })
    }

    fn update_failed_status(
        &mut self,
        failed: &StatusUpdate,
        rolled_back: &[StatusUpdate],
    ) -> Result<()> {
        let now = tstamp_to_millis(now_millis());
        let rollback_text = rollback_comment(failed.seqno);
        self.with_savepoint(|conn| {
            for update in rolled_back {
                update_transaction(
                    conn,
                    update.seqno,
                    EventStatus::Failed,
                    Some(&rollback_text),
                    now,
                )?;
            }
            let comment = failed.comment.as_deref().unwrap_or("Unknown failure");
            update_transaction(conn, failed.seqno, EventStatus::Failed, Some(comment), now)
        })
    }
}

impl CommitPositions for SqliteLogStore {
    fn prepare_task(&mut self, task_id: u32) -> Result<()> {
        commit_table::prepare(&self.conn, task_id)
    }

    fn last_commit_position(&self, task_id: u32) -> Result<Option<CommitPosition>> {
        commit_table::read(&self.conn, task_id)
    }

    fn update_commit_position(&mut self, position: &CommitPosition) -> Result<()> {
        commit_table::write(&self.conn, position)
    }

    fn commit_positions(&self) -> Result<Vec<CommitPosition>> {
        commit_table::read_all(&self.conn)
    }

    fn reduce_tasks(&mut self) -> Result<bool> {
        let (reduction, reduced) = self.with_savepoint(|conn| {
            let reduction = plan_reduction(&commit_table::read_all(conn)?);
            let reduced = match reduction {
                Reduction::Reduce { .. } => commit_table::delete_secondary(conn)?,
                _ => 0,
            };
            Ok((reduction, reduced))
        })?;
        finish_reduction(&reduction, reduced, self.native_sync.as_deref())
    }
}

impl Drop for SqliteLogStore {
    fn drop(&mut self) {
        if self.in_transaction {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                tracing::warn!("Failed to roll back open log transaction on release: {}", e);
            }
        }
    }
}
