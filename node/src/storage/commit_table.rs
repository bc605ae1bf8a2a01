// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Commit-position bookkeeping.
//!
//! One row per consuming task, keyed by `task_id`. Each task only writes its
//! own row, so concurrent tasks never contend on the same key. The reduction
//! rule lives here so both backends apply it identically.

use rusqlite::{params, Connection, OptionalExtension, Row};

use thl::error::Result;
use thl::position::{seqno_from_sql, seqno_to_sql, CommitPosition};

use crate::errors::SqlResultExt;
use crate::storage::sqlite::{millis_to_tstamp, tstamp_to_millis};
use crate::storage::NativeSlaveSync;

pub const TABLE_NAME: &str = "trep_commit_seqno";

/// Outcome of inspecting the rows before a reduction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reduction {
    /// Rows may collapse to task 0. Carries task 0's native event ID.
    Reduce { last_event_id: Option<String> },
    NoPrimaryTask,
    SeqnoMismatch,
}

/// Reduction is all or nothing: task 0 must exist and every row must sit on
/// the same seqno.
pub fn plan_reduction(rows: &[CommitPosition]) -> Reduction {
    let Some(primary) = rows.iter().find(|r| r.task_id == 0) else {
        return Reduction::NoPrimaryTask;
    };
    if rows.iter().any(|r| r.seqno != primary.seqno) {
        return Reduction::SeqnoMismatch;
    }
    Reduction::Reduce {
        last_event_id: primary.event_id.clone(),
    }
}

/// Logs the refusal, or re-points native replication after a reduction.
pub(crate) fn finish_reduction(
    reduction: &Reduction,
    reduced_rows: usize,
    native_sync: Option<&dyn NativeSlaveSync>,
) -> Result<bool> {
    match reduction {
        Reduction::NoPrimaryTask => {
            tracing::warn!("No task 0 present; cannot reduce task entries: {}", TABLE_NAME);
            Ok(false)
        }
        Reduction::SeqnoMismatch => {
            tracing::warn!(
                "Sequence numbers do not match; cannot reduce task entries: {}",
                TABLE_NAME
            );
            Ok(false)
        }
        Reduction::Reduce { last_event_id } => {
            tracing::info!("Reduced {} task entries: {}", reduced_rows, TABLE_NAME);
            if let (Some(sync), Some(event_id)) = (native_sync, last_event_id) {
                if sync.supports_native_slave_sync() {
                    tracing::info!(
                        "Synchronizing native slave replication to current event ID: {}",
                        event_id
                    );
                    sync.sync_native_slave(event_id)?;
                } else {
                    tracing::warn!("Native slave synchronization requested but not supported");
                }
            }
            Ok(true)
        }
    }
}

pub fn create_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {TABLE_NAME} (
            task_id           INTEGER PRIMARY KEY,
            seqno             INTEGER NOT NULL DEFAULT -1,
            fragno            INTEGER NOT NULL DEFAULT 0,
            last_frag         INTEGER NOT NULL DEFAULT 0,
            source_id         TEXT,
            epoch_number      INTEGER NOT NULL DEFAULT 0,
            eventid           TEXT,
            applied_latency   INTEGER NOT NULL DEFAULT 0,
            update_timestamp  INTEGER NOT NULL,
            shard_id          TEXT,
            extract_timestamp INTEGER
        );"
    ))
    .sql_context("create commit position table")
}

const SELECT_COLUMNS: &str = "task_id, seqno, fragno, last_frag, source_id, epoch_number, eventid, \
                              applied_latency, update_timestamp, shard_id, extract_timestamp";

fn position_from_row(row: &Row<'_>) -> rusqlite::Result<CommitPosition> {
    Ok(CommitPosition {
        task_id: row.get::<_, i64>(0)? as u32,
        seqno: seqno_from_sql(row.get(1)?),
        fragno: row.get::<_, i64>(2)? as u16,
        last_frag: row.get(3)?,
        source_id: row.get(4)?,
        epoch_number: row.get::<_, i64>(5)? as u64,
        event_id: row.get(6)?,
        applied_latency: row.get::<_, i64>(7)? as u64,
        update_tstamp: millis_to_tstamp(row.get(8)?),
        shard_id: row.get(9)?,
        extract_tstamp: row.get::<_, Option<i64>>(10)?.map(millis_to_tstamp),
    })
}

pub fn read(conn: &Connection, task_id: u32) -> Result<Option<CommitPosition>> {
    conn.query_row(
        &format!("SELECT {SELECT_COLUMNS} FROM {TABLE_NAME} WHERE task_id = ?1"),
        params![task_id as i64],
        position_from_row,
    )
    .optional()
    .sql_context("read commit position")
}

pub fn read_all(conn: &Connection) -> Result<Vec<CommitPosition>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM {TABLE_NAME} ORDER BY task_id"
        ))
        .sql_context("prepare commit position scan")?;
    let rows = stmt
        .query_map([], position_from_row)
        .sql_context("scan commit positions")?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .sql_context("scan commit positions")
}

/// Inserts or replaces the row owned by `position.task_id`.
pub fn write(conn: &Connection, position: &CommitPosition) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO {TABLE_NAME} ({SELECT_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
        ),
        params![
            position.task_id as i64,
            seqno_to_sql(position.seqno),
            position.fragno as i64,
            position.last_frag,
            position.source_id,
            position.epoch_number as i64,
            position.event_id,
            position.applied_latency as i64,
            tstamp_to_millis(position.update_tstamp),
            position.shard_id,
            position.extract_tstamp.map(tstamp_to_millis),
        ],
    )
    .sql_context("update commit position")?;
    Ok(())
}

/// Creates the row for `task_id` if it does not exist yet. A new task starts
/// where task 0 left off.
pub fn prepare(conn: &Connection, task_id: u32) -> Result<()> {
    if read(conn, task_id)?.is_some() {
        return Ok(());
    }
    write(conn, &CommitPosition::initial(task_id))?;
    match read(conn, 0)? {
        Some(primary) if task_id != 0 && primary.seqno.is_some() => {
            tracing::info!("Propagating commit position from task 0 to task {}", task_id);
            write(conn, &primary.copy_for(task_id))
        }
        _ => {
            tracing::info!("Initializing commit position defaults for task {}", task_id);
            Ok(())
        }
    }
}

pub fn delete_secondary(conn: &Connection) -> Result<usize> {
    conn.execute(&format!("DELETE FROM {TABLE_NAME} WHERE task_id > 0"), [])
        .sql_context("reduce commit positions")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(task_id: u32, seqno: Option<u64>) -> CommitPosition {
        CommitPosition {
            seqno,
            event_id: Some(format!("mysql-bin.000001:{}", task_id)),
            ..CommitPosition::initial(task_id)
        }
    }

    #[test]
    fn test_plan_requires_primary() {
        let rows = vec![row(1, Some(5)), row(2, Some(5))];
        assert_eq!(plan_reduction(&rows), Reduction::NoPrimaryTask);
    }

    #[test]
    fn test_plan_requires_common_seqno() {
        let rows = vec![row(0, Some(100)), row(1, Some(99))];
        assert_eq!(plan_reduction(&rows), Reduction::SeqnoMismatch);
    }

    #[test]
    fn test_plan_carries_primary_event_id() {
        let rows = vec![row(0, Some(100)), row(1, Some(100)), row(2, Some(100))];
        assert_eq!(
            plan_reduction(&rows),
            Reduction::Reduce {
                last_event_id: Some("mysql-bin.000001:0".into())
            }
        );
    }

    #[test]
    fn test_prepare_copies_primary_position() {
        let conn = Connection::open_in_memory().unwrap();
        create_table(&conn).unwrap();
        prepare(&conn, 0).unwrap();
        write(&conn, &row(0, Some(42))).unwrap();

        prepare(&conn, 3).unwrap();
        let copied = read(&conn, 3).unwrap().unwrap();
        assert_eq!(copied.seqno, Some(42));
        assert_eq!(copied.task_id, 3);

        // Existing rows are left alone.
        write(&conn, &row(3, Some(50))).unwrap();
        prepare(&conn, 3).unwrap();
        assert_eq!(read(&conn, 3).unwrap().unwrap().seqno, Some(50));
    }
}
