// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Row-range consistency checks between a master and its replicas.
//!
//! The master checksums a slice of a table (blake3 over the rows in rowid
//! order) and records the checksum and row count in the `consistency`
//! table. That row travels through the log like any other change; each
//! replica recomputes the same slice, stores its own values beside the
//! master's and reports whether they agree.
//!
//! # Table
//! ```text
//! consistency (db, tbl, id) PRIMARY KEY,
//!             row_offset, row_limit,          -1 when unset
//!             this_crc, this_cnt, master_crc, master_cnt, ts, method
//! ```

use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use thl::error::{ConsistencyError, Result};
use thl::event::now_millis;

use crate::storage::sqlite::tstamp_to_millis;

pub const TABLE_NAME: &str = "consistency";
pub const METHOD: &str = "blake3";

/// Column value standing for an unset offset or limit.
const ROW_UNSET: i64 = -1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsistencyCheck {
    pub id: i64,
    pub schema: String,
    pub table: String,
    pub row_offset: Option<u64>,
    pub row_limit: Option<u64>,
}

impl ConsistencyCheck {
    /// Checks the whole table.
    pub fn new(id: i64, schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            id,
            schema: schema.into(),
            table: table.into(),
            row_offset: None,
            row_limit: None,
        }
    }

    pub fn with_range(mut self, row_offset: u64, row_limit: u64) -> Self {
        self.row_offset = Some(row_offset);
        self.row_limit = Some(row_limit);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub this_crc: String,
    pub this_cnt: i64,
    pub master_crc: String,
    pub master_cnt: i64,
}

impl CheckResult {
    pub fn is_consistent(&self) -> bool {
        self.this_crc == self.master_crc && self.this_cnt == self.master_cnt
    }
}

fn sql<T>(statement: &str, result: rusqlite::Result<T>) -> Result<T> {
    result.map_err(|e| {
        ConsistencyError {
            statement: statement.to_string(),
            source: Box::new(e),
        }
        .into()
    })
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn create_table(conn: &Connection) -> Result<()> {
    let statement = format!(
        "CREATE TABLE IF NOT EXISTS {TABLE_NAME} (
            db          TEXT NOT NULL,
            tbl         TEXT NOT NULL,
            id          INTEGER NOT NULL,
            row_offset  INTEGER NOT NULL DEFAULT {ROW_UNSET},
            row_limit   INTEGER NOT NULL DEFAULT {ROW_UNSET},
            this_crc    TEXT,
            this_cnt    INTEGER,
            master_crc  TEXT,
            master_cnt  INTEGER,
            ts          INTEGER,
            method      TEXT,
            PRIMARY KEY (db, tbl, id)
        )"
    );
    sql(&statement, conn.execute_batch(&statement))
}

fn hash_value(hasher: &mut blake3::Hasher, value: ValueRef<'_>) {
    match value {
        ValueRef::Null => {
            hasher.update(&[0]);
        }
        ValueRef::Integer(i) => {
            hasher.update(&[1]);
            hasher.update(&i.to_le_bytes());
        }
        ValueRef::Real(f) => {
            hasher.update(&[2]);
            hasher.update(&f.to_le_bytes());
        }
        ValueRef::Text(t) => {
            hasher.update(&[3]);
            hasher.update(&(t.len() as u64).to_le_bytes());
            hasher.update(t);
        }
        ValueRef::Blob(b) => {
            hasher.update(&[4]);
            hasher.update(&(b.len() as u64).to_le_bytes());
            hasher.update(b);
        }
    }
}

/// Checksum and row count of the slice selected by `check`.
pub fn compute(conn: &Connection, check: &ConsistencyCheck) -> Result<(String, i64)> {
    let statement = format!(
        "SELECT * FROM {}.{} ORDER BY rowid LIMIT ?1 OFFSET ?2",
        quote_ident(&check.schema),
        quote_ident(&check.table)
    );
    let limit = check.row_limit.map_or(-1, |l| l as i64);
    let offset = check.row_offset.map_or(0, |o| o as i64);

    let mut stmt = sql(&statement, conn.prepare(&statement))?;
    let columns = stmt.column_count();
    let mut rows = sql(&statement, stmt.query(params![limit, offset]))?;
    let mut hasher = blake3::Hasher::new();
    let mut count = 0i64;
    while let Some(row) = sql(&statement, rows.next())? {
        for idx in 0..columns {
            hash_value(&mut hasher, sql(&statement, row.get_ref(idx))?);
        }
        count += 1;
    }
    Ok((hasher.finalize().to_hex().to_string(), count))
}

/// Runs `body` inside its own transaction. A final ROLLBACK is always
/// issued so row locks are released even after a successful COMMIT; its
/// error is ignored.
fn in_transaction<T>(conn: &Connection, body: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
    let outcome = sql("BEGIN", conn.execute_batch("BEGIN")).and_then(|()| {
        let value = body(conn)?;
        sql("COMMIT", conn.execute_batch("COMMIT"))?;
        Ok(value)
    });
    let _ = conn.execute_batch("ROLLBACK");
    outcome
}

fn insert_check(conn: &Connection, check: &ConsistencyCheck) -> Result<()> {
    let statement = format!(
        "INSERT OR REPLACE INTO {TABLE_NAME} (db, tbl, id, row_offset, row_limit, ts, method)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
    );
    sql(
        &statement,
        conn.execute(
            &statement,
            params![
                check.schema,
                check.table,
                check.id,
                check.row_offset.map_or(ROW_UNSET, |o| o as i64),
                check.row_limit.map_or(ROW_UNSET, |l| l as i64),
                tstamp_to_millis(now_millis()),
                METHOD
            ],
        ),
    )?;
    Ok(())
}

/// Master side: records the checksum of the slice as the reference values.
pub fn run_master(conn: &Connection, check: &ConsistencyCheck) -> Result<CheckResult> {
    in_transaction(conn, |conn| {
        insert_check(conn, check)?;
        let (crc, cnt) = compute(conn, check)?;
        let statement = format!(
            "UPDATE {TABLE_NAME} SET this_crc = ?1, this_cnt = ?2, master_crc = ?1, master_cnt = ?2
             WHERE db = ?3 AND tbl = ?4 AND id = ?5"
        );
        sql(
            &statement,
            conn.execute(&statement, params![crc, cnt, check.schema, check.table, check.id]),
        )?;
        tracing::info!(
            "Consistency check {} on {}.{}: {} rows, crc {}",
            check.id,
            check.schema,
            check.table,
            cnt,
            crc
        );
        Ok(CheckResult {
            this_crc: crc.clone(),
            this_cnt: cnt,
            master_crc: crc,
            master_cnt: cnt,
        })
    })
}

/// Replica side: recomputes the slice and compares with the master values
/// carried by the replicated check row.
pub fn run_replica(
    conn: &Connection,
    check: &ConsistencyCheck,
    master_crc: &str,
    master_cnt: i64,
) -> Result<CheckResult> {
    let result = in_transaction(conn, |conn| {
        insert_check(conn, check)?;
        let (crc, cnt) = compute(conn, check)?;
        let statement = format!(
            "UPDATE {TABLE_NAME} SET this_crc = ?1, this_cnt = ?2, master_crc = ?3, master_cnt = ?4
             WHERE db = ?5 AND tbl = ?6 AND id = ?7"
        );
        sql(
            &statement,
            conn.execute(
                &statement,
                params![crc, cnt, master_crc, master_cnt, check.schema, check.table, check.id],
            ),
        )?;
        Ok(CheckResult {
            this_crc: crc,
            this_cnt: cnt,
            master_crc: master_crc.to_string(),
            master_cnt,
        })
    })?;
    if !result.is_consistent() {
        tracing::warn!(
            "Consistency check {} failed on {}.{}: this={}/{} master={}/{}",
            check.id,
            check.schema,
            check.table,
            result.this_cnt,
            result.this_crc,
            result.master_cnt,
            result.master_crc
        );
    }
    Ok(result)
}

/// Stored result of a check, if it ran here.
pub fn read_result(conn: &Connection, schema: &str, table: &str, id: i64) -> Result<Option<CheckResult>> {
    let statement = format!(
        "SELECT this_crc, this_cnt, master_crc, master_cnt FROM {TABLE_NAME}
         WHERE db = ?1 AND tbl = ?2 AND id = ?3"
    );
    let row = sql(
        &statement,
        conn.query_row(&statement, params![schema, table, id], |row| {
            Ok((
                row.get::<_, Option<String>>(0)?,
                row.get::<_, Option<i64>>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<i64>>(3)?,
            ))
        })
        .optional(),
    )?;
    Ok(row.map(|(this_crc, this_cnt, master_crc, master_cnt)| CheckResult {
        this_crc: this_crc.unwrap_or_default(),
        this_cnt: this_cnt.unwrap_or_default(),
        master_crc: master_crc.unwrap_or_default(),
        master_cnt: master_cnt.unwrap_or_default(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use thl::ThlError;

    fn database(rows: &[(i64, &str)]) -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        create_table(&conn).unwrap();
        conn.execute_batch("CREATE TABLE orders (id INTEGER PRIMARY KEY, item TEXT)")
            .unwrap();
        for (id, item) in rows {
            conn.execute("INSERT INTO orders VALUES (?1, ?2)", params![id, item])
                .unwrap();
        }
        conn
    }

    #[test]
    fn test_matching_replica() {
        let master = database(&[(1, "apple"), (2, "pear"), (3, "plum")]);
        let replica = database(&[(1, "apple"), (2, "pear"), (3, "plum")]);
        let check = ConsistencyCheck::new(7, "main", "orders");

        let reference = run_master(&master, &check).unwrap();
        assert_eq!(reference.master_cnt, 3);
        let result =
            run_replica(&replica, &check, &reference.master_crc, reference.master_cnt).unwrap();
        assert!(result.is_consistent());
        assert_eq!(read_result(&replica, "main", "orders", 7).unwrap(), Some(result));
    }

    #[test]
    fn test_diverged_replica() {
        let master = database(&[(1, "apple"), (2, "pear")]);
        let replica = database(&[(1, "apple"), (2, "peach")]);
        let check = ConsistencyCheck::new(1, "main", "orders");

        let reference = run_master(&master, &check).unwrap();
        let result =
            run_replica(&replica, &check, &reference.master_crc, reference.master_cnt).unwrap();
        assert!(!result.is_consistent());
        assert_eq!(result.this_cnt, result.master_cnt);
    }

    #[test]
    fn test_row_range() {
        let master = database(&[(1, "a"), (2, "b"), (3, "c"), (4, "d")]);
        let check = ConsistencyCheck::new(2, "main", "orders").with_range(1, 2);
        let (_, count) = compute(&master, &check).unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_failure_names_statement_and_releases_transaction() {
        let conn = database(&[]);
        let check = ConsistencyCheck::new(1, "main", "missing");
        let err = run_master(&conn, &check).unwrap_err();
        match err {
            ThlError::Consistency(e) => assert!(e.statement.contains("\"missing\"")),
            other => panic!("unexpected error: {other}"),
        }
        assert!(conn.is_autocommit());
    }
}
