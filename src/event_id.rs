// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Native event IDs: the source database's own log coordinate carried by each
//! record. Parsing is a pure function of the string; the format is picked
//! from an explicit `mysql:` / `postgresql:` prefix or, failing that, from
//! the shape of the value.

use std::cmp::Ordering;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NativeEventId {
    /// `prefix.NNNNNN:OFFSET[;SESSION]`
    MySql {
        file_name: String,
        file_index: i64,
        offset: i64,
        session_id: Option<i64>,
    },
    /// PostgreSQL log sequence number `HI/LO` in hex.
    PgLsn(u64),
    /// Anything else; ordered lexicographically.
    Opaque(String),
}

const MYSQL_PREFIX: &str = "mysql:";
const POSTGRES_PREFIX: &str = "postgresql:";

/// Picks the parser from the ID's prefix or shape.
pub fn parse_event_id(raw: &str) -> NativeEventId {
    if let Some(rest) = raw.strip_prefix(MYSQL_PREFIX) {
        return parse_mysql(rest);
    }
    if let Some(rest) = raw.strip_prefix(POSTGRES_PREFIX) {
        return parse_lsn(rest).unwrap_or_else(|| NativeEventId::Opaque(raw.to_string()));
    }
    if let Some(lsn) = parse_lsn(raw) {
        return lsn;
    }
    match parse_mysql(raw) {
        id @ NativeEventId::MySql { .. } if id.is_valid() => id,
        _ => NativeEventId::Opaque(raw.to_string()),
    }
}

fn parse_mysql(raw: &str) -> NativeEventId {
    let Some((file_name, position)) = raw.split_once(':') else {
        return NativeEventId::Opaque(raw.to_string());
    };
    let file_index = match file_name.split_once('.') {
        Some((_, index)) => index.parse::<i64>().unwrap_or(-1),
        None => file_name.parse::<i64>().unwrap_or(-1),
    };
    let (offset, session_id) = match position.split_once(';') {
        Some((offset, session)) => (
            offset.parse::<i64>().unwrap_or(-1),
            Some(session.parse::<i64>().unwrap_or(-1)),
        ),
        None => (position.parse::<i64>().unwrap_or(-1), None),
    };
    NativeEventId::MySql {
        file_name: file_name.to_string(),
        file_index,
        offset,
        session_id,
    }
}

fn parse_lsn(raw: &str) -> Option<NativeEventId> {
    let (hi, lo) = raw.split_once('/')?;
    let hi = u32::from_str_radix(hi, 16).ok()?;
    let lo = u32::from_str_radix(lo, 16).ok()?;
    Some(NativeEventId::PgLsn(((hi as u64) << 32) | lo as u64))
}

impl NativeEventId {
    pub fn dbms_type(&self) -> &'static str {
        match self {
            NativeEventId::MySql { .. } => "mysql",
            NativeEventId::PgLsn(_) => "postgresql",
            NativeEventId::Opaque(_) => "opaque",
        }
    }

    pub fn is_valid(&self) -> bool {
        match self {
            NativeEventId::MySql {
                file_index, offset, ..
            } => *file_index > 0 && *offset > -1,
            NativeEventId::PgLsn(_) => true,
            NativeEventId::Opaque(raw) => !raw.is_empty(),
        }
    }
}

/// IDs of different database types do not compare.
impl PartialOrd for NativeEventId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (
                NativeEventId::MySql {
                    file_index: a_index,
                    offset: a_offset,
                    ..
                },
                NativeEventId::MySql {
                    file_index: b_index,
                    offset: b_offset,
                    ..
                },
            ) => Some((a_index, a_offset).cmp(&(b_index, b_offset))),
            (NativeEventId::PgLsn(a), NativeEventId::PgLsn(b)) => Some(a.cmp(b)),
            (NativeEventId::Opaque(a), NativeEventId::Opaque(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

/// Compares two raw IDs; `None` when either is invalid or the formats differ.
pub fn compare_event_ids(a: &str, b: &str) -> Option<Ordering> {
    let a = parse_event_id(a);
    let b = parse_event_id(b);
    if !a.is_valid() || !b.is_valid() {
        return None;
    }
    a.partial_cmp(&b)
}
