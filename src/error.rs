// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Error types.

use std::time::Duration;
use thiserror::Error;

use crate::event::EventStatus;

/// Boxed cause carried by backend-specific failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Malformed or unexpected traffic on a log connection.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("frame of {size} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge { size: usize, limit: usize },
    #[error("frame checksum mismatch: expected {expected:#010x}, found {found:#010x}")]
    ChecksumMismatch { expected: u32, found: u32 },
    #[error("failed to encode message: {0}")]
    Encode(String),
    #[error("failed to decode message: {0}")]
    Decode(String),
    #[error("unexpected message: expected {expected}, received {received}")]
    Unexpected {
        expected: &'static str,
        received: &'static str,
    },
    #[error("remote side reported an error: {0}")]
    Remote(String),
    #[error("invalid log URI {uri}: {reason}")]
    InvalidUri { uri: String, reason: String },
}

/// Handshake refused by either side.
#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("invalid heartbeat interval {0}ms: must be greater than zero")]
    InvalidHeartbeat(u64),
    #[error("protocol version mismatch: server={server} client={client}")]
    VersionMismatch { server: u32, client: u32 },
    #[error(
        "client requested non-existent transaction: client source ID={source_id} \
         seqno={seqno} client epoch number={epoch_number}"
    )]
    MissingSeqno {
        source_id: String,
        seqno: u64,
        epoch_number: u64,
    },
    #[error(
        "log epoch numbers do not match: client source ID={source_id} seqno={client_seqno} \
         epoch number={client_epoch}, server seqno={server_seqno} epoch number={server_epoch}"
    )]
    Diverged {
        source_id: String,
        client_seqno: u64,
        client_epoch: u64,
        server_seqno: u64,
        server_epoch: u64,
    },
    #[error("unable to seek to native event ID {event_id}: {reason}")]
    UnseekableEventId { event_id: String, reason: String },
    #[error("handshake rejected by server: {0}")]
    Rejected(String),
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("duplicate log entry: seqno={seqno} fragno={fragno}")]
    DuplicateEntry { seqno: u64, fragno: u16 },
    #[error("log entry not found: seqno={seqno} fragno={fragno}")]
    NotFound { seqno: u64, fragno: u16 },
    #[error("illegal status change for seqno={seqno} fragno={fragno}: {from:?} -> {to:?}")]
    InvalidTransition {
        seqno: u64,
        fragno: u16,
        from: EventStatus,
        to: EventStatus,
    },
    #[error("corrupt log entry seqno={seqno} fragno={fragno}: {reason}")]
    Corrupt {
        seqno: u64,
        fragno: u16,
        reason: String,
    },
    #[error("{context}: {source}")]
    Backend {
        context: String,
        #[source]
        source: BoxError,
    },
    #[error("rollback failed after error ({original}): {rollback}")]
    RollbackFailed {
        original: Box<ThlError>,
        #[source]
        rollback: BoxError,
    },
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub fn backend(context: impl Into<String>, source: impl Into<BoxError>) -> Self {
        StorageError::Backend {
            context: context.into(),
            source: source.into(),
        }
    }
}

/// Failure inside the row-range checksum workflow.
#[derive(Error, Debug)]
#[error("consistency check statement failed [{statement}]: {source}")]
pub struct ConsistencyError {
    pub statement: String,
    #[source]
    pub source: BoxError,
}

#[derive(Error, Debug)]
pub enum ThlError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Consistency(#[from] ConsistencyError),
    #[error("timed out after {waited:?} waiting for {what}")]
    Timeout { what: String, waited: Duration },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("partitioner failed: {0}")]
    Partition(String),
    #[error("parallel reader {task_id} failed: {message}")]
    ReaderFailed { task_id: u32, message: String },
    #[error("operation cancelled")]
    Cancelled,
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ThlError {
    /// True for failures that mean the peer went away or is not there yet:
    /// EOF, reset, abort, broken pipe, refusal and read timeouts.
    pub fn is_disconnect(&self) -> bool {
        use std::io::ErrorKind;

        match self {
            ThlError::Io(e) => matches!(
                e.kind(),
                ErrorKind::UnexpectedEof
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
                    | ErrorKind::ConnectionRefused
                    | ErrorKind::NotConnected
                    | ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ThlError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error, ErrorKind};

    #[test]
    fn test_disconnect_kinds() {
        for kind in [
            ErrorKind::UnexpectedEof,
            ErrorKind::ConnectionReset,
            ErrorKind::BrokenPipe,
            ErrorKind::ConnectionRefused,
        ] {
            assert!(ThlError::from(Error::from(kind)).is_disconnect(), "{:?}", kind);
        }
    }

    #[test]
    fn test_local_io_failures_are_not_disconnects() {
        for kind in [ErrorKind::PermissionDenied, ErrorKind::NotFound, ErrorKind::OutOfMemory] {
            assert!(!ThlError::from(Error::from(kind)).is_disconnect(), "{:?}", kind);
        }
        assert!(!ThlError::Cancelled.is_disconnect());
    }
}
