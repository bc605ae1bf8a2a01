// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Constants shared by the log server, the client connector and the stores.

use std::time::Duration;

/// Default listener port of the log server.
pub const DEFAULT_PORT: u16 = 2112;

/// URI scheme accepted by the client connector.
pub const URI_SCHEME: &str = "thl";

/// Wire protocol version advertised in the server handshake.
pub const PROTOCOL_VERSION: u32 = 2;

/// Upper bound on a single encoded frame.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Bytes preceding every frame payload: u32 length + u32 crc32.
pub const FRAME_HEADER_BYTES: usize = 8;

/// How long a lookup of fragment > 0 waits for the fragment to become visible.
pub const DEFAULT_FRAGMENT_WAIT: Duration = Duration::from_secs(5);

/// Rows removed per transaction by a range purge.
pub const DELETE_BATCH_SIZE: usize = 1000;

/// Task whose commit position seeds every other task.
pub const PRIMARY_TASK_ID: u32 = 0;

/// A connector that hears nothing for this many heartbeat intervals drops the link.
pub const HEARTBEAT_TIMEOUT_FACTOR: u32 = 3;
