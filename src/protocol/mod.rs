// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Messages exchanged between a log server and its clients.
//!
//! # Conversation
//! ```text
//! server                         client
//!   Handshake{capabilities}  -->
//!                            <--  HandshakeResponse{source, position, heartbeat}
//!   Ok{range} | Nok{reason}  -->
//!                            <--  EventRequest{seqno, prefetch_range}
//!   Event | EventBatch       -->
//!   Heartbeat (when idle)    -->
//!   Error{message}           -->  (fatal)
//! ```

pub mod codec;

use serde::{Deserialize, Serialize};

use crate::config::PROTOCOL_VERSION;
use crate::event::LogEvent;
use crate::position::{LogPosition, SeqNoRange};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub protocol_version: u32,
    pub batching: bool,
    pub heartbeats: bool,
    pub seek_by_event_id: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            batching: true,
            heartbeats: true,
            seek_by_event_id: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub source_id: String,
    /// `None` disables the divergence check.
    pub last_position: Option<LogPosition>,
    pub heartbeat_millis: u64,
    /// Resume after this native event ID instead of a seqno.
    pub target_event_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolMessage {
    Handshake(Capabilities),
    HandshakeResponse(HandshakeResponse),
    Ok {
        range: SeqNoRange,
        /// Set when the server positioned the client by native event ID.
        resume_seqno: Option<u64>,
    },
    Nok {
        reason: String,
    },
    EventRequest {
        seqno: u64,
        prefetch_range: u64,
    },
    Event(LogEvent),
    EventBatch(Vec<LogEvent>),
    Heartbeat,
    Error {
        message: String,
    },
}

impl ProtocolMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolMessage::Handshake(_) => "Handshake",
            ProtocolMessage::HandshakeResponse(_) => "HandshakeResponse",
            ProtocolMessage::Ok { .. } => "Ok",
            ProtocolMessage::Nok { .. } => "Nok",
            ProtocolMessage::EventRequest { .. } => "EventRequest",
            ProtocolMessage::Event(_) => "Event",
            ProtocolMessage::EventBatch(_) => "EventBatch",
            ProtocolMessage::Heartbeat => "Heartbeat",
            ProtocolMessage::Error { .. } => "Error",
        }
    }
}
