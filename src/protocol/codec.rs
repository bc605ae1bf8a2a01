// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Frame codec.
//!
//! # Frame Format
//! ```text
//! [Payload length (u32 LE)][crc32 of payload (u32 LE)][bincode payload]
//! ```
//! The payload is the bincode (serde, standard config) encoding of a
//! [`ProtocolMessage`]. Frames larger than [`MAX_FRAME_BYTES`] are refused on
//! both sides.

use byteorder::{ByteOrder, LittleEndian};

use super::ProtocolMessage;
use crate::config::{FRAME_HEADER_BYTES, MAX_FRAME_BYTES};
use crate::error::ProtocolError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: usize,
    pub checksum: u32,
}

impl FrameHeader {
    pub fn parse(bytes: &[u8; FRAME_HEADER_BYTES]) -> Result<Self, ProtocolError> {
        let length = LittleEndian::read_u32(&bytes[0..4]) as usize;
        let checksum = LittleEndian::read_u32(&bytes[4..8]);
        if length > MAX_FRAME_BYTES {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                limit: MAX_FRAME_BYTES,
            });
        }
        Ok(Self { length, checksum })
    }
}

/// Verifies and decodes the payload that followed `header`.
pub fn decode_payload(header: FrameHeader, payload: &[u8]) -> Result<ProtocolMessage, ProtocolError> {
    let found = crc32fast::hash(payload);
    if found != header.checksum {
        return Err(ProtocolError::ChecksumMismatch {
            expected: header.checksum,
            found,
        });
    }
    let (message, _) = bincode::serde::decode_from_slice::<ProtocolMessage, _>(
        payload,
        bincode::config::standard(),
    )
    .map_err(|e| ProtocolError::Decode(e.to_string()))?;
    Ok(message)
}

/// Decodes one complete frame held in memory.
pub fn decode_frame(frame: &[u8]) -> Result<ProtocolMessage, ProtocolError> {
    if frame.len() < FRAME_HEADER_BYTES {
        return Err(ProtocolError::Decode(format!(
            "frame of {} bytes is shorter than its header",
            frame.len()
        )));
    }
    let mut head = [0u8; FRAME_HEADER_BYTES];
    head.copy_from_slice(&frame[..FRAME_HEADER_BYTES]);
    let header = FrameHeader::parse(&head)?;
    let body = &frame[FRAME_HEADER_BYTES..];
    if body.len() != header.length {
        return Err(ProtocolError::Decode(format!(
            "frame declares {} payload bytes but carries {}",
            header.length,
            body.len()
        )));
    }
    decode_payload(header, body)
}

/// Encodes frames into a reusable buffer.
///
/// The buffer grows to fit the largest message seen; every `reset_period`
/// messages it is dropped and reallocated so one oversized batch does not pin
/// memory for the lifetime of the connection. A period of 0 never resets.
#[derive(Debug)]
pub struct FrameEncoder {
    buf: Vec<u8>,
    reset_period: u32,
    since_reset: u32,
}

impl FrameEncoder {
    pub fn new(reset_period: u32) -> Self {
        Self {
            buf: Vec::new(),
            reset_period,
            since_reset: 0,
        }
    }

    pub fn encode(&mut self, message: &ProtocolMessage) -> Result<&[u8], ProtocolError> {
        if self.reset_period > 0 && self.since_reset >= self.reset_period {
            self.buf = Vec::new();
            self.since_reset = 0;
        }
        self.since_reset += 1;

        self.buf.clear();
        self.buf.extend_from_slice(&[0u8; FRAME_HEADER_BYTES]);
        bincode::serde::encode_into_std_write(message, &mut self.buf, bincode::config::standard())
            .map_err(|e| ProtocolError::Encode(e.to_string()))?;

        let length = self.buf.len() - FRAME_HEADER_BYTES;
        if length > MAX_FRAME_BYTES {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                limit: MAX_FRAME_BYTES,
            });
        }
        let checksum = crc32fast::hash(&self.buf[FRAME_HEADER_BYTES..]);
        LittleEndian::write_u32(&mut self.buf[0..4], length as u32);
        LittleEndian::write_u32(&mut self.buf[4..8], checksum);
        Ok(&self.buf)
    }

    /// Capacity currently held by the encode buffer.
    pub fn buffered_capacity(&self) -> usize {
        self.buf.capacity()
    }
}
