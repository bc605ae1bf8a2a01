// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use crate::config::{FRAME_HEADER_BYTES, MAX_FRAME_BYTES};
use crate::error::ProtocolError;
use crate::event::LogEvent;
use crate::protocol::codec::{decode_frame, FrameEncoder, FrameHeader};
use crate::protocol::ProtocolMessage;

fn sample_batch(n: u64, payload: usize) -> ProtocolMessage {
    let events = (1..=n)
        .map(|s| LogEvent::new(s, 0, true, "db1", 3, format!("mysql-bin.000001:{}", s * 10), vec![7u8; payload]))
        .collect();
    ProtocolMessage::EventBatch(events)
}

#[test]
fn test_batch_frame_decodes_to_same_message() {
    let mut encoder = FrameEncoder::new(0);
    let msg = sample_batch(3, 16);
    let frame = encoder.encode(&msg).unwrap().to_vec();

    let mut head = [0u8; FRAME_HEADER_BYTES];
    head.copy_from_slice(&frame[..FRAME_HEADER_BYTES]);
    let header = FrameHeader::parse(&head).unwrap();
    assert_eq!(header.length, frame.len() - FRAME_HEADER_BYTES);

    assert_eq!(decode_frame(&frame).unwrap(), msg);
}

#[test]
fn test_corrupted_payload_is_rejected() {
    let mut encoder = FrameEncoder::new(0);
    let mut frame = encoder.encode(&ProtocolMessage::Heartbeat).unwrap().to_vec();
    let last = frame.len() - 1;
    frame[last] ^= 0xFF;

    match decode_frame(&frame) {
        Err(ProtocolError::ChecksumMismatch { .. }) => {}
        other => panic!("expected checksum mismatch, got {:?}", other),
    }
}

#[test]
fn test_oversized_header_is_rejected() {
    let mut head = [0u8; FRAME_HEADER_BYTES];
    head[..4].copy_from_slice(&((MAX_FRAME_BYTES as u32) + 1).to_le_bytes());
    assert!(matches!(
        FrameHeader::parse(&head),
        Err(ProtocolError::FrameTooLarge { .. })
    ));
}

#[test]
fn test_truncated_frame_is_rejected() {
    let mut encoder = FrameEncoder::new(0);
    let frame = encoder.encode(&sample_batch(1, 8)).unwrap().to_vec();
    assert!(decode_frame(&frame[..frame.len() - 2]).is_err());
    assert!(decode_frame(&frame[..3]).is_err());
}

#[test]
fn test_reset_period_releases_large_buffers() {
    let mut encoder = FrameEncoder::new(2);
    encoder.encode(&sample_batch(64, 4096)).unwrap();
    let grown = encoder.buffered_capacity();
    assert!(grown > 64 * 4096);

    // Second message still reuses the grown buffer.
    encoder.encode(&ProtocolMessage::Heartbeat).unwrap();
    assert_eq!(encoder.buffered_capacity(), grown);

    // Third message starts a new period with a fresh buffer.
    encoder.encode(&ProtocolMessage::Heartbeat).unwrap();
    assert!(encoder.buffered_capacity() < grown);
}

#[test]
fn test_zero_reset_period_keeps_buffer() {
    let mut encoder = FrameEncoder::new(0);
    encoder.encode(&sample_batch(16, 4096)).unwrap();
    let grown = encoder.buffered_capacity();
    for _ in 0..10 {
        encoder.encode(&ProtocolMessage::Heartbeat).unwrap();
    }
    assert_eq!(encoder.buffered_capacity(), grown);
}
