// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use crate::config::PROTOCOL_VERSION;
use crate::error::HandshakeError;
use crate::position::{LogPosition, SeqNoRange};
use crate::protocol::codec::{decode_frame, FrameEncoder};
use crate::protocol::{Capabilities, HandshakeResponse, ProtocolMessage};

#[test]
fn test_handshake_exchange_survives_framing() {
    let mut encoder = FrameEncoder::new(1);
    let messages = vec![
        ProtocolMessage::Handshake(Capabilities::default()),
        ProtocolMessage::HandshakeResponse(HandshakeResponse {
            source_id: "replica-1".into(),
            last_position: Some(LogPosition {
                epoch_number: 7,
                seqno: 1200,
            }),
            heartbeat_millis: 250,
            target_event_id: Some("mysql-bin.000004:1881".into()),
        }),
        ProtocolMessage::Ok {
            range: SeqNoRange::new(1, 1500),
            resume_seqno: None,
        },
        ProtocolMessage::EventRequest {
            seqno: 1201,
            prefetch_range: u64::MAX,
        },
    ];

    for msg in messages {
        let frame = encoder.encode(&msg).unwrap().to_vec();
        let decoded = decode_frame(&frame).unwrap();
        assert_eq!(decoded.kind(), msg.kind());
        assert_eq!(decoded, msg);
    }
}

#[test]
fn test_default_capabilities_advertise_current_version() {
    let caps = Capabilities::default();
    assert_eq!(caps.protocol_version, PROTOCOL_VERSION);
    assert!(caps.heartbeats);
}

#[test]
fn test_divergence_message_names_both_positions() {
    let err = HandshakeError::Diverged {
        source_id: "replica-1".into(),
        client_seqno: 42,
        client_epoch: 3,
        server_seqno: 42,
        server_epoch: 5,
    };
    let text = err.to_string();
    assert!(text.contains("seqno=42"));
    assert!(text.contains("epoch number=3"));
    assert!(text.contains("epoch number=5"));
}
