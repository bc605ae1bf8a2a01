// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Client connector for a remote log server.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::net::TcpSocket;

use thl::config::{DEFAULT_PORT, HEARTBEAT_TIMEOUT_FACTOR, PROTOCOL_VERSION, URI_SCHEME};
use thl::error::{HandshakeError, ProtocolError, Result, ThlError};
use thl::event::LogEvent;
use thl::position::{LogPosition, SeqNoRange};
use thl::protocol::{HandshakeResponse, ProtocolMessage};

use super::protocol::TcpProtocol;

/// Splits `thl://host[:port][/]` into host and port.
pub fn parse_uri(uri: &str) -> Result<(String, u16)> {
    let invalid = |reason: &str| -> ThlError {
        ProtocolError::InvalidUri {
            uri: uri.to_string(),
            reason: reason.to_string(),
        }
        .into()
    };
    let rest = uri
        .strip_prefix(URI_SCHEME)
        .and_then(|r| r.strip_prefix("://"))
        .ok_or_else(|| invalid("expected scheme thl://"))?;
    let authority = rest.split('/').next().unwrap_or_default();
    if authority.is_empty() {
        return Err(invalid("missing host"));
    }

    // Bracketed IPv6 literal, optionally followed by :port.
    if let Some(v6) = authority.strip_prefix('[') {
        let (host, tail) = v6.split_once(']').ok_or_else(|| invalid("unclosed ["))?;
        let port = match tail.strip_prefix(':') {
            Some(p) => p.parse().map_err(|_| invalid("bad port"))?,
            None if tail.is_empty() => DEFAULT_PORT,
            None => return Err(invalid("junk after host")),
        };
        return Ok((host.to_string(), port));
    }
    match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse().map_err(|_| invalid("bad port"))?;
            Ok((host.to_string(), port))
        }
        None => Ok((authority.to_string(), DEFAULT_PORT)),
    }
}

pub struct Connector {
    uri: String,
    host: String,
    port: u16,
    source_id: String,
    last_position: Option<LogPosition>,
    target_event_id: Option<String>,
    heartbeat_millis: u64,
    prefetch_range: u64,
    reset_period: u32,

    protocol: Option<TcpProtocol>,
    server_range: SeqNoRange,
    resume_seqno: Option<u64>,
    in_batch: VecDeque<LogEvent>,
    prefetch_index: u64,
    all_previous_fragments_done: bool,
}

impl Connector {
    pub fn new(uri: &str, source_id: impl Into<String>) -> Result<Self> {
        let (host, port) = parse_uri(uri)?;
        Ok(Self {
            uri: uri.to_string(),
            host,
            port,
            source_id: source_id.into(),
            last_position: None,
            target_event_id: None,
            heartbeat_millis: 3000,
            prefetch_range: u64::MAX,
            reset_period: 1,
            protocol: None,
            server_range: SeqNoRange::EMPTY,
            resume_seqno: None,
            in_batch: VecDeque::new(),
            prefetch_index: 0,
            all_previous_fragments_done: true,
        })
    }

    /// Position checked against the server's log during the handshake.
    pub fn with_last_position(mut self, position: Option<LogPosition>) -> Self {
        self.last_position = position;
        self
    }

    pub fn with_target_event_id(mut self, event_id: Option<String>) -> Self {
        self.target_event_id = event_id;
        self
    }

    pub fn with_heartbeat_millis(mut self, millis: u64) -> Self {
        self.heartbeat_millis = millis;
        self
    }

    pub fn with_prefetch_range(mut self, range: u64) -> Self {
        self.prefetch_range = range.max(1);
        self
    }

    pub fn with_reset_period(mut self, period: u32) -> Self {
        self.reset_period = period;
        self
    }

    pub fn set_last_position(&mut self, position: Option<LogPosition>) {
        self.last_position = position;
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn server_range(&self) -> SeqNoRange {
        self.server_range
    }

    /// Seqno chosen by the server after an event-ID seek.
    pub fn resume_seqno(&self) -> Option<u64> {
        self.resume_seqno
    }

    pub fn is_connected(&self) -> bool {
        self.protocol.is_some()
    }

    /// Opens the socket and runs the client half of the handshake.
    pub async fn connect(&mut self) -> Result<SeqNoRange> {
        self.close();
        let addr = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await?
            .next()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no address for {}", self.host),
                )
            })?;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_keepalive(true)?;
        let stream = socket.connect(addr).await?;
        stream.set_nodelay(true)?;

        let mut protocol = TcpProtocol::from_tcp(stream, self.reset_period, 0);
        protocol.set_read_timeout(Some(Duration::from_millis(
            self.heartbeat_millis
                .saturating_mul(HEARTBEAT_TIMEOUT_FACTOR as u64),
        )));

        let (range, resume_seqno) = self.handshake(&mut protocol).await?;
        tracing::info!(
            "Connected to {} range={:?} resume={:?}",
            self.uri,
            range,
            resume_seqno
        );
        self.server_range = range;
        self.resume_seqno = resume_seqno;
        self.protocol = Some(protocol);
        Ok(range)
    }

    async fn handshake(&self, protocol: &mut TcpProtocol) -> Result<(SeqNoRange, Option<u64>)> {
        match protocol.read_message().await? {
            ProtocolMessage::Handshake(capabilities) => {
                if capabilities.protocol_version != PROTOCOL_VERSION {
                    return Err(HandshakeError::VersionMismatch {
                        server: capabilities.protocol_version,
                        client: PROTOCOL_VERSION,
                    }
                    .into());
                }
            }
            other => {
                return Err(ProtocolError::Unexpected {
                    expected: "Handshake",
                    received: other.kind(),
                }
                .into())
            }
        }

        protocol
            .write_message(&ProtocolMessage::HandshakeResponse(HandshakeResponse {
                source_id: self.source_id.clone(),
                last_position: self.last_position,
                heartbeat_millis: self.heartbeat_millis,
                target_event_id: self.target_event_id.clone(),
            }))
            .await?;

        match protocol.read_message().await? {
            ProtocolMessage::Ok {
                range,
                resume_seqno,
            } => Ok((range, resume_seqno)),
            ProtocolMessage::Nok { reason } => Err(HandshakeError::Rejected(reason).into()),
            other => Err(ProtocolError::Unexpected {
                expected: "Ok",
                received: other.kind(),
            }
            .into()),
        }
    }

    pub fn close(&mut self) {
        self.protocol = None;
        self.in_batch.clear();
        self.prefetch_index = 0;
        self.all_previous_fragments_done = true;
    }

    fn account(&mut self, event: &LogEvent) {
        self.all_previous_fragments_done = event.last_frag;
        if event.last_frag {
            self.prefetch_index = self.prefetch_index.saturating_add(event.transaction_weight());
            if self.prefetch_index >= self.prefetch_range {
                self.prefetch_index = 0;
            }
        }
    }

    /// Returns the next event at or after `seqno`. A new request is only
    /// sent once the previous prefetch window has been fully received;
    /// heartbeats are absorbed here.
    pub async fn request_event(&mut self, seqno: u64) -> Result<LogEvent> {
        if let Some(event) = self.in_batch.pop_front() {
            self.account(&event);
            return Ok(event);
        }
        let prefetch_range = self.prefetch_range;
        let request_due = self.prefetch_index == 0 && self.all_previous_fragments_done;
        let protocol = self.protocol.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotConnected, "connector is not connected")
        })?;
        if request_due {
            protocol
                .write_message(&ProtocolMessage::EventRequest {
                    seqno,
                    prefetch_range,
                })
                .await?;
        }

        loop {
            match protocol.read_message().await? {
                ProtocolMessage::Heartbeat => continue,
                ProtocolMessage::Event(event) => {
                    self.account(&event);
                    return Ok(event);
                }
                ProtocolMessage::EventBatch(batch) => {
                    self.in_batch.extend(batch);
                    if let Some(event) = self.in_batch.pop_front() {
                        self.account(&event);
                        return Ok(event);
                    }
                }
                other => {
                    return Err(ProtocolError::Unexpected {
                        expected: "Event",
                        received: other.kind(),
                    }
                    .into())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_uri() {
        assert_eq!(parse_uri("thl://db1:2113/").unwrap(), ("db1".into(), 2113));
        assert_eq!(parse_uri("thl://db1").unwrap(), ("db1".into(), 2112));
        assert_eq!(parse_uri("thl://[::1]:9000").unwrap(), ("::1".into(), 9000));
        assert!(parse_uri("http://db1").is_err());
        assert!(parse_uri("thl:///").is_err());
        assert!(parse_uri("thl://db1:port").is_err());
    }

    #[test]
    fn test_prefetch_accounting() {
        let mut connector = Connector::new("thl://localhost", "replica")
            .unwrap()
            .with_prefetch_range(2);
        let frag = LogEvent::new(1, 0, false, "src", 1, "", vec![]);
        let last = LogEvent::new(1, 1, true, "src", 1, "", vec![]);

        connector.account(&frag);
        assert!(!connector.all_previous_fragments_done);
        connector.account(&last);
        assert_eq!(connector.prefetch_index, 1);
        connector.account(&LogEvent::new(2, 0, true, "src", 1, "", vec![]));
        assert_eq!(connector.prefetch_index, 0);
        assert!(connector.all_previous_fragments_done);
    }
}
