// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Server side of one client connection.
//!
//! The handler validates the client's position during the handshake, then
//! answers event requests by streaming from its own cursor. It sends a
//! heartbeat whenever no event shows up within the negotiated interval.

use std::cmp::Ordering;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use thl::error::{HandshakeError, ProtocolError, Result, StorageError, ThlError};
use thl::event_id::compare_event_ids;
use thl::position::StorePosition;
use thl::protocol::{Capabilities, HandshakeResponse, ProtocolMessage};

use super::protocol::Protocol;
use crate::cursor::{CursorRead, LogCursor, LogSource};
use crate::storage::LogStore;
use crate::telemetry;

pub struct ConnectionHandler<R, W> {
    id: u64,
    peer: String,
    protocol: Protocol<R, W>,
    source: LogSource,
    store: Box<dyn LogStore>,
    cursor: Option<LogCursor>,
}

impl<R, W> ConnectionHandler<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(
        id: u64,
        peer: impl Into<String>,
        protocol: Protocol<R, W>,
        source: LogSource,
    ) -> Result<Self> {
        let store = source.open_store(thl::config::PRIMARY_TASK_ID)?;
        Ok(Self {
            id,
            peer: peer.into(),
            protocol,
            source,
            store,
            cursor: None,
        })
    }

    /// Serves the connection until the client leaves, a fault occurs or
    /// `cancel` fires, then reports `id` on `finished`.
    pub async fn run(mut self, cancel: CancellationToken, finished: mpsc::UnboundedSender<u64>) {
        tracing::info!("Client {} connected from {}", self.id, self.peer);
        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(ThlError::Cancelled),
            result = self.serve() => result,
        };
        match outcome {
            Ok(()) => tracing::info!("Client {} finished", self.id),
            Err(ThlError::Cancelled) => {
                tracing::info!("Connection handler {} cancelled", self.id)
            }
            Err(e) if e.is_disconnect() => {
                tracing::info!("Client {} disconnected: {}", self.id, e)
            }
            Err(e) => {
                tracing::error!("Connection handler {} failed: {}", self.id, e);
                let _ = self
                    .protocol
                    .write_message(&ProtocolMessage::Error {
                        message: e.to_string(),
                    })
                    .await;
            }
        }
        self.cursor = None;
        let _ = finished.send(self.id);
    }

    async fn serve(&mut self) -> Result<()> {
        let heartbeat = self.handshake().await?;
        self.stream(heartbeat).await
    }

    /// Runs the server half of the handshake and returns the heartbeat
    /// interval requested by the client.
    pub async fn handshake(&mut self) -> Result<Duration> {
        self.protocol
            .write_message(&ProtocolMessage::Handshake(Capabilities::default()))
            .await?;
        let response = match self.protocol.read_message().await? {
            ProtocolMessage::HandshakeResponse(response) => response,
            other => {
                return Err(ProtocolError::Unexpected {
                    expected: "HandshakeResponse",
                    received: other.kind(),
                }
                .into())
            }
        };

        match self.validate(&response) {
            Ok(resume_seqno) => {
                let range = self.store.min_max_seqno()?;
                tracing::info!(
                    "Client {} handshake accepted: source={} position={:?} range={:?} resume={:?}",
                    self.id,
                    response.source_id,
                    response.last_position,
                    range,
                    resume_seqno
                );
                self.protocol
                    .write_message(&ProtocolMessage::Ok {
                        range,
                        resume_seqno,
                    })
                    .await?;
                Ok(Duration::from_millis(response.heartbeat_millis))
            }
            Err(e) => {
                tracing::warn!("Client {} handshake refused: {}", self.id, e);
                let _ = self
                    .protocol
                    .write_message(&ProtocolMessage::Nok {
                        reason: e.to_string(),
                    })
                    .await;
                Err(e)
            }
        }
    }

    fn validate(&self, response: &HandshakeResponse) -> Result<Option<u64>> {
        if response.heartbeat_millis == 0 {
            return Err(HandshakeError::InvalidHeartbeat(response.heartbeat_millis).into());
        }

        let validated = match response.last_position {
            Some(position) => {
                let Some(event) = self.store.find(position.seqno)? else {
                    return Err(HandshakeError::MissingSeqno {
                        source_id: response.source_id.clone(),
                        seqno: position.seqno,
                        epoch_number: position.epoch_number,
                    }
                    .into());
                };
                if event.epoch_number != position.epoch_number {
                    return Err(HandshakeError::Diverged {
                        source_id: response.source_id.clone(),
                        client_seqno: position.seqno,
                        client_epoch: position.epoch_number,
                        server_seqno: event.seqno,
                        server_epoch: event.epoch_number,
                    }
                    .into());
                }
                Some(position.seqno)
            }
            None => None,
        };

        match &response.target_event_id {
            Some(target) => self.seek_event_id(validated, target).map(Some),
            None => Ok(None),
        }
    }

    /// Finds the last stored transaction whose native event ID is at or
    /// before `target`, starting from `from`, and returns the seqno after it.
    fn seek_event_id(&self, from: Option<u64>, target: &str) -> Result<u64> {
        let unseekable = |reason: String| -> ThlError {
            HandshakeError::UnseekableEventId {
                event_id: target.to_string(),
                reason,
            }
            .into()
        };
        let range = self.store.min_max_seqno()?;
        let (Some(min), Some(max)) = (range.min_seqno, range.max_seqno) else {
            return Err(unseekable("log is empty".into()));
        };

        let mut found = None;
        for seqno in from.unwrap_or(min).max(min)..=max {
            let Some(event_id) = self.store.event_id(seqno)? else {
                continue;
            };
            if event_id.is_empty() {
                continue;
            }
            match compare_event_ids(&event_id, target) {
                Some(Ordering::Less) | Some(Ordering::Equal) => found = Some(seqno),
                Some(Ordering::Greater) => break,
                None => {
                    return Err(unseekable(format!(
                        "event ID {} at seqno {} is not comparable",
                        event_id, seqno
                    )))
                }
            }
        }
        match found {
            Some(seqno) => {
                tracing::info!("Event ID {} found at seqno {}", target, seqno);
                Ok(seqno + 1)
            }
            None => Err(unseekable(format!(
                "no event at or before it in seqno {}..={}",
                from.unwrap_or(min),
                max
            ))),
        }
    }

    async fn next_request(&mut self) -> Result<(u64, u64)> {
        match self.protocol.read_message().await? {
            ProtocolMessage::EventRequest {
                seqno,
                prefetch_range,
            } => Ok((seqno, prefetch_range.max(1))),
            other => Err(ProtocolError::Unexpected {
                expected: "EventRequest",
                received: other.kind(),
            }
            .into()),
        }
    }

    fn position_cursor(&mut self, seqno: u64) -> Result<&mut LogCursor> {
        if let Some(min) = self.store.min_seqno()? {
            if seqno < min {
                return Err(StorageError::NotFound { seqno, fragno: 0 }.into());
            }
        }
        match &mut self.cursor {
            Some(cursor) if cursor.position() == StorePosition::new(seqno, 0) => {}
            Some(cursor) => {
                tracing::debug!("Client {} cursor re-seek to {}", self.id, seqno);
                cursor.seek(seqno);
            }
            None => self.cursor = Some(self.source.cursor(seqno)?),
        }
        self.cursor
            .as_mut()
            .ok_or_else(|| ThlError::Config("cursor not opened".into()))
    }

    async fn stream(&mut self, heartbeat: Duration) -> Result<()> {
        loop {
            let (seqno, prefetch) = self.next_request().await?;
            tracing::debug!(
                "Client {} requested seqno {} prefetch {}",
                self.id,
                seqno,
                prefetch
            );
            self.position_cursor(seqno)?;

            let mut sent = 0u64;
            while sent < prefetch {
                let read = match self.cursor.as_mut() {
                    Some(cursor) => cursor.next_within(heartbeat).await?,
                    None => return Err(ThlError::Config("cursor not opened".into())),
                };
                match read {
                    Some(CursorRead::Event(event)) => {
                        sent = sent.saturating_add(event.transaction_weight());
                        let at_head = self.source.sequencer().current()
                            <= Some(StorePosition::new(event.end_seqno(), event.end_fragno()));
                        let force = sent >= prefetch || at_head;
                        self.protocol.send_event(event, force).await?;
                        metrics::counter!(telemetry::EVENTS_SENT, 1);
                    }
                    Some(CursorRead::Filtered(_)) => {}
                    None => {
                        self.protocol.flush_batch().await?;
                        self.protocol.write_message(&ProtocolMessage::Heartbeat).await?;
                        metrics::counter!(telemetry::HEARTBEATS_SENT, 1);
                    }
                }
            }
        }
    }
}
