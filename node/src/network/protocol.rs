// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Framed message stream shared by the server handler and the connector.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use thl::config::FRAME_HEADER_BYTES;
use thl::error::{ProtocolError, Result};
use thl::event::LogEvent;
use thl::protocol::codec::{decode_payload, FrameEncoder, FrameHeader};
use thl::protocol::ProtocolMessage;

pub type TcpProtocol = Protocol<OwnedReadHalf, OwnedWriteHalf>;

pub struct Protocol<R, W> {
    reader: BufReader<R>,
    writer: BufWriter<W>,
    encoder: FrameEncoder,
    buffer_size: usize,
    batch: Vec<LogEvent>,
    read_timeout: Option<Duration>,
}

impl TcpProtocol {
    pub fn from_tcp(stream: TcpStream, reset_period: u32, buffer_size: usize) -> Self {
        let (reader, writer) = stream.into_split();
        Protocol::new(reader, writer, reset_period, buffer_size)
    }
}

impl<R, W> Protocol<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W, reset_period: u32, buffer_size: usize) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
            encoder: FrameEncoder::new(reset_period),
            buffer_size,
            batch: Vec::with_capacity(buffer_size),
            read_timeout: None,
        }
    }

    /// Reads that see nothing for `timeout` fail with `TimedOut`.
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
    }

    pub async fn write_message(&mut self, message: &ProtocolMessage) -> Result<()> {
        let frame = self.encoder.encode(message)?;
        self.writer.write_all(frame).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn read_frame(&mut self) -> Result<ProtocolMessage> {
        let mut head = [0u8; FRAME_HEADER_BYTES];
        self.reader.read_exact(&mut head).await?;
        let header = FrameHeader::parse(&head)?;
        let mut payload = vec![0u8; header.length];
        self.reader.read_exact(&mut payload).await?;
        Ok(decode_payload(header, &payload)?)
    }

    /// Next message from the peer. An `Error` message from the peer is
    /// returned as `ProtocolError::Remote`.
    pub async fn read_message(&mut self) -> Result<ProtocolMessage> {
        let message = match self.read_timeout {
            Some(limit) => tokio::time::timeout(limit, self.read_frame())
                .await
                .map_err(|_| {
                    std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("no message from peer within {:?}", limit),
                    )
                })??,
            None => self.read_frame().await?,
        };
        match message {
            ProtocolMessage::Error { message } => Err(ProtocolError::Remote(message).into()),
            other => Ok(other),
        }
    }

    /// Sends one event. With batching enabled the event is held until the
    /// batch is full or `force` is set.
    pub async fn send_event(&mut self, event: LogEvent, force: bool) -> Result<()> {
        if self.buffer_size == 0 {
            return self.write_message(&ProtocolMessage::Event(event)).await;
        }
        self.batch.push(event);
        if force || self.batch.len() >= self.buffer_size {
            self.flush_batch().await?;
        }
        Ok(())
    }

    /// Writes out any held events.
    pub async fn flush_batch(&mut self) -> Result<()> {
        match self.batch.len() {
            0 => Ok(()),
            1 => {
                let event = self.batch.remove(0);
                self.write_message(&ProtocolMessage::Event(event)).await
            }
            _ => {
                let batch = std::mem::take(&mut self.batch);
                self.write_message(&ProtocolMessage::EventBatch(batch)).await
            }
        }
    }

    pub fn pending_batch_len(&self) -> usize {
        self.batch.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, split, DuplexStream, ReadHalf, WriteHalf};

    type MemProtocol = Protocol<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

    fn pair(buffer_size: usize) -> (MemProtocol, MemProtocol) {
        let (a, b) = duplex(64 * 1024);
        let (ar, aw) = split(a);
        let (br, bw) = split(b);
        (
            Protocol::new(ar, aw, 1, buffer_size),
            Protocol::new(br, bw, 1, 0),
        )
    }

    fn event(seqno: u64) -> LogEvent {
        LogEvent::new(seqno, 0, true, "src", 1, "", vec![seqno as u8])
    }

    #[tokio::test]
    async fn test_unbatched_sends_single_events() {
        let (mut tx, mut rx) = pair(0);
        tx.send_event(event(1), false).await.unwrap();
        assert!(matches!(rx.read_message().await.unwrap(), ProtocolMessage::Event(e) if e.seqno == 1));
    }

    #[tokio::test]
    async fn test_batch_flushes_when_full_or_forced() {
        let (mut tx, mut rx) = pair(3);
        tx.send_event(event(1), false).await.unwrap();
        tx.send_event(event(2), false).await.unwrap();
        assert_eq!(tx.pending_batch_len(), 2);
        tx.send_event(event(3), false).await.unwrap();
        match rx.read_message().await.unwrap() {
            ProtocolMessage::EventBatch(batch) => {
                assert_eq!(batch.iter().map(|e| e.seqno).collect::<Vec<_>>(), vec![1, 2, 3])
            }
            other => panic!("unexpected {}", other.kind()),
        }

        tx.send_event(event(4), false).await.unwrap();
        tx.send_event(event(5), true).await.unwrap();
        assert!(matches!(rx.read_message().await.unwrap(), ProtocolMessage::EventBatch(b) if b.len() == 2));
    }

    #[tokio::test]
    async fn test_remote_error_surfaces() {
        let (mut tx, mut rx) = pair(0);
        tx.write_message(&ProtocolMessage::Error {
            message: "boom".into(),
        })
        .await
        .unwrap();
        let err = rx.read_message().await.unwrap_err();
        assert!(matches!(
            err,
            thl::ThlError::Protocol(ProtocolError::Remote(m)) if m == "boom"
        ));
    }

    #[tokio::test]
    async fn test_read_timeout() {
        let (_tx, mut rx) = pair(0);
        rx.set_read_timeout(Some(Duration::from_millis(20)));
        let err = rx.read_message().await.unwrap_err();
        assert!(err.is_disconnect());
    }
}
