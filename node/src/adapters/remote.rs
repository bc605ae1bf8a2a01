// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Extractor that pulls events from a remote log server.
//!
//! Lost connections are retried at a fixed interval until the server comes
//! back. After a reconnect the server may resend fragments that were
//! already handed out; those are dropped here instead of failing.

use std::time::Duration;

use async_trait::async_trait;

use thl::error::Result;
use thl::event::{EventHeader, LogEvent};
use thl::position::{LogPosition, StorePosition};

use super::Extractor;
use crate::config::ThlConfig;
use crate::network::Connector;
use crate::parallel::ParallelEvent;
use crate::telemetry;

pub struct RemoteThlExtractor {
    connector: Connector,
    retry_interval: Duration,
    retry_log_every: u32,
    check_serialization: bool,
    last_event: Option<EventHeader>,
}

fn end_position(header: &EventHeader) -> StorePosition {
    let fragno = header.filtered.map_or(header.fragno, |f| f.fragno_end);
    StorePosition::new(header.end_seqno(), fragno)
}

impl RemoteThlExtractor {
    pub fn new(uri: &str, source_id: impl Into<String>, config: &ThlConfig) -> Result<Self> {
        let connector = Connector::new(uri, source_id)?
            .with_heartbeat_millis(config.heartbeat_millis)
            .with_prefetch_range(config.prefetch_range)
            .with_reset_period(config.reset_period);
        Ok(Self {
            connector,
            retry_interval: config.retry_interval,
            retry_log_every: config.retry_log_every.max(1),
            check_serialization: true,
            last_event: None,
        })
    }

    /// Skips the divergence check on connect.
    pub fn with_force(mut self, force: bool) -> Self {
        if force && self.check_serialization {
            tracing::info!("Force option enabled; log serialization checking is disabled");
            self.check_serialization = false;
        }
        self
    }

    /// Asks the server to position the stream after this native event ID.
    pub fn with_target_event_id(mut self, event_id: Option<String>) -> Self {
        self.connector = self.connector.with_target_event_id(event_id);
        self
    }

    pub fn connector(&self) -> &Connector {
        &self.connector
    }

    pub fn last_event(&self) -> Option<&EventHeader> {
        self.last_event.as_ref()
    }

    async fn open_connector(&mut self) -> Result<()> {
        tracing::info!("Opening connection to master: {}", self.connector.uri());
        let position = match (&self.last_event, self.check_serialization) {
            (Some(last), true) => Some(LogPosition {
                epoch_number: last.epoch_number,
                seqno: last.seqno,
            }),
            _ => None,
        };
        self.connector.set_last_position(position);

        let mut retries: u64 = 0;
        loop {
            match self.connector.connect().await {
                Ok(_) => break,
                Err(e) if e.is_disconnect() => {
                    self.connector.close();
                    retries += 1;
                    metrics::counter!(telemetry::RECONNECT_ATTEMPTS, 1);
                    if retries % u64::from(self.retry_log_every) == 0 {
                        tracing::info!(
                            "Waiting for master to become available: uri={} retries={} last error: {}",
                            self.connector.uri(),
                            retries,
                            e
                        );
                    }
                    tokio::time::sleep(self.retry_interval).await;
                }
                Err(e) => return Err(e),
            }
        }
        tracing::info!("Connected to master after {} retries", retries);
        Ok(())
    }

    /// Seqno to request next.
    fn next_seqno(&self) -> u64 {
        match &self.last_event {
            Some(last) if last.last_frag => last.end_seqno() + 1,
            Some(last) => last.seqno,
            None => self
                .connector
                .resume_seqno()
                .or(self.connector.server_range().min_seqno)
                .unwrap_or(0),
        }
    }

    fn already_delivered(&self, event: &LogEvent) -> bool {
        self.last_event.as_ref().is_some_and(|last| {
            StorePosition::new(event.seqno, event.fragno) <= end_position(last)
        })
    }
}

#[async_trait]
impl Extractor for RemoteThlExtractor {
    async fn set_last_event(&mut self, header: Option<EventHeader>) -> Result<()> {
        self.last_event = header;
        self.connector.close();
        Ok(())
    }

    async fn extract(&mut self) -> Result<ParallelEvent> {
        if !self.connector.is_connected() {
            self.open_connector().await?;
        }
        loop {
            let seqno = self.next_seqno();
            match self.connector.request_event(seqno).await {
                Ok(event) if self.already_delivered(&event) => {
                    tracing::debug!(
                        "Skipping re-delivered fragment {}:{}",
                        event.seqno,
                        event.fragno
                    );
                }
                Ok(event) => {
                    self.last_event = Some(event.header());
                    return Ok(ParallelEvent::Data(event));
                }
                Err(e) if e.is_disconnect() => {
                    tracing::info!("Connection to remote log lost; reconnecting: {}", e);
                    self.connector.close();
                    self.open_connector().await?;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use thl::event::FilteredRange;

    fn extractor() -> RemoteThlExtractor {
        RemoteThlExtractor::new("thl://localhost:1", "replica", &ThlConfig::default()).unwrap()
    }

    #[test]
    fn test_next_seqno_follows_last_event() {
        let mut x = extractor();
        assert_eq!(x.next_seqno(), 0);

        x.last_event = Some(LogEvent::new(7, 0, false, "src", 1, "", vec![]).header());
        assert_eq!(x.next_seqno(), 7);

        x.last_event = Some(LogEvent::new(7, 1, true, "src", 1, "", vec![]).header());
        assert_eq!(x.next_seqno(), 8);

        let filtered = LogEvent::new(9, 0, true, "src", 1, "", vec![]).with_filtered(FilteredRange {
            seqno_end: 12,
            fragno_end: 0,
        });
        x.last_event = Some(filtered.header());
        assert_eq!(x.next_seqno(), 13);
    }

    #[test]
    fn test_redelivered_fragments_are_recognised() {
        let mut x = extractor();
        x.last_event = Some(LogEvent::new(5, 2, false, "src", 1, "", vec![]).header());
        assert!(x.already_delivered(&LogEvent::new(5, 1, false, "src", 1, "", vec![])));
        assert!(x.already_delivered(&LogEvent::new(5, 2, false, "src", 1, "", vec![])));
        assert!(!x.already_delivered(&LogEvent::new(5, 3, true, "src", 1, "", vec![])));
        assert!(!x.already_delivered(&LogEvent::new(6, 0, true, "src", 1, "", vec![])));
    }
}
