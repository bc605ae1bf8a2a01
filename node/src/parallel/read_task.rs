// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! One partitioned reader: a background loop feeding a [`ReadQueue`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use thl::error::{Result, ThlError};
use thl::event::EventHeader;
use thl::partition::Partitioner;

use super::read_queue::ReadQueue;
use super::{ControlEvent, ControlKind, ParallelEvent};
use crate::config::ParallelConfig;
use crate::cursor::{CursorRead, LogSource, ReadFilter};
use crate::telemetry;
use crate::watermark::Watermark;

#[derive(Default)]
struct Counters {
    read: AtomicU64,
    accepted: AtomicU64,
    discarded: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReadTaskStats {
    pub task_id: u32,
    pub read: u64,
    pub accepted: u64,
    pub discarded: u64,
    pub queued: usize,
}

pub struct ReadTask {
    task_id: u32,
    queue: Arc<ReadQueue>,
    counters: Arc<Counters>,
    failure: Arc<Mutex<Option<String>>>,
    cancel: CancellationToken,
    terminated: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// Inputs to a reader's background loop.
struct ReadLoop {
    task_id: u32,
    source: LogSource,
    partitioner: Arc<dyn Partitioner>,
    head: Arc<Watermark<u64>>,
    queue: Arc<ReadQueue>,
    counters: Arc<Counters>,
    start_seqno: u64,
    sync_interval: u64,
}

impl ReadLoop {
    async fn run(self) -> Result<()> {
        let task_id = self.task_id;
        let partitioner = self.partitioner.clone();
        let filter: ReadFilter = Arc::new(move |header: &EventHeader| match partitioner.partition(header, task_id) {
            Ok(response) => response.partition == task_id,
            // Let the loop see the record so the error surfaces there.
            Err(_) => true,
        });
        let mut cursor = self
            .source
            .cursor_for_task(task_id, self.start_seqno)?
            .with_filter(filter);
        tracing::info!("Parallel reader {} starting at seqno {}", task_id, self.start_seqno);

        loop {
            let read = cursor.next().await?;
            let header = read.header();
            self.head.wait_at_least(header.seqno).await;
            self.counters.read.fetch_add(1, Ordering::Relaxed);

            match read {
                CursorRead::Event(event) => {
                    let owner = self.partitioner.partition(&header, task_id)?;
                    if owner.partition != task_id {
                        continue;
                    }
                    self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                    self.queue.post(event).await;
                }
                CursorRead::Filtered(header) => {
                    self.counters.discarded.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!(telemetry::PARALLEL_DISCARDED, 1);
                    let end = header.end_seqno();
                    self.queue.sync(end, header.last_frag).await;
                    if header.last_frag && self.sync_interval > 0 && end % self.sync_interval == 0 {
                        self.queue
                            .post_out_of_band(ControlEvent {
                                kind: ControlKind::Sync,
                                seqno: end,
                                header: Some(header),
                            })
                            .await;
                    }
                }
            }
        }
    }
}

impl ReadTask {
    pub fn new(task_id: u32, config: &ParallelConfig, start_seqno: u64) -> Self {
        Self {
            task_id,
            queue: Arc::new(ReadQueue::new(
                config.max_size,
                config.max_control_events,
                start_seqno,
            )),
            counters: Arc::new(Counters::default()),
            failure: Arc::new(Mutex::new(None)),
            cancel: CancellationToken::new(),
            terminated: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    pub fn task_id(&self) -> u32 {
        self.task_id
    }

    fn handle(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.handle.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn is_running(&self) -> bool {
        self.handle().is_some() && !self.terminated.is_cancelled()
    }

    /// Spawns the read loop. The loop ends on cancellation or on the first
    /// error; the error is kept and raised by [`Self::get`].
    pub(crate) fn start(
        &self,
        source: LogSource,
        partitioner: Arc<dyn Partitioner>,
        head: Arc<Watermark<u64>>,
        start_seqno: u64,
        sync_interval: u64,
    ) {
        let read_loop = ReadLoop {
            task_id: self.task_id,
            source,
            partitioner,
            head,
            queue: self.queue.clone(),
            counters: self.counters.clone(),
            start_seqno,
            sync_interval,
        };
        let task_id = self.task_id;
        let cancel = self.cancel.clone();
        let terminated = self.terminated.clone();
        let failure = self.failure.clone();
        *self.handle() = Some(tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => Ok(()),
                result = read_loop.run() => result,
            };
            match outcome {
                Ok(()) => tracing::info!("Parallel reader {} stopped", task_id),
                Err(e) => {
                    tracing::error!("Parallel reader {} failed: {}", task_id, e);
                    *failure.lock().unwrap_or_else(|p| p.into_inner()) = Some(e.to_string());
                }
            }
            terminated.cancel();
        }));
    }

    pub async fn stop(&self, join_timeout: Duration) {
        self.cancel.cancel();
        let handle = self.handle().take();
        if let Some(handle) = handle {
            match tokio::time::timeout(join_timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("Parallel reader {} panicked: {}", self.task_id, e),
                Err(_) => tracing::warn!(
                    "Parallel reader {} did not stop within {:?}",
                    self.task_id,
                    join_timeout
                ),
            }
        }
    }

    /// Next event for this partition. Queued events are handed out first;
    /// once the queue is empty a terminated reader raises its failure
    /// instead of waiting forever.
    pub async fn get(&self) -> Result<ParallelEvent> {
        tokio::select! {
            biased;
            event = self.queue.take() => Ok(event),
            _ = self.terminated.cancelled() => {
                if !self.queue.is_empty() {
                    return Ok(self.queue.take().await);
                }
                let failure = self.failure.lock().unwrap_or_else(|p| p.into_inner()).clone();
                match failure {
                    Some(message) => Err(ThlError::ReaderFailed {
                        task_id: self.task_id,
                        message,
                    }),
                    None => Err(ThlError::Cancelled),
                }
            }
        }
    }

    pub fn peek(&self) -> Option<ParallelEvent> {
        self.queue.peek()
    }

    pub fn size(&self) -> usize {
        self.queue.len()
    }

    pub async fn put_control_event(&self, control: ControlEvent) {
        self.queue.post_out_of_band(control).await;
    }

    pub fn stats(&self) -> ReadTaskStats {
        ReadTaskStats {
            task_id: self.task_id,
            read: self.counters.read.load(Ordering::Relaxed),
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            discarded: self.counters.discarded.load(Ordering::Relaxed),
            queued: self.queue.len(),
        }
    }
}
