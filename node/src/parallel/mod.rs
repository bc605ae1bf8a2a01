// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Partitioned parallel reads.
//!
//! A [`ParallelQueue`] runs one [`ReadTask`] per partition. Every task walks
//! the whole log with its own cursor and keeps only the records its
//! partition owns, so each output is a subsequence of the log in seqno
//! order. Control events are broadcast to every task and land in each
//! output at the position given by their seqno.
//!
//! All readers wait on a shared head watermark before queuing an event, so
//! the caller can keep fast partitions from running ahead.

pub mod queue;
pub mod read_queue;
pub mod read_task;

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use thl::error::{Result, ThlError};
use thl::event::{EventHeader, LogEvent};
use thl::partition::Partitioner;

use crate::config::ParallelConfig;
use crate::cursor::LogSource;
use crate::watermark::Watermark;
pub use read_task::{ReadTask, ReadTaskStats};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlKind {
    /// Consumers should stop after this point.
    Stop,
    /// Position marker, lets a consumer record progress across records it
    /// never sees.
    Sync,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlEvent {
    pub kind: ControlKind,
    pub seqno: u64,
    pub header: Option<EventHeader>,
}

impl ControlEvent {
    pub fn new(kind: ControlKind, seqno: u64) -> Self {
        Self {
            kind,
            seqno,
            header: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParallelEvent {
    Data(LogEvent),
    Control(ControlEvent),
}

impl ParallelEvent {
    pub fn seqno(&self) -> u64 {
        match self {
            ParallelEvent::Data(e) => e.seqno,
            ParallelEvent::Control(c) => c.seqno,
        }
    }
}

pub struct ParallelQueue {
    config: ParallelConfig,
    source: LogSource,
    partitioner: Arc<dyn Partitioner>,
    head: Arc<Watermark<u64>>,
    join_timeout: Duration,
    tasks: RwLock<Vec<Arc<ReadTask>>>,
}

impl ParallelQueue {
    pub fn new(
        source: LogSource,
        partitioner: Arc<dyn Partitioner>,
        config: ParallelConfig,
        join_timeout: Duration,
    ) -> Result<Self> {
        if config.channels == 0 {
            return Err(ThlError::Config("parallel channels must be positive".into()));
        }
        if partitioner.partitions() != config.channels {
            return Err(ThlError::Config(format!(
                "partitioner has {} partitions but {} channels are configured",
                partitioner.partitions(),
                config.channels
            )));
        }
        Ok(Self {
            config,
            source,
            partitioner,
            head: Arc::new(Watermark::new(u64::MAX)),
            join_timeout,
            tasks: RwLock::new(Vec::new()),
        })
    }

    /// Readers never queue an event with a seqno above `head`.
    pub fn with_head(mut self, head: Arc<Watermark<u64>>) -> Self {
        self.head = head;
        self
    }

    pub fn head(&self) -> &Arc<Watermark<u64>> {
        &self.head
    }

    fn tasks(&self) -> RwLockReadGuard<'_, Vec<Arc<ReadTask>>> {
        self.tasks.read().unwrap_or_else(|p| p.into_inner())
    }

    fn tasks_mut(&self) -> RwLockWriteGuard<'_, Vec<Arc<ReadTask>>> {
        self.tasks.write().unwrap_or_else(|p| p.into_inner())
    }

    pub fn channels(&self) -> u32 {
        self.config.channels
    }

    /// Seqno a task restarts from: after its last fully committed
    /// transaction, or at the start of a partially committed one.
    fn restart_seqno(&self, task_id: u32) -> Result<u64> {
        let store = self.source.open_store(task_id)?;
        if let Some(position) = store.last_commit_position(task_id)? {
            if let Some(seqno) = position.seqno {
                return Ok(if position.last_frag { seqno + 1 } else { seqno });
            }
        }
        Ok(store.min_seqno()?.unwrap_or(0))
    }

    /// Starts every task from its own commit position.
    pub fn start(&self) -> Result<()> {
        let mut starts = Vec::with_capacity(self.config.channels as usize);
        for task_id in 0..self.config.channels {
            starts.push(self.restart_seqno(task_id)?);
        }
        self.start_tasks(&starts)
    }

    /// Starts every task at `seqno`.
    pub fn start_at(&self, seqno: u64) -> Result<()> {
        let starts = vec![seqno; self.config.channels as usize];
        self.start_tasks(&starts)
    }

    fn start_tasks(&self, starts: &[u64]) -> Result<()> {
        let mut tasks = self.tasks_mut();
        if !tasks.is_empty() {
            return Err(ThlError::Config("parallel queue already started".into()));
        }
        for (task_id, &start) in (0u32..).zip(starts) {
            let task = ReadTask::new(task_id, &self.config, start);
            task.start(
                self.source.clone(),
                self.partitioner.clone(),
                self.head.clone(),
                start,
                self.config.sync_interval,
            );
            tasks.push(Arc::new(task));
        }
        tracing::info!("Started {} parallel readers", tasks.len());
        Ok(())
    }

    /// Stops every task, joining each within the join timeout.
    pub async fn stop(&self) {
        let tasks = std::mem::take(&mut *self.tasks_mut());
        for task in tasks {
            task.stop(self.join_timeout).await;
        }
    }

    pub fn task(&self, task_id: u32) -> Result<Arc<ReadTask>> {
        self.tasks()
            .get(task_id as usize)
            .cloned()
            .ok_or_else(|| ThlError::Config(format!("no parallel reader {}", task_id)))
    }

    pub async fn get(&self, task_id: u32) -> Result<ParallelEvent> {
        self.task(task_id)?.get().await
    }

    pub fn peek(&self, task_id: u32) -> Result<Option<ParallelEvent>> {
        Ok(self.task(task_id)?.peek())
    }

    pub fn size(&self, task_id: u32) -> Result<usize> {
        Ok(self.task(task_id)?.size())
    }

    /// Delivers `control` to every task.
    pub async fn put_control_event(&self, control: ControlEvent) {
        let tasks = self.tasks().clone();
        for task in tasks {
            task.put_control_event(control.clone()).await;
        }
    }

    pub fn stats(&self) -> Vec<ReadTaskStats> {
        self.tasks().iter().map(|task| task.stats()).collect()
    }
}
