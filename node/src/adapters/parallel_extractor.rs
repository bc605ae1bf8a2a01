// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! One partition of a [`ParallelQueue`] as an extractor.

use std::sync::Arc;

use async_trait::async_trait;

use thl::error::Result;
use thl::event::EventHeader;

use super::Extractor;
use crate::parallel::{ParallelEvent, ParallelQueue};

pub struct ParallelQueueExtractor {
    queue: Arc<ParallelQueue>,
    task_id: u32,
    last_event: Option<EventHeader>,
}

impl ParallelQueueExtractor {
    pub fn new(queue: Arc<ParallelQueue>, task_id: u32) -> Self {
        Self {
            queue,
            task_id,
            last_event: None,
        }
    }

    pub fn task_id(&self) -> u32 {
        self.task_id
    }

    pub fn last_event(&self) -> Option<&EventHeader> {
        self.last_event.as_ref()
    }
}

#[async_trait]
impl Extractor for ParallelQueueExtractor {
    /// Readers restart from their commit positions when the queue starts,
    /// so the header is only remembered.
    async fn set_last_event(&mut self, header: Option<EventHeader>) -> Result<()> {
        self.last_event = header;
        Ok(())
    }

    async fn extract(&mut self) -> Result<ParallelEvent> {
        let event = self.queue.get(self.task_id).await?;
        match &event {
            ParallelEvent::Data(data) => self.last_event = Some(data.header()),
            ParallelEvent::Control(control) => {
                if let Some(header) = &control.header {
                    self.last_event = Some(header.clone());
                }
            }
        }
        Ok(event)
    }
}
