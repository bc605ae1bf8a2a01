// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Output queue of one parallel reader.
//!
//! Data events arrive in log order, already filtered to this reader's
//! partition. Control events are not partitioned: one targeted at seqno S
//! is only placed in the queue after the reader has passed S with no
//! fragment open. Until then it waits in a bounded pending buffer.

use std::collections::VecDeque;

use tokio::sync::{Mutex, Notify};

use thl::event::LogEvent;

use super::queue::BoundedQueue;
use super::{ControlEvent, ParallelEvent};

#[derive(Debug)]
struct ReadState {
    /// Last seqno read from the log, whether kept or discarded.
    read_seqno: Option<u64>,
    last_frag: bool,
    pending: VecDeque<ControlEvent>,
}

impl ReadState {
    fn passed(&self, seqno: u64) -> bool {
        self.last_frag && self.read_seqno.is_some_and(|read| read >= seqno)
    }
}

pub struct ReadQueue {
    queue: BoundedQueue<ParallelEvent>,
    state: Mutex<ReadState>,
    max_control_events: usize,
    pending_space: Notify,
}

impl ReadQueue {
    /// `start_seqno` is the first seqno this reader will see.
    pub fn new(capacity: usize, max_control_events: usize, start_seqno: u64) -> Self {
        Self {
            queue: BoundedQueue::new(capacity),
            state: Mutex::new(ReadState {
                read_seqno: start_seqno.checked_sub(1),
                last_frag: true,
                pending: VecDeque::new(),
            }),
            max_control_events: max_control_events.max(1),
            pending_space: Notify::new(),
        }
    }

    /// Enqueues a data event, then releases control events it made due.
    pub async fn post(&self, event: LogEvent) {
        let mut state = self.state.lock().await;
        let (seqno, last_frag) = (event.end_seqno(), event.last_frag);
        self.queue.put(ParallelEvent::Data(event)).await;
        state.read_seqno = Some(seqno);
        state.last_frag = last_frag;
        self.release(&mut state).await;
    }

    /// Records that the reader moved past an event it did not keep.
    pub async fn sync(&self, seqno: u64, last_frag: bool) {
        let mut state = self.state.lock().await;
        state.read_seqno = Some(seqno);
        state.last_frag = last_frag;
        self.release(&mut state).await;
    }

    async fn release(&self, state: &mut ReadState) {
        let mut released = false;
        while state
            .pending
            .front()
            .is_some_and(|control| state.passed(control.seqno))
        {
            if let Some(control) = state.pending.pop_front() {
                tracing::debug!("Releasing held {:?} control event at seqno {}", control.kind, control.seqno);
                self.queue.put(ParallelEvent::Control(control)).await;
                released = true;
            }
        }
        if released {
            self.pending_space.notify_waiters();
        }
    }

    /// Places `control` in the queue now if the reader has passed its seqno,
    /// otherwise holds it back. Waits while the pending buffer is full.
    pub async fn post_out_of_band(&self, control: ControlEvent) {
        loop {
            let space = self.pending_space.notified();
            {
                let mut state = self.state.lock().await;
                if state.pending.is_empty() && state.passed(control.seqno) {
                    self.queue.put(ParallelEvent::Control(control)).await;
                    return;
                }
                if state.pending.len() < self.max_control_events {
                    state.pending.push_back(control);
                    return;
                }
            }
            space.await;
        }
    }

    pub async fn take(&self) -> ParallelEvent {
        self.queue.take().await
    }

    pub fn peek(&self) -> Option<ParallelEvent> {
        self.queue.peek()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub async fn pending_control_events(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn read_position(&self) -> (Option<u64>, bool) {
        let state = self.state.lock().await;
        (state.read_seqno, state.last_frag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parallel::ControlKind;

    fn data(seqno: u64, fragno: u16, last_frag: bool) -> LogEvent {
        LogEvent::new(seqno, fragno, last_frag, "src", 1, "", vec![])
    }

    async fn drain(queue: &ReadQueue) -> Vec<String> {
        let mut out = Vec::new();
        while !queue.is_empty() {
            out.push(match queue.take().await {
                ParallelEvent::Data(e) => format!("d{}.{}", e.seqno, e.fragno),
                ParallelEvent::Control(c) => format!("c{}", c.seqno),
            });
        }
        out
    }

    #[tokio::test]
    async fn test_control_waits_for_last_fragment() {
        let queue = ReadQueue::new(16, 4, 1);
        queue.post(data(1, 0, true)).await;
        queue.post(data(2, 0, false)).await;
        queue
            .post_out_of_band(ControlEvent::new(ControlKind::Sync, 2))
            .await;
        assert_eq!(queue.pending_control_events().await, 1);

        queue.post(data(2, 1, true)).await;
        assert_eq!(queue.pending_control_events().await, 0);
        assert_eq!(drain(&queue).await, vec!["d1.0", "d2.0", "d2.1", "c2"]);
    }

    #[tokio::test]
    async fn test_sync_releases_control_for_foreign_seqno() {
        let queue = ReadQueue::new(16, 4, 1);
        queue
            .post_out_of_band(ControlEvent::new(ControlKind::Stop, 3))
            .await;
        queue.post(data(1, 0, true)).await;
        queue.sync(2, true).await;
        assert_eq!(queue.len(), 1);
        queue.sync(3, true).await;
        assert_eq!(drain(&queue).await, vec!["d1.0", "c3"]);
    }

    #[tokio::test]
    async fn test_passed_control_goes_straight_in() {
        let queue = ReadQueue::new(16, 4, 5);
        queue
            .post_out_of_band(ControlEvent::new(ControlKind::Sync, 4))
            .await;
        assert_eq!(drain(&queue).await, vec!["c4"]);
    }
}
