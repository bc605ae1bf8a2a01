// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Bounded FIFO with blocking put/take and non-blocking peek.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::Notify;

pub struct BoundedQueue<T> {
    capacity: usize,
    items: Mutex<VecDeque<T>>,
    not_empty: Notify,
    not_full: Notify,
}

impl<T: Clone> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Appends `item`, waiting while the queue is full.
    pub async fn put(&self, item: T) {
        let mut item = Some(item);
        loop {
            let notified = self.not_full.notified();
            {
                let mut items = self.lock();
                if items.len() < self.capacity {
                    if let Some(item) = item.take() {
                        items.push_back(item);
                    }
                    drop(items);
                    self.not_empty.notify_one();
                    return;
                }
            }
            notified.await;
        }
    }

    /// Removes the head, waiting while the queue is empty.
    pub async fn take(&self) -> T {
        loop {
            let notified = self.not_empty.notified();
            {
                let mut items = self.lock();
                if let Some(item) = items.pop_front() {
                    let more = !items.is_empty();
                    drop(items);
                    self.not_full.notify_one();
                    if more {
                        self.not_empty.notify_one();
                    }
                    return item;
                }
            }
            notified.await;
        }
    }

    pub fn peek(&self) -> Option<T> {
        self.lock().front().cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
