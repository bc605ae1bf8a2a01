// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Monotonic watermark that tasks can wait on.
//!
//! Used as the facade's sequencer (highest committed fragment) and as the
//! head position that bounds the parallel readers.

use std::time::Duration;

use tokio::sync::watch;

use thl::error::{Result, ThlError};

#[derive(Debug)]
pub struct Watermark<T> {
    tx: watch::Sender<T>,
}

impl<T> Watermark<T>
where
    T: Ord + Copy + Send + Sync + std::fmt::Debug,
{
    pub fn new(initial: T) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    /// Moves the watermark forward. Values at or below the current one are
    /// ignored. Returns whether the watermark moved.
    pub fn advance(&self, value: T) -> bool {
        self.tx.send_if_modified(|current| {
            if value > *current {
                *current = value;
                true
            } else {
                false
            }
        })
    }

    pub fn current(&self) -> T {
        *self.tx.borrow()
    }

    /// Resolves once the watermark reaches `target`.
    pub async fn wait_at_least(&self, target: T) -> T {
        let mut rx = self.tx.subscribe();
        let reached = match rx.wait_for(|v| *v >= target).await {
            Ok(v) => *v,
            // The sender lives in `self`, so the channel cannot close here.
            Err(_) => self.current(),
        };
        reached
    }

    /// As [`Self::wait_at_least`], failing with `Timeout` after `timeout`.
    pub async fn wait_at_least_for(&self, target: T, timeout: Duration) -> Result<T> {
        tokio::time::timeout(timeout, self.wait_at_least(target))
            .await
            .map_err(|_| ThlError::Timeout {
                what: format!("watermark to reach {:?}", target),
                waited: timeout,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_advance_is_monotonic() {
        let mark = Watermark::new(5u64);
        assert!(!mark.advance(3));
        assert!(!mark.advance(5));
        assert!(mark.advance(9));
        assert_eq!(mark.current(), 9);
    }

    #[tokio::test]
    async fn test_waiter_released_by_advance() {
        let mark = Arc::new(Watermark::new(None::<u64>));
        let waiter = {
            let mark = mark.clone();
            tokio::spawn(async move { mark.wait_at_least(Some(2)).await })
        };
        mark.advance(Some(1));
        mark.advance(Some(3));
        assert_eq!(waiter.await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let mark = Watermark::new(0u64);
        let err = mark
            .wait_at_least_for(1, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, ThlError::Timeout { .. }));
    }
}
