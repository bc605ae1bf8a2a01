// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Recently stored events, keyed by seqno.
//!
//! Only unfragmented transactions are cached. The cache is a hint: a miss
//! always falls through to the store, and entries are evicted oldest first
//! once the capacity is reached.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use rustc_hash::FxHashMap;
use serde::Serialize;

use thl::event::LogEvent;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Default)]
struct CacheState {
    order: VecDeque<u64>,
    events: FxHashMap<u64, LogEvent>,
    hits: u64,
    misses: u64,
}

pub struct EventsCache {
    capacity: usize,
    state: Mutex<CacheState>,
}

impl EventsCache {
    /// A capacity of 0 disables caching.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(CacheState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn put(&self, event: &LogEvent) {
        if self.capacity == 0 || !event.is_unfragmented() {
            return;
        }
        let mut state = self.lock();
        if state.events.insert(event.seqno, event.clone()).is_none() {
            state.order.push_back(event.seqno);
        }
        while state.order.len() > self.capacity {
            if let Some(oldest) = state.order.pop_front() {
                state.events.remove(&oldest);
            }
        }
    }

    pub fn get(&self, seqno: u64) -> Option<LogEvent> {
        if self.capacity == 0 {
            return None;
        }
        let mut state = self.lock();
        let found = state.events.get(&seqno).cloned();
        if found.is_some() {
            state.hits += 1;
        } else {
            state.misses += 1;
        }
        found
    }

    /// Forgets `seqno`, e.g. after its status changed in the store.
    pub fn remove(&self, seqno: u64) {
        let mut state = self.lock();
        if state.events.remove(&seqno).is_some() {
            state.order.retain(|s| *s != seqno);
        }
    }

    /// Drops everything, e.g. after a purge rewrote the log.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.order.clear();
        state.events.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        CacheStats {
            entries: state.events.len(),
            capacity: self.capacity,
            hits: state.hits,
            misses: state.misses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(seqno: u64, fragno: u16, last_frag: bool) -> LogEvent {
        LogEvent::new(seqno, fragno, last_frag, "src", 1, "", vec![seqno as u8])
    }

    #[test]
    fn test_evicts_oldest() {
        let cache = EventsCache::new(2);
        cache.put(&event(1, 0, true));
        cache.put(&event(2, 0, true));
        cache.put(&event(3, 0, true));
        assert!(cache.get(1).is_none());
        assert_eq!(cache.get(3).unwrap().seqno, 3);
        assert_eq!(cache.stats().entries, 2);
    }

    #[test]
    fn test_fragments_not_cached() {
        let cache = EventsCache::new(4);
        cache.put(&event(1, 0, false));
        cache.put(&event(1, 1, true));
        assert!(cache.get(1).is_none());
    }

    #[test]
    fn test_remove_frees_slot() {
        let cache = EventsCache::new(2);
        cache.put(&event(1, 0, true));
        cache.put(&event(2, 0, true));
        cache.remove(1);
        cache.put(&event(3, 0, true));
        assert!(cache.get(1).is_none());
        assert!(cache.get(2).is_some());
        assert!(cache.get(3).is_some());
    }

    #[test]
    fn test_zero_capacity_disables() {
        let cache = EventsCache::new(0);
        cache.put(&event(1, 0, true));
        assert!(cache.get(1).is_none());
        assert_eq!(cache.stats().misses, 0);
    }
}
