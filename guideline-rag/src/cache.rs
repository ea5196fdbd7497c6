use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};

use crate::{fingerprint::Fingerprint, models::StructuredAnswer};

/// A cached answer and when it was stored.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub answer: StructuredAnswer,
    pub inserted_at: DateTime<Utc>,
    last_used: u64,
}

#[derive(Debug, Default)]
struct LruState {
    entries: HashMap<Fingerprint, CacheEntry>,
    /// usage tick -> key, oldest first
    order: BTreeMap<u64, Fingerprint>,
    tick: u64,
}

impl LruState {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
}

/// Bounded least-recently-used cache of validated answers.
///
/// Every `get` and `put` runs as one critical section with no await point
/// inside, so recency order stays consistent under concurrent requests.
#[derive(Debug)]
pub struct ResponseCache {
    capacity: usize,
    state: Mutex<LruState>,
}

impl ResponseCache {
    /// A capacity of zero disables caching.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(LruState::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns a clone of the cached entry and marks it most recently used.
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let tick = state.next_tick();
        let entry = state.entries.get_mut(fingerprint)?;
        let previous = std::mem::replace(&mut entry.last_used, tick);
        let hit = entry.clone();
        state.order.remove(&previous);
        state.order.insert(tick, fingerprint.clone());
        Some(hit)
    }

    /// Stores `answer`, returning the key evicted to make room, if any.
    pub fn put(&self, fingerprint: Fingerprint, answer: StructuredAnswer) -> Option<Fingerprint> {
        if self.capacity == 0 {
            return None;
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let tick = state.next_tick();

        if let Some(entry) = state.entries.get_mut(&fingerprint) {
            let previous = std::mem::replace(&mut entry.last_used, tick);
            entry.answer = answer;
            entry.inserted_at = Utc::now();
            state.order.remove(&previous);
            state.order.insert(tick, fingerprint);
            return None;
        }

        state.entries.insert(
            fingerprint.clone(),
            CacheEntry {
                answer,
                inserted_at: Utc::now(),
                last_used: tick,
            },
        );
        state.order.insert(tick, fingerprint);

        if state.entries.len() > self.capacity {
            let (_, oldest) = state.order.pop_first()?;
            state.entries.remove(&oldest);
            return Some(oldest);
        }
        None
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .contains_key(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.entries.clear();
        state.order.clear();
    }
}
