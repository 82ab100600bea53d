use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
};

use super::{context::ContextState, reactive::Reactive};
use crate::models::ActionRecord;

/// Durable mirror the chain keeps informed. Both calls return immediately;
/// the backend owns reporting its own failures.
pub trait CacheBackend: Send + Sync {
    fn set(&self, record: &ActionRecord);
    fn remove(&self, record: &ActionRecord);
}

struct ChainInner {
    records: VecDeque<ActionRecord>,
    cache: Option<Arc<dyn CacheBackend>>,
}

/// Capacity-bounded, sequence-numbered action log.
///
/// Sequence assignment, eviction and republishing happen under one lock, so
/// concurrent appends never share or skip a sequence number.
pub struct TrackChain {
    capacity: usize,
    state: Arc<Reactive<ContextState>>,
    inner: Mutex<ChainInner>,
}

impl TrackChain {
    pub fn new(capacity: usize, state: Arc<Reactive<ContextState>>) -> Self {
        Self {
            capacity: capacity.max(1),
            state,
            inner: Mutex::new(ChainInner {
                records: VecDeque::with_capacity(capacity.max(1)),
                cache: None,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends `record` and returns the sequence number it was given.
    pub fn append(&self, record: ActionRecord) -> u64 {
        let mut guard = self.lock();
        self.push_locked(&mut guard, record)
    }

    /// Appends `record` only when the chain holds nothing yet. The emptiness
    /// check and the append share one lock, so no concurrent append can land
    /// in between.
    pub fn append_if_empty(&self, record: ActionRecord) -> Option<u64> {
        let mut guard = self.lock();
        if !guard.records.is_empty() {
            return None;
        }
        Some(self.push_locked(&mut guard, record))
    }

    fn push_locked(&self, inner: &mut ChainInner, mut record: ActionRecord) -> u64 {
        // Read before evicting so a capacity of one still counts upwards.
        let seq = inner.records.back().map_or(0, |last| last.action_seq) + 1;

        while inner.records.len() >= self.capacity {
            let Some(evicted) = inner.records.pop_front() else {
                break;
            };
            if let Some(cache) = &inner.cache {
                cache.remove(&evicted);
            }
        }

        record.action_seq = seq;
        if let Some(cache) = &inner.cache {
            cache.set(&record);
        }
        inner.records.push_back(record);
        self.publish(&inner.records);
        seq
    }

    /// Replaces the whole chain. The cache is not told.
    pub fn overwrite(&self, records: Vec<ActionRecord>) {
        let mut guard = self.lock();
        guard.records = VecDeque::from(records);
        self.publish(&guard.records);
    }

    pub fn register_cache(&self, cache: Arc<dyn CacheBackend>) {
        self.lock().cache = Some(cache);
    }

    pub fn snapshot(&self) -> Vec<ActionRecord> {
        self.lock().records.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    fn publish(&self, records: &VecDeque<ActionRecord>) {
        let snapshot: Vec<ActionRecord> = records.iter().cloned().collect();
        self.state.set(|state| state.track_data = snapshot);
    }

    fn lock(&self) -> MutexGuard<'_, ChainInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
