//! Per-model cache of dequeued-but-unmatched gather items.
//!
//! Items are keyed by `(trans_id, route_label)`; each key keeps one FIFO per
//! gathered queue and the instant the key was first seen. Selection prefers
//! the lowest complete key and otherwise forces out an incomplete one when
//! the cache is over capacity or a key has aged past the timeout.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use stepd_core::BufferHandle;

pub type GatherKey = (u64, u32);

#[derive(Debug)]
struct KeyStore {
    slots: Vec<VecDeque<BufferHandle>>,
    born: Instant,
}

impl KeyStore {
    fn new(queue_count: usize, born: Instant) -> Self {
        Self {
            slots: vec![VecDeque::new(); queue_count],
            born,
        }
    }

    fn is_ready(&self) -> bool {
        self.slots.iter().all(|s| !s.is_empty())
    }

    fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| s.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    Unselected,
    /// Every slot of `key` had an item.
    Selected {
        key: GatherKey,
        items: Vec<BufferHandle>,
    },
    /// An incomplete set forced out; `None` marks a missing slot.
    FakeSelected {
        key: GatherKey,
        items: Vec<Option<BufferHandle>>,
    },
}

/// Force-out thresholds. Zero disables each.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectLimits {
    pub timeout: Duration,
    pub cache_num: u32,
}

#[derive(Debug, Default)]
pub struct GatherStore {
    entries: BTreeMap<GatherKey, KeyStore>,
}

impl GatherStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `handle` to slot `queue_index` of `key`.
    pub fn store(&mut self, key: GatherKey, queue_index: usize, queue_count: usize, handle: BufferHandle, now: Instant) {
        let entry = self
            .entries
            .entry(key)
            .or_insert_with(|| KeyStore::new(queue_count, now));
        if entry.slots.len() < queue_count {
            entry.slots.resize(queue_count, VecDeque::new());
        }
        entry.slots[queue_index].push_back(handle);
    }

    pub fn select(&mut self, now: Instant, limits: SelectLimits) -> Selection {
        let ready = self
            .entries
            .iter()
            .find(|(_, store)| store.is_ready())
            .map(|(key, _)| *key);
        if let Some(key) = ready {
            let items = self.consume(key).into_iter().flatten().collect();
            return Selection::Selected { key, items };
        }

        let forced = if limits.cache_num > 0 && self.entries.len() > limits.cache_num as usize {
            self.entries.keys().next().copied()
        } else if !limits.timeout.is_zero() {
            self.entries
                .iter()
                .find(|(_, store)| now.saturating_duration_since(store.born) > limits.timeout)
                .map(|(key, _)| *key)
        } else {
            None
        };

        match forced {
            Some(key) => Selection::FakeSelected {
                key,
                items: self.consume(key),
            },
            None => Selection::Unselected,
        }
    }

    /// Pop the front of every slot of `key`, dropping the key once empty.
    fn consume(&mut self, key: GatherKey) -> Vec<Option<BufferHandle>> {
        let Some(store) = self.entries.get_mut(&key) else {
            return Vec::new();
        };
        let items = store.slots.iter_mut().map(|s| s.pop_front()).collect();
        if store.is_empty() {
            self.entries.remove(&key);
        }
        items
    }

    /// Remove every key of `trans_id`, returning the handles it held.
    pub fn remove_trans(&mut self, trans_id: u64) -> Vec<BufferHandle> {
        let keys: Vec<GatherKey> = self
            .entries
            .range((trans_id, 0)..=(trans_id, u32::MAX))
            .map(|(key, _)| *key)
            .collect();
        let mut handles = Vec::new();
        for key in keys {
            if let Some(store) = self.entries.remove(&key) {
                handles.extend(store.slots.into_iter().flatten());
            }
        }
        handles
    }

    /// Empty the store, returning every handle it held.
    pub fn drain(&mut self) -> Vec<BufferHandle> {
        std::mem::take(&mut self.entries)
            .into_values()
            .flat_map(|store| store.slots.into_iter().flatten())
            .collect()
    }

    pub fn key_count(&self) -> usize {
        self.entries.len()
    }

    pub fn item_count(&self) -> usize {
        self.entries
            .values()
            .map(|s| s.slots.iter().map(VecDeque::len).sum::<usize>())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
