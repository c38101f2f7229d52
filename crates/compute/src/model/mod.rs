//! Loaded models and the per-model state kernel steps resume from.

pub mod gather_store;
pub mod registry;

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use stepd_core::{BufferHandle, ModelId, NotifyId, QueueId, TableId};
use stepd_sync::LockKind;

pub use gather_store::{GatherKey, GatherStore, SelectLimits, Selection};
pub use registry::ModelRegistry;

/// Static description of a model supplied at load time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    #[serde(default)]
    pub notify_ids: Vec<NotifyId>,
    /// Queues the model consumes; each maps back to this model for
    /// any-queue-not-empty wakeups.
    #[serde(default)]
    pub input_queues: Vec<QueueId>,
    #[serde(default)]
    pub output_queues: Vec<QueueId>,
}

impl ModelSpec {
    pub fn queue_ids(&self) -> impl Iterator<Item = QueueId> + '_ {
        self.input_queues.iter().chain(self.output_queues.iter()).copied()
    }
}

/// Table locks a model holds or is trying to take.
#[derive(Debug, Default)]
pub struct LockRecord {
    pub tried: Option<TableId>,
    pub held: BTreeMap<(TableId, LockKind), u32>,
}

impl LockRecord {
    pub fn record_held(&mut self, table: TableId, kind: LockKind) {
        *self.held.entry((table, kind)).or_default() += 1;
    }

    /// Drop one hold. Returns false if none was recorded.
    pub fn clear_held(&mut self, table: TableId, kind: LockKind) -> bool {
        match self.held.get_mut(&(table, kind)) {
            Some(count) if *count > 1 => {
                *count -= 1;
                true
            }
            Some(_) => {
                self.held.remove(&(table, kind));
                true
            }
            None => false,
        }
    }

    pub fn is_held(&self, table: TableId, kind: LockKind) -> bool {
        self.held.contains_key(&(table, kind))
    }
}

/// Partial progress of multi-item steps, kept across pend/resume.
#[derive(Debug, Default)]
pub struct ModelState {
    pub gather: GatherStore,
    /// Next queue index the gather sweep starts from.
    pub cursor: usize,
    /// One slot per batch-dequeue queue.
    pub partial_batch: Vec<Option<BufferHandle>>,
    /// Last produced batch, waiting for the enqueue step.
    pub batch_output: Vec<BufferHandle>,
    /// Items of `batch_output` already handed to their queue.
    pub enqueue_progress: usize,
}

#[derive(Debug)]
pub struct Model {
    id: ModelId,
    spec: ModelSpec,
    destroying: AtomicBool,
    locks: Mutex<LockRecord>,
    state: Mutex<ModelState>,
    exceptions: Mutex<HashSet<u64>>,
}

impl Model {
    pub fn new(id: ModelId, spec: ModelSpec) -> Self {
        Self {
            id,
            spec,
            destroying: AtomicBool::new(false),
            locks: Mutex::new(LockRecord::default()),
            state: Mutex::new(ModelState::default()),
            exceptions: Mutex::new(HashSet::new()),
        }
    }

    pub fn id(&self) -> ModelId {
        self.id
    }

    pub fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    pub fn is_destroying(&self) -> bool {
        self.destroying.load(Ordering::Acquire)
    }

    pub(crate) fn mark_destroying(&self) {
        self.destroying.store(true, Ordering::Release);
    }

    pub fn locks(&self) -> MutexGuard<'_, LockRecord> {
        self.locks.lock()
    }

    pub fn state(&self) -> MutexGuard<'_, ModelState> {
        self.state.lock()
    }

    pub fn tried_lock(&self) -> Option<TableId> {
        self.locks.lock().tried
    }

    /// Mark a transaction as failed; its gather items are discarded.
    pub fn mark_exception(&self, trans_id: u64) {
        self.exceptions.lock().insert(trans_id);
    }

    pub fn is_exception(&self, trans_id: u64) -> bool {
        self.exceptions.lock().contains(&trans_id)
    }

    pub fn exception_ids(&self) -> Vec<u64> {
        self.exceptions.lock().iter().copied().collect()
    }

    /// Take the last produced batch, leaving none.
    pub fn take_batch_output(&self) -> Vec<BufferHandle> {
        let mut state = self.state.lock();
        state.enqueue_progress = 0;
        std::mem::take(&mut state.batch_output)
    }

    pub fn batch_output(&self) -> Vec<BufferHandle> {
        self.state.lock().batch_output.clone()
    }
}
