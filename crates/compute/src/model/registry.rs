use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use stepd_core::{ModelId, QueueId, Result, SchedError, StreamId, TableId};
use stepd_sync::{BufferOwnershipTracker, TableLockRegistry, WaitCategory, WaitHub};

use super::{Model, ModelSpec};

#[derive(Debug, Default)]
struct RegistryInner {
    models: HashMap<ModelId, Arc<Model>>,
    queue_owner: HashMap<QueueId, ModelId>,
}

/// Loaded models by id, plus the teardown sequence that returns everything a
/// model held.
#[derive(Debug)]
pub struct ModelRegistry {
    waits: Arc<WaitHub>,
    tables: Arc<TableLockRegistry>,
    buffers: Arc<BufferOwnershipTracker>,
    inner: RwLock<RegistryInner>,
}

impl ModelRegistry {
    pub fn new(
        waits: Arc<WaitHub>,
        tables: Arc<TableLockRegistry>,
        buffers: Arc<BufferOwnershipTracker>,
    ) -> Self {
        Self {
            waits,
            tables,
            buffers,
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    fn check_spec(&self, id: ModelId, spec: &ModelSpec) -> Result<()> {
        let model_cap = self.waits.get(WaitCategory::EndGraph).capacity();
        if id.index() >= model_cap {
            return Err(SchedError::ParameterInvalid(format!(
                "{} exceeds max model count {}",
                id, model_cap
            )));
        }
        let notify_cap = self.waits.get(WaitCategory::Notify).capacity();
        if let Some(n) = spec.notify_ids.iter().find(|n| n.index() >= notify_cap) {
            return Err(SchedError::ParameterInvalid(format!(
                "{} of {} exceeds max notify count {}",
                n, id, notify_cap
            )));
        }
        let queue_cap = self.waits.get(WaitCategory::QueueNotEmpty).capacity();
        if let Some(q) = spec.queue_ids().find(|q| q.index() >= queue_cap) {
            return Err(SchedError::ParameterInvalid(format!(
                "{} of {} exceeds max queue count {}",
                q, id, queue_cap
            )));
        }
        Ok(())
    }

    pub fn load(&self, id: ModelId, spec: ModelSpec) -> Result<Arc<Model>> {
        self.check_spec(id, &spec)?;
        let mut inner = self.inner.write();
        if inner.models.contains_key(&id) {
            return Err(SchedError::ParameterInvalid(format!("{} is already loaded", id)));
        }
        for q in &spec.input_queues {
            if let Some(owner) = inner.queue_owner.insert(*q, id) {
                warn!(queue = %q, previous = %owner, model = %id, "input queue reassigned");
            }
        }
        let model = Arc::new(Model::new(id, spec));
        inner.models.insert(id, Arc::clone(&model));
        info!(model = %id, "model loaded");
        Ok(model)
    }

    pub fn get(&self, id: ModelId) -> Option<Arc<Model>> {
        self.inner.read().models.get(&id).cloned()
    }

    pub fn model_ids(&self) -> Vec<ModelId> {
        let mut ids: Vec<_> = self.inner.read().models.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.inner.read().models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Models whose current lock attempt is on `table`.
    pub fn models_trying_table(&self, table: TableId) -> Vec<ModelId> {
        let models: Vec<Arc<Model>> = self.inner.read().models.values().cloned().collect();
        let mut ids: Vec<ModelId> = models
            .iter()
            .filter(|m| m.tried_lock() == Some(table))
            .map(|m| m.id())
            .collect();
        ids.sort();
        ids
    }

    pub fn model_by_queue(&self, queue: QueueId) -> Option<ModelId> {
        self.inner.read().queue_owner.get(&queue).copied()
    }

    /// Announce a table release to every model trying `table`, returning the
    /// streams to resume.
    pub fn announce_table_unlock(&self, table: TableId) -> Vec<StreamId> {
        let coordinator = self.waits.get(WaitCategory::TableUnlock);
        self.models_trying_table(table)
            .into_iter()
            .filter_map(|m| match coordinator.announce(m.0) {
                Ok(waiter) => waiter,
                Err(e) => {
                    warn!(model = %m, %table, error = %e, "table unlock announce failed");
                    None
                }
            })
            .collect()
    }

    /// Tear a model down.
    ///
    /// Marks it destroying, clears every wait it could be registered on,
    /// releases its table locks, frees its cached gather items and finally
    /// every buffer it still owns. Returns streams of other models woken by
    /// the released locks.
    pub fn unload(&self, id: ModelId) -> Result<Vec<StreamId>> {
        let model = {
            let mut inner = self.inner.write();
            let model = inner
                .models
                .remove(&id)
                .ok_or(SchedError::ModelUnloaded(id))?;
            inner.queue_owner.retain(|_, owner| *owner != id);
            model
        };
        model.mark_destroying();
        info!(model = %id, "unloading model");

        self.clear_waits(&model);

        let (held, tried) = {
            let mut locks = model.locks();
            (std::mem::take(&mut locks.held), locks.tried.take())
        };
        let mut released = BTreeSet::new();
        for ((table, kind), count) in held {
            for _ in 0..count {
                self.tables.unlock(table, kind);
            }
            debug!(model = %id, %table, ?kind, count, "released held table lock");
            released.insert(table);
        }
        if let Some(table) = tried {
            debug!(model = %id, %table, "dropped pending lock attempt");
        }
        let woken: Vec<StreamId> = released
            .into_iter()
            .flat_map(|t| self.announce_table_unlock(t))
            .collect();

        let cached = {
            let mut state = model.state();
            state.partial_batch.clear();
            state.batch_output.clear();
            state.enqueue_progress = 0;
            state.cursor = 0;
            state.gather.drain()
        };
        for handle in cached {
            if let Err(e) = self.buffers.free_owned(id, handle) {
                warn!(model = %id, %handle, error = %e, "free of cached gather item failed");
            }
        }

        self.buffers.release_model(id)?;
        info!(model = %id, woken = woken.len(), "model unloaded");
        Ok(woken)
    }

    fn clear_waits(&self, model: &Model) {
        let model_ids = [model.id().0];
        let notify_ids: Vec<u32> = model.spec().notify_ids.iter().map(|n| n.0).collect();
        let queue_ids: Vec<u32> = model.spec().queue_ids().map(|q| q.0).collect();
        for category in WaitCategory::ALL {
            let ids: &[u32] = match category {
                WaitCategory::Notify => &notify_ids,
                WaitCategory::QueueNotEmpty | WaitCategory::QueueNotFull => &queue_ids,
                WaitCategory::EndGraph
                | WaitCategory::PrepareMem
                | WaitCategory::AnyQueueNotEmpty
                | WaitCategory::TableUnlock => &model_ids,
            };
            if let Err(e) = self.waits.get(category).clear_batch(ids) {
                warn!(model = %model.id(), %category, error = %e, "clearing waits failed");
            }
        }
    }
}
