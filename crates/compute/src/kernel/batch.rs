//! Timestamp-aligned batch dequeue.
//!
//! Takes one item per queue and accepts the batch once the spread of the
//! offset timestamps fits the interval. Otherwise the oldest item is freed
//! and only its queue is re-dequeued.

use std::sync::Arc;

use tracing::debug;

use stepd_core::{BufferHandle, Driver, Result, SchedError, StatusCode};
use stepd_sync::WaitCategory;

use super::{
    fail, resolve_model, wrong_params, BatchParams, KernelStep, RunContext, TaskDescriptor, TaskParams, WaitKey,
};
use crate::model::Model;
use crate::runtime::Runtime;

pub struct BatchDequeue {
    runtime: Arc<Runtime>,
}

/// Spread of `timestamps` after subtracting per-queue offsets, and the
/// index holding the minimum. Subtraction saturates at zero.
pub fn timestamp_spread(timestamps: &[u64], offsets: &[u64]) -> Option<(u64, usize)> {
    let adjusted: Vec<u64> = timestamps
        .iter()
        .enumerate()
        .map(|(i, ts)| ts.saturating_sub(offsets.get(i).copied().unwrap_or(0)))
        .collect();
    let max = *adjusted.iter().max()?;
    let (min_idx, min) = adjusted
        .iter()
        .enumerate()
        .min_by_key(|(_, ts)| **ts)?;
    Some((max - *min, min_idx))
}

enum Fill {
    Complete(Vec<BufferHandle>),
    Pending(u32),
}

impl BatchDequeue {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self { runtime }
    }

    fn check(params: &BatchParams) -> std::result::Result<(), String> {
        if params.queues.is_empty() {
            return Err("batch dequeue without input queues".into());
        }
        if !params.offsets.is_empty() && params.offsets.len() != params.queues.len() {
            return Err(format!(
                "{} offsets for {} queues",
                params.offsets.len(),
                params.queues.len()
            ));
        }
        Ok(())
    }

    /// Dequeue into every empty slot. Stops at the first queue that is
    /// still empty after consulting its not-empty wait.
    fn fill(&self, model: &Model, params: &BatchParams, ctx: &RunContext) -> Result<Fill> {
        let driver = self.runtime.driver();
        let not_empty = self.runtime.waits.get(WaitCategory::QueueNotEmpty);
        let mut state = model.state();
        if state.partial_batch.len() != params.queues.len() {
            let stale: Vec<BufferHandle> = state.partial_batch.drain(..).flatten().collect();
            for handle in stale {
                self.runtime.buffers.free_owned(model.id(), handle)?;
            }
            state.partial_batch = vec![None; params.queues.len()];
        }

        for (idx, route) in params.queues.iter().enumerate() {
            while state.partial_batch[idx].is_none() {
                if model.is_destroying() {
                    return Err(SchedError::ModelUnloaded(model.id()));
                }
                let item = if route.remote {
                    driver.dequeue_remote(route.queue_id)?
                } else {
                    driver.dequeue(route.queue_id)?
                };
                match item {
                    Some(handle) => {
                        self.runtime.buffers.own(handle, model.id())?;
                        state.partial_batch[idx] = Some(handle);
                    }
                    None => {
                        if not_empty.wait_or_consume(route.queue_id.0, ctx.stream_id)? {
                            return Ok(Fill::Pending(route.queue_id.0));
                        }
                    }
                }
            }
        }
        Ok(Fill::Complete(state.partial_batch.iter().flatten().copied().collect()))
    }

    fn run(&self, model: &Model, params: &BatchParams, ctx: &mut RunContext) -> Result<StatusCode> {
        loop {
            let items = match self.fill(model, params, ctx)? {
                Fill::Complete(items) => items,
                Fill::Pending(queue) => {
                    debug!(model = %model.id(), queue, "batch queue empty, pending");
                    ctx.pend(WaitKey::new(WaitCategory::QueueNotEmpty, queue));
                    return Ok(StatusCode::Ok);
                }
            };

            let timestamps = items
                .iter()
                .map(|h| self.runtime.driver().header(*h).map(|hdr| hdr.timestamp))
                .collect::<std::result::Result<Vec<u64>, _>>()?;
            let Some((spread, min_idx)) = timestamp_spread(&timestamps, &params.offsets) else {
                return Err(SchedError::Inner("empty batch".into()));
            };

            let mut state = model.state();
            if spread <= params.interval {
                debug!(model = %model.id(), spread, "batch aligned");
                state.partial_batch.clear();
                state.batch_output = items;
                state.enqueue_progress = 0;
                return Ok(StatusCode::Ok);
            }

            let oldest = state.partial_batch[min_idx].take();
            drop(state);
            if let Some(handle) = oldest {
                debug!(
                    model = %model.id(),
                    queue_index = min_idx,
                    timestamp = timestamps[min_idx],
                    spread,
                    interval = params.interval,
                    "discarding oldest item of misaligned batch"
                );
                self.runtime.buffers.free_owned(model.id(), handle)?;
            }
        }
    }
}

impl KernelStep for BatchDequeue {
    fn name(&self) -> &'static str {
        "batch_dequeue"
    }

    fn compute(&self, task: &TaskDescriptor, ctx: &mut RunContext) -> StatusCode {
        let TaskParams::BatchDequeue(params) = &task.params else {
            return wrong_params(self.name(), task);
        };
        if let Err(reason) = Self::check(params) {
            return fail(self.name(), ctx, SchedError::ParameterInvalid(reason));
        }
        let model = match resolve_model(&self.runtime, task, ctx) {
            Ok(model) => model,
            Err(status) => return status,
        };
        match self.run(&model, params, ctx) {
            Ok(status) => status,
            Err(e) => fail(self.name(), ctx, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use stepd_core::{BufferHeader, ModelId, QueueId, SimDriver};

    use super::super::testutil::*;
    use super::super::QueueRoute;
    use super::*;

    fn batch_task(queues: &[u32], interval: u64) -> TaskDescriptor {
        TaskDescriptor::new(
            0,
            ModelId(0),
            TaskParams::BatchDequeue(BatchParams {
                queues: queues.iter().map(|q| QueueRoute::local(QueueId(*q))).collect(),
                offsets: vec![],
                interval,
            }),
        )
    }

    fn push_ts(driver: &SimDriver, queue: u32, ts: u64) -> BufferHandle {
        driver
            .push(QueueId(queue), BufferHeader::default().with_timestamp(ts))
            .unwrap()
    }

    #[test]
    fn spread_uses_offsets_and_saturates() {
        assert_eq!(timestamp_spread(&[10, 12, 50], &[]), Some((40, 0)));
        assert_eq!(timestamp_spread(&[110, 12], &[100, 0]), Some((2, 0)));
        assert_eq!(timestamp_spread(&[3, 9], &[10, 0]), Some((9, 0)));
        assert_eq!(timestamp_spread(&[], &[]), None);
    }

    #[test]
    fn aligned_batch_is_accepted() {
        let (driver, runtime) = runtime();
        let model = load(&runtime, 0, &[1, 2]);
        driver.add_queue(QueueId(1));
        driver.add_queue(QueueId(2));
        let a = push_ts(&driver, 1, 100);
        let b = push_ts(&driver, 2, 103);

        let mut c = ctx(0, 0);
        assert_eq!(BatchDequeue::new(runtime).compute(&batch_task(&[1, 2], 5), &mut c), StatusCode::Ok);
        assert_eq!(model.batch_output(), vec![a, b]);
    }

    #[test]
    fn oldest_item_is_discarded_until_aligned() {
        let (driver, runtime) = runtime();
        let model = load(&runtime, 0, &[1, 2, 3]);
        for q in 1..=3 {
            driver.add_queue(QueueId(q));
        }
        let t10 = push_ts(&driver, 1, 10);
        let t12 = push_ts(&driver, 2, 12);
        let t50 = push_ts(&driver, 3, 50);
        let t48 = push_ts(&driver, 1, 48);
        let t49 = push_ts(&driver, 2, 49);

        let mut c = ctx(0, 0);
        assert_eq!(BatchDequeue::new(runtime).compute(&batch_task(&[1, 2, 3], 5), &mut c), StatusCode::Ok);
        assert!(!c.pending);
        assert_eq!(driver.free_count(t10), 1);
        assert_eq!(driver.free_count(t12), 1);
        assert_eq!(driver.free_count(t50), 0);
        assert_eq!(model.batch_output(), vec![t48, t49, t50]);
    }

    #[test]
    fn misaligned_batch_pends_on_the_refetched_queue() {
        let (driver, runtime) = runtime();
        let model = load(&runtime, 0, &[1, 2, 3]);
        for q in 1..=3 {
            driver.add_queue(QueueId(q));
        }
        let t10 = push_ts(&driver, 1, 10);
        push_ts(&driver, 2, 12);
        let t50 = push_ts(&driver, 3, 50);
        let step = BatchDequeue::new(runtime);

        let mut c = ctx(0, 0);
        step.compute(&batch_task(&[1, 2, 3], 5), &mut c);
        assert!(c.pending);
        assert_eq!(c.waiting_on, Some(WaitKey::new(WaitCategory::QueueNotEmpty, 1)));
        assert_eq!(driver.free_count(t10), 1);
        assert!(driver.is_live(t50));
        assert_eq!(model.state().partial_batch.iter().flatten().count(), 2);

        push_ts(&driver, 1, 47);
        push_ts(&driver, 2, 48);
        let mut c = ctx(0, 0);
        step.compute(&batch_task(&[1, 2, 3], 5), &mut c);
        // 47 vs 12: discard 12, refetch 48.
        assert!(!c.pending);
        assert_eq!(model.batch_output().len(), 3);
        assert_eq!(driver.free_count(t50), 0);
    }

    #[test]
    fn destroying_model_exits_cleanly() {
        let (driver, runtime) = runtime();
        load(&runtime, 0, &[1]);
        driver.add_queue(QueueId(1));
        let task = batch_task(&[1], 5);
        runtime.models.unload(ModelId(0)).unwrap();

        let mut c = ctx(0, 0);
        assert_eq!(BatchDequeue::new(runtime).compute(&task, &mut c), StatusCode::ModelUnload);
    }

    #[test]
    fn mismatched_offsets_are_rejected() {
        let (_driver, runtime) = runtime();
        load(&runtime, 0, &[]);
        let task = TaskDescriptor::new(
            0,
            ModelId(0),
            TaskParams::BatchDequeue(BatchParams {
                queues: vec![QueueRoute::local(QueueId(1))],
                offsets: vec![1, 2],
                interval: 0,
            }),
        );
        let mut c = ctx(0, 0);
        assert_eq!(BatchDequeue::new(runtime).compute(&task, &mut c), StatusCode::ParameterInvalid);
    }
}
