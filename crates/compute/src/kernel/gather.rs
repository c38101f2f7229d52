//! Multi-queue gather: one item per queue, aligned on transaction id and
//! route label.
//!
//! Dequeued items that do not complete a set yet are cached on the model
//! and survive pend/resume. Queues are polled round-robin from the model's
//! cursor so a stalled queue is not always polled first.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::MutexGuard;
use tracing::{debug, info, warn};

use stepd_core::{
    BufferHandle, BufferHeader, Driver, MismatchPolicy, Result, SchedError, StatusCode, DISCARD_RET_CODE,
};
use stepd_sync::WaitCategory;

use super::{
    fail, resolve_model, wrong_params, GatherParams, KernelStep, QueueRoute, RunContext, TaskDescriptor,
    TaskParams, WaitKey,
};
use crate::model::{GatherKey, Model, ModelState, SelectLimits, Selection};
use crate::runtime::Runtime;

pub struct GatherDequeue {
    runtime: Arc<Runtime>,
}

impl GatherDequeue {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self { runtime }
    }

    /// Number of gathered queues, or why the params are malformed.
    fn inputs(params: &GatherParams) -> std::result::Result<usize, String> {
        if params.queues.is_empty() {
            return Err("gather without input queues".into());
        }
        let k = params.inputs_count as usize;
        if k == 0 || k > params.queues.len() {
            return Err(format!(
                "inputs count {} outside 1..={}",
                k,
                params.queues.len()
            ));
        }
        Ok(k)
    }

    fn run(
        &self,
        model: &Model,
        routes: &[QueueRoute],
        limits: SelectLimits,
        policy: MismatchPolicy,
        ctx: &mut RunContext,
    ) -> Result<StatusCode> {
        let any_wait = self.runtime.waits.get(WaitCategory::AnyQueueNotEmpty);
        let wait_id = model.id().0;
        let mut state = model.state();
        loop {
            if model.is_destroying() {
                return Err(SchedError::ModelUnloaded(model.id()));
            }
            self.purge_exceptions(model, &mut state)?;

            match state.gather.select(Instant::now(), limits) {
                Selection::Selected { key, items } => {
                    debug!(model = %model.id(), trans_id = key.0, route_label = key.1, "gather selected");
                    state.batch_output = items;
                    state.enqueue_progress = 0;
                    return Ok(StatusCode::Ok);
                }
                Selection::FakeSelected { key, items } => match policy {
                    MismatchPolicy::Drop => {
                        let dropped = items.iter().flatten().count();
                        self.free_all(model, items.into_iter().flatten())?;
                        info!(
                            model = %model.id(),
                            trans_id = key.0,
                            route_label = key.1,
                            dropped,
                            "dropped incomplete gather set"
                        );
                        continue;
                    }
                    MismatchPolicy::Pad => {
                        state.batch_output = self.pad(model, key, items)?;
                        state.enqueue_progress = 0;
                        info!(
                            model = %model.id(),
                            trans_id = key.0,
                            route_label = key.1,
                            "padded incomplete gather set"
                        );
                        return Ok(StatusCode::DiscardData);
                    }
                },
                Selection::Unselected => {}
            }

            if let Some((idx, handle)) = self.dequeue_next(routes, &mut state)? {
                self.store(model, &mut state, routes.len(), idx, handle)?;
                continue;
            }

            if !any_wait.wait_or_consume(wait_id, ctx.stream_id)? {
                continue;
            }
            ctx.pend(WaitKey::new(WaitCategory::AnyQueueNotEmpty, wait_id));
            debug!(
                model = %model.id(),
                cached = state.gather.item_count(),
                "all gather queues empty, pending"
            );
            if model.is_destroying() {
                debug!(model = %model.id(), "model destroying, no supply request");
            } else {
                self.request_supply(routes);
            }
            return Ok(StatusCode::Ok);
        }
    }

    /// Free cached items of transactions marked as failed.
    fn purge_exceptions(&self, model: &Model, state: &mut MutexGuard<'_, ModelState>) -> Result<()> {
        let mut purged = Vec::new();
        for trans_id in model.exception_ids() {
            for handle in state.gather.remove_trans(trans_id) {
                debug!(model = %model.id(), trans_id, %handle, "discarding item of failed transaction");
                purged.push(handle);
            }
        }
        self.free_all(model, purged)
    }

    /// Free handles already taken out of the gather store. Every free is
    /// attempted; the first failure is reported afterwards.
    fn free_all(&self, model: &Model, handles: impl IntoIterator<Item = BufferHandle>) -> Result<()> {
        let mut first_err = None;
        for handle in handles {
            if let Err(e) = self.runtime.buffers.free_owned(model.id(), handle) {
                warn!(model = %model.id(), %handle, error = %e, "free of consumed gather item failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Dequeue one item from the first non-empty queue at or after the
    /// cursor. `None` when every queue is empty.
    fn dequeue_next(
        &self,
        routes: &[QueueRoute],
        state: &mut MutexGuard<'_, ModelState>,
    ) -> Result<Option<(usize, BufferHandle)>> {
        let driver = self.runtime.driver();
        let n = routes.len();
        for step in 0..n {
            let idx = (state.cursor + step) % n;
            let route = routes[idx];
            if driver.peek(route.queue_id)? == 0 {
                continue;
            }
            let item = if route.remote {
                driver.dequeue_remote(route.queue_id)?
            } else {
                driver.dequeue(route.queue_id)?
            };
            if let Some(handle) = item {
                state.cursor = (idx + 1) % n;
                return Ok(Some((idx, handle)));
            }
        }
        Ok(None)
    }

    fn store(
        &self,
        model: &Model,
        state: &mut MutexGuard<'_, ModelState>,
        queue_count: usize,
        idx: usize,
        handle: BufferHandle,
    ) -> Result<()> {
        let buffers = &self.runtime.buffers;
        buffers.own(handle, model.id())?;
        let header = match self.runtime.driver().header(handle) {
            Ok(header) => header,
            Err(e) => {
                buffers.free_owned(model.id(), handle)?;
                return Err(e.into());
            }
        };
        if model.is_exception(header.trans_id) {
            debug!(model = %model.id(), trans_id = header.trans_id, %handle, "discarding item of failed transaction");
            return buffers.free_owned(model.id(), handle);
        }
        state.gather.store(
            (header.trans_id, header.route_label),
            idx,
            queue_count,
            handle,
            Instant::now(),
        );
        debug!(
            model = %model.id(),
            queue_index = idx,
            trans_id = header.trans_id,
            route_label = header.route_label,
            "stored gather item"
        );
        Ok(())
    }

    /// Fill every missing slot with a zero-length placeholder tagged as
    /// discarded. On failure the whole set, placeholders included, is freed.
    fn pad(&self, model: &Model, key: GatherKey, items: Vec<Option<BufferHandle>>) -> Result<Vec<BufferHandle>> {
        let placeholder = BufferHeader {
            trans_id: key.0,
            route_label: key.1,
            timestamp: 0,
            ret_code: DISCARD_RET_CODE,
        };
        let mut batch = Vec::with_capacity(items.len());
        let mut failure: Option<SchedError> = None;
        for item in items {
            match item {
                Some(handle) => batch.push(handle),
                None if failure.is_none() => {
                    match self.runtime.buffers.allocate_and_own(0, model.id()) {
                        Ok(handle) => {
                            batch.push(handle);
                            if let Err(e) = self.runtime.driver().set_header(handle, &placeholder) {
                                failure = Some(e.into());
                            }
                        }
                        Err(e) => failure = Some(e),
                    }
                }
                None => {}
            }
        }
        match failure {
            None => Ok(batch),
            Some(e) => {
                warn!(model = %model.id(), trans_id = key.0, error = %e, "padding failed, freeing gather set");
                if let Err(free_err) = self.free_all(model, batch) {
                    debug!(model = %model.id(), error = %free_err, "free after padding failure also failed");
                }
                Err(e)
            }
        }
    }

    fn request_supply(&self, routes: &[QueueRoute]) {
        for route in routes.iter().filter(|r| r.remote) {
            if let Err(e) = self.runtime.driver().request_supply(route.queue_id) {
                warn!(queue = %route.queue_id, error = %e, "supply request failed");
            }
        }
    }
}

impl KernelStep for GatherDequeue {
    fn name(&self) -> &'static str {
        "gather_dequeue"
    }

    fn compute(&self, task: &TaskDescriptor, ctx: &mut RunContext) -> StatusCode {
        let TaskParams::GatherDequeue(params) = &task.params else {
            return wrong_params(self.name(), task);
        };
        let k = match Self::inputs(params) {
            Ok(k) => k,
            Err(reason) => return fail(self.name(), ctx, SchedError::ParameterInvalid(reason)),
        };
        let model = match resolve_model(&self.runtime, task, ctx) {
            Ok(model) => model,
            Err(status) => return status,
        };

        let defaults = &self.runtime.config.gather;
        let limits = SelectLimits {
            timeout: Duration::from_millis(params.timeout_ms.unwrap_or(defaults.timeout_ms)),
            cache_num: params.cache_num.unwrap_or(defaults.cache_num),
        };
        let policy = params.policy.unwrap_or(defaults.policy);

        // A stale signal from an earlier attempt must not skip the sweep.
        if let Err(e) = self
            .runtime
            .waits
            .get(WaitCategory::AnyQueueNotEmpty)
            .reset(model.id().0)
        {
            return fail(self.name(), ctx, e);
        }

        match self.run(&model, &params.queues[..k], limits, policy, ctx) {
            Ok(status) => status,
            Err(e) => fail(self.name(), ctx, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use stepd_core::{ModelId, QueueId, SimDriver};

    use super::super::testutil::*;
    use super::*;

    fn gather_task(queues: &[u32]) -> TaskDescriptor {
        let routes = queues.iter().map(|q| QueueRoute::local(QueueId(*q))).collect();
        TaskDescriptor::new(0, ModelId(0), TaskParams::GatherDequeue(GatherParams::all(routes)))
    }

    fn push(driver: &SimDriver, queue: u32, trans_id: u64) -> BufferHandle {
        driver.push(QueueId(queue), BufferHeader::new(trans_id, 0)).unwrap()
    }

    #[test]
    fn aligned_items_are_selected() {
        let (driver, runtime) = runtime();
        let model = load(&runtime, 0, &[1, 2]);
        driver.add_queue(QueueId(1));
        driver.add_queue(QueueId(2));
        let a = push(&driver, 1, 7);
        let b = push(&driver, 2, 7);

        let mut c = ctx(0, 0);
        assert_eq!(GatherDequeue::new(runtime.clone()).compute(&gather_task(&[1, 2]), &mut c), StatusCode::Ok);
        assert!(!c.pending);
        assert_eq!(model.batch_output(), vec![a, b]);
        assert!(runtime.buffers.owns(ModelId(0), a));
    }

    #[test]
    fn partial_set_survives_pend() {
        let (driver, runtime) = runtime();
        let model = load(&runtime, 0, &[1, 2]);
        driver.add_queue(QueueId(1));
        driver.add_queue(QueueId(2));
        push(&driver, 1, 3);
        let step = GatherDequeue::new(runtime.clone());

        let mut c = ctx(0, 0);
        step.compute(&gather_task(&[1, 2]), &mut c);
        assert!(c.pending);
        assert_eq!(c.waiting_on, Some(WaitKey::new(WaitCategory::AnyQueueNotEmpty, 0)));
        assert_eq!(model.state().gather.item_count(), 1);

        push(&driver, 2, 3);
        let mut c = ctx(0, 0);
        step.compute(&gather_task(&[1, 2]), &mut c);
        assert!(!c.pending);
        assert_eq!(model.batch_output().len(), 2);
        assert!(model.state().gather.is_empty());
    }

    #[test]
    fn remote_queue_gets_supply_request_on_stall() {
        let (driver, runtime) = runtime();
        load(&runtime, 0, &[1, 2]);
        driver.add_queue(QueueId(1));
        driver.add_remote_queue(QueueId(2));
        push(&driver, 2, 1);
        let task = TaskDescriptor::new(
            0,
            ModelId(0),
            TaskParams::GatherDequeue(GatherParams::all(vec![
                QueueRoute::local(QueueId(1)),
                QueueRoute::remote(QueueId(2)),
            ])),
        );

        let mut c = ctx(0, 0);
        GatherDequeue::new(runtime).compute(&task, &mut c);
        assert!(c.pending);
        assert_eq!(driver.remote_dequeues(), 1);
        assert_eq!(driver.supply_requests(), vec![QueueId(2)]);
    }

    #[test]
    fn pad_policy_fills_missing_slots() {
        let (driver, runtime) = runtime();
        let model = load(&runtime, 0, &[1, 2]);
        driver.add_queue(QueueId(1));
        driver.add_queue(QueueId(2));
        let first = push(&driver, 1, 4);
        push(&driver, 1, 5);
        let task = TaskDescriptor::new(
            0,
            ModelId(0),
            TaskParams::GatherDequeue(GatherParams {
                cache_num: Some(1),
                policy: Some(MismatchPolicy::Pad),
                ..GatherParams::all(vec![QueueRoute::local(QueueId(1)), QueueRoute::local(QueueId(2))])
            }),
        );

        let mut c = ctx(0, 0);
        assert_eq!(GatherDequeue::new(runtime).compute(&task, &mut c), StatusCode::DiscardData);
        let batch = model.batch_output();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0], first);
        let pad = driver.header(batch[1]).unwrap();
        assert!(pad.is_discard());
        assert_eq!(pad.trans_id, 4);
        assert_eq!(driver.size_of(batch[1]), Some(0));
    }

    fn forcing_task(queues: &[u32], policy: MismatchPolicy) -> TaskDescriptor {
        let routes = queues.iter().map(|q| QueueRoute::local(QueueId(*q))).collect();
        TaskDescriptor::new(
            0,
            ModelId(0),
            TaskParams::GatherDequeue(GatherParams {
                cache_num: Some(1),
                policy: Some(policy),
                ..GatherParams::all(routes)
            }),
        )
    }

    #[test]
    fn failed_drop_still_frees_rest_of_set() {
        let (driver, runtime) = runtime();
        let model = load(&runtime, 0, &[1, 2, 3]);
        for q in 1..=3 {
            driver.add_queue(QueueId(q));
        }
        let a = push(&driver, 1, 4);
        let b = push(&driver, 2, 4);
        push(&driver, 1, 5);
        driver.fail_free_of(a);

        let mut c = ctx(0, 0);
        let task = forcing_task(&[1, 2, 3], MismatchPolicy::Drop);
        let status = GatherDequeue::new(runtime.clone()).compute(&task, &mut c);
        assert_eq!(status, StatusCode::FromDriver);
        assert_eq!(driver.free_count(b), 1);
        assert!(!runtime.buffers.owns(ModelId(0), b));
        assert_eq!(model.state().gather.item_count(), 1);
    }

    #[test]
    fn failed_pad_frees_consumed_items() {
        let (driver, runtime) = runtime();
        let model = load(&runtime, 0, &[1, 2]);
        driver.add_queue(QueueId(1));
        driver.add_queue(QueueId(2));
        let first = push(&driver, 1, 4);
        push(&driver, 1, 5);
        driver.set_fail_alloc(true);

        let mut c = ctx(0, 0);
        let task = forcing_task(&[1, 2], MismatchPolicy::Pad);
        let status = GatherDequeue::new(runtime.clone()).compute(&task, &mut c);
        assert_eq!(status, StatusCode::FromDriver);
        assert_eq!(driver.free_count(first), 1);
        assert!(!runtime.buffers.owns(ModelId(0), first));
        assert!(model.batch_output().is_empty());
        assert_eq!(model.state().gather.item_count(), 1);
    }

    #[test]
    fn failed_purge_still_frees_other_items() {
        let (driver, runtime) = runtime();
        let model = load(&runtime, 0, &[1, 2, 3]);
        for q in 1..=3 {
            driver.add_queue(QueueId(q));
        }
        let a = push(&driver, 1, 8);
        let b = push(&driver, 2, 8);
        let step = GatherDequeue::new(runtime.clone());

        let mut c = ctx(0, 0);
        step.compute(&gather_task(&[1, 2, 3]), &mut c);
        assert!(c.pending);
        assert_eq!(model.state().gather.item_count(), 2);

        model.mark_exception(8);
        driver.fail_free_of(a);
        let mut c = ctx(0, 0);
        assert_eq!(step.compute(&gather_task(&[1, 2, 3]), &mut c), StatusCode::FromDriver);
        assert_eq!(driver.free_count(b), 1);
        assert!(model.state().gather.is_empty());
        assert_eq!(runtime.buffers.owned_count(ModelId(0)), 0);
    }

    #[test]
    fn exception_transactions_are_discarded() {
        let (driver, runtime) = runtime();
        let model = load(&runtime, 0, &[1, 2]);
        driver.add_queue(QueueId(1));
        driver.add_queue(QueueId(2));
        model.mark_exception(8);
        let bad = push(&driver, 1, 8);
        push(&driver, 1, 9);
        push(&driver, 2, 9);

        let mut c = ctx(0, 0);
        GatherDequeue::new(runtime).compute(&gather_task(&[1, 2]), &mut c);
        assert!(!c.pending);
        assert_eq!(driver.free_count(bad), 1);
        assert_eq!(model.batch_output().len(), 2);
    }

    #[test]
    fn inputs_count_limits_gathered_queues() {
        let (driver, runtime) = runtime();
        let model = load(&runtime, 0, &[1, 2]);
        driver.add_queue(QueueId(1));
        driver.add_queue(QueueId(2));
        push(&driver, 1, 1);
        push(&driver, 2, 1);
        let task = TaskDescriptor::new(
            0,
            ModelId(0),
            TaskParams::GatherDequeue(GatherParams {
                inputs_count: 1,
                ..GatherParams::all(vec![QueueRoute::local(QueueId(1)), QueueRoute::local(QueueId(2))])
            }),
        );

        let mut c = ctx(0, 0);
        GatherDequeue::new(runtime).compute(&task, &mut c);
        assert_eq!(model.batch_output().len(), 1);
        assert_eq!(driver.queue_len(QueueId(2)), 1);
    }

    #[test]
    fn malformed_params_are_rejected() {
        let (_driver, runtime) = runtime();
        load(&runtime, 0, &[]);
        let step = GatherDequeue::new(runtime);
        let mut c = ctx(0, 0);
        assert_eq!(step.compute(&gather_task(&[]), &mut c), StatusCode::ParameterInvalid);

        let too_many = TaskDescriptor::new(
            0,
            ModelId(0),
            TaskParams::GatherDequeue(GatherParams {
                inputs_count: 3,
                ..GatherParams::all(vec![QueueRoute::local(QueueId(1))])
            }),
        );
        assert_eq!(step.compute(&too_many, &mut c), StatusCode::ParameterInvalid);
        assert!(!c.pending);
    }

    #[test]
    fn driver_failure_reports_from_driver() {
        let (_driver, runtime) = runtime();
        load(&runtime, 0, &[]);
        // Queue 5 was never registered with the driver.
        let mut c = ctx(0, 0);
        assert_eq!(
            GatherDequeue::new(runtime).compute(&gather_task(&[5]), &mut c),
            StatusCode::FromDriver
        );
    }
}
