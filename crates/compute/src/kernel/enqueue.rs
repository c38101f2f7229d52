use std::sync::Arc;

use tracing::debug;

use stepd_core::{Driver, EnqueueOutcome, QueueId, Result, SchedError, StatusCode};
use stepd_sync::WaitCategory;

use super::{fail, resolve_model, wrong_params, KernelStep, RunContext, TaskDescriptor, TaskParams, WaitKey};
use crate::model::Model;
use crate::runtime::Runtime;

/// Hands the model's last produced batch to its output queues, item `i` to
/// queue `i`. Ownership of each item moves to the queue once accepted; a
/// full queue pends the step on its not-full wait.
pub struct Enqueue {
    runtime: Arc<Runtime>,
}

impl Enqueue {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self { runtime }
    }

    fn run(&self, model: &Model, queues: &[QueueId], ctx: &mut RunContext) -> Result<StatusCode> {
        let driver = self.runtime.driver();
        let not_full = self.runtime.waits.get(WaitCategory::QueueNotFull);
        let mut state = model.state();
        if state.batch_output.len() != queues.len() {
            return Err(SchedError::Inner(format!(
                "{} has {} batch items for {} output queues",
                model.id(),
                state.batch_output.len(),
                queues.len()
            )));
        }

        while state.enqueue_progress < queues.len() {
            let idx = state.enqueue_progress;
            let (queue, handle) = (queues[idx], state.batch_output[idx]);
            match driver.enqueue(queue, handle)? {
                EnqueueOutcome::Accepted => {
                    self.runtime.buffers.disown(model.id(), handle)?;
                    state.enqueue_progress += 1;
                }
                EnqueueOutcome::Full => {
                    if not_full.wait_or_consume(queue.0, ctx.stream_id)? {
                        debug!(model = %model.id(), %queue, "output queue full, pending");
                        ctx.pend(WaitKey::new(WaitCategory::QueueNotFull, queue.0));
                        return Ok(StatusCode::Ok);
                    }
                }
            }
        }

        debug!(model = %model.id(), items = queues.len(), "batch enqueued");
        state.batch_output.clear();
        state.enqueue_progress = 0;
        Ok(StatusCode::Ok)
    }
}

impl KernelStep for Enqueue {
    fn name(&self) -> &'static str {
        "enqueue"
    }

    fn compute(&self, task: &TaskDescriptor, ctx: &mut RunContext) -> StatusCode {
        let TaskParams::Enqueue { queues } = &task.params else {
            return wrong_params(self.name(), task);
        };
        if queues.is_empty() {
            return fail(
                self.name(),
                ctx,
                SchedError::ParameterInvalid("enqueue without output queues".into()),
            );
        }
        let model = match resolve_model(&self.runtime, task, ctx) {
            Ok(model) => model,
            Err(status) => return status,
        };
        match self.run(&model, queues, ctx) {
            Ok(status) => status,
            Err(e) => fail(self.name(), ctx, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use stepd_core::{BufferHandle, ModelId, StreamId};

    use super::super::testutil::*;
    use super::*;

    fn enqueue_task(queues: &[u32]) -> TaskDescriptor {
        TaskDescriptor::new(
            0,
            ModelId(0),
            TaskParams::Enqueue {
                queues: queues.iter().map(|q| QueueId(*q)).collect(),
            },
        )
    }

    fn stage_batch(runtime: &Runtime, model: &Model, count: usize) -> Vec<BufferHandle> {
        let handles: Vec<_> = (0..count)
            .map(|_| runtime.buffers.allocate_and_own(16, model.id()).unwrap())
            .collect();
        model.state().batch_output = handles.clone();
        handles
    }

    #[test]
    fn batch_moves_to_output_queues() {
        let (driver, runtime) = runtime();
        let model = load(&runtime, 0, &[]);
        driver.add_queue(QueueId(20));
        driver.add_queue(QueueId(21));
        let handles = stage_batch(&runtime, &model, 2);

        let mut c = ctx(0, 0);
        assert_eq!(Enqueue::new(runtime.clone()).compute(&enqueue_task(&[20, 21]), &mut c), StatusCode::Ok);
        assert_eq!(driver.drain_queue(QueueId(20)), vec![handles[0]]);
        assert_eq!(driver.drain_queue(QueueId(21)), vec![handles[1]]);
        assert_eq!(runtime.buffers.owned_count(ModelId(0)), 0);
        assert!(model.batch_output().is_empty());
    }

    #[test]
    fn full_queue_pends_and_resumes_where_it_stopped() {
        let (driver, runtime) = runtime();
        let model = load(&runtime, 0, &[]);
        driver.add_queue(QueueId(20));
        driver.add_bounded_queue(QueueId(21), 0);
        let handles = stage_batch(&runtime, &model, 2);
        let step = Enqueue::new(runtime.clone());

        let mut c = ctx(0, 4);
        step.compute(&enqueue_task(&[20, 21]), &mut c);
        assert!(c.pending);
        assert_eq!(model.state().enqueue_progress, 1);
        assert_eq!(driver.queue_len(QueueId(20)), 1);

        driver.add_bounded_queue(QueueId(21), 1);
        let waiter = runtime.waits.get(WaitCategory::QueueNotFull).announce(21).unwrap();
        assert_eq!(waiter, Some(StreamId(4)));

        let mut c = ctx(0, 4);
        step.compute(&enqueue_task(&[20, 21]), &mut c);
        assert!(!c.pending);
        assert_eq!(driver.queue_len(QueueId(20)), 1);
        assert_eq!(driver.drain_queue(QueueId(21)), vec![handles[1]]);
    }

    #[test]
    fn missing_batch_is_inner_error() {
        let (driver, runtime) = runtime();
        load(&runtime, 0, &[]);
        driver.add_queue(QueueId(20));
        let mut c = ctx(0, 0);
        assert_eq!(
            Enqueue::new(runtime).compute(&enqueue_task(&[20]), &mut c),
            StatusCode::InnerError
        );
    }
}
