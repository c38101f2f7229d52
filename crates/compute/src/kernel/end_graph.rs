use std::sync::Arc;

use tracing::debug;

use stepd_core::StatusCode;
use stepd_sync::WaitCategory;

use super::{fail, resolve_model, wrong_params, KernelStep, RunContext, TaskDescriptor, TaskParams, WaitKey};
use crate::runtime::Runtime;

/// Completes once the target model has signalled the end of its graph.
pub struct WaitEndGraph {
    runtime: Arc<Runtime>,
}

impl WaitEndGraph {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self { runtime }
    }
}

impl KernelStep for WaitEndGraph {
    fn name(&self) -> &'static str {
        "wait_end_graph"
    }

    fn compute(&self, task: &TaskDescriptor, ctx: &mut RunContext) -> StatusCode {
        let TaskParams::WaitEndGraph { target } = task.params else {
            return wrong_params(self.name(), task);
        };
        if let Err(status) = resolve_model(&self.runtime, task, ctx) {
            return status;
        }
        let end_graph = self.runtime.waits.get(WaitCategory::EndGraph);
        match end_graph.wait_or_consume(target.0, ctx.stream_id) {
            Ok(true) => {
                debug!(%target, stream = %ctx.stream_id, "waiting for end of graph");
                ctx.pend(WaitKey::new(WaitCategory::EndGraph, target.0));
                StatusCode::Ok
            }
            Ok(false) => StatusCode::Ok,
            Err(e) => fail(self.name(), ctx, e),
        }
    }
}

/// Signals the end of the running model's graph.
pub struct EndGraph {
    runtime: Arc<Runtime>,
}

impl EndGraph {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self { runtime }
    }
}

impl KernelStep for EndGraph {
    fn name(&self) -> &'static str {
        "end_graph"
    }

    fn compute(&self, task: &TaskDescriptor, ctx: &mut RunContext) -> StatusCode {
        let TaskParams::EndGraph = task.params else {
            return wrong_params(self.name(), task);
        };
        let model = match resolve_model(&self.runtime, task, ctx) {
            Ok(model) => model,
            Err(status) => return status,
        };
        match self.runtime.waits.get(WaitCategory::EndGraph).announce(model.id().0) {
            Ok(waiter) => {
                ctx.wake(waiter);
                StatusCode::Ok
            }
            Err(e) => fail(self.name(), ctx, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use stepd_core::{ModelId, StreamId};

    use super::super::testutil::*;
    use super::*;

    #[test]
    fn waiter_resumes_after_end_graph() {
        let (_driver, runtime) = runtime();
        load(&runtime, 0, &[]);
        load(&runtime, 1, &[]);
        let wait = TaskDescriptor::new(0, ModelId(1), TaskParams::WaitEndGraph { target: ModelId(0) });
        let end = TaskDescriptor::new(1, ModelId(0), TaskParams::EndGraph);

        let mut waiter = ctx(1, 3);
        WaitEndGraph::new(runtime.clone()).compute(&wait, &mut waiter);
        assert!(waiter.pending);

        let mut producer = ctx(0, 4);
        assert_eq!(EndGraph::new(runtime.clone()).compute(&end, &mut producer), StatusCode::Ok);
        assert_eq!(producer.woken, vec![StreamId(3)]);

        let mut resumed = ctx(1, 3);
        WaitEndGraph::new(runtime).compute(&wait, &mut resumed);
        assert!(!resumed.pending);
    }

    #[test]
    fn target_beyond_model_bound_is_rejected() {
        let (_driver, runtime) = runtime();
        load(&runtime, 0, &[]);
        let wait = TaskDescriptor::new(0, ModelId(0), TaskParams::WaitEndGraph { target: ModelId(100) });
        let mut c = ctx(0, 0);
        assert_eq!(
            WaitEndGraph::new(runtime).compute(&wait, &mut c),
            StatusCode::ParameterInvalid
        );
    }
}
