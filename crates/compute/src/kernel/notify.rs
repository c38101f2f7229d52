use std::sync::Arc;

use tracing::debug;

use stepd_core::StatusCode;
use stepd_sync::WaitCategory;

use super::{fail, resolve_model, wrong_params, KernelStep, RunContext, TaskDescriptor, TaskParams, WaitKey};
use crate::runtime::Runtime;

/// Completes once the notify id has been recorded; pends otherwise.
pub struct WaitNotify {
    runtime: Arc<Runtime>,
}

impl WaitNotify {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self { runtime }
    }
}

impl KernelStep for WaitNotify {
    fn name(&self) -> &'static str {
        "wait_notify"
    }

    fn compute(&self, task: &TaskDescriptor, ctx: &mut RunContext) -> StatusCode {
        let TaskParams::WaitNotify { notify_id } = task.params else {
            return wrong_params(self.name(), task);
        };
        if let Err(status) = resolve_model(&self.runtime, task, ctx) {
            return status;
        }
        let notify = self.runtime.waits.get(WaitCategory::Notify);
        match notify.wait_or_consume(notify_id.0, ctx.stream_id) {
            Ok(true) => {
                debug!(%notify_id, stream = %ctx.stream_id, "waiting for notify");
                ctx.pend(WaitKey::new(WaitCategory::Notify, notify_id.0));
                StatusCode::Ok
            }
            Ok(false) => StatusCode::Ok,
            Err(e) => fail(self.name(), ctx, e),
        }
    }
}

/// Records a notify id, resuming whichever stream waits on it.
pub struct RecordNotify {
    runtime: Arc<Runtime>,
}

impl RecordNotify {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self { runtime }
    }
}

impl KernelStep for RecordNotify {
    fn name(&self) -> &'static str {
        "record_notify"
    }

    fn compute(&self, task: &TaskDescriptor, ctx: &mut RunContext) -> StatusCode {
        let TaskParams::RecordNotify { notify_id } = task.params else {
            return wrong_params(self.name(), task);
        };
        if let Err(status) = resolve_model(&self.runtime, task, ctx) {
            return status;
        }
        match self.runtime.waits.get(WaitCategory::Notify).announce(notify_id.0) {
            Ok(waiter) => {
                ctx.wake(waiter);
                StatusCode::Ok
            }
            Err(e) => fail(self.name(), ctx, e),
        }
    }
}
