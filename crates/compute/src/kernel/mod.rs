//! Kernel steps: the unit of work a stream executes.
//!
//! A step runs once and either completes or pends. It never blocks: when a
//! precondition is unmet it registers with a wait coordinator, sets
//! `ctx.pending` and returns OK. Partial progress of multi-item steps lives
//! on the [`Model`](crate::model::Model) so a resumed step continues where
//! it stopped.

pub mod batch;
pub mod context;
pub mod end_graph;
pub mod enqueue;
pub mod gather;
pub mod notify;
pub mod table;
pub mod task;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use stepd_core::{SchedError, StatusCode};

use crate::model::Model;
use crate::runtime::Runtime;

pub use batch::BatchDequeue;
pub use context::{RunContext, WaitKey};
pub use end_graph::{EndGraph, WaitEndGraph};
pub use enqueue::Enqueue;
pub use gather::GatherDequeue;
pub use notify::{RecordNotify, WaitNotify};
pub use table::{LockTable, UnlockTable};
pub use task::{BatchParams, GatherParams, QueueRoute, TaskDescriptor, TaskParams};

/// A step implementation the scheduler can invoke.
pub trait KernelStep: Send + Sync {
    /// Name used for routing, logging and metrics.
    fn name(&self) -> &'static str;

    /// Run the step once. Pending is signalled through `ctx.pending`.
    fn compute(&self, task: &TaskDescriptor, ctx: &mut RunContext) -> StatusCode;
}

/// Kernel name to implementation.
#[derive(Default)]
pub struct KernelRegistry {
    kernels: HashMap<&'static str, Arc<dyn KernelStep>>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in step bound to `runtime`.
    pub fn with_builtin(runtime: &Arc<Runtime>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(WaitNotify::new(Arc::clone(runtime))));
        registry.register(Arc::new(RecordNotify::new(Arc::clone(runtime))));
        registry.register(Arc::new(LockTable::new(Arc::clone(runtime))));
        registry.register(Arc::new(UnlockTable::new(Arc::clone(runtime))));
        registry.register(Arc::new(WaitEndGraph::new(Arc::clone(runtime))));
        registry.register(Arc::new(EndGraph::new(Arc::clone(runtime))));
        registry.register(Arc::new(GatherDequeue::new(Arc::clone(runtime))));
        registry.register(Arc::new(BatchDequeue::new(Arc::clone(runtime))));
        registry.register(Arc::new(Enqueue::new(Arc::clone(runtime))));
        registry
    }

    pub fn register(&mut self, kernel: Arc<dyn KernelStep>) {
        info!("Registered kernel: {}", kernel.name());
        self.kernels.insert(kernel.name(), kernel);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn KernelStep>> {
        self.kernels.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.kernels.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for KernelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelRegistry")
            .field("kernels", &self.names())
            .finish()
    }
}

/// Look up the running model, rejecting descriptors built for another one.
///
/// A missing or destroying model is a teardown race and maps to
/// `ModelUnload`.
pub(crate) fn resolve_model(
    runtime: &Runtime,
    task: &TaskDescriptor,
    ctx: &RunContext,
) -> Result<Arc<Model>, StatusCode> {
    if task.model_id != ctx.model_id {
        debug!(
            task = %task.task_id,
            expected = %ctx.model_id,
            got = %task.model_id,
            "descriptor model mismatch"
        );
        return Err(StatusCode::ParameterInvalid);
    }
    match runtime.models.get(ctx.model_id) {
        Some(model) if !model.is_destroying() => Ok(model),
        _ => {
            debug!(model = %ctx.model_id, stream = %ctx.stream_id, "model gone, aborting step");
            Err(StatusCode::ModelUnload)
        }
    }
}

/// Map an error raised inside a step to the status it reports.
pub(crate) fn fail(kernel: &'static str, ctx: &RunContext, err: SchedError) -> StatusCode {
    let status = err.status();
    match status {
        StatusCode::ModelUnload => {
            debug!(kernel, model = %ctx.model_id, "step aborted by unload")
        }
        _ => tracing::error!(
            kernel,
            model = %ctx.model_id,
            stream = %ctx.stream_id,
            task = %ctx.task_id,
            error = %err,
            "step failed"
        ),
    }
    status
}

fn wrong_params(kernel: &'static str, task: &TaskDescriptor) -> StatusCode {
    tracing::error!(
        kernel,
        task = %task.task_id,
        got = task.kernel_name(),
        "descriptor params do not match kernel"
    );
    StatusCode::ParameterInvalid
}


#[cfg(test)]
mod tests {
    use stepd_core::ModelId;

    use super::testutil::*;
    use super::*;

    #[test]
    fn builtin_registry_routes_every_params_variant() {
        let (_driver, runtime) = runtime();
        let registry = KernelRegistry::with_builtin(&runtime);
        assert_eq!(registry.names().len(), 9);
        for name in [
            "wait_notify",
            "record_notify",
            "lock_table",
            "unlock_table",
            "wait_end_graph",
            "end_graph",
            "gather_dequeue",
            "batch_dequeue",
            "enqueue",
        ] {
            assert_eq!(registry.get(name).unwrap().name(), name);
        }
    }

    #[test]
    fn resolve_rejects_model_mismatch() {
        let (_driver, runtime) = runtime();
        load(&runtime, 1, &[]);
        let task = TaskDescriptor::new(0, ModelId(2), TaskParams::EndGraph);
        assert_eq!(
            resolve_model(&runtime, &task, &ctx(1, 0)).unwrap_err(),
            StatusCode::ParameterInvalid
        );
    }

    #[test]
    fn resolve_reports_unloaded_model() {
        let (_driver, runtime) = runtime();
        let task = TaskDescriptor::new(0, ModelId(3), TaskParams::EndGraph);
        assert_eq!(
            resolve_model(&runtime, &task, &ctx(3, 0)).unwrap_err(),
            StatusCode::ModelUnload
        );
    }
}
