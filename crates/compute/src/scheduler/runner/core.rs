use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use stepd_core::{ModelId, Result, StreamId};

use crate::events::{EventDispatcher, StreamWaker};
use crate::kernel::{KernelRegistry, KernelStep, TaskDescriptor};
use crate::model::{Model, ModelSpec};
use crate::runtime::Runtime;
use crate::scheduler::metrics::SchedulerMetrics;
use crate::scheduler::stream::StreamTable;

/// The stream scheduler. Owns the kernel registry and the stream table and
/// runs steps against a shared [`Runtime`].
pub struct Scheduler {
    pub(super) runtime: Arc<Runtime>,
    pub(super) kernels: KernelRegistry,
    pub(super) streams: Arc<StreamTable>,
    /// Scheduler metrics.
    pub(super) metrics: Arc<RwLock<SchedulerMetrics>>,
    /// Shutdown signal.
    pub(super) shutdown: Arc<AtomicBool>,
}

impl Scheduler {
    /// Create a scheduler with every built-in kernel registered.
    pub fn new(runtime: Arc<Runtime>) -> Self {
        let kernels = KernelRegistry::with_builtin(&runtime);
        Self {
            runtime,
            kernels,
            streams: Arc::new(StreamTable::new()),
            metrics: Arc::new(RwLock::new(SchedulerMetrics::default())),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Register an extra kernel, replacing a built-in of the same name.
    pub fn register_kernel(&mut self, kernel: Arc<dyn KernelStep>) {
        self.kernels.register(kernel);
    }

    pub fn load_model(&self, id: ModelId, spec: ModelSpec) -> Result<Arc<Model>> {
        self.runtime.models.load(id, spec)
    }

    /// Tear a model down. Streams of other models that were waiting on a
    /// table it held are resumed; its own streams are aborted, those with a
    /// step in flight once the step returns.
    pub fn unload_model(&self, id: ModelId) -> Result<()> {
        let woken = self.runtime.models.unload(id)?;
        for stream in woken {
            self.streams.wake(stream);
        }
        let aborted = self.streams.abort_model(id);
        self.metrics.write().aborted_streams += aborted as u64;
        info!(model = %id, aborted, "model streams aborted");
        Ok(())
    }

    /// Add a stream executing `tasks` in order on behalf of `model`.
    pub fn add_stream(&self, stream: StreamId, model: ModelId, tasks: Vec<TaskDescriptor>) -> Result<()> {
        self.streams.add(stream, model, tasks)
    }

    /// Dispatcher that resumes this scheduler's streams.
    pub fn dispatcher(&self) -> EventDispatcher {
        let waker: Arc<dyn StreamWaker> = self.streams.clone();
        EventDispatcher::new(Arc::clone(&self.runtime), waker)
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub fn streams(&self) -> &Arc<StreamTable> {
        &self.streams
    }

    pub fn kernels(&self) -> &KernelRegistry {
        &self.kernels
    }

    /// Get a snapshot of the current scheduler metrics.
    pub fn metrics(&self) -> SchedulerMetrics {
        self.metrics.read().clone()
    }

    /// Signal the scheduler to stop.
    pub fn shutdown(&self) {
        info!("Scheduler shutdown requested");
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Get an Arc to the shutdown flag (for external shutdown signaling).
    pub fn shutdown_signal(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }
}
