pub mod events;
pub mod kernel;
pub mod model;
pub mod runtime;
pub mod scheduler;

pub use events::{EventDispatcher, ExternalEvent, StreamWaker};
pub use kernel::{KernelRegistry, KernelStep, RunContext, TaskDescriptor, TaskParams, WaitKey};
pub use model::{Model, ModelRegistry, ModelSpec};
pub use runtime::Runtime;
pub use scheduler::{Scheduler, SchedulerMetrics, StepOutcome, StreamStatus, StreamTable};
