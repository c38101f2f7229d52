//! Stream scheduler for kernel steps.
//!
//! Streams are ordered lists of [`TaskDescriptor`](crate::kernel::TaskDescriptor)s
//! bound to one model. The scheduler claims runnable streams, runs their next
//! step on a worker pool and parks streams whose step pended until an
//! announced event wakes them.

pub mod metrics;
pub mod runner;
pub mod stream;

pub use metrics::SchedulerMetrics;
pub use runner::Scheduler;
pub use stream::{Claim, StepOutcome, StreamStatus, StreamTable};
