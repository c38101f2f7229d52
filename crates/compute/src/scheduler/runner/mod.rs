//! Scheduler runner -- claims streams and executes their steps.
//!
//! Split into focused submodules:
//! - `core`: Scheduler struct, constructor, model and stream management
//! - `execution`: single-step execution, the drain loop and the pool loop

mod core;
mod execution;

pub use self::core::Scheduler;
