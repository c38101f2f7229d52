//! Non-blocking synchronization substrate shared by every kernel step.
//!
//! Nothing in this crate ever parks a thread on a condition: locks are
//! try-only, waits register interest and return, and buffer ownership is
//! tracked so teardown can reclaim everything in one pass.

pub mod buffer;
pub mod event_wait;
pub mod rwlock;
pub mod table_lock;
pub mod wait_hub;

pub use buffer::{BufferOwnershipTracker, OwnedBuffer};
pub use event_wait::{EventWaitCoordinator, WaitCategory};
pub use rwlock::{LockKind, TableRwLock};
pub use table_lock::TableLockRegistry;
pub use wait_hub::WaitHub;
