//! Boundary to the accelerator driver.
//!
//! Every primitive is non-blocking or bounded and reports failure as an
//! ordinary [`DriverError`]. "Would block" on a queue is `Ok(None)` from a
//! dequeue and [`EnqueueOutcome::Full`] from an enqueue, never an error.

pub mod sim;

use serde::{Deserialize, Serialize};

use crate::error::DriverError;
use crate::ids::{BufferHandle, QueueId};
use crate::status::StatusCode;

pub use sim::SimDriver;

/// Header `ret_code` stamped on zero-length placeholder buffers of a padded
/// gather batch.
pub const DISCARD_RET_CODE: i32 = StatusCode::DiscardData as i32;

/// Per-buffer metadata kept by the driver alongside the payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferHeader {
    /// Transaction the item belongs to; gather aligns on this.
    pub trans_id: u64,
    pub route_label: u32,
    /// Monotonic production timestamp; batch dequeue aligns on this.
    pub timestamp: u64,
    pub ret_code: i32,
}

impl BufferHeader {
    pub fn new(trans_id: u64, route_label: u32) -> Self {
        Self {
            trans_id,
            route_label,
            ..Self::default()
        }
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn is_discard(&self) -> bool {
        self.ret_code == DISCARD_RET_CODE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Accepted,
    /// Queue is at capacity; the handle was not taken.
    Full,
}

pub trait Driver: Send + Sync {
    fn alloc(&self, size: u64) -> Result<BufferHandle, DriverError>;

    fn free(&self, handle: BufferHandle) -> Result<(), DriverError>;

    /// Number of items ready on the queue.
    fn peek(&self, queue: QueueId) -> Result<usize, DriverError>;

    /// Dequeue from a queue local to this device. `Ok(None)` when empty.
    fn dequeue(&self, queue: QueueId) -> Result<Option<BufferHandle>, DriverError>;

    /// Dequeue from a queue whose producer lives across the device boundary.
    fn dequeue_remote(&self, queue: QueueId) -> Result<Option<BufferHandle>, DriverError>;

    fn enqueue(&self, queue: QueueId, handle: BufferHandle) -> Result<EnqueueOutcome, DriverError>;

    fn header(&self, handle: BufferHandle) -> Result<BufferHeader, DriverError>;

    fn set_header(&self, handle: BufferHandle, header: &BufferHeader) -> Result<(), DriverError>;

    /// Nudge the remote producer of `queue` to supply more data.
    fn request_supply(&self, queue: QueueId) -> Result<(), DriverError>;
}
