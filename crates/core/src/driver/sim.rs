//! In-memory driver used by the simulator binary and by tests.
//!
//! Tracks every live buffer so callers can assert that nothing leaked and
//! nothing was freed twice.

use std::collections::{HashMap, HashSet, VecDeque};

use parking_lot::Mutex;

use super::{BufferHeader, Driver, EnqueueOutcome};
use crate::error::DriverError;
use crate::ids::{BufferHandle, QueueId};

const RET_NO_MEMORY: i32 = -12;
const RET_BAD_HANDLE: i32 = -9;
const RET_NO_QUEUE: i32 = -2;

#[derive(Debug)]
struct SimBuffer {
    size: u64,
    header: BufferHeader,
}

#[derive(Debug, Default)]
struct SimQueue {
    items: VecDeque<BufferHandle>,
    capacity: Option<usize>,
    remote: bool,
}

#[derive(Debug, Default)]
struct SimState {
    next_handle: u64,
    buffers: HashMap<BufferHandle, SimBuffer>,
    queues: HashMap<QueueId, SimQueue>,
    freed: Vec<BufferHandle>,
    fail_alloc: bool,
    fail_free: HashSet<BufferHandle>,
    supply_requests: Vec<QueueId>,
    remote_dequeues: usize,
}

impl SimState {
    fn alloc(&mut self, size: u64) -> BufferHandle {
        self.next_handle += 1;
        let handle = BufferHandle(0x1000 + self.next_handle);
        self.buffers.insert(
            handle,
            SimBuffer {
                size,
                header: BufferHeader::default(),
            },
        );
        handle
    }

    fn queue_mut(&mut self, op: &'static str, queue: QueueId) -> Result<&mut SimQueue, DriverError> {
        self.queues
            .get_mut(&queue)
            .ok_or(DriverError::new(op, RET_NO_QUEUE))
    }
}

#[derive(Debug, Default)]
pub struct SimDriver {
    state: Mutex<SimState>,
}

impl SimDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an unbounded local queue.
    pub fn add_queue(&self, queue: QueueId) {
        self.state.lock().queues.entry(queue).or_default();
    }

    pub fn add_bounded_queue(&self, queue: QueueId, capacity: usize) {
        self.state.lock().queues.entry(queue).or_default().capacity = Some(capacity);
    }

    /// Register a queue whose producer sits across the device boundary.
    pub fn add_remote_queue(&self, queue: QueueId) {
        self.state.lock().queues.entry(queue).or_default().remote = true;
    }

    pub fn is_remote(&self, queue: QueueId) -> bool {
        self.state
            .lock()
            .queues
            .get(&queue)
            .map(|q| q.remote)
            .unwrap_or(false)
    }

    /// Produce an item onto `queue` as an upstream producer would. Ignores
    /// capacity. Returns the new buffer's handle.
    pub fn push(&self, queue: QueueId, header: BufferHeader) -> Result<BufferHandle, DriverError> {
        let mut state = self.state.lock();
        state.queue_mut("push", queue)?;
        let handle = state.alloc(0);
        if let Some(buf) = state.buffers.get_mut(&handle) {
            buf.header = header;
        }
        state.queue_mut("push", queue)?.items.push_back(handle);
        Ok(handle)
    }

    pub fn queue_len(&self, queue: QueueId) -> usize {
        self.state
            .lock()
            .queues
            .get(&queue)
            .map(|q| q.items.len())
            .unwrap_or(0)
    }

    /// Remove and return every handle on `queue` without freeing them.
    pub fn drain_queue(&self, queue: QueueId) -> Vec<BufferHandle> {
        self.state
            .lock()
            .queues
            .get_mut(&queue)
            .map(|q| q.items.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn is_live(&self, handle: BufferHandle) -> bool {
        self.state.lock().buffers.contains_key(&handle)
    }

    pub fn live_count(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn size_of(&self, handle: BufferHandle) -> Option<u64> {
        self.state.lock().buffers.get(&handle).map(|b| b.size)
    }

    /// Every successfully freed handle, in free order.
    pub fn freed(&self) -> Vec<BufferHandle> {
        self.state.lock().freed.clone()
    }

    pub fn free_count(&self, handle: BufferHandle) -> usize {
        self.state.lock().freed.iter().filter(|h| **h == handle).count()
    }

    pub fn set_fail_alloc(&self, fail: bool) {
        self.state.lock().fail_alloc = fail;
    }

    /// Make the next free of `handle` fail. The buffer stays live.
    pub fn fail_free_of(&self, handle: BufferHandle) {
        self.state.lock().fail_free.insert(handle);
    }

    pub fn supply_requests(&self) -> Vec<QueueId> {
        self.state.lock().supply_requests.clone()
    }

    pub fn remote_dequeues(&self) -> usize {
        self.state.lock().remote_dequeues
    }
}

impl Driver for SimDriver {
    fn alloc(&self, size: u64) -> Result<BufferHandle, DriverError> {
        let mut state = self.state.lock();
        if state.fail_alloc {
            return Err(DriverError::new("alloc", RET_NO_MEMORY));
        }
        Ok(state.alloc(size))
    }

    fn free(&self, handle: BufferHandle) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        if state.fail_free.remove(&handle) {
            return Err(DriverError::new("free", RET_BAD_HANDLE));
        }
        if state.buffers.remove(&handle).is_none() {
            return Err(DriverError::new("free", RET_BAD_HANDLE));
        }
        state.freed.push(handle);
        Ok(())
    }

    fn peek(&self, queue: QueueId) -> Result<usize, DriverError> {
        let mut state = self.state.lock();
        Ok(state.queue_mut("peek", queue)?.items.len())
    }

    fn dequeue(&self, queue: QueueId) -> Result<Option<BufferHandle>, DriverError> {
        let mut state = self.state.lock();
        Ok(state.queue_mut("dequeue", queue)?.items.pop_front())
    }

    fn dequeue_remote(&self, queue: QueueId) -> Result<Option<BufferHandle>, DriverError> {
        let mut state = self.state.lock();
        let item = state.queue_mut("dequeue_remote", queue)?.items.pop_front();
        if item.is_some() {
            state.remote_dequeues += 1;
        }
        Ok(item)
    }

    fn enqueue(&self, queue: QueueId, handle: BufferHandle) -> Result<EnqueueOutcome, DriverError> {
        let mut state = self.state.lock();
        if !state.buffers.contains_key(&handle) {
            return Err(DriverError::new("enqueue", RET_BAD_HANDLE));
        }
        let q = state.queue_mut("enqueue", queue)?;
        if q.capacity.is_some_and(|cap| q.items.len() >= cap) {
            return Ok(EnqueueOutcome::Full);
        }
        q.items.push_back(handle);
        Ok(EnqueueOutcome::Accepted)
    }

    fn header(&self, handle: BufferHandle) -> Result<BufferHeader, DriverError> {
        self.state
            .lock()
            .buffers
            .get(&handle)
            .map(|b| b.header)
            .ok_or(DriverError::new("header", RET_BAD_HANDLE))
    }

    fn set_header(&self, handle: BufferHandle, header: &BufferHeader) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        let buf = state
            .buffers
            .get_mut(&handle)
            .ok_or(DriverError::new("set_header", RET_BAD_HANDLE))?;
        buf.header = *header;
        Ok(())
    }

    fn request_supply(&self, queue: QueueId) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        state.queue_mut("request_supply", queue)?;
        state.supply_requests.push(queue);
        Ok(())
    }
}
