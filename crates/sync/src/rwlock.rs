use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Which side of a [`TableRwLock`] a caller holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockKind {
    Read,
    Write,
}

impl LockKind {
    /// Decode the raw lock type carried in a task descriptor.
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(LockKind::Read),
            1 => Some(LockKind::Write),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct RwState {
    readers: u32,
    writer_active: bool,
}

/// Try-only reader/writer lock for one shared table.
///
/// Never sleeps and never queues requesters. Invariant: an active writer
/// implies zero readers.
#[derive(Debug, Default)]
pub struct TableRwLock {
    state: Mutex<RwState>,
}

impl TableRwLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_read(&self) -> bool {
        let mut state = self.state.lock();
        if state.writer_active {
            return false;
        }
        state.readers += 1;
        true
    }

    pub fn try_write(&self) -> bool {
        let mut state = self.state.lock();
        if state.writer_active || state.readers > 0 {
            return false;
        }
        state.writer_active = true;
        true
    }

    pub fn try_lock(&self, kind: LockKind) -> bool {
        match kind {
            LockKind::Read => self.try_read(),
            LockKind::Write => self.try_write(),
        }
    }

    /// Release one hold of `kind`. Releasing a kind that is not held is a
    /// logged no-op; the reader count never underflows.
    pub fn unlock(&self, kind: LockKind) {
        let mut state = self.state.lock();
        match kind {
            LockKind::Read if state.readers > 0 => state.readers -= 1,
            LockKind::Write if state.writer_active => state.writer_active = false,
            _ => warn!(
                ?kind,
                readers = state.readers,
                writer_active = state.writer_active,
                "unlock of a lock kind that is not held"
            ),
        }
    }

    pub fn readers(&self) -> u32 {
        self.state.lock().readers
    }

    pub fn is_write_locked(&self) -> bool {
        self.state.lock().writer_active
    }
}
