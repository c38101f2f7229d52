//! Sticky, single-slot event/wait state keyed by a small integer id.
//!
//! A step that needs a condition calls [`EventWaitCoordinator::wait_or_consume`]:
//! either the condition already happened (consume it, proceed) or the step's
//! stream is registered and the step pends. Whoever satisfies the condition
//! calls [`EventWaitCoordinator::announce`] and resumes the returned stream.
//!
//! Level-triggered and single-slot: a second registration on the same id
//! overwrites the first, and repeated announces collapse into one.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use stepd_core::{Result, SchedError, StreamId};

/// The condition a coordinator instance tracks. Diagnostic only; every
/// category shares one implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitCategory {
    Notify,
    EndGraph,
    QueueNotEmpty,
    QueueNotFull,
    PrepareMem,
    AnyQueueNotEmpty,
    TableUnlock,
}

impl WaitCategory {
    pub const ALL: [WaitCategory; 7] = [
        WaitCategory::Notify,
        WaitCategory::EndGraph,
        WaitCategory::QueueNotEmpty,
        WaitCategory::QueueNotFull,
        WaitCategory::PrepareMem,
        WaitCategory::AnyQueueNotEmpty,
        WaitCategory::TableUnlock,
    ];

    pub fn name(self) -> &'static str {
        match self {
            WaitCategory::Notify => "notify",
            WaitCategory::EndGraph => "end_graph",
            WaitCategory::QueueNotEmpty => "queue_not_empty",
            WaitCategory::QueueNotFull => "queue_not_full",
            WaitCategory::PrepareMem => "prepare_mem",
            WaitCategory::AnyQueueNotEmpty => "any_queue_not_empty",
            WaitCategory::TableUnlock => "table_unlock",
        }
    }
}

impl std::fmt::Display for WaitCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug)]
struct WaitState {
    happened: Vec<bool>,
    waiting: Vec<Option<StreamId>>,
    wait_count: usize,
}

#[derive(Debug)]
pub struct EventWaitCoordinator {
    category: WaitCategory,
    capacity: usize,
    state: Mutex<WaitState>,
}

impl EventWaitCoordinator {
    pub fn new(category: WaitCategory, capacity: usize) -> Self {
        Self {
            category,
            capacity,
            state: Mutex::new(WaitState {
                happened: vec![false; capacity],
                waiting: vec![None; capacity],
                wait_count: 0,
            }),
        }
    }

    pub fn category(&self) -> WaitCategory {
        self.category
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn check(&self, id: u32) -> Result<usize> {
        let idx = id as usize;
        if idx >= self.capacity {
            return Err(SchedError::ParameterInvalid(format!(
                "{} wait id {} out of range, capacity {}",
                self.category, id, self.capacity
            )));
        }
        Ok(idx)
    }

    /// Signal that the condition for `id` holds.
    ///
    /// Returns the stream registered on `id`, if any, clearing the
    /// registration; the caller resumes it. The event is recorded as happened
    /// either way, so the resumed step consumes it on re-entry instead of
    /// parking again.
    pub fn announce(&self, id: u32) -> Result<Option<StreamId>> {
        let idx = self.check(id)?;
        let mut state = self.state.lock();
        state.happened[idx] = true;
        let waiter = state.waiting[idx].take();
        if waiter.is_some() {
            state.wait_count = state.wait_count.saturating_sub(1);
        }
        debug!(category = %self.category, id, ?waiter, "announce");
        Ok(waiter)
    }

    /// Consume a recorded event for `id`, or register `stream` as its waiter.
    ///
    /// Returns `true` when the caller must pend. The last registration
    /// before the next announce wins.
    pub fn wait_or_consume(&self, id: u32, stream: StreamId) -> Result<bool> {
        let idx = self.check(id)?;
        let mut state = self.state.lock();
        if state.happened[idx] {
            state.happened[idx] = false;
            debug!(category = %self.category, id, %stream, "event consumed");
            return Ok(false);
        }
        match state.waiting[idx].replace(stream) {
            None => state.wait_count += 1,
            Some(prev) if prev != stream => warn!(
                category = %self.category,
                id,
                %prev,
                %stream,
                "waiter overwritten, previous stream will not be woken by this id"
            ),
            Some(_) => {}
        }
        debug!(category = %self.category, id, %stream, "waiting");
        Ok(true)
    }

    /// Forget both a recorded event and a registered waiter for `id`.
    pub fn reset(&self, id: u32) -> Result<()> {
        let idx = self.check(id)?;
        let mut state = self.state.lock();
        Self::clear_slot(&mut state, idx);
        Ok(())
    }

    /// Reset every id in `ids`. All ids are validated before any is cleared.
    pub fn clear_batch(&self, ids: &[u32]) -> Result<()> {
        let idxs = ids
            .iter()
            .map(|&id| self.check(id))
            .collect::<Result<Vec<_>>>()?;
        let mut state = self.state.lock();
        for idx in idxs {
            Self::clear_slot(&mut state, idx);
        }
        debug!(category = %self.category, count = ids.len(), "cleared wait batch");
        Ok(())
    }

    fn clear_slot(state: &mut WaitState, idx: usize) {
        state.happened[idx] = false;
        if state.waiting[idx].take().is_some() {
            state.wait_count = state.wait_count.saturating_sub(1);
        }
    }

    /// Ids that currently have a registered waiter, with the waiter.
    pub fn waiting_ids(&self) -> Vec<(u32, StreamId)> {
        let state = self.state.lock();
        state
            .waiting
            .iter()
            .enumerate()
            .filter_map(|(idx, w)| w.map(|s| (idx as u32, s)))
            .collect()
    }

    pub fn wait_count(&self) -> usize {
        self.state.lock().wait_count
    }

    pub fn has_happened(&self, id: u32) -> Result<bool> {
        let idx = self.check(id)?;
        Ok(self.state.lock().happened[idx])
    }
}
