use serde::Serialize;

use stepd_core::{ModelId, StreamId, TaskId};
use stepd_sync::WaitCategory;

/// What a pended step is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct WaitKey {
    pub category: WaitCategory,
    pub id: u32,
}

impl WaitKey {
    pub fn new(category: WaitCategory, id: u32) -> Self {
        Self { category, id }
    }
}

impl std::fmt::Display for WaitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.category, self.id)
    }
}

/// Per-invocation context handed to [`KernelStep::compute`].
///
/// `pending` is the only suspension signal: a step that cannot make progress
/// sets it and returns OK. Streams a step resumed by announcing are collected
/// in `woken` for the scheduler to requeue.
///
/// [`KernelStep::compute`]: super::KernelStep::compute
#[derive(Debug, Clone)]
pub struct RunContext {
    pub model_id: ModelId,
    pub stream_id: StreamId,
    pub task_id: TaskId,
    pub pending: bool,
    pub waiting_on: Option<WaitKey>,
    pub woken: Vec<StreamId>,
}

impl RunContext {
    pub fn new(model_id: ModelId, stream_id: StreamId, task_id: TaskId) -> Self {
        Self {
            model_id,
            stream_id,
            task_id,
            pending: false,
            waiting_on: None,
            woken: Vec::new(),
        }
    }

    pub fn pend(&mut self, key: WaitKey) {
        self.pending = true;
        self.waiting_on = Some(key);
    }

    pub fn wake(&mut self, stream: Option<StreamId>) {
        if let Some(stream) = stream {
            self.woken.push(stream);
        }
    }
}
