//! Per-stream execution state and the ready queue.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use stepd_core::{ModelId, Result, SchedError, StatusCode, StreamId};

use crate::events::StreamWaker;
use crate::kernel::{TaskDescriptor, WaitKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StreamStatus {
    Runnable,
    Running,
    Pending { on: Option<WaitKey> },
    Done,
    /// Stopped because its model was unloaded.
    Aborted,
    Failed { code: StatusCode },
}

impl StreamStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StreamStatus::Done | StreamStatus::Aborted | StreamStatus::Failed { .. }
        )
    }
}

/// How a step left its stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Advanced,
    Pended(Option<WaitKey>),
    Aborted,
    Failed(StatusCode),
}

#[derive(Debug)]
struct StreamEntry {
    model: ModelId,
    tasks: Vec<TaskDescriptor>,
    next_task: usize,
    status: StreamStatus,
    resume_requested: bool,
    /// Model unloaded while a step was in flight.
    abort_requested: bool,
}

/// A claimed step, ready to run on a worker.
#[derive(Debug, Clone)]
pub struct Claim {
    pub stream: StreamId,
    pub model: ModelId,
    pub task: TaskDescriptor,
}

#[derive(Debug, Default)]
struct TableInner {
    streams: HashMap<StreamId, StreamEntry>,
    ready: VecDeque<StreamId>,
}

/// Stream states plus the queue of runnable streams.
///
/// A stream is in the ready queue at most once and is claimed by at most one
/// worker at a time.
#[derive(Debug, Default)]
pub struct StreamTable {
    inner: Mutex<TableInner>,
}

impl StreamTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, stream: StreamId, model: ModelId, tasks: Vec<TaskDescriptor>) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.streams.contains_key(&stream) {
            return Err(SchedError::ParameterInvalid(format!("{} already exists", stream)));
        }
        let status = if tasks.is_empty() {
            StreamStatus::Done
        } else {
            inner.ready.push_back(stream);
            StreamStatus::Runnable
        };
        inner.streams.insert(
            stream,
            StreamEntry {
                model,
                tasks,
                next_task: 0,
                status,
                resume_requested: false,
                abort_requested: false,
            },
        );
        Ok(())
    }

    /// Pop the next runnable stream and mark it running.
    pub fn claim_next(&self) -> Option<Claim> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        while let Some(stream) = inner.ready.pop_front() {
            let Some(entry) = inner.streams.get_mut(&stream) else {
                continue;
            };
            if entry.status != StreamStatus::Runnable {
                continue;
            }
            let Some(task) = entry.tasks.get(entry.next_task).cloned() else {
                entry.status = StreamStatus::Done;
                continue;
            };
            entry.status = StreamStatus::Running;
            entry.resume_requested = false;
            return Some(Claim {
                stream,
                model: entry.model,
                task,
            });
        }
        None
    }

    /// Record how a claimed step ended. Returns the stream's new status.
    /// A stream whose model was unloaded mid-step ends aborted whatever the
    /// step reported.
    pub fn complete(&self, stream: StreamId, outcome: StepOutcome) -> Option<StreamStatus> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(entry) = inner.streams.get_mut(&stream) else {
            warn!(%stream, "completion for unknown stream");
            return None;
        };
        if entry.abort_requested {
            entry.abort_requested = false;
            entry.status = StreamStatus::Aborted;
            debug!(%stream, ?outcome, "step finished after model unload, stream aborted");
            return Some(StreamStatus::Aborted);
        }
        let requeue = match outcome {
            StepOutcome::Advanced => {
                entry.next_task += 1;
                if entry.next_task >= entry.tasks.len() {
                    entry.status = StreamStatus::Done;
                    false
                } else {
                    entry.status = StreamStatus::Runnable;
                    true
                }
            }
            StepOutcome::Pended(on) => {
                if entry.resume_requested {
                    // Woken while still running: the awaited event already
                    // happened, run again right away.
                    entry.resume_requested = false;
                    entry.status = StreamStatus::Runnable;
                    true
                } else {
                    entry.status = StreamStatus::Pending { on };
                    false
                }
            }
            StepOutcome::Aborted => {
                entry.status = StreamStatus::Aborted;
                false
            }
            StepOutcome::Failed(code) => {
                entry.status = StreamStatus::Failed { code };
                false
            }
        };
        let status = entry.status;
        if requeue {
            inner.ready.push_back(stream);
        }
        Some(status)
    }

    /// Abort every non-terminal stream of `model`. Streams with a step in
    /// flight are aborted when that step completes. Returns how many were
    /// aborted right away.
    pub fn abort_model(&self, model: ModelId) -> usize {
        let mut inner = self.inner.lock();
        let mut aborted = 0;
        for (stream, entry) in inner.streams.iter_mut() {
            if entry.model != model || entry.status.is_terminal() {
                continue;
            }
            if entry.status == StreamStatus::Running {
                entry.abort_requested = true;
                debug!(%stream, %model, "abort deferred until running step completes");
            } else {
                entry.status = StreamStatus::Aborted;
                aborted += 1;
            }
        }
        aborted
    }

    pub fn status(&self, stream: StreamId) -> Option<StreamStatus> {
        self.inner.lock().streams.get(&stream).map(|e| e.status)
    }

    pub fn next_task(&self, stream: StreamId) -> Option<usize> {
        self.inner.lock().streams.get(&stream).map(|e| e.next_task)
    }

    pub fn ready_len(&self) -> usize {
        self.inner.lock().ready.len()
    }

    pub fn has_running(&self) -> bool {
        self.inner
            .lock()
            .streams
            .values()
            .any(|e| e.status == StreamStatus::Running)
    }

    pub fn count_where(&self, pred: impl Fn(StreamStatus) -> bool) -> usize {
        self.inner
            .lock()
            .streams
            .values()
            .filter(|e| pred(e.status))
            .count()
    }
}

impl StreamWaker for StreamTable {
    fn wake(&self, stream: StreamId) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(entry) = inner.streams.get_mut(&stream) else {
            warn!(%stream, "wake for unknown stream");
            return;
        };
        match entry.status {
            StreamStatus::Pending { .. } => {
                entry.status = StreamStatus::Runnable;
                inner.ready.push_back(stream);
                debug!(%stream, "stream resumed");
            }
            StreamStatus::Running => entry.resume_requested = true,
            status => debug!(%stream, ?status, "wake ignored"),
        }
    }
}
