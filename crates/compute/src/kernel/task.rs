use serde::{Deserialize, Serialize};

use stepd_core::{MismatchPolicy, ModelId, NotifyId, QueueId, TableId, TaskId};

/// One input queue of a gather or batch dequeue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueRoute {
    pub queue_id: QueueId,
    /// Producer sits across the device boundary.
    #[serde(default)]
    pub remote: bool,
}

impl QueueRoute {
    pub fn local(queue_id: QueueId) -> Self {
        Self {
            queue_id,
            remote: false,
        }
    }

    pub fn remote(queue_id: QueueId) -> Self {
        Self {
            queue_id,
            remote: true,
        }
    }
}

/// Gather one item per queue aligned on `(trans_id, route_label)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatherParams {
    pub queues: Vec<QueueRoute>,
    /// Number of leading queues that take part. Must be in `1..=queues.len()`.
    pub inputs_count: u32,
    /// Overrides `gather.timeout_ms` from config.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub cache_num: Option<u32>,
    #[serde(default)]
    pub policy: Option<MismatchPolicy>,
}

impl GatherParams {
    pub fn all(queues: Vec<QueueRoute>) -> Self {
        let inputs_count = queues.len() as u32;
        Self {
            queues,
            inputs_count,
            timeout_ms: None,
            cache_num: None,
            policy: None,
        }
    }
}

/// Dequeue one item per queue whose offset timestamps lie within `interval`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchParams {
    pub queues: Vec<QueueRoute>,
    /// Per-queue timestamp offset. Empty means zero for every queue.
    #[serde(default)]
    pub offsets: Vec<u64>,
    pub interval: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kernel", rename_all = "snake_case")]
pub enum TaskParams {
    WaitNotify { notify_id: NotifyId },
    RecordNotify { notify_id: NotifyId },
    /// `lock_type` is raw: 0 read, 1 write.
    LockTable { table_id: TableId, lock_type: u32 },
    UnlockTable { table_id: TableId, lock_type: u32 },
    WaitEndGraph { target: ModelId },
    EndGraph,
    GatherDequeue(GatherParams),
    BatchDequeue(BatchParams),
    Enqueue { queues: Vec<QueueId> },
}

impl TaskParams {
    /// Name of the kernel that executes these params.
    pub fn kernel_name(&self) -> &'static str {
        match self {
            TaskParams::WaitNotify { .. } => "wait_notify",
            TaskParams::RecordNotify { .. } => "record_notify",
            TaskParams::LockTable { .. } => "lock_table",
            TaskParams::UnlockTable { .. } => "unlock_table",
            TaskParams::WaitEndGraph { .. } => "wait_end_graph",
            TaskParams::EndGraph => "end_graph",
            TaskParams::GatherDequeue(_) => "gather_dequeue",
            TaskParams::BatchDequeue(_) => "batch_dequeue",
            TaskParams::Enqueue { .. } => "enqueue",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub task_id: TaskId,
    /// Model the descriptor was built for; must match the running stream's.
    pub model_id: ModelId,
    pub params: TaskParams,
}

impl TaskDescriptor {
    pub fn new(task_id: u32, model_id: ModelId, params: TaskParams) -> Self {
        Self {
            task_id: TaskId(task_id),
            model_id,
            params,
        }
    }

    pub fn kernel_name(&self) -> &'static str {
        self.params.kernel_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_names_route_by_variant() {
        let t = TaskDescriptor::new(
            0,
            ModelId(1),
            TaskParams::GatherDequeue(GatherParams::all(vec![QueueRoute::local(QueueId(1))])),
        );
        assert_eq!(t.kernel_name(), "gather_dequeue");
        assert_eq!(TaskParams::EndGraph.kernel_name(), "end_graph");
    }

    #[test]
    fn descriptors_deserialize_from_json() {
        let raw = r#"{
            "task_id": 3,
            "model_id": 0,
            "params": {"kernel": "lock_table", "table_id": 7, "lock_type": 1}
        }"#;
        let t: TaskDescriptor = serde_json::from_str(raw).unwrap();
        assert_eq!(
            t.params,
            TaskParams::LockTable {
                table_id: TableId(7),
                lock_type: 1
            }
        );
    }
}
