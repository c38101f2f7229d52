//! External events: driver and peer notifications that satisfy a wait.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use stepd_core::{ModelId, QueueId, Result, SchedError, StreamId, TableId};
use stepd_sync::WaitCategory;

use crate::runtime::Runtime;

/// Requeues a stream a wait coordinator handed back from `announce`.
pub trait StreamWaker: Send + Sync {
    fn wake(&self, stream: StreamId);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExternalEvent {
    QueueNotEmpty { queue: QueueId },
    QueueNotFull { queue: QueueId },
    TableUnlock { table: TableId },
    /// A remote producer supplied data for the model's gather.
    SupplyEnqueue { model: ModelId },
    PrepareMem { model: ModelId },
    EndGraph { model: ModelId },
    /// The transaction failed upstream; its cached gather items are dropped.
    TransException { model: ModelId, trans_id: u64 },
}

pub struct EventDispatcher {
    runtime: Arc<Runtime>,
    waker: Arc<dyn StreamWaker>,
}

impl EventDispatcher {
    pub fn new(runtime: Arc<Runtime>, waker: Arc<dyn StreamWaker>) -> Self {
        Self { runtime, waker }
    }

    /// Announce the event to its coordinator and wake whoever waited.
    /// Returns the woken streams.
    pub fn dispatch(&self, event: ExternalEvent) -> Result<Vec<StreamId>> {
        let waits = &self.runtime.waits;
        let woken: Vec<StreamId> = match event {
            ExternalEvent::QueueNotEmpty { queue } => {
                match waits.get(WaitCategory::QueueNotEmpty).announce(queue.0)? {
                    Some(stream) => vec![stream],
                    None => match self.runtime.models.model_by_queue(queue) {
                        Some(model) => self.announce_model(WaitCategory::AnyQueueNotEmpty, model)?,
                        None => {
                            debug!(%queue, "queue has no consuming model");
                            Vec::new()
                        }
                    },
                }
            }
            ExternalEvent::QueueNotFull { queue } => waits
                .get(WaitCategory::QueueNotFull)
                .announce(queue.0)?
                .into_iter()
                .collect(),
            ExternalEvent::TableUnlock { table } => self.runtime.models.announce_table_unlock(table),
            ExternalEvent::SupplyEnqueue { model } => {
                self.announce_model(WaitCategory::AnyQueueNotEmpty, model)?
            }
            ExternalEvent::PrepareMem { model } => self.announce_model(WaitCategory::PrepareMem, model)?,
            ExternalEvent::EndGraph { model } => self.announce_model(WaitCategory::EndGraph, model)?,
            ExternalEvent::TransException { model, trans_id } => {
                let target = self
                    .runtime
                    .models
                    .get(model)
                    .ok_or(SchedError::ModelUnloaded(model))?;
                target.mark_exception(trans_id);
                info!(%model, trans_id, "transaction marked as failed");
                Vec::new()
            }
        };

        for stream in &woken {
            debug!(?event, %stream, "resuming stream");
            self.waker.wake(*stream);
        }
        Ok(woken)
    }

    fn announce_model(&self, category: WaitCategory, model: ModelId) -> Result<Vec<StreamId>> {
        if self.runtime.models.get(model).is_none() {
            warn!(%model, %category, "event for a model that is not loaded");
        }
        Ok(self
            .runtime
            .waits
            .get(category)
            .announce(model.0)?
            .into_iter()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use stepd_core::{SchedConfig, SimDriver};

    use super::*;
    use crate::model::ModelSpec;

    #[derive(Default)]
    struct RecordingWaker {
        woken: Mutex<Vec<StreamId>>,
    }

    impl StreamWaker for RecordingWaker {
        fn wake(&self, stream: StreamId) {
            self.woken.lock().push(stream);
        }
    }

    fn setup() -> (Arc<Runtime>, Arc<RecordingWaker>, EventDispatcher) {
        let config = SchedConfig {
            max_model_count: 4,
            max_notify_count: 4,
            max_queue_count: 16,
            ..SchedConfig::default()
        };
        let runtime = Runtime::new(config, Arc::new(SimDriver::new()));
        runtime
            .models
            .load(
                ModelId(1),
                ModelSpec {
                    input_queues: vec![QueueId(3)],
                    ..ModelSpec::default()
                },
            )
            .unwrap();
        let waker = Arc::new(RecordingWaker::default());
        let dispatcher = EventDispatcher::new(runtime.clone(), waker.clone());
        (runtime, waker, dispatcher)
    }

    #[test]
    fn queue_not_empty_prefers_the_queue_waiter() {
        let (runtime, waker, dispatcher) = setup();
        runtime
            .waits
            .get(WaitCategory::QueueNotEmpty)
            .wait_or_consume(3, StreamId(7))
            .unwrap();
        runtime
            .waits
            .get(WaitCategory::AnyQueueNotEmpty)
            .wait_or_consume(1, StreamId(8))
            .unwrap();

        let woken = dispatcher.dispatch(ExternalEvent::QueueNotEmpty { queue: QueueId(3) }).unwrap();
        assert_eq!(woken, vec![StreamId(7)]);
        assert_eq!(*waker.woken.lock(), vec![StreamId(7)]);
    }

    #[test]
    fn queue_not_empty_falls_back_to_owning_model() {
        let (runtime, waker, dispatcher) = setup();
        runtime
            .waits
            .get(WaitCategory::AnyQueueNotEmpty)
            .wait_or_consume(1, StreamId(8))
            .unwrap();

        dispatcher.dispatch(ExternalEvent::QueueNotEmpty { queue: QueueId(3) }).unwrap();
        assert_eq!(*waker.woken.lock(), vec![StreamId(8)]);
    }

    #[test]
    fn model_keyed_events_without_waiter_are_remembered() {
        let (runtime, waker, dispatcher) = setup();
        dispatcher.dispatch(ExternalEvent::PrepareMem { model: ModelId(1) }).unwrap();
        assert!(waker.woken.lock().is_empty());
        assert!(!runtime
            .waits
            .get(WaitCategory::PrepareMem)
            .wait_or_consume(1, StreamId(0))
            .unwrap());
    }

    #[test]
    fn trans_exception_marks_model() {
        let (runtime, _waker, dispatcher) = setup();
        dispatcher
            .dispatch(ExternalEvent::TransException {
                model: ModelId(1),
                trans_id: 42,
            })
            .unwrap();
        assert!(runtime.models.get(ModelId(1)).unwrap().is_exception(42));
        assert!(dispatcher
            .dispatch(ExternalEvent::TransException {
                model: ModelId(2),
                trans_id: 1,
            })
            .is_err());
    }

    #[test]
    fn out_of_range_queue_is_rejected() {
        let (_runtime, _waker, dispatcher) = setup();
        assert!(matches!(
            dispatcher.dispatch(ExternalEvent::QueueNotFull { queue: QueueId(99) }),
            Err(SchedError::ParameterInvalid(_))
        ));
    }
}
