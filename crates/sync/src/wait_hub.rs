use tracing::info;

use stepd_core::SchedConfig;

use crate::event_wait::{EventWaitCoordinator, WaitCategory};

/// One [`EventWaitCoordinator`] per [`WaitCategory`], sized from config.
///
/// Built once by the scheduler's startup sequence and shared by `Arc`.
#[derive(Debug)]
pub struct WaitHub {
    notify: EventWaitCoordinator,
    end_graph: EventWaitCoordinator,
    queue_not_empty: EventWaitCoordinator,
    queue_not_full: EventWaitCoordinator,
    prepare_mem: EventWaitCoordinator,
    any_queue_not_empty: EventWaitCoordinator,
    table_unlock: EventWaitCoordinator,
}

impl WaitHub {
    pub fn new(config: &SchedConfig) -> Self {
        let models = config.max_model_count as usize;
        let queues = config.max_queue_count as usize;
        let notifies = config.max_notify_count as usize;
        info!(models, queues, notifies, "building wait coordinators");
        Self {
            notify: EventWaitCoordinator::new(WaitCategory::Notify, notifies),
            end_graph: EventWaitCoordinator::new(WaitCategory::EndGraph, models),
            queue_not_empty: EventWaitCoordinator::new(WaitCategory::QueueNotEmpty, queues),
            queue_not_full: EventWaitCoordinator::new(WaitCategory::QueueNotFull, queues),
            prepare_mem: EventWaitCoordinator::new(WaitCategory::PrepareMem, models),
            any_queue_not_empty: EventWaitCoordinator::new(WaitCategory::AnyQueueNotEmpty, models),
            table_unlock: EventWaitCoordinator::new(WaitCategory::TableUnlock, models),
        }
    }

    pub fn get(&self, category: WaitCategory) -> &EventWaitCoordinator {
        match category {
            WaitCategory::Notify => &self.notify,
            WaitCategory::EndGraph => &self.end_graph,
            WaitCategory::QueueNotEmpty => &self.queue_not_empty,
            WaitCategory::QueueNotFull => &self.queue_not_full,
            WaitCategory::PrepareMem => &self.prepare_mem,
            WaitCategory::AnyQueueNotEmpty => &self.any_queue_not_empty,
            WaitCategory::TableUnlock => &self.table_unlock,
        }
    }

    /// Total registered waiters across all categories.
    pub fn total_waiters(&self) -> usize {
        WaitCategory::ALL
            .iter()
            .map(|c| self.get(*c).wait_count())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use stepd_core::StreamId;

    use super::*;

    fn small_config() -> SchedConfig {
        SchedConfig {
            max_model_count: 4,
            max_notify_count: 16,
            max_queue_count: 32,
            ..SchedConfig::default()
        }
    }

    #[test]
    fn capacities_follow_config() {
        let hub = WaitHub::new(&small_config());
        assert_eq!(hub.get(WaitCategory::Notify).capacity(), 16);
        assert_eq!(hub.get(WaitCategory::QueueNotEmpty).capacity(), 32);
        assert_eq!(hub.get(WaitCategory::QueueNotFull).capacity(), 32);
        assert_eq!(hub.get(WaitCategory::EndGraph).capacity(), 4);
        assert_eq!(hub.get(WaitCategory::TableUnlock).capacity(), 4);
    }

    #[test]
    fn categories_are_independent() {
        let hub = WaitHub::new(&small_config());
        hub.get(WaitCategory::EndGraph).announce(1).unwrap();
        assert!(hub
            .get(WaitCategory::PrepareMem)
            .wait_or_consume(1, StreamId(0))
            .unwrap());
        assert_eq!(hub.total_waiters(), 1);
        for category in WaitCategory::ALL {
            assert_eq!(hub.get(category).category(), category);
        }
    }
}
