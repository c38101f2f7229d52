use std::sync::Arc;

use stepd_core::{Driver, SchedConfig};
use stepd_sync::{BufferOwnershipTracker, TableLockRegistry, WaitHub};

use crate::model::ModelRegistry;

/// Process-wide services every kernel step works against.
///
/// Built once at startup and shared by `Arc`; tests build isolated ones.
#[derive(Debug)]
pub struct Runtime {
    pub config: SchedConfig,
    pub waits: Arc<WaitHub>,
    pub tables: Arc<TableLockRegistry>,
    pub buffers: Arc<BufferOwnershipTracker>,
    pub models: ModelRegistry,
}

impl Runtime {
    pub fn new(config: SchedConfig, driver: Arc<dyn Driver>) -> Arc<Self> {
        let waits = Arc::new(WaitHub::new(&config));
        let tables = Arc::new(TableLockRegistry::new());
        let buffers = Arc::new(BufferOwnershipTracker::new(
            driver,
            config.max_model_count as usize,
        ));
        let models = ModelRegistry::new(
            Arc::clone(&waits),
            Arc::clone(&tables),
            Arc::clone(&buffers),
        );
        Arc::new(Self {
            config,
            waits,
            tables,
            buffers,
            models,
        })
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        self.buffers.driver()
    }
}
