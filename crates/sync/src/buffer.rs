//! Model-scoped ownership of accelerator buffers.
//!
//! A buffer a model holds is an [`OwnedBuffer`]: dropping it frees the handle
//! once, and transferring it elsewhere disarms it first. The tracker keeps
//! one list per model slot, each behind its own lock, so that teardown can
//! reclaim everything a model still holds.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use stepd_core::{BufferHandle, Driver, DriverError, ModelId, Result, SchedError};

/// A driver buffer that is freed exactly once unless ownership is handed off.
pub struct OwnedBuffer {
    handle: BufferHandle,
    driver: Arc<dyn Driver>,
    armed: bool,
}

impl OwnedBuffer {
    pub fn new(handle: BufferHandle, driver: Arc<dyn Driver>) -> Self {
        Self {
            handle,
            driver,
            armed: true,
        }
    }

    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    /// Give up ownership without freeing.
    pub fn into_handle(mut self) -> BufferHandle {
        self.armed = false;
        self.handle
    }

    /// Free now and report the driver's verdict.
    pub fn free(mut self) -> std::result::Result<(), DriverError> {
        self.armed = false;
        self.driver.free(self.handle)
    }
}

impl Drop for OwnedBuffer {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.driver.free(self.handle) {
                warn!(handle = %self.handle, error = %e, "free on drop failed");
            }
        }
    }
}

impl std::fmt::Debug for OwnedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnedBuffer")
            .field("handle", &self.handle)
            .field("armed", &self.armed)
            .finish()
    }
}

pub struct BufferOwnershipTracker {
    driver: Arc<dyn Driver>,
    slots: Vec<Mutex<Vec<OwnedBuffer>>>,
}

impl BufferOwnershipTracker {
    pub fn new(driver: Arc<dyn Driver>, max_model_count: usize) -> Self {
        Self {
            driver,
            slots: (0..max_model_count).map(|_| Mutex::new(Vec::new())).collect(),
        }
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    fn slot(&self, model: ModelId) -> Result<&Mutex<Vec<OwnedBuffer>>> {
        self.slots.get(model.index()).ok_or_else(|| {
            SchedError::Inner(format!(
                "{} out of range, tracker has {} slots",
                model,
                self.slots.len()
            ))
        })
    }

    /// Allocate `size` bytes from the driver and own them for `model`.
    pub fn allocate_and_own(&self, size: u64, model: ModelId) -> Result<BufferHandle> {
        let slot = self.slot(model)?;
        let handle = self.driver.alloc(size)?;
        slot.lock()
            .push(OwnedBuffer::new(handle, Arc::clone(&self.driver)));
        debug!(%model, %handle, size, "allocated and owned");
        Ok(handle)
    }

    /// Allocate one buffer per size. Stops at the first failure; buffers
    /// allocated before it stay owned.
    pub fn allocate_list_and_own(&self, sizes: &[u64], model: ModelId) -> Result<Vec<BufferHandle>> {
        sizes
            .iter()
            .map(|&size| self.allocate_and_own(size, model))
            .collect()
    }

    /// Own a handle obtained elsewhere, e.g. from a dequeue. A handle the
    /// model already owns is rejected so it cannot be freed twice.
    pub fn own(&self, handle: BufferHandle, model: ModelId) -> Result<()> {
        if handle.is_null() {
            return Err(SchedError::ParameterInvalid(format!(
                "cannot own null buffer for {}",
                model
            )));
        }
        let mut owned = self.slot(model)?.lock();
        if owned.iter().any(|b| b.handle() == handle) {
            return Err(SchedError::ParameterInvalid(format!(
                "{} already owns {}",
                model, handle
            )));
        }
        owned.push(OwnedBuffer::new(handle, Arc::clone(&self.driver)));
        Ok(())
    }

    fn take(&self, model: ModelId, handle: BufferHandle) -> Result<Option<OwnedBuffer>> {
        let mut owned = self.slot(model)?.lock();
        Ok(owned
            .iter()
            .position(|b| b.handle() == handle)
            .map(|pos| owned.remove(pos)))
    }

    /// Stop tracking `handle` without freeing it. A handle that is not owned
    /// is tolerated; the null handle is not.
    pub fn disown(&self, model: ModelId, handle: BufferHandle) -> Result<()> {
        if handle.is_null() {
            return Err(SchedError::ParameterInvalid(format!(
                "cannot disown null buffer for {}",
                model
            )));
        }
        match self.take(model, handle)? {
            Some(buf) => {
                buf.into_handle();
            }
            None => warn!(%model, %handle, "disown of a buffer the model does not own"),
        }
        Ok(())
    }

    /// Stop tracking `handle` and free it.
    pub fn free_owned(&self, model: ModelId, handle: BufferHandle) -> Result<()> {
        match self.take(model, handle)? {
            Some(buf) => buf.free().map_err(SchedError::from),
            None => {
                warn!(%model, %handle, "free of a buffer the model does not own");
                Ok(())
            }
        }
    }

    /// Free every buffer `model` still owns. Individual free failures are
    /// logged and skipped.
    pub fn release_model(&self, model: ModelId) -> Result<()> {
        let drained: Vec<OwnedBuffer> = std::mem::take(&mut *self.slot(model)?.lock());
        if drained.is_empty() {
            return Ok(());
        }
        let total = drained.len();
        let mut failed = 0usize;
        for buf in drained {
            let handle = buf.handle();
            if let Err(e) = buf.free() {
                failed += 1;
                warn!(%model, %handle, error = %e, "free during release failed");
            }
        }
        info!(%model, total, failed, "released model buffers");
        Ok(())
    }

    pub fn release_all(&self) {
        for idx in 0..self.slots.len() {
            let model = ModelId(idx as u32);
            if let Err(e) = self.release_model(model) {
                warn!(%model, error = %e, "release failed");
            }
        }
    }

    pub fn owned_count(&self, model: ModelId) -> usize {
        self.slot(model).map(|s| s.lock().len()).unwrap_or(0)
    }

    pub fn owns(&self, model: ModelId, handle: BufferHandle) -> bool {
        self.slot(model)
            .map(|s| s.lock().iter().any(|b| b.handle() == handle))
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for BufferOwnershipTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferOwnershipTracker")
            .field("slots", &self.slots.len())
            .finish()
    }
}
