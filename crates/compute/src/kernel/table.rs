use std::sync::Arc;

use tracing::debug;

use stepd_core::{StatusCode, TableId};
use stepd_sync::{LockKind, WaitCategory};

use super::{fail, resolve_model, wrong_params, KernelStep, RunContext, TaskDescriptor, TaskParams, WaitKey};
use crate::runtime::Runtime;

fn decode(table_id: TableId, lock_type: u32) -> Result<LockKind, StatusCode> {
    if !table_id.is_valid() {
        debug!(%table_id, "invalid table id");
        return Err(StatusCode::ParameterInvalid);
    }
    LockKind::from_raw(lock_type).ok_or_else(|| {
        debug!(%table_id, lock_type, "lock type out of range");
        StatusCode::ParameterInvalid
    })
}

/// Takes a table lock, pending on the model's table-unlock wait while the
/// table is held elsewhere.
pub struct LockTable {
    runtime: Arc<Runtime>,
}

impl LockTable {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self { runtime }
    }
}

impl KernelStep for LockTable {
    fn name(&self) -> &'static str {
        "lock_table"
    }

    fn compute(&self, task: &TaskDescriptor, ctx: &mut RunContext) -> StatusCode {
        let TaskParams::LockTable { table_id, lock_type } = task.params else {
            return wrong_params(self.name(), task);
        };
        let kind = match decode(table_id, lock_type) {
            Ok(kind) => kind,
            Err(status) => return status,
        };
        let model = match resolve_model(&self.runtime, task, ctx) {
            Ok(model) => model,
            Err(status) => return status,
        };
        let unlock_wait = self.runtime.waits.get(WaitCategory::TableUnlock);
        let wait_id = model.id().0;
        if let Err(e) = unlock_wait.reset(wait_id) {
            return fail(self.name(), ctx, e);
        }
        // Mark the attempt before trying so a release racing with the
        // failed try still reaches this model.
        model.locks().tried = Some(table_id);

        loop {
            if self.runtime.tables.try_lock(table_id, kind) {
                let mut locks = model.locks();
                locks.record_held(table_id, kind);
                locks.tried = None;
                debug!(model = %model.id(), %table_id, ?kind, "table locked");
                return StatusCode::Ok;
            }
            match unlock_wait.wait_or_consume(wait_id, ctx.stream_id) {
                Ok(true) => {
                    debug!(model = %model.id(), %table_id, ?kind, "table busy, pending");
                    ctx.pend(WaitKey::new(WaitCategory::TableUnlock, wait_id));
                    return StatusCode::Ok;
                }
                Ok(false) => continue,
                Err(e) => return fail(self.name(), ctx, e),
            }
        }
    }
}

/// Releases a table lock the model holds and resumes models trying it.
/// Releasing a lock that is not held is a no-op.
pub struct UnlockTable {
    runtime: Arc<Runtime>,
}

impl UnlockTable {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self { runtime }
    }
}

impl KernelStep for UnlockTable {
    fn name(&self) -> &'static str {
        "unlock_table"
    }

    fn compute(&self, task: &TaskDescriptor, ctx: &mut RunContext) -> StatusCode {
        let TaskParams::UnlockTable { table_id, lock_type } = task.params else {
            return wrong_params(self.name(), task);
        };
        let kind = match decode(table_id, lock_type) {
            Ok(kind) => kind,
            Err(status) => return status,
        };
        let model = match resolve_model(&self.runtime, task, ctx) {
            Ok(model) => model,
            Err(status) => return status,
        };
        if !model.locks().clear_held(table_id, kind) {
            debug!(model = %model.id(), %table_id, ?kind, "table not held, nothing to unlock");
            return StatusCode::Ok;
        }
        self.runtime.tables.unlock(table_id, kind);
        ctx.woken
            .extend(self.runtime.models.announce_table_unlock(table_id));
        StatusCode::Ok
    }
}
