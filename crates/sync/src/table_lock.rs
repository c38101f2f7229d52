use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use stepd_core::TableId;

use crate::rwlock::{LockKind, TableRwLock};

/// Process-wide map of table id to its [`TableRwLock`].
///
/// The registry mutex guards only lookup and insert. Lock operations run on
/// the per-table lock after the registry mutex is released, so unrelated
/// tables never contend. Entries are created lazily and never removed.
#[derive(Debug, Default)]
pub struct TableLockRegistry {
    tables: Mutex<HashMap<TableId, Arc<TableRwLock>>>,
}

impl TableLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, table: TableId) -> Arc<TableRwLock> {
        let mut tables = self.tables.lock();
        Arc::clone(tables.entry(table).or_insert_with(|| {
            debug!(%table, "creating table lock");
            Arc::new(TableRwLock::new())
        }))
    }

    pub fn rd_lock(&self, table: TableId) -> bool {
        self.entry(table).try_read()
    }

    pub fn wr_lock(&self, table: TableId) -> bool {
        self.entry(table).try_write()
    }

    pub fn try_lock(&self, table: TableId, kind: LockKind) -> bool {
        let ok = self.entry(table).try_lock(kind);
        debug!(%table, ?kind, ok, "table try-lock");
        ok
    }

    pub fn unlock(&self, table: TableId, kind: LockKind) {
        self.entry(table).unlock(kind);
        debug!(%table, ?kind, "table unlocked");
    }

    pub fn table_count(&self) -> usize {
        self.tables.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn entries_are_created_lazily() {
        let registry = TableLockRegistry::new();
        assert_eq!(registry.table_count(), 0);
        assert!(registry.rd_lock(TableId(4)));
        assert!(registry.rd_lock(TableId(4)));
        assert!(registry.wr_lock(TableId(5)));
        assert_eq!(registry.table_count(), 2);
    }

    #[test]
    fn tables_are_independent() {
        let registry = TableLockRegistry::new();
        assert!(registry.wr_lock(TableId(1)));
        assert!(registry.wr_lock(TableId(2)));
        assert!(!registry.rd_lock(TableId(1)));
        registry.unlock(TableId(1), LockKind::Write);
        assert!(registry.rd_lock(TableId(1)));
    }

    #[test]
    fn writer_excludes_readers_across_threads() {
        let registry = Arc::new(TableLockRegistry::new());
        assert!(registry.wr_lock(TableId(9)));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || registry.try_lock(TableId(9), LockKind::Read))
            })
            .collect();
        for h in handles {
            assert!(!h.join().unwrap());
        }

        registry.unlock(TableId(9), LockKind::Write);
        assert!(registry.try_lock(TableId(9), LockKind::Read));
    }

    #[test]
    fn unlock_of_unknown_table_creates_entry_and_is_harmless() {
        let registry = TableLockRegistry::new();
        registry.unlock(TableId(3), LockKind::Read);
        assert_eq!(registry.table_count(), 1);
        assert!(registry.wr_lock(TableId(3)));
    }
}
