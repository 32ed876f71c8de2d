//! Shared-cache table locks
//!
//! Handles that share one file take read or write locks on individual
//! trees, keyed by root page. A handle that is not sharable never records
//! or checks locks.

use log::trace;

use crate::error::{Error, ErrorCode, Result};
use crate::types::{BtreeId, Pgno};

use super::types::{BtLock, BtsFlags, MASTER_ROOT};
use super::BtShared;

/// One lock held by a handle on a tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct TableLock {
    pub btree: BtreeId,
    pub table: Pgno,
    pub lock: BtLock,
}

impl BtShared {
    /// Check that `btree` may take `lock` on `table` without recording it.
    pub(crate) fn query_table_lock(&mut self, btree: BtreeId, table: Pgno, lock: BtLock) -> Result<()> {
        let handle = self.handle(btree)?;
        if !handle.sharable {
            return Ok(());
        }
        if self.writer != Some(btree) && self.bts_flags.contains(BtsFlags::EXCLUSIVE) {
            return Err(Error::with_message(
                ErrorCode::Locked,
                "another handle holds an exclusive transaction",
            ));
        }
        let conflict = self
            .locks
            .iter()
            .find(|held| held.btree != btree && held.table == table && held.lock != lock)
            .copied();
        if let Some(held) = conflict {
            if lock == BtLock::Write {
                self.bts_flags.insert(BtsFlags::PENDING);
            }
            trace!(
                "handle {} wants {:?} on table {}, handle {} holds {:?}",
                btree,
                lock,
                table,
                held.btree,
                held.lock
            );
            return Err(Error::with_message(
                ErrorCode::Locked,
                format!("table {} is locked", table),
            ));
        }
        Ok(())
    }

    /// Record `lock` on `table` for `btree`, upgrading a read lock it already
    /// holds. The caller has checked the request with `query_table_lock`.
    pub(crate) fn set_table_lock(&mut self, btree: BtreeId, table: Pgno, lock: BtLock) -> Result<()> {
        if !self.handle(btree)?.sharable {
            return Ok(());
        }
        match self
            .locks
            .iter_mut()
            .find(|held| held.btree == btree && held.table == table)
        {
            Some(held) => {
                if lock > held.lock {
                    held.lock = lock;
                }
            }
            None => self.locks.push(TableLock { btree, table, lock }),
        }
        Ok(())
    }

    /// Query and then record a lock. Read locks of a read-uncommitted handle
    /// on anything but the master table are never taken.
    pub(crate) fn lock_table(&mut self, btree: BtreeId, table: Pgno, lock: BtLock) -> Result<()> {
        let handle = self.handle(btree)?;
        if !handle.sharable {
            return Ok(());
        }
        if lock == BtLock::Read && handle.read_uncommitted && table != MASTER_ROOT {
            return Ok(());
        }
        self.query_table_lock(btree, table, lock)?;
        self.set_table_lock(btree, table, lock)
    }

    /// Drop every lock `btree` holds. Releasing the writer's locks also
    /// clears the exclusive and pending flags.
    pub(crate) fn clear_all_table_locks(&mut self, btree: BtreeId) {
        self.locks.retain(|held| held.btree != btree);
        if self.writer == Some(btree) {
            self.writer = None;
            self.bts_flags.remove(BtsFlags::EXCLUSIVE | BtsFlags::PENDING);
        } else if self.n_transaction == 2 {
            // the one remaining transaction is the writer's
            self.bts_flags.remove(BtsFlags::PENDING);
        }
    }

    /// Locks currently held on `table`.
    pub(crate) fn table_locks(&self, table: Pgno) -> Vec<TableLock> {
        self.locks
            .iter()
            .filter(|held| held.table == table)
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::config::BtreeConfig;
    use crate::error::ErrorCode;
    use crate::shared_cache;
    use crate::storage::btree::{Btree, BtLock, BTREE_INTKEY};

    fn shared_pair(dir: &tempfile::TempDir) -> (Arc<Btree>, Arc<Btree>) {
        shared_cache::set_shared_cache_enabled(true);
        let path = dir.path().join("locks.db");
        let cfg = BtreeConfig::default().page_size(1024).shared_cache(true);
        let a = Btree::open(Some(&path), cfg.clone()).unwrap();
        let b = Btree::open(Some(&path), cfg).unwrap();
        assert!(a.shares_cache_with(&b));
        (a, b)
    }

    #[test]
    fn test_write_lock_blocks_other_readers() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = shared_pair(&dir);
        a.begin_trans(true).unwrap();
        let root = a.create_table(BTREE_INTKEY).unwrap();
        a.lock_table(root, true).unwrap();

        b.begin_trans(false).unwrap();
        let err = b.lock_table(root, false).unwrap_err();
        assert_eq!(err.code, ErrorCode::Locked);

        a.commit().unwrap();
        b.lock_table(root, false).unwrap();
        b.commit().unwrap();
    }

    #[test]
    fn test_failed_write_request_sets_pending() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = shared_pair(&dir);
        a.begin_trans(true).unwrap();
        let root = a.create_table(BTREE_INTKEY).unwrap();
        a.commit().unwrap();

        a.begin_trans(false).unwrap();
        a.lock_table(root, false).unwrap();
        b.begin_trans(false).unwrap();
        assert_eq!(b.lock_table(root, true).unwrap_err().code, ErrorCode::Locked);
        {
            let shared = a.lock_shared().unwrap();
            assert!(shared.bts_flags.contains(super::BtsFlags::PENDING));
            assert_eq!(shared.table_locks(root).len(), 1);
            assert_eq!(shared.table_locks(root)[0].lock, BtLock::Read);
        }
        a.commit().unwrap();
        b.commit().unwrap();
    }

    #[test]
    fn test_read_uncommitted_skips_read_locks() {
        let dir = tempfile::tempdir().unwrap();
        shared_cache::set_shared_cache_enabled(true);
        let path = dir.path().join("dirty.db");
        let cfg = BtreeConfig::default().page_size(1024).shared_cache(true);
        let a = Btree::open(Some(&path), cfg.clone()).unwrap();
        let b = Btree::open(Some(&path), cfg.read_uncommitted(true)).unwrap();
        a.begin_trans(true).unwrap();
        let root = a.create_table(BTREE_INTKEY).unwrap();
        a.lock_table(root, true).unwrap();
        b.begin_trans(false).unwrap();
        b.lock_table(root, false).unwrap();
        a.commit().unwrap();
        b.commit().unwrap();
    }
}
