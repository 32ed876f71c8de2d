//! B-tree implementation

mod balance;
mod cache;
mod cursor;
mod encoding;
mod freelist;
mod integrity;
mod lock;
mod ops;
mod page;
mod record;
mod row_store;
mod types;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, warn};

use crate::config::BtreeConfig;
use crate::error::{Error, ErrorCode, Result};
use crate::shared_cache;
use crate::storage::pager::{Pager, PagerGetFlags, SavepointOp};
use crate::types::{BtreeId, CursorId, Pgno, RowId};
use crate::util::bitvec::BitVec;

pub use cursor::BtCursor;
pub use encoding::{read_varint, varint_len, write_varint};
pub use integrity::IntegrityCheckResult;
pub use page::{CellInfo, MemPage, OverflowCell, PageKind};
pub use record::{
    make_record, parse_record_fields, CollSeq, KeyInfo, RecordField, UnpackedRecord,
    KEYINFO_ORDER_DESC,
};
pub use row_store::RowStore;
pub use types::{
    BtLock, BtreeInsertFlags, BtsFlags, CursorState, DbHeader, PageLimits, TransState,
    BTREE_APPLICATION_ID, BTREE_BLOBKEY, BTREE_DATA_VERSION, BTREE_DEFAULT_CACHE_SIZE,
    BTREE_FILE_FORMAT, BTREE_FREE_PAGE_COUNT, BTREE_INCR_VACUUM, BTREE_INTKEY,
    BTREE_LARGEST_ROOT_PAGE, BTREE_SCHEMA_VERSION, BTREE_TEXT_ENCODING, BTREE_USER_VERSION,
    DEFAULT_PAGE_SIZE, MASTER_ROOT, MAX_PAGE_SIZE, MIN_PAGE_SIZE, MIN_USABLE_SIZE,
    PTF_INDEX_INTERIOR, PTF_INDEX_LEAF, PTF_TABLE_INTERIOR, PTF_TABLE_LEAF, SQLITE_N_BTREE_META,
};

use cursor::{save_all_cursors, CursorCore};
use encoding::{get4, put4};
use lock::TableLock;
use types::{FILE_HEADER_SIZE, HEADER_META_BASE, HEADER_PAGE_COUNT};

/// Content of one row handed to [`BtCursor::insert`].
#[derive(Debug, Clone, Default)]
pub struct BtreePayload {
    /// Record bytes of an index entry; unused for table trees
    pub key: Option<Vec<u8>>,
    /// Rowid of a table entry
    pub n_key: RowId,
    pub data: Vec<u8>,
    /// Zero bytes appended after `data`
    pub n_zero: u32,
}

impl BtreePayload {
    pub fn table(rowid: RowId, data: impl Into<Vec<u8>>) -> Self {
        Self {
            key: None,
            n_key: rowid,
            data: data.into(),
            n_zero: 0,
        }
    }

    pub fn index(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::default()
        }
    }

    pub fn with_zero_tail(mut self, n_zero: u32) -> Self {
        self.n_zero = n_zero;
        self
    }
}

/// Per-handle view of the shared file.
#[derive(Debug, Clone, Copy)]
pub(crate) struct HandleState {
    pub in_trans: TransState,
    pub sharable: bool,
    pub read_uncommitted: bool,
}

/// State of one open database file, shared by every handle on it.
pub struct BtShared {
    pub(crate) pager: Pager,
    pub(crate) limits: PageLimits,
    pub(crate) bts_flags: BtsFlags,
    /// Pages in the database, as recorded in the header of page 1
    pub(crate) n_page: Pgno,
    page1_loaded: bool,
    pub(crate) in_transaction: TransState,
    /// Handles holding a read or write transaction
    pub(crate) n_transaction: usize,
    pub(crate) writer: Option<BtreeId>,
    pub(crate) locks: Vec<TableLock>,
    /// Pages freed during the current write transaction whose content is live
    pub(crate) has_content: Option<BitVec>,
    pub(crate) cursors: BTreeMap<CursorId, CursorCore>,
    next_cursor_id: CursorId,
    next_btree_id: BtreeId,
    pub(crate) handles: BTreeMap<BtreeId, HandleState>,
    pub(crate) max_page_count: Pgno,
    pub(crate) spare_buffers: Vec<Vec<u8>>,
}

impl BtShared {
    fn new(mut pager: Pager, config: &BtreeConfig) -> Result<Self> {
        let mut flags = BtsFlags::empty();
        if config.read_only || pager.is_readonly() {
            flags.insert(BtsFlags::READ_ONLY);
        }
        if config.secure_delete {
            flags.insert(BtsFlags::SECURE_DELETE);
        }
        if pager.page_count() == 0 {
            pager.set_page_size(config.page_size, config.reserve)?;
        } else {
            flags.insert(BtsFlags::PAGESIZE_FIXED);
        }
        let limits = PageLimits::new(pager.page_size(), pager.usable_size())
            .with_secure_delete(config.secure_delete);
        Ok(Self {
            pager,
            limits,
            bts_flags: flags,
            n_page: 0,
            page1_loaded: false,
            in_transaction: TransState::None,
            n_transaction: 0,
            writer: None,
            locks: Vec::new(),
            has_content: None,
            cursors: BTreeMap::new(),
            next_cursor_id: 1,
            next_btree_id: 1,
            handles: BTreeMap::new(),
            max_page_count: config.max_page_count,
            spare_buffers: Vec::new(),
        })
    }

    fn register_handle(&mut self, sharable: bool, read_uncommitted: bool) -> BtreeId {
        let id = self.next_btree_id;
        self.next_btree_id += 1;
        self.handles.insert(
            id,
            HandleState {
                in_trans: TransState::None,
                sharable,
                read_uncommitted,
            },
        );
        id
    }

    pub(crate) fn handle(&self, id: BtreeId) -> Result<HandleState> {
        self.handles
            .get(&id)
            .copied()
            .ok_or_else(|| Error::with_message(ErrorCode::Misuse, "btree handle is closed"))
    }

    pub(crate) fn require_read(&self, id: BtreeId) -> Result<()> {
        if self.handle(id)?.in_trans == TransState::None {
            return Err(Error::with_message(ErrorCode::Misuse, "no transaction is open"));
        }
        Ok(())
    }

    pub(crate) fn require_write(&self, id: BtreeId) -> Result<()> {
        if self.bts_flags.contains(BtsFlags::READ_ONLY) {
            return Err(Error::new(ErrorCode::ReadOnly));
        }
        if self.handle(id)?.in_trans != TransState::Write {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                "no write transaction is open",
            ));
        }
        Ok(())
    }

    /// Take the shared lock and validate page 1.
    fn lock_btree(&mut self) -> Result<()> {
        self.pager.shared_lock()?;
        let n_page_file = self.pager.page_count();
        let mut header = [0u8; FILE_HEADER_SIZE];
        self.pager.read_file_header(&mut header)?;
        let mut n_page = get4(&header, HEADER_PAGE_COUNT);
        if n_page == 0 || header[24..28] != header[92..96] {
            n_page = n_page_file;
        }
        if n_page > 0 {
            let hdr = match DbHeader::parse(&header) {
                Ok(hdr) => hdr,
                Err(e) => {
                    self.pager.unlock();
                    return Err(e);
                }
            };
            if hdr.write_version > 1 {
                self.bts_flags.insert(BtsFlags::READ_ONLY);
            }
            if hdr.page_size != self.limits.page_size
                || hdr.page_size - hdr.reserve as u32 != self.limits.usable_size
            {
                self.pager.unlock();
                warn!(
                    "page 1 declares {} byte pages, file was opened with {}",
                    hdr.page_size, self.limits.page_size
                );
                return Err(Error::corrupt(1));
            }
            if n_page > n_page_file {
                self.pager.unlock();
                warn!("header claims {} pages, file holds {}", n_page, n_page_file);
                return Err(Error::corrupt(1));
            }
            self.bts_flags.insert(BtsFlags::PAGESIZE_FIXED);
        }
        self.n_page = n_page;
        self.page1_loaded = true;
        Ok(())
    }

    /// Drop the shared lock once no transaction needs it.
    fn unlock_if_unused(&mut self) {
        if self.in_transaction == TransState::None && self.page1_loaded {
            self.page1_loaded = false;
            self.pager.unlock();
        }
    }

    /// Write page 1 of an empty database: file header plus an empty master
    /// table leaf.
    fn new_database(&mut self) -> Result<()> {
        if self.n_page > 0 {
            return Ok(());
        }
        let mut page1 = MemPage::blank(1, self.limits, PTF_TABLE_LEAF)?;
        DbHeader::format(&mut page1.data, self.limits.page_size, self.pager.reserve());
        self.write_raw(1, &page1.data)?;
        self.bts_flags.insert(BtsFlags::PAGESIZE_FIXED);
        self.n_page = 1;
        debug!(
            "new database: {} byte pages, {} usable",
            self.limits.page_size, self.limits.usable_size
        );
        Ok(())
    }

    /// Re-read the page count after the pager restored older images.
    fn reload_page_count(&mut self) -> Result<()> {
        let mut n_page = 0;
        if self.pager.page_count() > 0 {
            let page1 = self.get_page(1, PagerGetFlags::empty())?;
            n_page = get4(&page1.data, HEADER_PAGE_COUNT);
        }
        if n_page == 0 {
            n_page = self.pager.page_count();
        }
        self.n_page = n_page;
        Ok(())
    }

    fn begin_trans(&mut self, id: BtreeId, write: bool, exclusive: bool) -> Result<()> {
        let handle = self.handle(id)?;
        if handle.in_trans == TransState::Write || (handle.in_trans == TransState::Read && !write) {
            return Ok(());
        }
        if write && self.bts_flags.contains(BtsFlags::READ_ONLY) {
            return Err(Error::new(ErrorCode::ReadOnly));
        }
        if (write && self.in_transaction == TransState::Write)
            || self.bts_flags.contains(BtsFlags::PENDING)
        {
            return Err(Error::with_message(
                ErrorCode::Locked,
                "another handle holds the write transaction",
            ));
        }
        if exclusive && self.locks.iter().any(|lock| lock.btree != id) {
            return Err(Error::with_message(
                ErrorCode::Locked,
                "tables are locked by another handle",
            ));
        }
        self.query_table_lock(id, MASTER_ROOT, BtLock::Read)?;

        self.bts_flags.remove(BtsFlags::INITIALLY_EMPTY);
        if self.n_page == 0 {
            self.bts_flags.insert(BtsFlags::INITIALLY_EMPTY);
        }
        let mut result = Ok(());
        if !self.page1_loaded {
            result = self.lock_btree();
        }
        if result.is_ok() && write {
            if self.bts_flags.contains(BtsFlags::READ_ONLY) {
                result = Err(Error::new(ErrorCode::ReadOnly));
            } else {
                result = self.pager.begin().and_then(|_| self.new_database());
            }
        }
        if let Err(e) = result {
            self.unlock_if_unused();
            return Err(e);
        }

        if handle.in_trans == TransState::None {
            self.n_transaction += 1;
            if handle.sharable {
                self.set_table_lock(id, MASTER_ROOT, BtLock::Read)?;
            }
        }
        let in_trans = if write { TransState::Write } else { TransState::Read };
        if let Some(h) = self.handles.get_mut(&id) {
            h.in_trans = in_trans;
        }
        if in_trans > self.in_transaction {
            self.in_transaction = in_trans;
        }
        if write {
            self.writer = Some(id);
            self.bts_flags.remove(BtsFlags::EXCLUSIVE);
            if exclusive {
                self.bts_flags.insert(BtsFlags::EXCLUSIVE);
            }
            let mut page1 = self.get_page(1, PagerGetFlags::empty())?;
            if get4(&page1.data, HEADER_PAGE_COUNT) != self.n_page {
                put4(&mut page1.data, HEADER_PAGE_COUNT, self.n_page);
                self.write_raw(1, &page1.data)?;
            }
        }
        debug!(
            "handle {} began a {} transaction ({} pages)",
            id,
            if write { "write" } else { "read" },
            self.n_page
        );
        Ok(())
    }

    /// Release the handle's transaction and its table locks.
    fn end_transaction(&mut self, id: BtreeId) {
        let in_trans = self.handles.get(&id).map(|h| h.in_trans);
        if let Some(state) = in_trans {
            if state != TransState::None {
                self.clear_all_table_locks(id);
                self.n_transaction = self.n_transaction.saturating_sub(1);
                if self.n_transaction == 0 {
                    self.in_transaction = TransState::None;
                }
            }
        }
        if let Some(h) = self.handles.get_mut(&id) {
            h.in_trans = TransState::None;
        }
        self.unlock_if_unused();
    }

    fn commit_phase_one(&mut self, id: BtreeId) -> Result<()> {
        if self.handle(id)?.in_trans == TransState::Write {
            self.pager.commit_phase_one()?;
        }
        Ok(())
    }

    fn commit_phase_two(&mut self, id: BtreeId) -> Result<()> {
        let in_trans = self.handle(id)?.in_trans;
        if in_trans == TransState::None {
            return Ok(());
        }
        if in_trans == TransState::Write {
            self.pager.commit_phase_two()?;
            self.in_transaction = TransState::Read;
            self.clear_has_content();
            debug!("handle {} committed ({} pages)", id, self.n_page);
        }
        self.end_transaction(id);
        Ok(())
    }

    /// Fault cursors that may have seen pages the rollback replaces: every
    /// cursor when `all` is set, otherwise only those of handle `id`.
    fn trip_cursors(&mut self, id: BtreeId, all: bool) {
        for core in self.cursors.values_mut() {
            if all || core.btree_id == id {
                core.trip(Error::with_message(
                    ErrorCode::Abort,
                    "transaction rolled back",
                ));
            }
        }
    }

    fn rollback(&mut self, id: BtreeId) -> Result<()> {
        let in_trans = self.handle(id)?.in_trans;
        self.trip_cursors(id, in_trans == TransState::Write);
        let mut result = Ok(());
        if in_trans == TransState::Write {
            result = self.pager.rollback().and_then(|_| self.reload_page_count());
            self.in_transaction = TransState::Read;
            self.clear_has_content();
            debug!("handle {} rolled back ({} pages)", id, self.n_page);
        }
        self.end_transaction(id);
        result
    }

    fn savepoint(&mut self, id: BtreeId, op: SavepointOp, index: usize) -> Result<()> {
        if self.handle(id)?.in_trans != TransState::Write {
            return Ok(());
        }
        if op == SavepointOp::Rollback {
            save_all_cursors(self, 0)?;
        }
        self.pager.savepoint(op, index)?;
        if op == SavepointOp::Rollback {
            self.reload_page_count()?;
            if self.n_page == 0 {
                self.new_database()?;
            }
        }
        Ok(())
    }
}

/// An open handle on a database file.
pub struct Btree {
    shared: Arc<Mutex<BtShared>>,
    id: BtreeId,
    sharable: bool,
}

impl std::fmt::Debug for Btree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Btree")
            .field("id", &self.id)
            .field("sharable", &self.sharable)
            .finish()
    }
}

impl Btree {
    /// Open `path`, or a private in-memory database when `path` is None.
    pub fn open(path: Option<&Path>, config: BtreeConfig) -> Result<Arc<Btree>> {
        if !config.is_valid_geometry() {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                format!(
                    "invalid page geometry: {} byte pages with {} reserved",
                    config.page_size, config.reserve
                ),
            ));
        }
        let sharable = config.shared_cache && shared_cache::shared_cache_enabled() && path.is_some();
        if sharable {
            if let Some(existing) = path.and_then(shared_cache::lookup) {
                let id = existing
                    .lock()
                    .map_err(|_| Error::new(ErrorCode::Internal))?
                    .register_handle(true, config.read_uncommitted);
                debug!("handle {} joined a shared cache", id);
                return Ok(Arc::new(Btree {
                    shared: existing,
                    id,
                    sharable: true,
                }));
            }
        }

        let pager = Pager::open(path, config.read_only)?;
        let mut state = BtShared::new(pager, &config)?;
        let id = state.register_handle(sharable, config.read_uncommitted);
        let shared = Arc::new(Mutex::new(state));
        if sharable {
            if let Some(path) = path {
                shared_cache::insert(path, &shared);
            }
        }
        debug!(
            "handle {} opened {}",
            id,
            path.map(|p| p.display().to_string())
                .unwrap_or_else(|| "an in-memory database".to_string())
        );
        Ok(Arc::new(Btree {
            shared,
            id,
            sharable,
        }))
    }

    pub(crate) fn lock_shared(&self) -> Result<MutexGuard<'_, BtShared>> {
        self.shared
            .lock()
            .map_err(|_| Error::with_message(ErrorCode::Internal, "btree state lock poisoned"))
    }

    pub fn id(&self) -> BtreeId {
        self.id
    }

    pub fn is_sharable(&self) -> bool {
        self.sharable
    }

    /// True when both handles use the same underlying file state.
    pub fn shares_cache_with(&self, other: &Btree) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn page_size(&self) -> Result<u32> {
        Ok(self.lock_shared()?.limits.page_size)
    }

    pub fn usable_size(&self) -> Result<u32> {
        Ok(self.lock_shared()?.limits.usable_size)
    }

    /// Pages in the database as of the current transaction.
    pub fn page_count(&self) -> Result<Pgno> {
        Ok(self.lock_shared()?.n_page)
    }

    pub fn is_read_only(&self) -> Result<bool> {
        Ok(self.lock_shared()?.bts_flags.contains(BtsFlags::READ_ONLY))
    }

    pub fn txn_state(&self) -> TransState {
        self.lock_shared()
            .ok()
            .and_then(|shared| shared.handle(self.id).ok())
            .map(|h| h.in_trans)
            .unwrap_or(TransState::None)
    }

    pub fn set_secure_delete(&self, on: bool) -> Result<()> {
        let mut shared = self.lock_shared()?;
        shared.bts_flags.set(BtsFlags::SECURE_DELETE, on);
        shared.limits = shared.limits.with_secure_delete(on);
        Ok(())
    }

    pub fn secure_delete(&self) -> Result<bool> {
        Ok(self.lock_shared()?.bts_flags.contains(BtsFlags::SECURE_DELETE))
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    pub fn begin_trans(&self, write: bool) -> Result<()> {
        self.lock_shared()?.begin_trans(self.id, write, false)
    }

    /// Begin a write transaction that also keeps other handles from taking
    /// new table locks.
    pub fn begin_exclusive(&self) -> Result<()> {
        self.lock_shared()?.begin_trans(self.id, true, true)
    }

    /// Flush the write transaction to the file.
    pub fn commit_phase_one(&self) -> Result<()> {
        self.lock_shared()?.commit_phase_one(self.id)
    }

    /// Finish the commit and end the transaction.
    pub fn commit_phase_two(&self) -> Result<()> {
        self.lock_shared()?.commit_phase_two(self.id)
    }

    pub fn commit(&self) -> Result<()> {
        let mut shared = self.lock_shared()?;
        shared.commit_phase_one(self.id)?;
        shared.commit_phase_two(self.id)
    }

    /// Abandon the current transaction. Open cursors are tripped and return
    /// an `Abort` error from then on.
    pub fn rollback(&self) -> Result<()> {
        self.lock_shared()?.rollback(self.id)
    }

    /// Open statement sub-transactions so that `index` savepoints exist.
    pub fn begin_stmt(&self, index: usize) -> Result<()> {
        let mut shared = self.lock_shared()?;
        shared.require_write(self.id)?;
        shared.pager.open_savepoint(index)
    }

    pub fn savepoint(&self, op: SavepointOp, index: usize) -> Result<()> {
        self.lock_shared()?.savepoint(self.id, op, index)
    }

    // ========================================================================
    // Metadata
    // ========================================================================

    /// Read one of the 4-byte metadata fields of page 1.
    pub fn get_meta(&self, idx: usize) -> Result<u32> {
        if idx >= SQLITE_N_BTREE_META {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                format!("no metadata field {}", idx),
            ));
        }
        let mut shared = self.lock_shared()?;
        shared.require_read(self.id)?;
        if idx == BTREE_DATA_VERSION {
            return Ok(shared.pager.data_version());
        }
        if shared.n_page == 0 {
            return Ok(0);
        }
        let page1 = shared.get_page(1, PagerGetFlags::empty())?;
        Ok(get4(&page1.data, HEADER_META_BASE + 4 * idx))
    }

    /// Write a metadata field. Field 0 is the free-page count and is
    /// maintained by the free-list.
    pub fn update_meta(&self, idx: usize, value: u32) -> Result<()> {
        if idx == BTREE_FREE_PAGE_COUNT || idx >= BTREE_DATA_VERSION {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                format!("metadata field {} is not writable", idx),
            ));
        }
        let mut shared = self.lock_shared()?;
        shared.require_write(self.id)?;
        let mut page1 = shared.get_page(1, PagerGetFlags::empty())?;
        put4(&mut page1.data, HEADER_META_BASE + 4 * idx, value);
        shared.write_raw(1, &page1.data)
    }

    // ========================================================================
    // Tables and cursors
    // ========================================================================

    /// Create a new empty tree. `flags` is [`BTREE_INTKEY`] for a table or
    /// [`BTREE_BLOBKEY`] for an index. Returns the root page.
    pub fn create_table(&self, flags: u8) -> Result<Pgno> {
        let mut shared = self.lock_shared()?;
        shared.require_write(self.id)?;
        ops::create_table(&mut shared, flags)
    }

    /// Free every page of the tree rooted at `root`, including the root.
    pub fn drop_table(&self, root: Pgno) -> Result<()> {
        let mut shared = self.lock_shared()?;
        shared.require_write(self.id)?;
        ops::drop_table(&mut shared, root)
    }

    /// Delete every entry of the tree rooted at `root`. Returns the number of
    /// entries removed.
    pub fn clear_table(&self, root: Pgno) -> Result<i64> {
        let mut shared = self.lock_shared()?;
        shared.require_write(self.id)?;
        ops::clear_table(&mut shared, root)
    }

    /// Take a table lock for this handle (shared-cache mode only).
    pub fn lock_table(&self, root: Pgno, write: bool) -> Result<()> {
        let lock = if write { BtLock::Write } else { BtLock::Read };
        self.lock_shared()?.lock_table(self.id, root, lock)
    }

    /// Open a cursor on the tree rooted at `root`. Index cursors compare
    /// records with `key_info`, or bytewise without one.
    pub fn cursor(
        self: &Arc<Self>,
        root: Pgno,
        write: bool,
        key_info: Option<Arc<KeyInfo>>,
    ) -> Result<BtCursor> {
        let mut shared = self.lock_shared()?;
        let id = shared.open_cursor(self.id, root, write, key_info, false)?;
        drop(shared);
        Ok(BtCursor::new(Arc::clone(self), id, root, None))
    }

    /// Open a cursor whose operations are served by `store` instead of pages.
    pub fn cursor_with_row_store(
        self: &Arc<Self>,
        root: Pgno,
        write: bool,
        store: Box<dyn RowStore + Send>,
    ) -> Result<BtCursor> {
        let mut shared = self.lock_shared()?;
        let id = shared.open_cursor(self.id, root, write, None, true)?;
        drop(shared);
        Ok(BtCursor::new(Arc::clone(self), id, root, Some(store)))
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    /// Check the trees rooted at `roots` and the free-list. At most
    /// `max_errors` messages are collected.
    pub fn integrity_check(&self, roots: &[Pgno], max_errors: usize) -> Result<IntegrityCheckResult> {
        let mut shared = self.lock_shared()?;
        shared.require_read(self.id)?;
        integrity::check(&mut shared, roots, max_errors)
    }

    /// Raw image of page `pgno`.
    pub fn get_page_data(&self, pgno: Pgno) -> Result<Vec<u8>> {
        let mut shared = self.lock_shared()?;
        if pgno == 0 || pgno > shared.pager.page_count() {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                format!("page {} is outside the database", pgno),
            ));
        }
        Ok(shared.get_page(pgno, PagerGetFlags::READONLY)?.data)
    }

    /// Overwrite page `pgno` with `data`. Requires a write transaction.
    pub fn put_page_data(&self, pgno: Pgno, data: &[u8]) -> Result<()> {
        let mut shared = self.lock_shared()?;
        shared.require_write(self.id)?;
        if pgno == 0 || pgno > shared.n_page {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                format!("page {} is outside the database", pgno),
            ));
        }
        save_all_cursors(&mut shared, 0)?;
        shared.write_raw(pgno, data)
    }
}

impl BtShared {
    fn open_cursor(
        &mut self,
        btree_id: BtreeId,
        root: Pgno,
        write: bool,
        key_info: Option<Arc<KeyInfo>>,
        row_store: bool,
    ) -> Result<CursorId> {
        let handle = self.handle(btree_id)?;
        if write && self.bts_flags.contains(BtsFlags::READ_ONLY) {
            return Err(Error::new(ErrorCode::ReadOnly));
        }
        if !row_store {
            if handle.in_trans == TransState::None {
                return Err(Error::with_message(ErrorCode::Misuse, "no transaction is open"));
            }
            if write && handle.in_trans != TransState::Write {
                return Err(Error::with_message(
                    ErrorCode::Misuse,
                    "write cursor needs a write transaction",
                ));
            }
            if root == 0 {
                return Err(Error::with_message(ErrorCode::Misuse, "root page 0"));
            }
            let lock = if write { BtLock::Write } else { BtLock::Read };
            self.lock_table(btree_id, root, lock)?;
        }

        let int_key = if row_store || key_info.is_some() {
            key_info.is_none()
        } else if root <= self.n_page {
            self.get_and_init_page(root)?.is_intkey()
        } else if root == MASTER_ROOT {
            true
        } else {
            warn!("cursor root {} is beyond the last page {}", root, self.n_page);
            return Err(Error::corrupt(root));
        };

        let id = self.next_cursor_id;
        self.next_cursor_id += 1;
        self.cursors
            .insert(id, CursorCore::new(btree_id, root, write, int_key, key_info));
        Ok(id)
    }
}

impl Drop for Btree {
    fn drop(&mut self) {
        if let Ok(mut shared) = self.lock_shared() {
            let in_trans = shared
                .handle(self.id)
                .map(|h| h.in_trans)
                .unwrap_or(TransState::None);
            if in_trans != TransState::None {
                if let Err(e) = shared.rollback(self.id) {
                    warn!("rollback while closing handle {} failed: {}", self.id, e);
                }
            }
            let id = self.id;
            shared.cursors.retain(|_, core| core.btree_id != id);
            shared.handles.remove(&id);
            debug!("handle {} closed", id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_db() -> Arc<Btree> {
        Btree::open(None, BtreeConfig::default().page_size(1024)).unwrap()
    }

    #[test]
    fn test_first_write_transaction_formats_page_one() {
        let bt = memory_db();
        bt.begin_trans(true).unwrap();
        assert_eq!(bt.page_count().unwrap(), 1);
        let page1 = bt.get_page_data(1).unwrap();
        let hdr = DbHeader::parse(&page1).unwrap();
        assert_eq!(hdr.page_size, 1024);
        assert_eq!(page1[100], PTF_TABLE_LEAF);
        bt.commit().unwrap();
        assert_eq!(bt.txn_state(), TransState::None);
    }

    #[test]
    fn test_meta_fields() {
        let bt = memory_db();
        bt.begin_trans(true).unwrap();
        bt.update_meta(BTREE_SCHEMA_VERSION, 7).unwrap();
        bt.update_meta(BTREE_USER_VERSION, 42).unwrap();
        assert_eq!(bt.get_meta(BTREE_SCHEMA_VERSION).unwrap(), 7);
        assert_eq!(bt.get_meta(BTREE_USER_VERSION).unwrap(), 42);
        assert_eq!(
            bt.update_meta(BTREE_FREE_PAGE_COUNT, 1).unwrap_err().code,
            ErrorCode::Misuse
        );
        bt.commit().unwrap();
        bt.begin_trans(false).unwrap();
        assert_eq!(bt.get_meta(BTREE_USER_VERSION).unwrap(), 42);
        assert_eq!(bt.get_meta(BTREE_DATA_VERSION).unwrap(), 1);
    }

    #[test]
    fn test_rollback_restores_page_count() {
        let bt = memory_db();
        bt.begin_trans(true).unwrap();
        bt.commit().unwrap();
        bt.begin_trans(true).unwrap();
        bt.create_table(BTREE_INTKEY).unwrap();
        bt.create_table(BTREE_BLOBKEY).unwrap();
        assert_eq!(bt.page_count().unwrap(), 3);
        bt.rollback().unwrap();
        bt.begin_trans(false).unwrap();
        assert_eq!(bt.page_count().unwrap(), 1);
    }

    #[test]
    fn test_read_only_handle_refuses_writes() {
        let bt = Btree::open(None, BtreeConfig::default().read_only(true)).unwrap();
        assert_eq!(bt.begin_trans(true).unwrap_err().code, ErrorCode::ReadOnly);
        bt.begin_trans(false).unwrap();
        assert_eq!(bt.txn_state(), TransState::Read);
    }

    #[test]
    fn test_savepoint_rollback_discards_table() {
        let bt = memory_db();
        bt.begin_trans(true).unwrap();
        let t1 = bt.create_table(BTREE_INTKEY).unwrap();
        bt.begin_stmt(1).unwrap();
        bt.create_table(BTREE_INTKEY).unwrap();
        assert_eq!(bt.page_count().unwrap(), 3);
        bt.savepoint(SavepointOp::Rollback, 0).unwrap();
        assert_eq!(bt.page_count().unwrap(), 2);
        assert_eq!(t1, 2);
        bt.commit().unwrap();
    }
}
