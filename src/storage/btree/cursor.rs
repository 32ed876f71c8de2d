//! Cursor
//!
//! A cursor is a path of pages from the root of one tree down to the cell it
//! points at. The path lives in a [`CursorCore`] owned by the shared file
//! state so that a mutation through one cursor can save every other cursor
//! on the same root before pages change underneath them. [`BtCursor`] is the
//! public handle that borrows its core while an operation runs.

use std::sync::Arc;

use log::{trace, warn};

use crate::error::{Error, ErrorCode, Result};
use crate::storage::pager::PagerGetFlags;
use crate::types::{BtreeId, CursorId, Pgno, RowId};

use super::encoding::get4;
use super::page::{CellInfo, MemPage};
use super::record::{KeyInfo, UnpackedRecord};
use super::row_store::RowStore;
use super::types::{BtCursorFlags, BtreeInsertFlags, CursorState, BTCURSOR_MAX_DEPTH, MASTER_ROOT};
use super::{ops, BtShared, Btree, BtreePayload};

/// Key copied out of a cursor so it can find its way back after the tree
/// changed under it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum SavedKey {
    Int(RowId),
    Record(Vec<u8>),
}

fn no_page() -> Error {
    Error::with_message(ErrorCode::Internal, "cursor holds no page")
}

pub(crate) struct CursorCore {
    pub btree_id: BtreeId,
    pub root: Pgno,
    pub writable: bool,
    pub key_info: Option<Arc<KeyInfo>>,
    /// True for table trees
    pub int_key: bool,
    pub state: CursorState,
    pub fault: Option<Error>,
    /// Pending no-op direction after a restore or a position-preserving delete
    pub skip_next: i32,
    /// Page path, root first
    pub pages: Vec<MemPage>,
    /// Cell index within each page of `pages`
    pub idx: Vec<usize>,
    pub info: Option<CellInfo>,
    pub saved_key: Option<SavedKey>,
    pub flags: BtCursorFlags,
}

impl CursorCore {
    pub(crate) fn new(
        btree_id: BtreeId,
        root: Pgno,
        writable: bool,
        int_key: bool,
        key_info: Option<Arc<KeyInfo>>,
    ) -> Self {
        let mut flags = BtCursorFlags::empty();
        if writable {
            flags.insert(BtCursorFlags::WRITE);
        }
        Self {
            btree_id,
            root,
            writable,
            key_info,
            int_key,
            state: CursorState::Invalid,
            fault: None,
            skip_next: 0,
            pages: Vec::new(),
            idx: Vec::new(),
            info: None,
            saved_key: None,
            flags,
        }
    }

    fn fault_error(&self) -> Error {
        self.fault
            .clone()
            .unwrap_or_else(|| Error::new(ErrorCode::Abort))
    }

    /// Error out if the cursor has been tripped.
    pub(crate) fn check_fault(&self) -> Result<()> {
        if self.state == CursorState::Faulted {
            return Err(self.fault_error());
        }
        Ok(())
    }

    /// Park the cursor in the faulted state. Every later call returns `err`.
    pub(crate) fn trip(&mut self, err: Error) {
        self.release_pages();
        self.saved_key = None;
        self.fault = Some(err);
        self.state = CursorState::Faulted;
    }

    fn invalidate_info(&mut self) {
        self.info = None;
        self.flags.remove(BtCursorFlags::VALID_NKEY);
    }

    pub(crate) fn release_pages(&mut self) {
        self.pages.clear();
        self.idx.clear();
        self.invalidate_info();
        self.flags.remove(BtCursorFlags::AT_LAST);
    }

    pub(crate) fn page(&self) -> Result<&MemPage> {
        self.pages.last().ok_or_else(no_page)
    }

    pub(crate) fn page_mut(&mut self) -> Result<&mut MemPage> {
        self.pages.last_mut().ok_or_else(no_page)
    }

    pub(crate) fn ix(&self) -> usize {
        self.idx.last().copied().unwrap_or(0)
    }

    pub(crate) fn set_ix(&mut self, ix: usize) {
        if let Some(last) = self.idx.last_mut() {
            *last = ix;
        }
        self.invalidate_info();
    }

    /// Probe record for a saved or supplied index key.
    pub(crate) fn probe(&self, key: Vec<u8>) -> UnpackedRecord {
        match &self.key_info {
            Some(info) => UnpackedRecord::with_key_info(key, Arc::clone(info)),
            None => UnpackedRecord::new(key),
        }
    }

    // ========================================================================
    // Moving between pages
    // ========================================================================

    fn move_to_child(&mut self, shared: &mut BtShared, pgno: Pgno) -> Result<()> {
        if self.pages.len() >= BTCURSOR_MAX_DEPTH {
            warn!("tree rooted at {} is deeper than {} levels", self.root, BTCURSOR_MAX_DEPTH);
            return Err(Error::corrupt(pgno));
        }
        self.invalidate_info();
        self.flags.remove(BtCursorFlags::AT_LAST);
        let child = shared.get_and_init_page(pgno)?;
        if child.n_cell < 1 || child.is_intkey() != self.int_key {
            return Err(child.corrupt("child page does not belong to this tree"));
        }
        self.pages.push(child);
        self.idx.push(0);
        Ok(())
    }

    fn move_to_parent(&mut self) {
        if self.pages.len() > 1 {
            self.pages.pop();
            self.idx.pop();
        }
        self.invalidate_info();
    }

    /// Reset the path to the root page. Returns false when the tree is empty.
    pub(crate) fn move_to_root(&mut self, shared: &mut BtShared) -> Result<bool> {
        if self.state >= CursorState::RequiresSeek {
            if self.state == CursorState::Faulted {
                return Err(self.fault_error());
            }
            self.saved_key = None;
            self.state = CursorState::Invalid;
        }
        self.release_pages();
        self.skip_next = 0;
        if self.root == 0 || (self.root == MASTER_ROOT && shared.n_page == 0) {
            self.state = CursorState::Invalid;
            return Ok(false);
        }
        let root = shared.get_and_init_page(self.root)?;
        if root.is_intkey() != self.int_key {
            return Err(root.corrupt("root page type does not match the cursor"));
        }
        let n_cell = root.n_cell;
        let leaf = root.is_leaf();
        let right = if leaf { 0 } else { root.right_child() };
        let pgno = root.pgno;
        self.pages.push(root);
        self.idx.push(0);
        if n_cell > 0 {
            self.state = CursorState::Valid;
            Ok(true)
        } else if !leaf {
            if pgno != 1 {
                return Err(self.page()?.corrupt("empty interior root"));
            }
            self.state = CursorState::Valid;
            self.move_to_child(shared, right)?;
            Ok(true)
        } else {
            self.state = CursorState::Invalid;
            Ok(false)
        }
    }

    fn move_to_leftmost(&mut self, shared: &mut BtShared) -> Result<()> {
        loop {
            let page = self.page()?;
            if page.is_leaf() {
                return Ok(());
            }
            let pgno = page.child_pgno(self.ix())?;
            self.move_to_child(shared, pgno)?;
        }
    }

    fn move_to_rightmost(&mut self, shared: &mut BtShared) -> Result<()> {
        loop {
            let page = self.page()?;
            let n_cell = page.n_cell;
            if page.is_leaf() {
                self.set_ix(n_cell.saturating_sub(1));
                return Ok(());
            }
            let pgno = page.right_child();
            self.set_ix(n_cell);
            self.move_to_child(shared, pgno)?;
        }
    }

    // ========================================================================
    // Traversal
    // ========================================================================

    /// Position on the first entry. Returns true when the tree is empty.
    pub(crate) fn first(&mut self, shared: &mut BtShared) -> Result<bool> {
        if !self.move_to_root(shared)? {
            return Ok(true);
        }
        self.move_to_leftmost(shared)?;
        Ok(false)
    }

    /// Position on the last entry. Returns true when the tree is empty.
    pub(crate) fn last(&mut self, shared: &mut BtShared) -> Result<bool> {
        if self.state == CursorState::Valid && self.flags.contains(BtCursorFlags::AT_LAST) {
            return Ok(false);
        }
        if !self.move_to_root(shared)? {
            return Ok(true);
        }
        self.move_to_rightmost(shared)?;
        self.flags.insert(BtCursorFlags::AT_LAST);
        Ok(false)
    }

    fn restore_if_needed(&mut self, shared: &mut BtShared) -> Result<()> {
        if self.state >= CursorState::RequiresSeek {
            self.restore_position(shared)?;
        }
        Ok(())
    }

    /// Advance to the next entry. Moving past the last entry leaves the
    /// cursor `Invalid`.
    pub(crate) fn next(&mut self, shared: &mut BtShared) -> Result<()> {
        self.flags.remove(BtCursorFlags::AT_LAST);
        self.invalidate_info();
        if self.state != CursorState::Valid {
            self.restore_if_needed(shared)?;
            match self.state {
                CursorState::Invalid => return Ok(()),
                CursorState::SkipNext => {
                    self.state = CursorState::Valid;
                    if std::mem::take(&mut self.skip_next) > 0 {
                        return Ok(());
                    }
                }
                _ => {}
            }
        }

        let (n_cell, leaf) = {
            let page = self.page()?;
            (page.n_cell, page.is_leaf())
        };
        let ix = self.ix() + 1;
        self.set_ix(ix);
        if ix >= n_cell {
            if !leaf {
                let pgno = self.page()?.right_child();
                self.move_to_child(shared, pgno)?;
                return self.move_to_leftmost(shared);
            }
            loop {
                if self.pages.len() == 1 {
                    self.state = CursorState::Invalid;
                    return Ok(());
                }
                self.move_to_parent();
                if self.ix() < self.page()?.n_cell {
                    break;
                }
            }
            // Interior cells of a table tree only carry keys
            if self.page()?.is_intkey() {
                return self.next(shared);
            }
            return Ok(());
        }
        if leaf {
            Ok(())
        } else {
            self.move_to_leftmost(shared)
        }
    }

    /// Step back to the previous entry. Moving before the first entry leaves
    /// the cursor `Invalid`.
    pub(crate) fn previous(&mut self, shared: &mut BtShared) -> Result<()> {
        self.flags.remove(BtCursorFlags::AT_LAST);
        self.invalidate_info();
        if self.state != CursorState::Valid {
            self.restore_if_needed(shared)?;
            match self.state {
                CursorState::Invalid => return Ok(()),
                CursorState::SkipNext => {
                    self.state = CursorState::Valid;
                    if std::mem::take(&mut self.skip_next) < 0 {
                        return Ok(());
                    }
                }
                _ => {}
            }
        }

        if !self.page()?.is_leaf() {
            let pgno = self.page()?.child_pgno(self.ix())?;
            self.move_to_child(shared, pgno)?;
            return self.move_to_rightmost(shared);
        }
        while self.ix() == 0 {
            if self.pages.len() == 1 {
                self.state = CursorState::Invalid;
                return Ok(());
            }
            self.move_to_parent();
        }
        let ix = self.ix() - 1;
        self.set_ix(ix);
        let page = self.page()?;
        if page.is_intkey() && !page.is_leaf() {
            return self.previous(shared);
        }
        Ok(())
    }

    // ========================================================================
    // Seeking
    // ========================================================================

    /// Seek a table tree for `key`. The result is 0 on an exact match,
    /// negative when the cursor stopped on a smaller key and positive when it
    /// stopped on a larger one. An empty tree yields -1 with the cursor invalid.
    pub(crate) fn table_moveto(
        &mut self,
        shared: &mut BtShared,
        key: RowId,
        bias_right: bool,
    ) -> Result<i32> {
        if self.state == CursorState::Valid
            && self.flags.contains(BtCursorFlags::VALID_NKEY)
            && self.page().map(|p| p.is_leaf()).unwrap_or(false)
        {
            let current = self.cell_info()?.n_key;
            if current == key {
                return Ok(0);
            }
            if self.flags.contains(BtCursorFlags::AT_LAST) && current < key {
                return Ok(-1);
            }
        }

        if !self.move_to_root(shared)? {
            return Ok(-1);
        }
        if !self.int_key {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                "integer seek on an index tree",
            ));
        }
        loop {
            let (leaf, n_cell) = {
                let page = self.page()?;
                (page.is_leaf(), page.n_cell)
            };
            let mut lwr: i64 = 0;
            let mut upr: i64 = n_cell as i64 - 1;
            let mut idx = if bias_right { upr } else { upr >> 1 };
            let c = loop {
                let cell_key = self.page()?.parse_cell(idx as usize)?.n_key;
                if cell_key < key {
                    lwr = idx + 1;
                    if lwr > upr {
                        break -1;
                    }
                } else if cell_key > key {
                    upr = idx - 1;
                    if lwr > upr {
                        break 1;
                    }
                } else {
                    self.set_ix(idx as usize);
                    if leaf {
                        self.cell_info()?;
                        return Ok(0);
                    }
                    lwr = idx;
                    break 0;
                }
                idx = (lwr + upr) >> 1;
            };
            if leaf {
                self.set_ix(idx as usize);
                return Ok(c);
            }
            let pgno = {
                let page = self.page()?;
                if lwr as usize >= page.n_cell {
                    page.right_child()
                } else {
                    page.child_pgno(lwr as usize)?
                }
            };
            self.set_ix(lwr as usize);
            self.move_to_child(shared, pgno)?;
        }
    }

    /// Seek an index tree for the record in `key`. Same result convention
    /// as [`table_moveto`](Self::table_moveto); an exact match can stop on an
    /// interior page.
    pub(crate) fn index_moveto(
        &mut self,
        shared: &mut BtShared,
        key: &mut UnpackedRecord,
    ) -> Result<i32> {
        if !self.move_to_root(shared)? {
            return Ok(-1);
        }
        if self.int_key {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                "record seek on a table tree",
            ));
        }
        loop {
            let (leaf, n_cell) = {
                let page = self.page()?;
                (page.is_leaf(), page.n_cell)
            };
            let mut lwr: i64 = 0;
            let mut upr: i64 = n_cell as i64 - 1;
            let mut idx = upr >> 1;
            let c = loop {
                let record = self.cell_record(shared, idx as usize)?;
                let c = key.compare_cell(&record) as i32;
                if c < 0 {
                    lwr = idx + 1;
                } else if c > 0 {
                    upr = idx - 1;
                } else {
                    self.set_ix(idx as usize);
                    return Ok(0);
                }
                if lwr > upr {
                    break c;
                }
                idx = (lwr + upr) >> 1;
            };
            if leaf {
                self.set_ix(idx as usize);
                return Ok(c);
            }
            let pgno = {
                let page = self.page()?;
                if lwr as usize >= page.n_cell {
                    page.right_child()
                } else {
                    page.child_pgno(lwr as usize)?
                }
            };
            self.set_ix(lwr as usize);
            self.move_to_child(shared, pgno)?;
        }
    }

    /// Full record stored in cell `idx` of the current page.
    fn cell_record(&mut self, shared: &mut BtShared, idx: usize) -> Result<Vec<u8>> {
        let info = self.page()?.parse_cell(idx)?;
        if info.n_local as u32 == info.n_payload {
            let cell = self.page()?.cell(idx)?;
            let start = info.n_header as usize;
            return Ok(cell[start..start + info.n_local as usize].to_vec());
        }
        self.set_ix(idx);
        self.access_payload(shared, 0, info.n_payload)
    }

    // ========================================================================
    // Reading the current entry
    // ========================================================================

    /// Parsed header of the current cell, cached until the cursor moves.
    pub(crate) fn cell_info(&mut self) -> Result<CellInfo> {
        if let Some(info) = self.info {
            return Ok(info);
        }
        let info = self.page()?.parse_cell(self.ix())?;
        self.info = Some(info);
        self.flags.insert(BtCursorFlags::VALID_NKEY);
        Ok(info)
    }

    /// Copy `amount` payload bytes starting at `offset`, following the
    /// overflow chain past the local part.
    pub(crate) fn access_payload(
        &mut self,
        shared: &mut BtShared,
        offset: u32,
        amount: u32,
    ) -> Result<Vec<u8>> {
        let info = self.cell_info()?;
        if offset as u64 + amount as u64 > info.n_payload as u64 {
            return Err(self.page()?.corrupt("payload read past the end of the record"));
        }
        let mut out = Vec::with_capacity(amount as usize);
        let local = info.n_local as u32;
        let mut offset = offset;
        let mut amount = amount;
        if offset < local {
            let n = amount.min(local - offset);
            let start = info.n_header as usize + offset as usize;
            let cell = self.page()?.cell(self.ix())?;
            out.extend_from_slice(&cell[start..start + n as usize]);
            offset += n;
            amount -= n;
        }
        if amount == 0 {
            return Ok(out);
        }

        offset -= local;
        let ovfl_size = shared.limits.usable_size - 4;
        let mut next = info.overflow_pgno.unwrap_or(0);
        while amount > 0 {
            if next < 2 || next > shared.n_page {
                warn!("overflow chain of page {} leads to page {}", self.page()?.pgno, next);
                return Err(Error::corrupt(next));
            }
            let ovfl = shared.get_page(next, PagerGetFlags::READONLY)?;
            let following = get4(&ovfl.data, 0);
            if offset >= ovfl_size {
                offset -= ovfl_size;
            } else {
                let n = amount.min(ovfl_size - offset);
                let start = 4 + offset as usize;
                out.extend_from_slice(&ovfl.data[start..start + n as usize]);
                offset = 0;
                amount -= n;
            }
            next = following;
        }
        Ok(out)
    }

    /// Local part of the current payload, without touching overflow pages.
    pub(crate) fn payload_fetch(&mut self) -> Result<Vec<u8>> {
        let info = self.cell_info()?;
        let cell = self.page()?.cell(self.ix())?;
        let start = info.n_header as usize;
        Ok(cell[start..start + info.n_local as usize].to_vec())
    }

    /// Number of entries in the tree.
    pub(crate) fn count(&mut self, shared: &mut BtShared) -> Result<i64> {
        if !self.move_to_root(shared)? {
            return Ok(0);
        }
        let mut n: i64 = 0;
        loop {
            let page = self.page()?;
            if page.is_leaf() || !page.is_intkey() {
                n += page.n_cell as i64;
            }
            if page.is_leaf() {
                loop {
                    if self.pages.len() == 1 {
                        self.move_to_root(shared)?;
                        return Ok(n);
                    }
                    self.move_to_parent();
                    if self.ix() < self.page()?.n_cell {
                        break;
                    }
                }
                let ix = self.ix() + 1;
                self.set_ix(ix);
            }
            let pgno = self.page()?.child_pgno(self.ix())?;
            self.move_to_child(shared, pgno)?;
        }
    }

    // ========================================================================
    // Save and restore
    // ========================================================================

    /// Remember the key of the current entry without dropping the path.
    pub(crate) fn save_key(&mut self, shared: &mut BtShared) -> Result<()> {
        let info = self.cell_info()?;
        let key = if self.int_key {
            SavedKey::Int(info.n_key)
        } else {
            SavedKey::Record(self.access_payload(shared, 0, info.n_payload)?)
        };
        self.saved_key = Some(key);
        Ok(())
    }

    /// Save the current key and drop every page so the tree may change.
    pub(crate) fn save_position(&mut self, shared: &mut BtShared) -> Result<()> {
        if self.state == CursorState::SkipNext {
            self.state = CursorState::Valid;
        } else {
            self.skip_next = 0;
        }
        self.save_key(shared)?;
        self.release_pages();
        self.state = CursorState::RequiresSeek;
        Ok(())
    }

    /// Seek back to the saved key.
    pub(crate) fn restore_position(&mut self, shared: &mut BtShared) -> Result<()> {
        if self.state == CursorState::Faulted {
            return Err(self.fault_error());
        }
        self.state = CursorState::Invalid;
        let key = match self.saved_key.clone() {
            Some(key) => key,
            None => return Ok(()),
        };
        let skip = self.skip_next;
        let loc = match key {
            SavedKey::Int(rowid) => self.table_moveto(shared, rowid, false)?,
            SavedKey::Record(bytes) => {
                let mut probe = self.probe(bytes);
                self.index_moveto(shared, &mut probe)?
            }
        };
        self.saved_key = None;
        self.skip_next = if loc != 0 { loc } else { skip };
        if self.skip_next != 0 && self.state == CursorState::Valid {
            self.state = CursorState::SkipNext;
        }
        trace!(
            "cursor on root {} restored ({:?}, skip {})",
            self.root,
            self.state,
            self.skip_next
        );
        Ok(())
    }
}

/// Save every cursor on `root` (every cursor when `root` is 0) so the tree
/// can be modified. The cursor doing the modification is checked out of the
/// map while it runs and so is never touched here.
pub(crate) fn save_all_cursors(shared: &mut BtShared, root: Pgno) -> Result<()> {
    let ids: Vec<CursorId> = shared
        .cursors
        .iter()
        .filter(|(_, c)| root == 0 || c.root == root)
        .map(|(id, _)| *id)
        .collect();
    for id in ids {
        let mut core = match shared.cursors.remove(&id) {
            Some(core) => core,
            None => continue,
        };
        let result = match core.state {
            CursorState::Valid | CursorState::SkipNext => core.save_position(shared),
            _ => {
                core.release_pages();
                Ok(())
            }
        };
        shared.cursors.insert(id, core);
        result?;
    }
    Ok(())
}

// ============================================================================
// Public cursor handle
// ============================================================================

/// A position within one tree of an open [`Btree`].
pub struct BtCursor {
    btree: Arc<Btree>,
    id: CursorId,
    root: Pgno,
    row_store: Option<Box<dyn RowStore + Send>>,
}

impl std::fmt::Debug for BtCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtCursor")
            .field("id", &self.id)
            .field("root", &self.root)
            .field("row_store", &self.row_store.is_some())
            .finish()
    }
}

impl BtCursor {
    pub(crate) fn new(
        btree: Arc<Btree>,
        id: CursorId,
        root: Pgno,
        row_store: Option<Box<dyn RowStore + Send>>,
    ) -> Self {
        Self {
            btree,
            id,
            root,
            row_store,
        }
    }

    /// Run `f` with this cursor's core checked out of the shared state.
    fn with_core<T>(&self, f: impl FnOnce(&mut BtShared, &mut CursorCore) -> Result<T>) -> Result<T> {
        let mut shared = self.btree.lock_shared()?;
        let mut core = shared
            .cursors
            .remove(&self.id)
            .ok_or_else(|| Error::with_message(ErrorCode::Misuse, "cursor is closed"))?;
        let result = f(&mut shared, &mut core);
        shared.cursors.insert(self.id, core);
        result
    }

    pub fn root_page(&self) -> Pgno {
        self.root
    }

    pub fn btree(&self) -> &Arc<Btree> {
        &self.btree
    }

    pub fn is_row_store(&self) -> bool {
        self.row_store.is_some()
    }

    pub fn is_writable(&self) -> bool {
        self.with_core(|_, core| Ok(core.writable)).unwrap_or(false)
    }

    pub fn state(&self) -> CursorState {
        self.with_core(|_, core| Ok(core.state))
            .unwrap_or(CursorState::Invalid)
    }

    /// Move to the first entry. Returns true if the tree is empty.
    pub fn first(&mut self) -> Result<bool> {
        if let Some(store) = self.row_store.as_mut() {
            return store.first();
        }
        self.with_core(|shared, core| core.first(shared))
    }

    /// Move to the last entry. Returns true if the tree is empty.
    pub fn last(&mut self) -> Result<bool> {
        if let Some(store) = self.row_store.as_mut() {
            return store.last();
        }
        self.with_core(|shared, core| core.last(shared))
    }

    pub fn next(&mut self) -> Result<()> {
        if let Some(store) = self.row_store.as_mut() {
            return store.next();
        }
        self.with_core(|shared, core| core.next(shared))
    }

    pub fn previous(&mut self) -> Result<()> {
        if let Some(store) = self.row_store.as_mut() {
            return store.previous();
        }
        self.with_core(|shared, core| core.previous(shared))
    }

    /// Seek a table tree. Returns 0 on an exact match, negative when the
    /// cursor stops on a smaller key and positive when it stops on a larger one.
    pub fn table_moveto(&mut self, key: RowId, bias_right: bool) -> Result<i32> {
        if let Some(store) = self.row_store.as_mut() {
            return store.table_moveto(key, bias_right);
        }
        self.with_core(|shared, core| core.table_moveto(shared, key, bias_right))
    }

    /// Seek an index tree. `key.eq_seen` reports whether an equal record
    /// was met on the way down.
    pub fn index_moveto(&mut self, key: &mut UnpackedRecord) -> Result<i32> {
        if let Some(store) = self.row_store.as_mut() {
            return store.index_moveto(key);
        }
        self.with_core(|shared, core| core.index_moveto(shared, key))
    }

    /// True unless the cursor points at an entry.
    pub fn eof(&self) -> bool {
        if let Some(store) = self.row_store.as_ref() {
            return store.eof();
        }
        self.with_core(|_, core| Ok(core.state != CursorState::Valid))
            .unwrap_or(true)
    }

    pub fn is_valid(&self) -> bool {
        !self.eof()
    }

    /// True if the cursor no longer points at the entry it was left on.
    pub fn has_moved(&self) -> bool {
        self.with_core(|_, core| Ok(core.state != CursorState::Valid))
            .unwrap_or(true)
    }

    /// Bring a saved cursor back to its key. Returns true when the cursor is
    /// not on the same entry afterwards.
    pub fn restore(&mut self) -> Result<bool> {
        self.with_core(|shared, core| {
            core.restore_if_needed(shared)?;
            Ok(core.state != CursorState::Valid)
        })
    }

    pub fn integer_key(&self) -> Result<RowId> {
        if let Some(store) = self.row_store.as_ref() {
            return store.integer_key();
        }
        self.with_core(|shared, core| {
            require_valid(shared, core)?;
            Ok(core.cell_info()?.n_key)
        })
    }

    pub fn payload_size(&self) -> Result<u32> {
        if let Some(store) = self.row_store.as_ref() {
            return store.payload_size();
        }
        self.with_core(|shared, core| {
            require_valid(shared, core)?;
            Ok(core.cell_info()?.n_payload)
        })
    }

    /// Read `amount` bytes of the current payload starting at `offset`.
    pub fn payload(&self, offset: u32, amount: u32) -> Result<Vec<u8>> {
        if let Some(store) = self.row_store.as_ref() {
            return store.payload(offset, amount);
        }
        self.with_core(|shared, core| {
            require_valid(shared, core)?;
            core.access_payload(shared, offset, amount)
        })
    }

    /// The locally stored part of the current payload.
    pub fn payload_fetch(&self) -> Result<Vec<u8>> {
        if let Some(store) = self.row_store.as_ref() {
            let size = store.payload_size()?;
            return store.payload(0, size);
        }
        self.with_core(|shared, core| {
            require_valid(shared, core)?;
            core.payload_fetch()
        })
    }

    /// The whole payload of the current entry.
    pub fn key(&self) -> Result<Vec<u8>> {
        let size = self.payload_size()?;
        self.payload(0, size)
    }

    pub fn count(&mut self) -> Result<i64> {
        if let Some(store) = self.row_store.as_mut() {
            return store.count();
        }
        self.with_core(|shared, core| {
            core.check_fault()?;
            core.count(shared)
        })
    }

    /// Insert or replace an entry.
    pub fn insert(
        &mut self,
        payload: &BtreePayload,
        flags: BtreeInsertFlags,
        seek_result: i32,
    ) -> Result<()> {
        if let Some(store) = self.row_store.as_mut() {
            return store.insert(payload);
        }
        self.with_core(|shared, core| ops::insert(shared, core, payload, flags, seek_result))
    }

    /// Delete the current entry. With `SAVEPOSITION` a following
    /// `next`/`previous` continues from the deleted entry.
    pub fn delete(&mut self, flags: BtreeInsertFlags) -> Result<()> {
        if let Some(store) = self.row_store.as_mut() {
            return store.delete();
        }
        self.with_core(|shared, core| ops::delete(shared, core, flags))
    }

    /// Delete every entry of this cursor's tree. Returns the number of rows removed.
    pub fn clear_table_of_cursor(&mut self) -> Result<i64> {
        let root = self.root;
        self.with_core(|shared, core| {
            core.check_fault()?;
            shared.require_write(core.btree_id)?;
            core.release_pages();
            core.state = CursorState::Invalid;
            ops::clear_table(shared, root)
        })
    }
}

/// Restore a saved cursor and make sure it points at an entry.
fn require_valid(shared: &mut BtShared, core: &mut CursorCore) -> Result<()> {
    core.check_fault()?;
    core.restore_if_needed(shared)?;
    if core.state != CursorState::Valid && core.state != CursorState::SkipNext {
        return Err(Error::with_message(
            ErrorCode::Misuse,
            "cursor does not point at an entry",
        ));
    }
    Ok(())
}

impl Drop for BtCursor {
    fn drop(&mut self) {
        if let Ok(mut shared) = self.btree.lock_shared() {
            shared.cursors.remove(&self.id);
        }
    }
}
