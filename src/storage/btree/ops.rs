//! Tree operations
//!
//! Row-level mutation through a cursor and whole-tree operations on a root
//! page. Every mutation saves the other cursors on the same root first, then
//! edits the page under the cursor and lets the balancer repair the tree.

use log::{debug, trace, warn};

use crate::error::{Error, ErrorCode, Result};
use crate::storage::pager::PagerGetFlags;
use crate::types::Pgno;
use crate::util::bitvec::BitVec;

use super::balance::balance;
use super::cursor::{save_all_cursors, CursorCore, SavedKey};
use super::encoding::{get4, put4, write_varint};
use super::page::{CellInfo, MemPage};
use super::types::{
    BtCursorFlags, BtreeInsertFlags, CursorState, BTREE_INTKEY, MASTER_ROOT, PTF_INDEX_LEAF,
    PTF_LEAF, PTF_TABLE_LEAF,
};
use super::{BtShared, BtreePayload};

/// Build the cell image for `payload` as it would be stored on `page`,
/// writing any payload that does not fit locally to new overflow pages.
pub(crate) fn fill_in_cell(
    shared: &mut BtShared,
    page: &MemPage,
    payload: &BtreePayload,
) -> Result<Vec<u8>> {
    let mut cell = vec![0u8; page.child_ptr_size];
    let mut body: Vec<u8>;
    if page.is_intkey() {
        body = payload.data.clone();
        body.resize(payload.data.len() + payload.n_zero as usize, 0);
        write_varint(body.len() as u64, &mut cell);
        write_varint(payload.n_key as u64, &mut cell);
    } else {
        body = payload.key.clone().ok_or_else(|| {
            Error::with_message(ErrorCode::Misuse, "index entry without a key")
        })?;
        write_varint(body.len() as u64, &mut cell);
    }
    let n_payload = u32::try_from(body.len())
        .map_err(|_| Error::with_message(ErrorCode::TooBig, "payload too large"))?;

    let n_local = page.payload_to_local(n_payload);
    cell.extend_from_slice(&body[..n_local]);
    if n_local < body.len() {
        let chunk = shared.limits.usable_size as usize - 4;
        let chunks: Vec<&[u8]> = body[n_local..].chunks(chunk).collect();
        let mut pgnos: Vec<Pgno> = Vec::with_capacity(chunks.len());
        for _ in 0..chunks.len() {
            let nearby = pgnos.last().copied().unwrap_or(0);
            let ovfl = shared.allocate_page(nearby)?;
            pgnos.push(ovfl.pgno);
        }
        for (i, part) in chunks.iter().enumerate() {
            let mut buf = shared.take_buffer();
            put4(&mut buf, 0, pgnos.get(i + 1).copied().unwrap_or(0));
            buf[4..4 + part.len()].copy_from_slice(part);
            let result = shared.write_raw(pgnos[i], &buf);
            shared.recycle_buffer(buf);
            result?;
        }
        let mut ptr = [0u8; 4];
        put4(&mut ptr, 0, pgnos[0]);
        cell.extend_from_slice(&ptr);
        trace!(
            "payload of {} bytes spilled to {} overflow pages starting at {}",
            n_payload,
            pgnos.len(),
            pgnos[0]
        );
    }
    while cell.len() < 4 {
        cell.push(0);
    }
    Ok(cell)
}

/// Free the overflow chain of `cell`, which lives on `page`.
pub(crate) fn clear_cell(shared: &mut BtShared, page: &MemPage, cell: &[u8]) -> Result<CellInfo> {
    let info = page.parse_cell_bytes(cell)?;
    let first = match info.overflow_pgno {
        Some(pgno) => pgno,
        None => return Ok(info),
    };
    let ovfl_size = shared.limits.usable_size - 4;
    let spilled = info.n_payload - info.n_local as u32;
    let n_ovfl = (spilled + ovfl_size - 1) / ovfl_size;
    let mut next = first;
    for i in 0..n_ovfl {
        if next < 2 || next > shared.n_page {
            warn!("overflow chain of page {} leads to page {}", page.pgno, next);
            return Err(Error::corrupt(page.pgno));
        }
        let following = if i + 1 < n_ovfl {
            get4(&shared.get_page(next, PagerGetFlags::READONLY)?.data, 0)
        } else {
            0
        };
        if shared.pager.ref_count(next) > 0 {
            warn!("overflow page {} is still in use", next);
            return Err(Error::corrupt(next));
        }
        shared.free_page(next)?;
        next = following;
    }
    Ok(info)
}

fn no_position(core: &CursorCore) -> Error {
    Error::with_message(
        ErrorCode::Misuse,
        format!("cursor on root {} does not point at an entry", core.root),
    )
}

/// Insert `payload` at the position of its key, replacing an entry with an
/// equal key. `seek_result` is the result of a seek the caller already did
/// when `USESEEKRESULT` is set.
pub(crate) fn insert(
    shared: &mut BtShared,
    core: &mut CursorCore,
    payload: &BtreePayload,
    flags: BtreeInsertFlags,
    seek_result: i32,
) -> Result<()> {
    core.check_fault()?;
    if !core.writable {
        return Err(Error::with_message(ErrorCode::ReadOnly, "cursor is read-only"));
    }
    shared.require_write(core.btree_id)?;
    save_all_cursors(shared, core.root)?;

    let positioned = flags.contains(BtreeInsertFlags::USESEEKRESULT)
        && core.state == CursorState::Valid;
    let mut loc = if positioned { seek_result } else { 0 };
    if core.int_key {
        let on_key = core.state == CursorState::Valid
            && core.flags.contains(BtCursorFlags::VALID_NKEY)
            && core.info.map(|info| info.n_key) == Some(payload.n_key);
        if on_key {
            loc = 0;
        } else if loc == 0 {
            let append = flags.contains(BtreeInsertFlags::APPEND);
            loc = core.table_moveto(shared, payload.n_key, append)?;
        }
    } else if loc == 0 && !positioned {
        let key = payload.key.clone().ok_or_else(|| {
            Error::with_message(ErrorCode::Misuse, "index entry without a key")
        })?;
        let mut probe = core.probe(key);
        loc = core.index_moveto(shared, &mut probe)?;
    }

    let mut idx = core.ix();
    let mut new_cell = fill_in_cell(shared, core.page()?, payload)?;
    {
        let root = core.root;
        let page = core.pages.last_mut().ok_or_else(|| {
            Error::with_message(
                ErrorCode::Internal,
                format!("cursor on root {} holds no page", root),
            )
        })?;
        if loc == 0 && page.n_cell > 0 {
            if idx >= page.n_cell {
                return Err(page.corrupt("replaced cell past the last cell"));
            }
            let old = page.cell_bytes(idx)?;
            if !page.is_leaf() {
                new_cell[..4].copy_from_slice(&old[..4]);
            }
            let old_info = clear_cell(shared, page, &old)?;
            if old.len() == new_cell.len() && old_info.overflow_pgno.is_none() {
                let pc = page.cell_ptr(idx);
                page.data[pc..pc + new_cell.len()].copy_from_slice(&new_cell);
                shared.write_page(page)?;
                core.set_ix(idx);
                core.state = CursorState::Valid;
                return Ok(());
            }
            page.drop_cell(idx, old.len())?;
        } else if loc < 0 && page.n_cell > 0 {
            idx += 1;
        }
        page.insert_cell(idx, &new_cell, None)?;
        if page.overflow.is_empty() {
            shared.write_page(page)?;
        }
    }
    core.set_ix(idx);

    if core.page()?.overflow.is_empty() {
        core.state = CursorState::Valid;
        return Ok(());
    }
    core.state = CursorState::Valid;
    balance(shared, core)?;
    core.release_pages();
    if flags.contains(BtreeInsertFlags::SAVEPOSITION) {
        core.saved_key = Some(match &payload.key {
            Some(key) if !core.int_key => SavedKey::Record(key.clone()),
            _ => SavedKey::Int(payload.n_key),
        });
        core.skip_next = 0;
        core.state = CursorState::RequiresSeek;
    } else {
        core.state = CursorState::Invalid;
    }
    Ok(())
}

/// Delete the entry under the cursor. With `SAVEPOSITION` the cursor stays
/// usable for a following `next`/`previous`.
pub(crate) fn delete(
    shared: &mut BtShared,
    core: &mut CursorCore,
    flags: BtreeInsertFlags,
) -> Result<()> {
    core.check_fault()?;
    if !core.writable {
        return Err(Error::with_message(ErrorCode::ReadOnly, "cursor is read-only"));
    }
    shared.require_write(core.btree_id)?;
    if core.state >= CursorState::RequiresSeek {
        core.restore_position(shared)?;
        if core.state != CursorState::Valid {
            return Ok(());
        }
    } else if core.state != CursorState::Valid {
        return Err(no_position(core));
    }

    let cell_depth = core.pages.len().saturating_sub(1);
    let cell_idx = core.ix();
    let (cell, leaf, n_free, n_cell) = {
        let page = core.page()?;
        if cell_idx >= page.n_cell {
            return Err(page.corrupt("deleted cell past the last cell"));
        }
        (page.cell_bytes(cell_idx)?, page.is_leaf(), page.n_free, page.n_cell)
    };

    let mut preserve = false;
    let mut skip = false;
    if flags.contains(BtreeInsertFlags::SAVEPOSITION) {
        let usable = shared.limits.usable_size as i32;
        if !leaf || n_free + cell.len() as i32 + 2 > usable * 2 / 3 || n_cell == 1 {
            core.save_key(shared)?;
            preserve = true;
        } else {
            skip = true;
        }
    }

    // an interior entry is replaced by its in-order predecessor
    if !leaf {
        core.previous(shared)?;
    }

    save_all_cursors(shared, core.root)?;
    {
        let page = &mut core.pages[cell_depth];
        clear_cell(shared, page, &cell)?;
        page.drop_cell(cell_idx, cell.len())?;
    }

    if !leaf {
        let leaf_ix = core.ix();
        let leaf_cell = core.page()?.cell_bytes(leaf_ix)?;
        let child = core.pages[cell_depth + 1].pgno;
        let mut moved = vec![0u8; 4];
        moved.extend_from_slice(&leaf_cell);
        let size = core.pages[cell_depth].cell_size_bytes(&moved);
        moved.truncate(size);
        core.pages[cell_depth].insert_cell(cell_idx, &moved, Some(child))?;
        core.page_mut()?.drop_cell(leaf_ix, leaf_cell.len())?;
        shared.write_page(core.page_mut()?)?;
        trace!(
            "moved predecessor from page {} into interior page {}",
            core.page()?.pgno,
            core.pages[cell_depth].pgno
        );
    }
    shared.write_page(&mut core.pages[cell_depth])?;

    balance(shared, core)?;
    if core.pages.len() > cell_depth + 1 {
        core.pages.truncate(cell_depth + 1);
        core.idx.truncate(cell_depth + 1);
        balance(shared, core)?;
    }

    if skip {
        let n_cell = core.page()?.n_cell;
        core.state = CursorState::SkipNext;
        if cell_idx >= n_cell {
            core.skip_next = -1;
            core.set_ix(n_cell.saturating_sub(1));
        } else {
            core.skip_next = 1;
            core.set_ix(cell_idx);
        }
    } else {
        core.move_to_root(shared)?;
        if preserve {
            core.release_pages();
            core.state = CursorState::RequiresSeek;
        }
    }
    Ok(())
}

/// Allocate and format the root page of a new tree.
pub(crate) fn create_table(shared: &mut BtShared, flags: u8) -> Result<Pgno> {
    let page = shared.allocate_page(MASTER_ROOT)?;
    let kind = if flags & BTREE_INTKEY != 0 {
        PTF_TABLE_LEAF
    } else {
        PTF_INDEX_LEAF
    };
    let mut root = MemPage::zeroed(page, shared.limits, kind)?;
    shared.write_page(&mut root)?;
    debug!(
        "created {} tree at page {}",
        if kind == PTF_TABLE_LEAF { "table" } else { "index" },
        root.pgno
    );
    Ok(root.pgno)
}

/// Remove every entry below `root`, freeing all pages but the root, which
/// is left as an empty leaf. Returns the number of entries removed.
pub(crate) fn clear_table(shared: &mut BtShared, root: Pgno) -> Result<i64> {
    save_all_cursors(shared, root)?;
    if root == 0 || root > shared.n_page {
        warn!("clear of root {} outside the database ({} pages)", root, shared.n_page);
        return Err(Error::corrupt(root));
    }
    let mut seen = BitVec::new(shared.n_page);
    let mut pending = vec![root];
    let mut changes: i64 = 0;
    while let Some(pgno) = pending.pop() {
        if seen.test(pgno) || !seen.set(pgno) {
            warn!("page {} reached twice while clearing tree {}", pgno, root);
            return Err(Error::corrupt(pgno));
        }
        let mut page = shared.get_and_init_page(pgno)?;
        for i in 0..page.n_cell {
            let cell = page.cell_bytes(i)?;
            if !page.is_leaf() {
                pending.push(get4(&cell, 0));
            }
            clear_cell(shared, &page, &cell)?;
        }
        if page.is_leaf() {
            changes += page.n_cell as i64;
        } else {
            pending.push(page.right_child());
            if !page.is_intkey() {
                changes += page.n_cell as i64;
            }
        }
        if pgno == root {
            let flags = page.flags() | PTF_LEAF;
            page.zero(flags)?;
            shared.write_page(&mut page)?;
        } else {
            drop(page);
            shared.free_page(pgno)?;
        }
    }
    trace!("cleared tree {} ({} entries)", root, changes);
    Ok(changes)
}

/// Clear the tree at `root` and return the root page to the free-list.
pub(crate) fn drop_table(shared: &mut BtShared, root: Pgno) -> Result<()> {
    if root == MASTER_ROOT {
        return Err(Error::with_message(
            ErrorCode::Misuse,
            "the master table cannot be dropped",
        ));
    }
    if shared.cursors.values().any(|c| c.root == root) {
        return Err(Error::with_message(
            ErrorCode::Locked,
            format!("table {} has open cursors", root),
        ));
    }
    clear_table(shared, root)?;
    shared.free_page(root)?;
    debug!("dropped tree at page {}", root);
    Ok(())
}
