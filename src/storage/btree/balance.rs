//! Balancer
//!
//! After an insert or delete the page under the cursor may hold cells that
//! did not fit (`MemPage::overflow`) or may have become more than two thirds
//! empty. [`balance`] walks up the cursor path fixing one level at a time:
//! the root grows a level when it overflows, a rightmost append on a table
//! leaf gets a fresh sibling, and anything else is redistributed across up
//! to three neighbouring siblings. A root left with no cells absorbs its only
//! child.

use log::{trace, warn};

use crate::error::{Error, Result};
use crate::types::Pgno;

use super::cursor::CursorCore;
use super::encoding::{get4, put4, read_varint, write_varint};
use super::page::MemPage;
use super::types::{PTF_LEAF, PTF_TABLE_LEAF};
use super::BtShared;

/// Most siblings a single rebalance may produce.
const MAX_NEW_SIBLINGS: usize = 5;

/// Rebalance every level of the cursor path that needs it. On return the
/// cursor path is truncated to the first level that was left alone.
pub(crate) fn balance(shared: &mut BtShared, core: &mut CursorCore) -> Result<()> {
    let n_min = shared.limits.usable_size as i32 * 2 / 3;
    loop {
        let depth = match core.pages.len() {
            0 => return Ok(()),
            n => n - 1,
        };
        let page = &core.pages[depth];
        if depth == 0 {
            if page.overflow.is_empty() {
                break;
            }
            balance_deeper(shared, core)?;
            continue;
        }
        if page.overflow.is_empty() && page.n_free <= n_min {
            break;
        }

        let child = match core.pages.pop() {
            Some(child) => child,
            None => break,
        };
        core.idx.pop();
        let parent_idx = core.idx.last().copied().unwrap_or(0);
        let parent = match core.pages.last_mut() {
            Some(parent) => parent,
            None => break,
        };
        if child.has_data()
            && child.overflow.len() == 1
            && child.overflow[0].idx == child.n_cell
            && child.n_cell > 0
            && parent.pgno != 1
            && parent.n_cell == parent_idx
        {
            balance_quick(shared, parent, child)?;
        } else {
            balance_nonroot(shared, parent, parent_idx, child, depth == 1)?;
        }
    }
    Ok(())
}

/// Move the content of an overflowing root into a new child and leave the
/// root as an empty interior page pointing at it.
fn balance_deeper(shared: &mut BtShared, core: &mut CursorCore) -> Result<()> {
    let root_pgno = core.pages[0].pgno;
    let flags = core.pages[0].flags();
    let child_page = shared.allocate_page(root_pgno)?;
    let mut child = MemPage::zeroed(child_page, shared.limits, flags)?;

    let root = &mut core.pages[0];
    child.copy_content_from(root)?;
    child.overflow = std::mem::take(&mut root.overflow);
    root.zero(flags & !PTF_LEAF)?;
    root.set_right_child(child.pgno);
    shared.write_page(&mut child)?;
    shared.write_page(root)?;
    trace!(
        "balance deeper: root {} moved {} cells (+{} overflow) to page {}",
        root_pgno,
        child.n_cell,
        child.overflow.len(),
        child.pgno
    );

    core.idx[0] = 0;
    core.pages.truncate(1);
    core.idx.truncate(1);
    core.pages.push(child);
    core.idx.push(0);
    Ok(())
}

/// A table leaf whose single overflow cell belongs at its right end gets a
/// new right sibling holding only that cell.
fn balance_quick(shared: &mut BtShared, parent: &mut MemPage, mut child: MemPage) -> Result<()> {
    let cell = match child.overflow.pop() {
        Some(ovfl) => ovfl.cell,
        None => return Ok(()),
    };
    let new_page = shared.allocate_page(0)?;
    let mut new = MemPage::zeroed(new_page, shared.limits, PTF_TABLE_LEAF)?;
    new.insert_cell(0, &cell, None)?;
    if !new.overflow.is_empty() {
        return Err(new.corrupt("cell does not fit on an empty page"));
    }
    shared.write_page(&mut new)?;

    let last_key = child.parse_cell(child.n_cell - 1)?.n_key;
    let mut divider = vec![0u8; 4];
    write_varint(last_key as u64, &mut divider);
    parent.insert_cell(parent.n_cell, &divider, Some(child.pgno))?;
    parent.set_right_child(new.pgno);

    shared.write_page(&mut child)?;
    shared.write_page(parent)?;
    trace!(
        "balance quick: page {} gets right sibling {} under parent {} (divider {})",
        child.pgno,
        new.pgno,
        parent.pgno,
        last_key
    );
    Ok(())
}

/// Integer key of a table-leaf cell image.
fn table_leaf_key(cell: &[u8]) -> Result<i64> {
    let (_, n) = read_varint(cell, 0)?;
    let (key, _) = read_varint(cell, n)?;
    Ok(key as i64)
}

/// Index among the on-page cells of the parent for logical cell `logical`
/// when `n_ovfl` cells are waiting in its overflow list.
fn on_page_index(parent: &MemPage, logical: usize, n_ovfl: usize) -> Result<usize> {
    logical
        .checked_sub(n_ovfl)
        .ok_or_else(|| parent.corrupt("divider index out of range"))
}

/// Redistribute the cells of `child` and up to two of its siblings, together
/// with the dividers between them, over as many pages as they need.
fn balance_nonroot(
    shared: &mut BtShared,
    parent: &mut MemPage,
    parent_idx: usize,
    child: MemPage,
    is_root: bool,
) -> Result<()> {
    let limits = shared.limits;
    let usable = limits.usable_size as i64;

    // Pick the siblings: the child and its neighbours, at most three.
    let mut n_ovfl = parent.overflow.len();
    let total = parent.n_cell + n_ovfl;
    let nx_div;
    let mut i;
    if total < 2 {
        nx_div = 0;
        i = total;
    } else {
        nx_div = if parent_idx == 0 {
            0
        } else if parent_idx == total {
            total - 2
        } else {
            parent_idx - 1
        };
        i = 2;
    }
    let n_old = i + 1;

    // The pointer to the rightmost sibling lives either in a parent cell or in
    // the right-child field of the header.
    let right_at = on_page_index(parent, i + nx_div, n_ovfl)?;
    let right_cell = if right_at == parent.n_cell {
        None
    } else {
        Some(parent.cell_ptr(right_at))
    };
    let mut pgno = match right_cell {
        None => parent.right_child(),
        Some(pc) => get4(&parent.data, pc),
    };

    let mut child = Some(child);
    let mut old: Vec<Option<MemPage>> = (0..n_old).map(|_| None).collect();
    let mut dividers: Vec<Vec<u8>> = vec![Vec::new(); n_old - 1];
    loop {
        let page = match child.take() {
            Some(c) if c.pgno == pgno => c,
            other => {
                child = other;
                shared.get_and_init_page(pgno)?
            }
        };
        old[i] = Some(page);
        if i == 0 {
            break;
        }
        i -= 1;
        let in_overflow = n_ovfl > 0 && parent.overflow[0].idx == i + nx_div;
        if in_overflow {
            let cell = parent.overflow.remove(0).cell;
            pgno = get4(&cell, 0);
            dividers[i] = cell;
            parent.overflow.clear();
            n_ovfl = 0;
        } else {
            let at = on_page_index(parent, i + nx_div, n_ovfl)?;
            let cell = parent.cell_bytes(at)?;
            pgno = get4(&cell, 0);
            parent.drop_cell(at, cell.len())?;
            dividers[i] = cell;
        }
    }
    if let Some(child) = child {
        return Err(child.corrupt("page is not a child of its parent"));
    }
    let old: Vec<MemPage> = old.into_iter().flatten().collect();
    if old.len() != n_old {
        return Err(parent.corrupt("missing sibling page"));
    }

    // Gather every cell of the siblings, with the dividers in between.
    let page_flags = old[0].flags();
    let leaf = old[0].is_leaf();
    let leaf_data = old[0].has_data();
    let leaf_correction: i64 = if leaf { 4 } else { 0 };
    let mut cells: Vec<Vec<u8>> = Vec::new();
    let mut cnt_new = [0usize; MAX_NEW_SIBLINGS + 1];
    let mut sz_new = [0i64; MAX_NEW_SIBLINGS + 1];
    let usable_space = usable - 12 + leaf_correction;
    for (j, page) in old.iter().enumerate() {
        if page.flags() != page_flags {
            return Err(page.corrupt("siblings have different page types"));
        }
        let mut on_page = 0;
        let mut ovfl = page.overflow.iter().peekable();
        for logical in 0..page.n_cell + page.overflow.len() {
            match ovfl.peek() {
                Some(o) if o.idx == logical => {
                    cells.push(o.cell.clone());
                    ovfl.next();
                }
                _ => {
                    cells.push(page.cell_bytes(on_page)?);
                    on_page += 1;
                }
            }
        }
        if on_page != page.n_cell {
            return Err(page.corrupt("overflow cell index out of range"));
        }
        sz_new[j] = usable_space - page.n_free as i64
            + page
                .overflow
                .iter()
                .map(|o| o.cell.len() as i64 + 2)
                .sum::<i64>();
        cnt_new[j] = cells.len();

        if j < n_old - 1 && !leaf_data {
            let div = &dividers[j];
            let cell = if leaf {
                let mut c = div[4..].to_vec();
                while c.len() < 4 {
                    c.push(0);
                }
                c
            } else {
                let mut c = div.clone();
                put4(&mut c, 0, page.right_child());
                c
            };
            cells.push(cell);
        }
    }
    let n_cell = cells.len();
    let size_of = |idx: usize| cells[idx].len() as i64 + 2;

    // Pack pages from the left, adding pages while they overflow.
    let mut k = n_old;
    let mut i = 0;
    while i < k {
        while sz_new[i] > usable_space {
            if i + 1 >= k {
                k = i + 2;
                if k > MAX_NEW_SIBLINGS {
                    return Err(parent.corrupt("rebalance needs too many siblings"));
                }
                sz_new[k - 1] = 0;
                cnt_new[k - 1] = n_cell;
            }
            if cnt_new[i] == 0 {
                return Err(parent.corrupt("sibling size accounting underflow"));
            }
            let sz = size_of(cnt_new[i] - 1);
            sz_new[i] -= sz;
            let moved = if leaf_data {
                sz
            } else if cnt_new[i] < n_cell {
                size_of(cnt_new[i])
            } else {
                0
            };
            sz_new[i + 1] += moved;
            cnt_new[i] -= 1;
        }
        while cnt_new[i] < n_cell {
            let sz = size_of(cnt_new[i]);
            if sz_new[i] + sz > usable_space {
                break;
            }
            sz_new[i] += sz;
            cnt_new[i] += 1;
            let moved = if leaf_data {
                sz
            } else if cnt_new[i] < n_cell {
                size_of(cnt_new[i])
            } else {
                0
            };
            sz_new[i + 1] -= moved;
        }
        if cnt_new[i] >= n_cell {
            k = i + 1;
        } else if cnt_new[i] <= if i > 0 { cnt_new[i - 1] } else { 0 } {
            return Err(parent.corrupt("sibling left without cells"));
        }
        i += 1;
    }

    // Shift cells rightwards so the last page is not nearly empty. Ties keep
    // the left page fuller.
    for i in (1..k).rev() {
        let mut sz_right = sz_new[i];
        let mut sz_left = sz_new[i - 1];
        let mut r = cnt_new[i - 1] as i64 - 1;
        let mut d = r + 1 - if leaf_data { 1 } else { 0 };
        while r >= 0 {
            let sz_r = cells[r as usize].len() as i64;
            let sz_d = cells[d as usize].len() as i64;
            if sz_right != 0 && sz_right + sz_d + 2 > sz_left - (sz_r + if i == k - 1 { 0 } else { 2 }) {
                break;
            }
            sz_right += sz_d + 2;
            sz_left -= sz_r + 2;
            cnt_new[i - 1] = r as usize;
            r -= 1;
            d -= 1;
        }
        sz_new[i] = sz_right;
        sz_new[i - 1] = sz_left;
        if cnt_new[i - 1] <= if i > 1 { cnt_new[i - 2] } else { 0 } {
            return Err(parent.corrupt("sibling left without cells"));
        }
    }

    // Page numbers: reuse the old ones, allocate the rest, keep them ascending.
    let last_right = if leaf { 0 } else { old[n_old - 1].right_child() };
    let old_pgnos: Vec<Pgno> = old.iter().map(|p| p.pgno).collect();
    drop(old);
    let mut new_pgnos: Vec<Pgno> = Vec::with_capacity(k);
    for j in 0..k {
        if j < n_old {
            new_pgnos.push(old_pgnos[j]);
        } else {
            let nearby = new_pgnos.last().copied().unwrap_or(0);
            let page = shared.allocate_page(nearby)?;
            new_pgnos.push(page.pgno);
        }
    }
    for (j, pgno) in new_pgnos.iter().enumerate() {
        if new_pgnos[..j].contains(pgno) {
            warn!("rebalance under page {} produced page {} twice", parent.pgno, pgno);
            return Err(Error::corrupt(*pgno));
        }
    }
    new_pgnos.sort_unstable();

    let mut new_pages: Vec<MemPage> = Vec::with_capacity(k);
    for j in 0..k {
        let mut page = MemPage::blank(new_pgnos[j], limits, page_flags)?;
        let start = match j {
            0 => 0,
            _ if leaf_data => cnt_new[j - 1],
            _ => cnt_new[j - 1] + 1,
        };
        page.rebuild(&cells[start..cnt_new[j]])?;
        if !leaf {
            let right = if j == k - 1 {
                last_right
            } else {
                get4(&cells[cnt_new[j]], 0)
            };
            page.set_right_child(right);
        }
        new_pages.push(page);
    }

    // Point the parent at the new pages.
    let last_pgno = new_pgnos[k - 1];
    match right_cell {
        None => parent.set_right_child(last_pgno),
        Some(pc) => put4(&mut parent.data, pc, last_pgno),
    }
    for j in 0..k - 1 {
        let at = cnt_new[j];
        let divider = if leaf_data {
            let mut cell = vec![0u8; 4];
            write_varint(table_leaf_key(&cells[at - 1])? as u64, &mut cell);
            cell
        } else if leaf {
            let mut cell = vec![0u8; 4];
            cell.extend_from_slice(&cells[at]);
            let size = parent.cell_size_bytes(&cell);
            cell.truncate(size);
            cell
        } else {
            cells[at].clone()
        };
        parent.insert_cell(nx_div + j, &divider, Some(new_pages[j].pgno))?;
    }

    for page in new_pages.iter_mut() {
        shared.write_page(page)?;
    }
    trace!(
        "balance nonroot: parent {} siblings {:?} -> {:?} cells {:?}",
        parent.pgno,
        old_pgnos,
        new_pgnos,
        &cnt_new[..k]
    );

    if is_root && parent.n_cell == 0 && parent.overflow.is_empty() && parent.hdr_offset as i32 <= new_pages[0].n_free {
        let only = new_pages.remove(0);
        parent.copy_content_from(&only)?;
        shared.write_page(parent)?;
        let pgno = only.pgno;
        drop(only);
        shared.free_page(pgno)?;
        trace!("balance shallower: root {} absorbed page {}", parent.pgno, pgno);
    } else {
        shared.write_page(parent)?;
    }
    drop(new_pages);

    for pgno in old_pgnos.iter().skip(k) {
        shared.free_page(*pgno)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::config::BtreeConfig;
    use crate::storage::btree::{Btree, BtreeInsertFlags, BtreePayload, BTREE_BLOBKEY, BTREE_INTKEY};

    fn memory_db(page_size: u32) -> Arc<Btree> {
        let bt = Btree::open(None, BtreeConfig::default().page_size(page_size)).unwrap();
        bt.begin_trans(true).unwrap();
        bt
    }

    fn keys(bt: &Arc<Btree>, root: u32) -> Vec<i64> {
        let mut cur = bt.cursor(root, false, None).unwrap();
        let mut out = Vec::new();
        cur.first().unwrap();
        while !cur.eof() {
            out.push(cur.integer_key().unwrap());
            cur.next().unwrap();
        }
        out
    }

    #[test]
    fn test_sequential_appends_use_quick_balance() {
        let bt = memory_db(512);
        let root = bt.create_table(BTREE_INTKEY).unwrap();
        let mut cur = bt.cursor(root, true, None).unwrap();
        for key in 0..200 {
            cur.insert(&BtreePayload::table(key, vec![7u8; 20]), BtreeInsertFlags::APPEND, 0)
                .unwrap();
        }
        drop(cur);
        assert_eq!(keys(&bt, root), (0..200).collect::<Vec<_>>());
        let check = bt.integrity_check(&[1, root], 10).unwrap();
        assert!(check.is_ok, "{:?}", check.errors);
    }

    #[test]
    fn test_reverse_inserts_split_left_siblings() {
        let bt = memory_db(512);
        let root = bt.create_table(BTREE_INTKEY).unwrap();
        let mut cur = bt.cursor(root, true, None).unwrap();
        for key in (0..300).rev() {
            cur.insert(&BtreePayload::table(key, vec![key as u8; 30]), BtreeInsertFlags::empty(), 0)
                .unwrap();
        }
        drop(cur);
        assert_eq!(keys(&bt, root), (0..300).collect::<Vec<_>>());
        let check = bt.integrity_check(&[1, root], 10).unwrap();
        assert!(check.is_ok, "{:?}", check.errors);
    }

    #[test]
    fn test_deleting_everything_collapses_the_tree() {
        let bt = memory_db(512);
        let root = bt.create_table(BTREE_INTKEY).unwrap();
        let mut cur = bt.cursor(root, true, None).unwrap();
        for key in 0..400 {
            cur.insert(&BtreePayload::table(key, vec![1u8; 40]), BtreeInsertFlags::empty(), 0)
                .unwrap();
        }
        for key in 0..400 {
            assert_eq!(cur.table_moveto(key, false).unwrap(), 0);
            cur.delete(BtreeInsertFlags::empty()).unwrap();
        }
        assert!(cur.first().unwrap());
        drop(cur);

        let page = bt.get_page_data(root).unwrap();
        assert_eq!(page[0], crate::storage::btree::PTF_TABLE_LEAF);
        let check = bt.integrity_check(&[1, root], 10).unwrap();
        assert!(check.is_ok, "{:?}", check.errors);
    }

    #[test]
    fn test_index_tree_splits_and_merges() {
        let bt = memory_db(512);
        let root = bt.create_table(BTREE_BLOBKEY).unwrap();
        let mut cur = bt.cursor(root, true, None).unwrap();
        let key = |n: u32| format!("key-{:06}", n * 7919 % 1000).into_bytes();
        for n in 0..1000 {
            cur.insert(&BtreePayload::index(key(n)), BtreeInsertFlags::empty(), 0)
                .unwrap();
        }
        let mut seen = Vec::new();
        cur.first().unwrap();
        while !cur.eof() {
            seen.push(cur.key().unwrap());
            cur.next().unwrap();
        }
        let mut expected: Vec<Vec<u8>> = (0..1000).map(key).collect();
        expected.sort();
        assert_eq!(seen, expected);

        for n in (0..1000).step_by(2) {
            let mut probe = crate::storage::btree::UnpackedRecord::new(key(n));
            assert_eq!(cur.index_moveto(&mut probe).unwrap(), 0);
            cur.delete(BtreeInsertFlags::empty()).unwrap();
        }
        assert_eq!(cur.count().unwrap(), 500);
        drop(cur);
        let check = bt.integrity_check(&[1, root], 10).unwrap();
        assert!(check.is_ok, "{:?}", check.errors);
    }
}
