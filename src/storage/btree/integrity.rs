//! Integrity check
//!
//! Walks the free-list and every tree named by the caller, marking each page
//! it reaches. Problems are collected as messages instead of failing, so one
//! pass over a damaged file reports as much as it can.

use log::debug;

use crate::error::Result;
use crate::storage::pager::PagerGetFlags;
use crate::types::Pgno;
use crate::util::bitvec::BitVec;

use super::encoding::get4;
use super::page::MemPage;
use super::types::{BTCURSOR_MAX_DEPTH, HEADER_FIRST_TRUNK, HEADER_FREE_COUNT};
use super::BtShared;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityCheckResult {
    pub errors: Vec<String>,
    pub pages_checked: u32,
    pub is_ok: bool,
}

struct IntegrityCheckState {
    page_refs: BitVec,
    page_count: Pgno,
    max_err: usize,
    errors: Vec<String>,
    pages_checked: u32,
    /// Context prepended to every message
    prefix: String,
}

impl IntegrityCheckState {
    fn add_error(&mut self, message: String) {
        if self.should_stop() {
            return;
        }
        self.errors.push(format!("{}{}", self.prefix, message));
    }

    fn should_stop(&self) -> bool {
        self.errors.len() >= self.max_err
    }

    /// Mark `pgno` as used. Returns true if it is out of range or was
    /// already reached through another path.
    fn check_ref(&mut self, pgno: Pgno) -> bool {
        if pgno == 0 || pgno > self.page_count {
            self.add_error(format!("invalid page number {}", pgno));
            return true;
        }
        if self.page_refs.test(pgno) {
            self.add_error(format!("2nd reference to page {}", pgno));
            return true;
        }
        self.page_refs.set(pgno);
        self.pages_checked += 1;
        false
    }

    fn into_result(self) -> IntegrityCheckResult {
        IntegrityCheckResult {
            is_ok: self.errors.is_empty(),
            errors: self.errors,
            pages_checked: self.pages_checked,
        }
    }
}

/// Check the trees rooted at `roots` (0 entries are skipped) and the
/// free-list, then report pages nothing refers to. `max_errors` of 0 means
/// no limit.
pub(crate) fn check(
    shared: &mut BtShared,
    roots: &[Pgno],
    max_errors: usize,
) -> Result<IntegrityCheckResult> {
    let page_count = shared.n_page;
    let mut state = IntegrityCheckState {
        page_refs: BitVec::new(page_count),
        page_count,
        max_err: if max_errors == 0 { usize::MAX } else { max_errors },
        errors: Vec::new(),
        pages_checked: 0,
        prefix: String::new(),
    };
    if page_count == 0 {
        return Ok(state.into_result());
    }

    let pending = shared.limits.pending_byte_page();
    if pending <= page_count {
        state.page_refs.set(pending);
    }

    let (first_trunk, free_count) = {
        let page1 = shared.get_page(1, PagerGetFlags::READONLY)?;
        (
            get4(&page1.data, HEADER_FIRST_TRUNK),
            get4(&page1.data, HEADER_FREE_COUNT),
        )
    };
    state.prefix = "Main freelist: ".to_string();
    check_list(&mut state, shared, true, first_trunk, free_count);
    state.prefix.clear();

    for &root in roots {
        if root == 0 || state.should_stop() {
            continue;
        }
        check_tree_page(&mut state, shared, root, root, i64::MAX, 0);
        state.prefix.clear();
    }

    for pgno in 1..=page_count {
        if state.should_stop() {
            break;
        }
        if !state.page_refs.test(pgno) {
            state.add_error(format!("Page {} is never used", pgno));
        }
    }
    debug!(
        "integrity check of {} pages: {} pages reached, {} problems",
        page_count,
        state.pages_checked,
        state.errors.len()
    );
    Ok(state.into_result())
}

/// Follow a free-list trunk chain or an overflow chain starting at `first`
/// that should hold `expected` pages.
fn check_list(
    state: &mut IntegrityCheckState,
    shared: &mut BtShared,
    free_list: bool,
    first: Pgno,
    expected: u32,
) {
    let errors_at_start = state.errors.len();
    let mut remaining = expected as i64;
    let mut pgno = first;
    let trunk_capacity = shared.limits.usable_size / 4 - 2;
    while pgno != 0 && !state.should_stop() {
        if state.check_ref(pgno) {
            break;
        }
        remaining -= 1;
        let data = match shared.get_page(pgno, PagerGetFlags::READONLY) {
            Ok(page) => page.data,
            Err(_) => {
                state.add_error(format!("failed to get page {}", pgno));
                break;
            }
        };
        if free_list {
            let n_leaf = get4(&data, 4);
            if n_leaf > trunk_capacity {
                state.add_error(format!("freelist leaf count too big on page {}", pgno));
                remaining -= 1;
            } else {
                for i in 0..n_leaf as usize {
                    state.check_ref(get4(&data, 8 + 4 * i));
                }
                remaining -= n_leaf as i64;
            }
        }
        pgno = get4(&data, 0);
    }
    if remaining != 0 && state.errors.len() == errors_at_start {
        state.add_error(format!(
            "{} is {} but should be {}",
            if free_list { "size" } else { "overflow list length" },
            expected as i64 - remaining,
            expected
        ));
    }
}

/// Check page `pgno` of the tree rooted at `root` and everything below it.
/// Integer keys must not exceed `max_key`. Returns the depth of the subtree
/// and the smallest key seen.
fn check_tree_page(
    state: &mut IntegrityCheckState,
    shared: &mut BtShared,
    root: Pgno,
    pgno: Pgno,
    max_key: i64,
    depth: usize,
) -> (i32, i64) {
    let mut min_key = max_key;
    if state.should_stop() || state.check_ref(pgno) {
        return (0, min_key);
    }
    let page_prefix = format!("Tree {} page {}: ", root, pgno);
    state.prefix = page_prefix.clone();
    if depth > BTCURSOR_MAX_DEPTH {
        state.add_error(format!("tree is deeper than {} levels", BTCURSOR_MAX_DEPTH));
        return (0, min_key);
    }
    let limits = shared.limits;
    let page = match shared
        .get_page(pgno, PagerGetFlags::READONLY)
        .and_then(|p| MemPage::init(p, limits))
    {
        Ok(page) => page,
        Err(err) => {
            state.add_error(format!("unable to decode page ({})", err));
            return (0, min_key);
        }
    };

    let usable = shared.limits.usable_size as usize;
    let content_start = page.content_start();
    let mut coverage = true;
    let mut ranges: Vec<(usize, usize)> = Vec::with_capacity(page.n_cell);
    let mut key_can_be_equal = true;
    let mut sub_depth: i32 = -1;

    if !page.is_leaf() {
        let (d, k) = check_tree_page(state, shared, root, page.right_child(), min_key, depth + 1);
        sub_depth = d;
        min_key = k;
        key_can_be_equal = false;
    }

    for i in (0..page.n_cell).rev() {
        if state.should_stop() {
            break;
        }
        state.prefix = format!("Tree {} page {} cell {}: ", root, pgno, i);
        let pc = page.cell_ptr(i);
        if pc < content_start || pc > usable - 4 {
            state.add_error(format!(
                "Offset {} out of range {}..{}",
                pc,
                content_start,
                usable - 4
            ));
            coverage = false;
            continue;
        }
        let info = match page.parse_cell(i) {
            Ok(info) if pc + info.n_size as usize <= usable => info,
            _ => {
                state.add_error("Extends off end of page".to_string());
                coverage = false;
                continue;
            }
        };
        ranges.push((pc, pc + info.n_size as usize - 1));

        if page.is_intkey() {
            let out_of_order = if key_can_be_equal {
                info.n_key > min_key
            } else {
                info.n_key >= min_key
            };
            if out_of_order {
                state.add_error(format!("Rowid {} out of order", info.n_key));
            }
            min_key = info.n_key;
            key_can_be_equal = false;
        }

        if let Some(first) = info.overflow_pgno {
            let ovfl_size = usable as u32 - 4;
            let n_pages = (info.n_payload - info.n_local as u32 + ovfl_size - 1) / ovfl_size;
            check_list(state, shared, false, first, n_pages);
        }

        if !page.is_leaf() {
            let child = get4(&page.data, pc);
            let (d, k) = check_tree_page(state, shared, root, child, min_key, depth + 1);
            state.prefix = format!("Tree {} page {} cell {}: ", root, pgno, i);
            min_key = k;
            key_can_be_equal = false;
            if d != sub_depth {
                state.add_error("Child page depth differs".to_string());
                sub_depth = d;
            }
        }
    }

    state.prefix = page_prefix;
    if coverage && !state.should_stop() {
        match page.free_blocks() {
            Ok(blocks) => {
                ranges.extend(blocks.iter().map(|&(start, size)| (start, start + size - 1)));
                check_coverage(state, &page, content_start, usable, ranges);
            }
            Err(_) => state.add_error("freeblock chain out of order".to_string()),
        }
    }
    (sub_depth + 1, min_key)
}

/// Every byte of the content area belongs to exactly one cell or freeblock,
/// and the gaps add up to the fragment count in the header.
fn check_coverage(
    state: &mut IntegrityCheckState,
    page: &MemPage,
    content_start: usize,
    usable: usize,
    mut ranges: Vec<(usize, usize)>,
) {
    ranges.sort_unstable();
    let mut prev_end = content_start as i64 - 1;
    let mut n_frag: i64 = 0;
    for (start, end) in ranges {
        if prev_end >= start as i64 {
            state.add_error(format!(
                "Multiple uses for byte {} of page {}",
                start, page.pgno
            ));
            return;
        }
        n_frag += start as i64 - prev_end - 1;
        prev_end = end as i64;
    }
    n_frag += usable as i64 - prev_end - 1;
    if n_frag != page.fragmented_bytes() as i64 {
        state.add_error(format!(
            "Fragmentation of {} bytes reported as {} on page {}",
            n_frag,
            page.fragmented_bytes(),
            page.pgno
        ));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::config::BtreeConfig;
    use crate::storage::btree::encoding::{get2, put2, put4};
    use crate::storage::btree::{Btree, BtreeInsertFlags, BtreePayload, BTREE_INTKEY};

    fn table_with_rows(rows: i64) -> (Arc<Btree>, u32) {
        let bt = Btree::open(None, BtreeConfig::default().page_size(1024)).unwrap();
        bt.begin_trans(true).unwrap();
        let root = bt.create_table(BTREE_INTKEY).unwrap();
        let mut cur = bt.cursor(root, true, None).unwrap();
        for key in 0..rows {
            cur.insert(&BtreePayload::table(key, vec![key as u8; 20]), BtreeInsertFlags::empty(), 0)
                .unwrap();
        }
        (bt, root)
    }

    #[test]
    fn test_clean_database_passes() {
        let (bt, root) = table_with_rows(200);
        let result = bt.integrity_check(&[1, root], 0).unwrap();
        assert!(result.is_ok, "{:?}", result.errors);
        assert_eq!(result.pages_checked, bt.page_count().unwrap());
    }

    #[test]
    fn test_backwards_freeblock_is_one_problem() {
        let (bt, root) = table_with_rows(10);
        let mut cur = bt.cursor(root, true, None).unwrap();
        assert_eq!(cur.table_moveto(5, false).unwrap(), 0);
        cur.delete(BtreeInsertFlags::empty()).unwrap();
        drop(cur);

        let mut data = bt.get_page_data(root).unwrap();
        let first = get2(&data, 1);
        assert!(first > 0);
        put2(&mut data, first, first - 8);
        bt.put_page_data(root, &data).unwrap();

        let result = bt.integrity_check(&[1, root], 0).unwrap();
        assert_eq!(result.errors.len(), 1, "{:?}", result.errors);
        assert!(result.errors[0].starts_with(&format!("Tree {} page {}: ", root, root)));
    }

    #[test]
    fn test_unreferenced_and_doubly_referenced_pages() {
        let (bt, root) = table_with_rows(3);
        let other = bt.create_table(BTREE_INTKEY).unwrap();

        let result = bt.integrity_check(&[1, root], 0).unwrap();
        assert_eq!(result.errors, vec![format!("Page {} is never used", other)]);

        let result = bt.integrity_check(&[1, root, other, root], 0).unwrap();
        assert_eq!(result.errors, vec![format!("2nd reference to page {}", root)]);
    }

    #[test]
    fn test_rowids_out_of_order() {
        let (bt, root) = table_with_rows(3);
        let mut data = bt.get_page_data(root).unwrap();
        let a = get2(&data, 8);
        let b = get2(&data, 10);
        put2(&mut data, 8, b);
        put2(&mut data, 10, a);
        bt.put_page_data(root, &data).unwrap();

        let result = bt.integrity_check(&[1, root], 0).unwrap();
        assert_eq!(
            result.errors,
            vec![format!("Tree {} page {} cell 0: Rowid 1 out of order", root, root)]
        );
    }

    #[test]
    fn test_fragment_count_mismatch() {
        let (bt, root) = table_with_rows(3);
        let mut data = bt.get_page_data(root).unwrap();
        data[7] = 5;
        bt.put_page_data(root, &data).unwrap();

        let result = bt.integrity_check(&[1, root], 0).unwrap();
        assert_eq!(
            result.errors,
            vec![format!(
                "Tree {} page {}: Fragmentation of 0 bytes reported as 5 on page {}",
                root, root, root
            )]
        );
    }

    #[test]
    fn test_free_list_size_mismatch() {
        let (bt, root) = table_with_rows(3);
        let doomed = bt.create_table(BTREE_INTKEY).unwrap();
        bt.drop_table(doomed).unwrap();
        let mut page1 = bt.get_page_data(1).unwrap();
        put4(&mut page1, 36, 3);
        bt.put_page_data(1, &page1).unwrap();

        let result = bt.integrity_check(&[1, root], 0).unwrap();
        assert_eq!(result.errors, vec!["Main freelist: size is 1 but should be 3".to_string()]);
    }

    #[test]
    fn test_error_limit() {
        let (bt, root) = table_with_rows(3);
        bt.create_table(BTREE_INTKEY).unwrap();
        bt.create_table(BTREE_INTKEY).unwrap();
        let result = bt.integrity_check(&[1, root], 1).unwrap();
        assert_eq!(result.errors.len(), 1);
        assert!(!result.is_ok);
    }
}
