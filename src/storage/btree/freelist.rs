//! File-level free-list
//!
//! Unused pages are chained through trunk pages that start at the pointer
//! stored at offset 32 of page 1. A trunk page holds the number of the next
//! trunk, a leaf count, and up to `usable/4 - 2` leaf page numbers. The total
//! number of free pages lives at offset 36 of page 1.

use log::{trace, warn};

use crate::error::{Error, ErrorCode, Result};
use crate::storage::pager::{DbPage, PagerGetFlags};
use crate::types::Pgno;
use crate::util::bitvec::BitVec;

use super::encoding::{get4, put4};
use super::types::{BtsFlags, HEADER_FIRST_TRUNK, HEADER_FREE_COUNT, HEADER_PAGE_COUNT};
use super::BtShared;

impl BtShared {
    /// Leaf slots a trunk page may hold before it is considered corrupt.
    fn trunk_capacity(&self) -> u32 {
        self.limits.usable_size / 4 - 2
    }

    /// Number of free pages recorded in the file header.
    pub(crate) fn free_page_count(&mut self) -> Result<u32> {
        let page1 = self.get_page(1, PagerGetFlags::empty())?;
        Ok(get4(&page1.data, HEADER_FREE_COUNT))
    }

    /// Take a page off the free-list, or extend the file when the list is
    /// empty. When `nearby` is non-zero the leaf closest to it is preferred.
    /// The returned image is unformatted; its content is unspecified unless
    /// the page was freed and reused within the current transaction.
    pub(crate) fn allocate_page(&mut self, nearby: Pgno) -> Result<DbPage> {
        let mut page1 = self.get_page(1, PagerGetFlags::empty())?;
        let n_free = get4(&page1.data, HEADER_FREE_COUNT);
        let mx = self.n_page;
        if n_free >= mx {
            warn!("free-page count {} exceeds page count {}", n_free, mx);
            return Err(Error::corrupt(1));
        }

        if n_free == 0 {
            let mut pgno = self.n_page + 1;
            if pgno == self.limits.pending_byte_page() {
                pgno += 1;
            }
            if pgno > self.max_page_count {
                return Err(Error::with_message(
                    ErrorCode::Full,
                    format!("page limit of {} reached", self.max_page_count),
                ));
            }
            self.n_page = pgno;
            put4(&mut page1.data, HEADER_PAGE_COUNT, pgno);
            self.write_raw(1, &page1.data)?;
            drop(page1);
            let page = self.get_unused_page(pgno, PagerGetFlags::NOCONTENT)?;
            self.write_raw(pgno, &page.data)?;
            trace!("allocate: extended file to page {}", pgno);
            return Ok(page);
        }

        put4(&mut page1.data, HEADER_FREE_COUNT, n_free - 1);
        let trunk_pgno = get4(&page1.data, HEADER_FIRST_TRUNK);
        if trunk_pgno < 2 || trunk_pgno > mx {
            warn!("free-list trunk {} outside the database", trunk_pgno);
            return Err(Error::corrupt(1));
        }
        let mut trunk = self.get_unused_page(trunk_pgno, PagerGetFlags::empty())?;
        let k = get4(&trunk.data, 4);

        if k == 0 {
            // the trunk itself is handed out and its successor becomes the head
            let next = get4(&trunk.data, 0);
            put4(&mut page1.data, HEADER_FIRST_TRUNK, next);
            self.write_raw(1, &page1.data)?;
            trace!("allocate: reused trunk page {} (next trunk {})", trunk_pgno, next);
            return Ok(trunk);
        }
        if k > self.trunk_capacity() {
            warn!("free-list trunk {} claims {} leaves", trunk_pgno, k);
            return Err(Error::corrupt(trunk_pgno));
        }

        let leaf_at = |data: &[u8], i: u32| get4(data, 8 + 4 * i as usize);
        let closest = if nearby > 0 {
            (0..k)
                .min_by_key(|&i| (leaf_at(&trunk.data, i) as i64 - nearby as i64).abs())
                .unwrap_or(0)
        } else {
            0
        };
        let pgno = leaf_at(&trunk.data, closest);
        if pgno < 2 || pgno > mx {
            warn!("free-list leaf {} on trunk {} outside the database", pgno, trunk_pgno);
            return Err(Error::corrupt(trunk_pgno));
        }
        if closest < k - 1 {
            let last = leaf_at(&trunk.data, k - 1);
            put4(&mut trunk.data, 8 + 4 * closest as usize, last);
        }
        put4(&mut trunk.data, 4, k - 1);
        self.write_raw(trunk_pgno, &trunk.data)?;
        self.write_raw(1, &page1.data)?;
        drop(trunk);
        drop(page1);

        let flags = if self.has_content(pgno) {
            PagerGetFlags::empty()
        } else {
            PagerGetFlags::NOCONTENT
        };
        let page = self.get_unused_page(pgno, flags)?;
        trace!(
            "allocate: leaf {} from trunk {} ({} leaves left)",
            pgno,
            trunk_pgno,
            k - 1
        );
        Ok(page)
    }

    /// Return `pgno` to the free-list.
    pub(crate) fn free_page(&mut self, pgno: Pgno) -> Result<()> {
        if pgno < 2 || pgno > self.n_page {
            warn!("attempt to free page {} of {}", pgno, self.n_page);
            return Err(Error::corrupt(pgno));
        }
        let mut page1 = self.get_page(1, PagerGetFlags::empty())?;
        let n_free = get4(&page1.data, HEADER_FREE_COUNT);
        put4(&mut page1.data, HEADER_FREE_COUNT, n_free + 1);

        if self.bts_flags.contains(BtsFlags::SECURE_DELETE) {
            let mut page = self.get_page(pgno, PagerGetFlags::empty())?;
            page.data.fill(0);
            self.write_raw(pgno, &page.data)?;
        }

        let mut head = 0;
        if n_free != 0 {
            head = get4(&page1.data, HEADER_FIRST_TRUNK);
            if head < 2 || head > self.n_page {
                warn!("free-list trunk {} outside the database", head);
                return Err(Error::corrupt(1));
            }
            let mut trunk = self.get_page(head, PagerGetFlags::empty())?;
            let n_leaf = get4(&trunk.data, 4);
            let slots = self.limits.usable_size / 4;
            if n_leaf > slots - 2 {
                warn!("free-list trunk {} claims {} leaves", head, n_leaf);
                return Err(Error::corrupt(head));
            }
            if n_leaf < slots - 8 {
                put4(&mut trunk.data, 4, n_leaf + 1);
                put4(&mut trunk.data, 8 + 4 * n_leaf as usize, pgno);
                self.write_raw(head, &trunk.data)?;
                self.write_raw(1, &page1.data)?;
                self.set_has_content(pgno);
                trace!("free: page {} is leaf {} of trunk {}", pgno, n_leaf, head);
                return Ok(());
            }
        }

        let mut page = self.get_page(pgno, PagerGetFlags::empty())?;
        put4(&mut page.data, 0, head);
        put4(&mut page.data, 4, 0);
        self.write_raw(pgno, &page.data)?;
        put4(&mut page1.data, HEADER_FIRST_TRUNK, pgno);
        self.write_raw(1, &page1.data)?;
        trace!("free: page {} is the new trunk (next {})", pgno, head);
        Ok(())
    }

    /// Record that `pgno` went onto the free-list in this transaction, so a
    /// later reuse must read its real content.
    pub(crate) fn set_has_content(&mut self, pgno: Pgno) {
        let n_page = self.n_page;
        let bits = self.has_content.get_or_insert_with(|| BitVec::new(n_page));
        bits.set(pgno);
    }

    /// Pages beyond the bitmap were added after it was built and count as set.
    pub(crate) fn has_content(&self, pgno: Pgno) -> bool {
        self.has_content
            .as_ref()
            .map_or(false, |bits| pgno > bits.size() || bits.test(pgno))
    }

    pub(crate) fn clear_has_content(&mut self) {
        self.has_content = None;
    }

    /// Every page on the free-list, trunks first in chain order. Stops with
    /// Corrupt on a loop or an out-of-range page number.
    pub(crate) fn free_list_pages(&mut self) -> Result<Vec<Pgno>> {
        let page1 = self.get_page(1, PagerGetFlags::empty())?;
        let mut expected = get4(&page1.data, HEADER_FREE_COUNT);
        let mut trunk_pgno = get4(&page1.data, HEADER_FIRST_TRUNK);
        drop(page1);
        let mut seen = BitVec::new(self.n_page);
        let mut pages = Vec::new();
        while trunk_pgno != 0 {
            if trunk_pgno > self.n_page || seen.test(trunk_pgno) {
                return Err(Error::corrupt(trunk_pgno));
            }
            seen.set(trunk_pgno);
            if expected == 0 {
                return Err(Error::corrupt(1));
            }
            expected -= 1;
            pages.push(trunk_pgno);
            let trunk = self.get_page(trunk_pgno, PagerGetFlags::empty())?;
            let n_leaf = get4(&trunk.data, 4);
            if n_leaf > self.trunk_capacity() || n_leaf > expected {
                return Err(Error::corrupt(trunk_pgno));
            }
            for i in 0..n_leaf as usize {
                let leaf = get4(&trunk.data, 8 + 4 * i);
                if leaf < 2 || leaf > self.n_page || seen.test(leaf) {
                    return Err(Error::corrupt(trunk_pgno));
                }
                seen.set(leaf);
                pages.push(leaf);
            }
            expected -= n_leaf;
            trunk_pgno = get4(&trunk.data, 0);
        }
        if expected != 0 {
            return Err(Error::corrupt(1));
        }
        Ok(pages)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::BtreeConfig;
    use crate::storage::btree::Btree;
    use crate::storage::pager::PagerGetFlags;

    fn writable(page_size: u32) -> std::sync::Arc<Btree> {
        let bt = Btree::open(None, BtreeConfig::default().page_size(page_size)).unwrap();
        bt.begin_trans(true).unwrap();
        bt
    }

    #[test]
    fn test_allocate_extends_then_reuses_freed_pages() {
        let bt = writable(512);
        let mut shared = bt.lock_shared().unwrap();
        let pages: Vec<_> = (0..4).map(|_| shared.allocate_page(0).unwrap().pgno).collect();
        assert_eq!(pages, vec![2, 3, 4, 5]);
        assert_eq!(shared.page_count(), 5);

        shared.free_page(3).unwrap();
        shared.free_page(5).unwrap();
        assert_eq!(shared.free_page_count().unwrap(), 2);
        assert_eq!(shared.free_list_pages().unwrap(), vec![3, 5]);

        // page 3 became the trunk; page 5 is its only leaf
        let again = shared.allocate_page(0).unwrap();
        assert_eq!(again.pgno, 5);
        drop(again);
        let again = shared.allocate_page(0).unwrap();
        assert_eq!(again.pgno, 3);
        drop(again);
        assert_eq!(shared.free_page_count().unwrap(), 0);
        assert_eq!(shared.page_count(), 5);
    }

    #[test]
    fn test_allocate_prefers_nearby_leaf() {
        let bt = writable(512);
        let mut shared = bt.lock_shared().unwrap();
        for _ in 0..10 {
            shared.allocate_page(0).unwrap();
        }
        for pgno in [2, 4, 7, 9, 11] {
            shared.free_page(pgno).unwrap();
        }
        let page = shared.allocate_page(8).unwrap();
        assert_eq!(page.pgno, 7);
        drop(page);
        let mut left = shared.free_list_pages().unwrap();
        left.sort_unstable();
        assert_eq!(left, vec![2, 4, 9, 11]);
    }

    #[test]
    fn test_full_trunk_starts_new_trunk() {
        let bt = writable(512);
        let mut shared = bt.lock_shared().unwrap();
        // a 512-byte trunk takes 120 leaves before a new trunk is started
        for _ in 0..130 {
            shared.allocate_page(0).unwrap();
        }
        for pgno in 2..=131 {
            shared.free_page(pgno).unwrap();
        }
        let pages = shared.free_list_pages().unwrap();
        assert_eq!(pages.len(), 130);
        assert_eq!(shared.free_page_count().unwrap(), 130);
        assert_eq!(pages[0], 123);
    }

    #[test]
    fn test_has_content_tracks_reuse_within_transaction() {
        let bt = writable(512);
        let mut shared = bt.lock_shared().unwrap();
        for _ in 0..3 {
            shared.allocate_page(0).unwrap();
        }
        let mut page = shared.get_page(4, PagerGetFlags::empty()).unwrap();
        page.data[200] = 0xAB;
        shared.write_raw(4, &page.data).unwrap();
        drop(page);

        shared.free_page(2).unwrap();
        assert!(!shared.has_content(2));
        shared.free_page(4).unwrap();
        assert!(shared.has_content(4));
        assert!(shared.has_content(99));

        let reused = shared.allocate_page(0).unwrap();
        assert_eq!(reused.pgno, 4);
        assert_eq!(reused.data[200], 0xAB);
        drop(reused);

        shared.clear_has_content();
        assert!(!shared.has_content(4));
    }

    #[test]
    fn test_secure_delete_zeroes_freed_page() {
        let bt = writable(512);
        bt.set_secure_delete(true).unwrap();
        let mut shared = bt.lock_shared().unwrap();
        shared.allocate_page(0).unwrap();
        shared.allocate_page(0).unwrap();
        shared.free_page(2).unwrap();
        let mut page = shared.get_page(3, PagerGetFlags::empty()).unwrap();
        page.data.fill(0x5A);
        shared.write_raw(3, &page.data).unwrap();
        drop(page);
        shared.free_page(3).unwrap();
        let page = shared.get_page(3, PagerGetFlags::empty()).unwrap();
        assert!(page.data.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_corrupt_free_count_is_detected() {
        let bt = writable(512);
        let mut shared = bt.lock_shared().unwrap();
        let mut page1 = shared.get_page(1, PagerGetFlags::empty()).unwrap();
        page1.data[36..40].copy_from_slice(&50u32.to_be_bytes());
        shared.write_raw(1, &page1.data).unwrap();
        drop(page1);
        assert!(shared.allocate_page(0).unwrap_err().is_corrupt());
    }
}
