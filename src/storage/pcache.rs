//! Page cache used by the pager.
//!
//! Every cached page carries a reference tag. Handing a [`PageRef`] to a
//! caller clones the tag; dropping the `PageRef` is the only way to release
//! it, so the outstanding reference count of a page is always exact.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::storage::pager::PgFlags;
use crate::types::Pgno;

#[derive(Debug)]
struct PageTag {
    pgno: Pgno,
}

/// A counted reference to a cached page.
#[derive(Clone, Debug)]
pub struct PageRef(Arc<PageTag>);

impl PageRef {
    pub fn pgno(&self) -> Pgno {
        self.0.pgno
    }
}

/// Page header used by the page cache.
pub struct PgHdr {
    pub pgno: Pgno,
    pub data: Vec<u8>,
    pub flags: PgFlags,
    tag: Arc<PageTag>,
}

impl PgHdr {
    fn new(pgno: Pgno, data: Vec<u8>) -> Self {
        Self {
            pgno,
            data,
            flags: PgFlags::CLEAN,
            tag: Arc::new(PageTag { pgno }),
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.flags.contains(PgFlags::DIRTY)
    }

    /// Outstanding references held outside the cache.
    pub fn n_ref(&self) -> usize {
        Arc::strong_count(&self.tag) - 1
    }
}

/// Unbounded page cache with dirty tracking.
pub struct PCache {
    pages: HashMap<Pgno, PgHdr>,
    dirty: BTreeSet<Pgno>,
    page_size: usize,
}

impl PCache {
    pub fn open(page_size: usize) -> Self {
        Self {
            pages: HashMap::new(),
            dirty: BTreeSet::new(),
            page_size,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Drop every page and adopt a new page size.
    pub fn reset(&mut self, page_size: usize) {
        self.pages.clear();
        self.dirty.clear();
        self.page_size = page_size;
    }

    pub fn fetch(&self, pgno: Pgno) -> Option<&PgHdr> {
        self.pages.get(&pgno)
    }

    /// Install `data` as the content of `pgno`, keeping any existing tag.
    pub fn install(&mut self, pgno: Pgno, data: Vec<u8>) -> &mut PgHdr {
        let hdr = self
            .pages
            .entry(pgno)
            .or_insert_with(|| PgHdr::new(pgno, Vec::new()));
        hdr.data = data;
        hdr
    }

    /// Hand out a new reference to a cached page.
    pub fn page_ref(&self, pgno: Pgno) -> Option<PageRef> {
        self.pages.get(&pgno).map(|hdr| PageRef(Arc::clone(&hdr.tag)))
    }

    pub fn ref_count(&self, pgno: Pgno) -> usize {
        self.pages.get(&pgno).map(|hdr| hdr.n_ref()).unwrap_or(0)
    }

    /// Sum of outstanding references across all pages.
    pub fn ref_count_total(&self) -> usize {
        self.pages.values().map(|hdr| hdr.n_ref()).sum()
    }

    pub fn make_dirty(&mut self, pgno: Pgno) {
        if let Some(hdr) = self.pages.get_mut(&pgno) {
            hdr.flags.insert(PgFlags::DIRTY);
            self.dirty.insert(pgno);
        }
    }

    /// Dirty page numbers in ascending order.
    pub fn dirty_list(&self) -> Vec<Pgno> {
        self.dirty.iter().copied().collect()
    }

    pub fn clean_all(&mut self) {
        for pgno in std::mem::take(&mut self.dirty) {
            if let Some(hdr) = self.pages.get_mut(&pgno) {
                hdr.flags.remove(PgFlags::DIRTY);
            }
        }
    }

    /// Discard every page with a number greater than `pgno`.
    pub fn truncate(&mut self, pgno: Pgno) {
        self.pages.retain(|&p, _| p <= pgno);
        self.dirty.retain(|&p| p <= pgno);
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refs_are_released_on_drop() {
        let mut cache = PCache::open(512);
        cache.install(3, vec![0u8; 512]);
        let a = cache.page_ref(3).unwrap();
        let b = a.clone();
        assert_eq!(cache.ref_count(3), 2);
        drop(a);
        assert_eq!(cache.ref_count(3), 1);
        drop(b);
        assert_eq!(cache.ref_count(3), 0);
        assert_eq!(cache.ref_count_total(), 0);
    }

    #[test]
    fn test_dirty_tracking_and_truncate() {
        let mut cache = PCache::open(512);
        for pgno in 1..=5 {
            cache.install(pgno, vec![pgno as u8; 512]);
        }
        cache.make_dirty(4);
        cache.make_dirty(2);
        assert_eq!(cache.dirty_list(), vec![2, 4]);
        cache.truncate(3);
        assert_eq!(cache.dirty_list(), vec![2]);
        assert!(cache.fetch(4).is_none());
        cache.clean_all();
        assert_eq!(cache.dirty_count(), 0);
        assert!(!cache.fetch(2).unwrap().is_dirty());
    }
}
