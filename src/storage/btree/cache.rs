//! Page cache adapter
//!
//! Page-number level access to the pager for the b-tree layer. Pages come
//! back as owned images carrying a [`PageRef`](crate::storage::pcache::PageRef);
//! a reference is released exactly when the image that carries it is dropped.

use log::warn;

use crate::error::{Error, Result};
use crate::storage::pager::{DbPage, PagerGetFlags};
use crate::types::Pgno;

use super::page::MemPage;
use super::types::FILE_HEADER_SIZE;
use super::BtShared;

/// Upper bound on recycled scratch buffers kept between operations.
const MAX_SPARE_BUFFERS: usize = 8;

impl BtShared {
    /// Number of pages in the database as seen by the b-tree.
    pub(crate) fn page_count(&self) -> Pgno {
        self.n_page
    }

    /// Fetch a raw page image.
    pub(crate) fn get_page(&mut self, pgno: Pgno, flags: PagerGetFlags) -> Result<DbPage> {
        self.pager.get(pgno, flags)
    }

    /// Fetch and decode a b-tree page.
    pub(crate) fn get_and_init_page(&mut self, pgno: Pgno) -> Result<MemPage> {
        if pgno == 0 || pgno > self.n_page {
            warn!("page {} is outside the database ({} pages)", pgno, self.n_page);
            return Err(Error::corrupt(pgno));
        }
        let page = self.pager.get(pgno, PagerGetFlags::READONLY)?;
        MemPage::init(page, self.limits)
    }

    /// Fetch a page that is about to be reused. Nobody else may hold it.
    pub(crate) fn get_unused_page(&mut self, pgno: Pgno, flags: PagerGetFlags) -> Result<DbPage> {
        let page = self.pager.get(pgno, flags)?;
        let refs = self.pager.ref_count(pgno);
        if refs > 1 {
            warn!("page {} is being reused while still referenced ({} refs)", pgno, refs);
            return Err(Error::corrupt(pgno));
        }
        Ok(page)
    }

    /// Hand a modified page back to the pager. The first 100 bytes of page 1
    /// belong to the file header and are always taken from the pager image.
    pub(crate) fn write_page(&mut self, page: &mut MemPage) -> Result<()> {
        if page.pgno == 1 {
            let current = self.pager.get(1, PagerGetFlags::empty())?;
            page.data[..FILE_HEADER_SIZE].copy_from_slice(&current.data[..FILE_HEADER_SIZE]);
        }
        self.pager.write(page.pgno, &page.data)
    }

    /// Store a raw page image.
    pub(crate) fn write_raw(&mut self, pgno: Pgno, data: &[u8]) -> Result<()> {
        self.pager.write(pgno, data)
    }

    /// A zeroed buffer of one page, reusing a spare one when available.
    pub(crate) fn take_buffer(&mut self) -> Vec<u8> {
        let page_size = self.limits.page_size as usize;
        match self.spare_buffers.pop() {
            Some(mut buf) if buf.len() == page_size => {
                buf.fill(0);
                buf
            }
            _ => vec![0u8; page_size],
        }
    }

    pub(crate) fn recycle_buffer(&mut self, buf: Vec<u8>) {
        if buf.len() == self.limits.page_size as usize && self.spare_buffers.len() < MAX_SPARE_BUFFERS
        {
            self.spare_buffers.push(buf);
        }
    }
}
