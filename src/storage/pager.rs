//! Page cache management
//!
//! The Pager owns the database file, the page cache and the in-memory
//! rollback journal. The B-tree layer only talks to it through page
//! numbers: it fetches pages, hands modified images back with
//! [`Pager::write`], and drives the transaction state machine.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bitflags::bitflags;
use log::{debug, trace};

use crate::error::{Error, ErrorCode, Result};
use crate::storage::pcache::{PCache, PageRef};
use crate::types::Pgno;

// ============================================================================
// Constants
// ============================================================================

/// Default page size
pub const DEFAULT_PAGE_SIZE: u32 = 4096;

/// Minimum page size
pub const MIN_PAGE_SIZE: u32 = 512;

/// Maximum page size
pub const MAX_PAGE_SIZE: u32 = 65536;

/// Offset of the file change counter in page 1
const CHANGE_COUNTER_OFFSET: usize = 24;

/// Offset of the "version-valid-for" number in page 1
const VERSION_VALID_FOR_OFFSET: usize = 92;

// ============================================================================
// Pager Flags
// ============================================================================

bitflags! {
    /// Flags for Pager::get()
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PagerGetFlags: u8 {
        /// Do not load data from disk
        const NOCONTENT = 0x01;
        /// Read-only page is acceptable
        const READONLY = 0x02;
    }

    /// Page state flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PgFlags: u8 {
        /// Page is clean (unmodified)
        const CLEAN = 0x00;
        /// Page has been modified
        const DIRTY = 0x01;
    }
}

// ============================================================================
// Enums
// ============================================================================

/// Pager state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i32)]
pub enum PagerState {
    /// No lock held, pager is open
    Open = 0,
    /// Shared lock held, can read
    Reader = 1,
    /// Write transaction open, original images being journaled
    Writer = 2,
    /// Dirty pages flushed, waiting for phase two
    WriterFinished = 3,
    /// Error occurred, pager is in error state
    Error = 4,
}

/// Savepoint operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SavepointOp {
    /// Begin a new savepoint
    Begin,
    /// Release (commit) savepoint
    Release,
    /// Rollback to savepoint
    Rollback,
}

// ============================================================================
// Pages handed to the B-tree
// ============================================================================

/// A page fetched from the pager: an owned copy of the image plus a
/// reference that keeps the page pinned until dropped.
#[derive(Debug)]
pub struct DbPage {
    pub pgno: Pgno,
    pub data: Vec<u8>,
    page_ref: PageRef,
}

impl DbPage {
    pub fn page_ref(&self) -> &PageRef {
        &self.page_ref
    }

    pub fn into_parts(self) -> (Pgno, Vec<u8>, PageRef) {
        (self.pgno, self.data, self.page_ref)
    }
}

// ============================================================================
// Savepoint
// ============================================================================

/// Savepoint state: images of pages as they were when the savepoint opened
struct Savepoint {
    orig_db_size: Pgno,
    images: HashMap<Pgno, Vec<u8>>,
}

impl Savepoint {
    fn new(db_size: Pgno) -> Self {
        Savepoint {
            orig_db_size: db_size,
            images: HashMap::new(),
        }
    }
}

// ============================================================================
// Pager
// ============================================================================

pub struct Pager {
    file: Option<File>,
    path: Option<PathBuf>,
    cache: PCache,
    page_size: u32,
    reserve: u8,
    /// Logical size of the database in pages
    db_size: Pgno,
    /// Size at the start of the current write transaction
    db_orig_size: Pgno,
    /// Number of whole pages currently stored in the file
    db_file_size: Pgno,
    journal: HashMap<Pgno, Vec<u8>>,
    savepoints: Vec<Savepoint>,
    state: PagerState,
    read_only: bool,
    data_version: u32,
}

impl Pager {
    /// Open a pager on `path`, or a private in-memory image when `path` is None.
    pub fn open(path: Option<&Path>, read_only: bool) -> Result<Self> {
        let mut pager = Pager {
            file: None,
            path: path.map(Path::to_path_buf),
            cache: PCache::open(DEFAULT_PAGE_SIZE as usize),
            page_size: DEFAULT_PAGE_SIZE,
            reserve: 0,
            db_size: 0,
            db_orig_size: 0,
            db_file_size: 0,
            journal: HashMap::new(),
            savepoints: Vec::new(),
            state: PagerState::Open,
            read_only,
            data_version: 0,
        };
        if let Some(path) = path {
            let file = OpenOptions::new()
                .read(true)
                .write(!read_only)
                .create(!read_only)
                .open(path)
                .map_err(|e| {
                    Error::with_message(ErrorCode::CantOpen, format!("{}: {}", path.display(), e))
                })?;
            pager.file = Some(file);
            pager.load_geometry()?;
            debug!(
                "pager: opened {} ({} pages of {} bytes)",
                path.display(),
                pager.db_size,
                pager.page_size
            );
        }
        Ok(pager)
    }

    /// Pick up page size and page count from an existing file.
    fn load_geometry(&mut self) -> Result<()> {
        let len = match &self.file {
            Some(file) => file.metadata()?.len(),
            None => return Ok(()),
        };
        if len == 0 {
            return Ok(());
        }
        let mut header = [0u8; 100];
        self.read_file_header(&mut header)?;
        let raw = u16::from_be_bytes([header[16], header[17]]) as u32;
        let page_size = if raw == 1 { 65536 } else { raw };
        if (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) && page_size.is_power_of_two() {
            self.page_size = page_size;
            self.reserve = header[20];
            self.cache.reset(page_size as usize);
        }
        self.db_file_size = (len / self.page_size as u64) as Pgno;
        self.db_size = self.db_file_size;
        self.db_orig_size = self.db_size;
        Ok(())
    }

    /// Read up to the first 100 bytes of the file. Missing bytes read as zero.
    pub fn read_file_header(&mut self, buf: &mut [u8]) -> Result<()> {
        buf.fill(0);
        if let Some(data) = self.cache.fetch(1).map(|hdr| hdr.data.clone()) {
            let n = buf.len().min(data.len());
            buf[..n].copy_from_slice(&data[..n]);
            return Ok(());
        }
        if let Some(file) = self.file.as_mut() {
            file.seek(SeekFrom::Start(0))?;
            let mut filled = 0;
            while filled < buf.len() {
                let n = file.read(&mut buf[filled..])?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
        }
        Ok(())
    }

    /// Change the page size. Only allowed while the database is empty.
    pub fn set_page_size(&mut self, page_size: u32, reserve: u8) -> Result<()> {
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) || !page_size.is_power_of_two() {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                format!("invalid page size {}", page_size),
            ));
        }
        if self.db_size > 0 && page_size != self.page_size {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                "page size is fixed once the database has content",
            ));
        }
        self.page_size = page_size;
        self.reserve = reserve;
        if self.cache.page_size() != page_size as usize {
            self.cache.reset(page_size as usize);
        }
        Ok(())
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn reserve(&self) -> u8 {
        self.reserve
    }

    pub fn usable_size(&self) -> u32 {
        self.page_size - self.reserve as u32
    }

    /// Number of pages in the database.
    pub fn page_count(&self) -> Pgno {
        self.db_size
    }

    pub fn state(&self) -> PagerState {
        self.state
    }

    pub fn is_readonly(&self) -> bool {
        self.read_only
    }

    pub fn filename(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Incremented every time a write transaction commits.
    pub fn data_version(&self) -> u32 {
        self.data_version
    }

    /// Outstanding references to `pgno`.
    pub fn ref_count(&self, pgno: Pgno) -> usize {
        self.cache.ref_count(pgno)
    }

    /// Outstanding references across all pages.
    pub fn refcount(&self) -> usize {
        self.cache.ref_count_total()
    }

    fn read_page_from_file(&mut self, pgno: Pgno) -> Result<Vec<u8>> {
        let page_size = self.page_size as usize;
        let mut data = vec![0u8; page_size];
        if pgno > self.db_file_size {
            return Ok(data);
        }
        if let Some(file) = self.file.as_mut() {
            file.seek(SeekFrom::Start((pgno as u64 - 1) * page_size as u64))?;
            file.read_exact(&mut data)?;
        }
        Ok(data)
    }

    /// Current content of `pgno` without taking a reference.
    fn current_image(&mut self, pgno: Pgno) -> Result<Vec<u8>> {
        match self.cache.fetch(pgno) {
            Some(hdr) => Ok(hdr.data.clone()),
            None => self.read_page_from_file(pgno),
        }
    }

    /// Fetch a page. With `NOCONTENT` an uncached page is returned zeroed
    /// instead of being read from the file.
    pub fn get(&mut self, pgno: Pgno, flags: PagerGetFlags) -> Result<DbPage> {
        if pgno == 0 {
            return Err(Error::corrupt(pgno));
        }
        if self.state == PagerState::Error {
            return Err(Error::with_message(ErrorCode::IoErr, "pager is in error state"));
        }
        if self.cache.fetch(pgno).is_none() {
            let data = if flags.contains(PagerGetFlags::NOCONTENT) {
                vec![0u8; self.page_size as usize]
            } else {
                self.read_page_from_file(pgno)?
            };
            self.cache.install(pgno, data);
        }
        let data = self
            .cache
            .fetch(pgno)
            .map(|hdr| hdr.data.clone())
            .ok_or_else(|| Error::new(ErrorCode::Internal))?;
        let page_ref = self
            .cache
            .page_ref(pgno)
            .ok_or_else(|| Error::new(ErrorCode::Internal))?;
        Ok(DbPage {
            pgno,
            data,
            page_ref,
        })
    }

    /// Store a modified page image, journaling the original on first write.
    pub fn write(&mut self, pgno: Pgno, data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::new(ErrorCode::ReadOnly));
        }
        if self.state != PagerState::Writer {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                "page write outside a write transaction",
            ));
        }
        if pgno == 0 || data.len() != self.page_size as usize {
            return Err(Error::new(ErrorCode::Internal));
        }
        let needs_journal = pgno <= self.db_orig_size && !self.journal.contains_key(&pgno);
        let needs_savepoint = self
            .savepoints
            .iter()
            .any(|sp| pgno <= sp.orig_db_size && !sp.images.contains_key(&pgno));
        if needs_journal || needs_savepoint {
            let original = self.current_image(pgno)?;
            for sp in self.savepoints.iter_mut() {
                if pgno <= sp.orig_db_size && !sp.images.contains_key(&pgno) {
                    sp.images.insert(pgno, original.clone());
                }
            }
            if needs_journal {
                self.journal.insert(pgno, original);
            }
        }
        self.cache.install(pgno, data.to_vec());
        self.cache.make_dirty(pgno);
        if pgno > self.db_size {
            self.db_size = pgno;
        }
        Ok(())
    }

    /// Acquire the shared lock needed to read.
    pub fn shared_lock(&mut self) -> Result<()> {
        if self.state == PagerState::Open {
            self.state = PagerState::Reader;
        }
        Ok(())
    }

    /// Drop back to the unlocked state when no transaction is open.
    pub fn unlock(&mut self) {
        if self.state == PagerState::Reader {
            self.state = PagerState::Open;
        }
    }

    /// Start a write transaction.
    pub fn begin(&mut self) -> Result<()> {
        if self.read_only {
            return Err(Error::new(ErrorCode::ReadOnly));
        }
        self.shared_lock()?;
        if self.state == PagerState::Reader {
            self.state = PagerState::Writer;
            self.db_orig_size = self.db_size;
            self.journal.clear();
            self.savepoints.clear();
            debug!("pager: begin write ({} pages)", self.db_size);
        }
        Ok(())
    }

    /// Bump the change counter and flush every dirty page to the file.
    pub fn commit_phase_one(&mut self) -> Result<()> {
        if self.state != PagerState::Writer {
            return Ok(());
        }
        if self.cache.dirty_count() > 0 && self.db_size > 0 {
            let mut page1 = self.current_image(1)?;
            let counter = u32::from_be_bytes([
                page1[CHANGE_COUNTER_OFFSET],
                page1[CHANGE_COUNTER_OFFSET + 1],
                page1[CHANGE_COUNTER_OFFSET + 2],
                page1[CHANGE_COUNTER_OFFSET + 3],
            ])
            .wrapping_add(1);
            page1[CHANGE_COUNTER_OFFSET..CHANGE_COUNTER_OFFSET + 4]
                .copy_from_slice(&counter.to_be_bytes());
            page1[VERSION_VALID_FOR_OFFSET..VERSION_VALID_FOR_OFFSET + 4]
                .copy_from_slice(&counter.to_be_bytes());
            self.write(1, &page1)?;
        }
        if self.file.is_some() {
            let page_size = self.page_size as u64;
            let dirty = self.cache.dirty_list();
            let mut images = Vec::with_capacity(dirty.len());
            for pgno in dirty {
                if pgno > self.db_size {
                    continue;
                }
                if let Some(hdr) = self.cache.fetch(pgno) {
                    images.push((pgno, hdr.data.clone()));
                }
            }
            if let Some(file) = self.file.as_mut() {
                for (pgno, data) in &images {
                    file.seek(SeekFrom::Start((*pgno as u64 - 1) * page_size))?;
                    file.write_all(data)?;
                }
                file.set_len(self.db_size as u64 * page_size)?;
                file.sync_data()?;
            }
            trace!("pager: flushed {} pages", images.len());
            self.db_file_size = self.db_size;
        }
        self.state = PagerState::WriterFinished;
        Ok(())
    }

    /// Finish the commit: forget the journal and mark every page clean.
    pub fn commit_phase_two(&mut self) -> Result<()> {
        if self.state != PagerState::WriterFinished && self.state != PagerState::Writer {
            return Ok(());
        }
        self.journal.clear();
        self.savepoints.clear();
        self.cache.clean_all();
        self.cache.truncate(self.db_size);
        self.db_orig_size = self.db_size;
        self.data_version = self.data_version.wrapping_add(1);
        self.state = PagerState::Reader;
        debug!("pager: commit ({} pages)", self.db_size);
        Ok(())
    }

    /// Undo every change made by the current write transaction.
    pub fn rollback(&mut self) -> Result<()> {
        if self.state < PagerState::Writer {
            return Ok(());
        }
        for (pgno, image) in std::mem::take(&mut self.journal) {
            self.cache.install(pgno, image);
        }
        self.db_size = self.db_orig_size;
        self.cache.truncate(self.db_size);
        self.cache.clean_all();
        self.savepoints.clear();
        self.state = PagerState::Reader;
        debug!("pager: rollback ({} pages)", self.db_size);
        Ok(())
    }

    /// Make sure at least `n` savepoints are open.
    pub fn open_savepoint(&mut self, n: usize) -> Result<()> {
        if self.state != PagerState::Writer {
            return Err(Error::new(ErrorCode::Misuse));
        }
        while self.savepoints.len() < n {
            self.savepoints.push(Savepoint::new(self.db_size));
        }
        Ok(())
    }

    /// Release or roll back savepoint `index` (and everything opened after it).
    pub fn savepoint(&mut self, op: SavepointOp, index: usize) -> Result<()> {
        match op {
            SavepointOp::Begin => self.open_savepoint(index + 1),
            SavepointOp::Release => {
                self.savepoints.truncate(index);
                Ok(())
            }
            SavepointOp::Rollback => {
                if index >= self.savepoints.len() {
                    return Ok(());
                }
                self.savepoints.truncate(index + 1);
                let (orig_db_size, images) = match self.savepoints.last() {
                    Some(sp) => (sp.orig_db_size, sp.images.clone()),
                    None => return Ok(()),
                };
                for (pgno, image) in images {
                    self.cache.install(pgno, image);
                    self.cache.make_dirty(pgno);
                }
                self.db_size = orig_db_size;
                self.cache.truncate(orig_db_size);
                Ok(())
            }
        }
    }

    pub fn savepoint_count(&self) -> usize {
        self.savepoints.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_pager(page_size: u32) -> Pager {
        let mut pager = Pager::open(None, false).unwrap();
        pager.set_page_size(page_size, 0).unwrap();
        pager
    }

    #[test]
    fn test_write_requires_transaction() {
        let mut pager = memory_pager(512);
        pager.shared_lock().unwrap();
        let err = pager.write(1, &vec![0u8; 512]).unwrap_err();
        assert_eq!(err.code, ErrorCode::Misuse);
    }

    #[test]
    fn test_rollback_restores_images_and_size() {
        let mut pager = memory_pager(512);
        pager.begin().unwrap();
        pager.write(1, &vec![1u8; 512]).unwrap();
        pager.commit_phase_one().unwrap();
        pager.commit_phase_two().unwrap();

        pager.begin().unwrap();
        pager.write(1, &vec![2u8; 512]).unwrap();
        pager.write(2, &vec![3u8; 512]).unwrap();
        assert_eq!(pager.page_count(), 2);
        pager.rollback().unwrap();
        assert_eq!(pager.page_count(), 1);
        let page = pager.get(1, PagerGetFlags::empty()).unwrap();
        // the change counter lives at 24..28 and was bumped by the first commit
        assert_eq!(page.data[0], 1);
        assert_eq!(page.data[100], 1);
    }

    #[test]
    fn test_savepoint_rollback() {
        let mut pager = memory_pager(512);
        pager.begin().unwrap();
        pager.write(1, &vec![1u8; 512]).unwrap();
        pager.savepoint(SavepointOp::Begin, 0).unwrap();
        pager.write(1, &vec![9u8; 512]).unwrap();
        pager.write(2, &vec![9u8; 512]).unwrap();
        pager.savepoint(SavepointOp::Rollback, 0).unwrap();
        assert_eq!(pager.page_count(), 1);
        assert_eq!(pager.get(1, PagerGetFlags::empty()).unwrap().data[0], 1);
        pager.savepoint(SavepointOp::Release, 0).unwrap();
        assert_eq!(pager.savepoint_count(), 0);
    }

    #[test]
    fn test_refcount_follows_db_page_lifetime() {
        let mut pager = memory_pager(512);
        pager.begin().unwrap();
        pager.write(1, &vec![0u8; 512]).unwrap();
        let page = pager.get(1, PagerGetFlags::empty()).unwrap();
        assert_eq!(pager.ref_count(1), 1);
        drop(page);
        assert_eq!(pager.ref_count(1), 0);
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pager.db");
        {
            let mut pager = Pager::open(Some(&path), false).unwrap();
            pager.set_page_size(1024, 0).unwrap();
            pager.begin().unwrap();
            let mut page1 = vec![0u8; 1024];
            page1[16..18].copy_from_slice(&1024u16.to_be_bytes());
            pager.write(1, &page1).unwrap();
            pager.write(2, &vec![7u8; 1024]).unwrap();
            pager.commit_phase_one().unwrap();
            pager.commit_phase_two().unwrap();
        }
        let mut pager = Pager::open(Some(&path), false).unwrap();
        assert_eq!(pager.page_size(), 1024);
        assert_eq!(pager.page_count(), 2);
        pager.shared_lock().unwrap();
        assert_eq!(pager.get(2, PagerGetFlags::empty()).unwrap().data[10], 7);
    }
}
