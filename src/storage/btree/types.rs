//! B-tree type definitions, constants, and bitflags

use bitflags::bitflags;

use crate::error::{Error, ErrorCode, Result};
use crate::types::Pgno;

use super::encoding::{put4, read_u16, read_u32};

// Page flags
pub const PTF_INTKEY: u8 = 0x01;
pub const PTF_ZERODATA: u8 = 0x02;
pub const PTF_LEAFDATA: u8 = 0x04;
pub const PTF_LEAF: u8 = 0x08;
pub const PTF_TABLE_LEAF: u8 = PTF_INTKEY | PTF_LEAFDATA | PTF_LEAF;
pub const PTF_TABLE_INTERIOR: u8 = PTF_INTKEY | PTF_LEAFDATA;
pub const PTF_INDEX_LEAF: u8 = PTF_LEAF | PTF_ZERODATA;
pub const PTF_INDEX_INTERIOR: u8 = PTF_ZERODATA;

// Page header field offsets, relative to the header start
pub const HDR_FLAGS: usize = 0;
pub const HDR_FIRST_FREEBLOCK: usize = 1;
pub const HDR_CELL_COUNT: usize = 3;
pub const HDR_CONTENT_START: usize = 5;
pub const HDR_FRAGMENTED: usize = 7;
pub const HDR_RIGHT_CHILD: usize = 8;

// Page sizes
pub const PAGE_HEADER_SIZE_LEAF: usize = 8;
pub const PAGE_HEADER_SIZE_INTERIOR: usize = 12;
pub const FILE_HEADER_SIZE: usize = 100;
pub const MAX_EMBEDDED: u32 = 64;
pub const MIN_EMBEDDED: u32 = 32;
pub const CELL_PTR_SIZE: usize = 2;
pub const MAX_PAGE_SIZE: u32 = 65536;
pub const MIN_PAGE_SIZE: u32 = 512;
pub const DEFAULT_PAGE_SIZE: u32 = 4096;
pub const MIN_USABLE_SIZE: u32 = 480;

/// Largest fragmented-byte count a free-slot search may push a page to.
pub const MAX_FRAGMENTED: u8 = 60;

// B-tree key types
pub const BTREE_INTKEY: u8 = 1;
pub const BTREE_BLOBKEY: u8 = 2;

/// Root page of the master table.
pub const MASTER_ROOT: Pgno = 1;

// B-tree metadata indices
pub const BTREE_FREE_PAGE_COUNT: usize = 0;
pub const BTREE_SCHEMA_VERSION: usize = 1;
pub const BTREE_FILE_FORMAT: usize = 2;
pub const BTREE_DEFAULT_CACHE_SIZE: usize = 3;
pub const BTREE_LARGEST_ROOT_PAGE: usize = 4;
pub const BTREE_TEXT_ENCODING: usize = 5;
pub const BTREE_USER_VERSION: usize = 6;
pub const BTREE_INCR_VACUUM: usize = 7;
pub const BTREE_APPLICATION_ID: usize = 8;
pub const BTREE_DATA_VERSION: usize = 15;
pub const SQLITE_N_BTREE_META: usize = 16;
pub const BTCURSOR_MAX_DEPTH: usize = 20;

// Page 1 header offsets
pub const HEADER_PAGE_COUNT: usize = 28;
pub const HEADER_FIRST_TRUNK: usize = 32;
pub const HEADER_FREE_COUNT: usize = 36;
pub const HEADER_META_BASE: usize = 36;

pub const SQLITE_FILE_HEADER: &[u8; 16] = b"SQLite format 3\0";

/// Byte offset of the lock-byte range. The page holding it is never used.
pub const PENDING_BYTE: u32 = 0x4000_0000;

pub fn pending_byte_page(page_size: u32) -> Pgno {
    PENDING_BYTE / page_size + 1
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BtsFlags: u16 {
        const READ_ONLY = 0x0001;
        const PAGESIZE_FIXED = 0x0002;
        const SECURE_DELETE = 0x0004;
        const INITIALLY_EMPTY = 0x0010;
        const EXCLUSIVE = 0x0040;
        const PENDING = 0x0080;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BtreeInsertFlags: u8 {
        /// Leave the cursor pointing at the new row
        const SAVEPOSITION = 0x02;
        /// The new key is larger than every existing key
        const APPEND = 0x08;
        /// Use seek_result parameter to skip internal seek - cursor is already positioned
        const USESEEKRESULT = 0x10;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BtCursorFlags: u8 {
        const WRITE = 0x01;
        const VALID_NKEY = 0x02;
        const AT_LAST = 0x08;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum TransState {
    None = 0,
    Read = 1,
    Write = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum BtLock {
    Read = 1,
    Write = 2,
}

/// Cursor position classification. States at or above `RequiresSeek`
/// must be restored before the cursor can be used.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum CursorState {
    Valid = 0,
    Invalid = 1,
    SkipNext = 2,
    RequiresSeek = 3,
    Faulted = 4,
}

/// Page limits and payload thresholds derived once per file
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageLimits {
    pub page_size: u32,
    pub usable_size: u32,
    /// Largest local payload on an index page
    pub max_local: u32,
    /// Smallest local payload kept when spilling
    pub min_local: u32,
    /// Largest local payload on a table leaf
    pub max_leaf: u32,
    pub min_leaf: u32,
    pub secure_delete: bool,
}

impl PageLimits {
    pub fn new(page_size: u32, usable_size: u32) -> Self {
        let max_local = (usable_size - 12) * MAX_EMBEDDED / 255 - 23;
        let min_local = (usable_size - 12) * MIN_EMBEDDED / 255 - 23;
        Self {
            page_size,
            usable_size,
            max_local,
            min_local,
            max_leaf: usable_size - 35,
            min_leaf: min_local,
            secure_delete: false,
        }
    }

    pub fn with_secure_delete(mut self, on: bool) -> Self {
        self.secure_delete = on;
        self
    }

    pub fn header_offset(pgno: Pgno) -> usize {
        if pgno == 1 {
            FILE_HEADER_SIZE
        } else {
            0
        }
    }

    pub fn usable_end(&self) -> usize {
        self.usable_size as usize
    }

    /// Maximum number of cells a single page can hold
    pub fn max_cells(&self) -> usize {
        (self.page_size as usize - 8) / 6
    }

    pub fn pending_byte_page(&self) -> Pgno {
        pending_byte_page(self.page_size)
    }
}

/// Database header structure
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DbHeader {
    pub page_size: u32,
    pub reserve: u8,
    pub write_version: u8,
    pub read_version: u8,
    pub change_counter: u32,
    pub page_count: u32,
    pub first_trunk_page: Pgno,
    pub free_page_count: u32,
    pub version_valid_for: u32,
}

impl DbHeader {
    /// Decode and validate the 100-byte prefix of page 1.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let not_a_db = |why: &str| Error::with_message(ErrorCode::NotADb, why.to_string());
        if data.len() < FILE_HEADER_SIZE {
            return Err(not_a_db("short header"));
        }
        if &data[..16] != SQLITE_FILE_HEADER {
            return Err(not_a_db("bad magic"));
        }
        let write_version = data[18];
        let read_version = data[19];
        if read_version > 1 {
            return Err(not_a_db("unsupported read version"));
        }
        if data[21..24] != [MAX_EMBEDDED as u8, MIN_EMBEDDED as u8, MIN_EMBEDDED as u8] {
            return Err(not_a_db("bad payload fractions"));
        }
        let page_size = ((data[16] as u32) << 8) | ((data[17] as u32) << 16);
        if !page_size.is_power_of_two() || page_size > MAX_PAGE_SIZE || page_size <= 256 {
            return Err(not_a_db("bad page size"));
        }
        let reserve = data[20];
        if page_size - (reserve as u32) < MIN_USABLE_SIZE {
            return Err(not_a_db("usable size too small"));
        }
        let field = |off| read_u32(data, off).unwrap_or(0);
        Ok(Self {
            page_size,
            reserve,
            write_version,
            read_version,
            change_counter: field(24),
            page_count: field(HEADER_PAGE_COUNT),
            first_trunk_page: field(HEADER_FIRST_TRUNK),
            free_page_count: field(HEADER_FREE_COUNT),
            version_valid_for: field(92),
        })
    }

    /// Raw page-size field as stored at offset 16.
    pub fn raw_page_size(data: &[u8]) -> Option<u16> {
        read_u16(data, 16)
    }

    /// Write the header of a brand-new database into `data`.
    pub fn format(data: &mut [u8], page_size: u32, reserve: u8) {
        data[..16].copy_from_slice(SQLITE_FILE_HEADER);
        data[16] = ((page_size >> 8) & 0xff) as u8;
        data[17] = ((page_size >> 16) & 0xff) as u8;
        data[18] = 1;
        data[19] = 1;
        data[20] = reserve;
        data[21] = MAX_EMBEDDED as u8;
        data[22] = MIN_EMBEDDED as u8;
        data[23] = MIN_EMBEDDED as u8;
        data[24..FILE_HEADER_SIZE].fill(0);
        put4(data, HEADER_PAGE_COUNT, 1);
    }
}
