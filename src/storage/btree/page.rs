//! Page codec and in-page free-space allocator
//!
//! A [`MemPage`] is an owned image of one b-tree page plus the header fields
//! decoded from it. All edits happen on the image; the caller hands the bytes
//! back to the pager when it is done with the page. Cells that do not fit on
//! the page are parked in [`MemPage::overflow`] until the balancer places them.

use log::warn;

use crate::error::{Error, Result};
use crate::storage::pager::DbPage;
use crate::storage::pcache::PageRef;
use crate::types::Pgno;

use super::encoding::{
    get2, get2_nonzero, get4, put2, put4, read_varint, read_varint32, read_varint_at, varint_skip,
};
use super::types::{
    PageLimits, HDR_CELL_COUNT, HDR_CONTENT_START, HDR_FIRST_FREEBLOCK, HDR_FLAGS, HDR_FRAGMENTED,
    HDR_RIGHT_CHILD, PAGE_HEADER_SIZE_INTERIOR, PAGE_HEADER_SIZE_LEAF, PTF_INDEX_INTERIOR,
    PTF_INDEX_LEAF, PTF_LEAF, PTF_TABLE_INTERIOR, PTF_TABLE_LEAF,
};

/// The four legal b-tree page layouts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageKind {
    /// Integer keys with payload
    TableLeaf,
    /// Child pointer plus integer key, no payload
    TableInterior,
    /// Record key, no child pointer
    IndexLeaf,
    /// Child pointer plus record key
    IndexInterior,
}

impl PageKind {
    pub fn from_flags(flags: u8) -> Option<Self> {
        match flags {
            PTF_TABLE_LEAF => Some(PageKind::TableLeaf),
            PTF_TABLE_INTERIOR => Some(PageKind::TableInterior),
            PTF_INDEX_LEAF => Some(PageKind::IndexLeaf),
            PTF_INDEX_INTERIOR => Some(PageKind::IndexInterior),
            _ => None,
        }
    }

    pub fn flags(self) -> u8 {
        match self {
            PageKind::TableLeaf => PTF_TABLE_LEAF,
            PageKind::TableInterior => PTF_TABLE_INTERIOR,
            PageKind::IndexLeaf => PTF_INDEX_LEAF,
            PageKind::IndexInterior => PTF_INDEX_INTERIOR,
        }
    }

    pub fn is_leaf(self) -> bool {
        matches!(self, PageKind::TableLeaf | PageKind::IndexLeaf)
    }

    pub fn is_intkey(self) -> bool {
        matches!(self, PageKind::TableLeaf | PageKind::TableInterior)
    }

    /// Table leaf: the only layout that stores both an integer key and a payload.
    pub fn has_data(self) -> bool {
        self == PageKind::TableLeaf
    }

    pub fn child_ptr_size(self) -> usize {
        if self.is_leaf() {
            0
        } else {
            4
        }
    }
}

/// Decoded layout of one cell.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CellInfo {
    /// Rowid for table cells, payload size for index cells
    pub n_key: i64,
    /// Total payload bytes, including anything on overflow pages
    pub n_payload: u32,
    /// Payload bytes stored on the page
    pub n_local: u16,
    /// Offset of the payload from the start of the cell
    pub n_header: u16,
    /// Bytes the cell occupies on the page
    pub n_size: u16,
    /// First overflow page, when the payload spills
    pub overflow_pgno: Option<Pgno>,
}

/// A cell waiting for the balancer, tagged with its logical index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OverflowCell {
    pub idx: usize,
    pub cell: Vec<u8>,
}

pub struct MemPage {
    pub pgno: Pgno,
    pub data: Vec<u8>,
    page_ref: Option<PageRef>,
    pub limits: PageLimits,
    pub kind: PageKind,
    /// 100 on page 1, 0 elsewhere
    pub hdr_offset: usize,
    pub child_ptr_size: usize,
    /// Start of the cell pointer array
    pub cell_offset: usize,
    pub n_cell: usize,
    /// Free bytes: gap, freeblocks and fragments
    pub n_free: i32,
    pub max_local: usize,
    pub min_local: usize,
    pub overflow: Vec<OverflowCell>,
}

impl std::fmt::Debug for MemPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemPage")
            .field("pgno", &self.pgno)
            .field("kind", &self.kind)
            .field("n_cell", &self.n_cell)
            .field("n_free", &self.n_free)
            .field("overflow", &self.overflow.len())
            .finish()
    }
}

impl MemPage {
    fn shell(pgno: Pgno, data: Vec<u8>, page_ref: Option<PageRef>, limits: PageLimits) -> Self {
        let hdr_offset = PageLimits::header_offset(pgno);
        Self {
            pgno,
            data,
            page_ref,
            limits,
            kind: PageKind::TableLeaf,
            hdr_offset,
            child_ptr_size: 0,
            cell_offset: hdr_offset + PAGE_HEADER_SIZE_LEAF,
            n_cell: 0,
            n_free: 0,
            max_local: limits.max_leaf as usize,
            min_local: limits.min_leaf as usize,
            overflow: Vec::new(),
        }
    }

    /// Decode a page fetched from the pager.
    pub fn init(page: DbPage, limits: PageLimits) -> Result<Self> {
        let (pgno, data, page_ref) = page.into_parts();
        Self::from_image(pgno, data, Some(page_ref), limits)
    }

    /// Decode a raw image.
    pub fn from_image(
        pgno: Pgno,
        data: Vec<u8>,
        page_ref: Option<PageRef>,
        limits: PageLimits,
    ) -> Result<Self> {
        let mut page = Self::shell(pgno, data, page_ref, limits);
        page.decode()?;
        Ok(page)
    }

    /// Format a fetched page as an empty page of the given type.
    pub fn zeroed(page: DbPage, limits: PageLimits, flags: u8) -> Result<Self> {
        let (pgno, data, page_ref) = page.into_parts();
        let mut page = Self::shell(pgno, data, Some(page_ref), limits);
        page.zero(flags)?;
        Ok(page)
    }

    /// Blank image of the right size, formatted with `flags`.
    pub fn blank(pgno: Pgno, limits: PageLimits, flags: u8) -> Result<Self> {
        let data = vec![0u8; limits.page_size as usize];
        let mut page = Self::shell(pgno, data, None, limits);
        page.zero(flags)?;
        Ok(page)
    }

    pub fn page_ref(&self) -> Option<&PageRef> {
        self.page_ref.as_ref()
    }

    fn usable(&self) -> usize {
        self.limits.usable_end()
    }

    /// Log the page header and build a Corrupt error for this page.
    pub(crate) fn corrupt(&self, what: &str) -> Error {
        let start = self.hdr_offset.min(self.data.len());
        let end = (start + PAGE_HEADER_SIZE_INTERIOR).min(self.data.len());
        warn!(
            "corrupt page {}: {} (header {})",
            self.pgno,
            what,
            hex::encode(&self.data[start..end])
        );
        Error::corrupt(self.pgno)
    }

    fn decode_flags(&mut self, flags: u8) -> Result<()> {
        let kind = match PageKind::from_flags(flags) {
            Some(kind) => kind,
            None => return Err(self.corrupt("invalid page type")),
        };
        self.kind = kind;
        self.child_ptr_size = kind.child_ptr_size();
        if kind.is_intkey() {
            self.max_local = self.limits.max_leaf as usize;
            self.min_local = self.limits.min_leaf as usize;
        } else {
            self.max_local = self.limits.max_local as usize;
            self.min_local = self.limits.min_local as usize;
        }
        Ok(())
    }

    /// Parse the header and walk the freeblock chain to compute `n_free`.
    fn decode(&mut self) -> Result<()> {
        let hdr = self.hdr_offset;
        let usable = self.usable();
        if self.data.len() < usable || hdr + PAGE_HEADER_SIZE_INTERIOR > usable {
            return Err(self.corrupt("short page image"));
        }
        self.decode_flags(self.data[hdr + HDR_FLAGS])?;
        self.overflow.clear();
        self.cell_offset = hdr + PAGE_HEADER_SIZE_LEAF + self.child_ptr_size;

        let top = get2_nonzero(&self.data, hdr + HDR_CONTENT_START);
        self.n_cell = get2(&self.data, hdr + HDR_CELL_COUNT);
        if self.n_cell > self.limits.max_cells() {
            return Err(self.corrupt("too many cells"));
        }
        let first_cell = self.cell_offset + 2 * self.n_cell;
        let last_cell = usable - 4;

        let mut n_free = self.data[hdr + HDR_FRAGMENTED] as usize + top;
        let mut pc = get2(&self.data, hdr + HDR_FIRST_FREEBLOCK);
        if pc > 0 {
            if pc < first_cell {
                return Err(self.corrupt("freeblock inside the cell pointer array"));
            }
            let (mut next, mut size);
            loop {
                if pc > last_cell {
                    return Err(self.corrupt("freeblock past the end of the page"));
                }
                next = get2(&self.data, pc);
                size = get2(&self.data, pc + 2);
                n_free += size;
                if next <= pc + size + 3 {
                    break;
                }
                pc = next;
            }
            if next > 0 {
                return Err(self.corrupt("freeblocks out of order"));
            }
            if pc + size > usable {
                return Err(self.corrupt("freeblock extends past the end of the page"));
            }
        }
        if n_free > usable || n_free < first_cell {
            return Err(self.corrupt("free space out of range"));
        }
        self.n_free = (n_free - first_cell) as i32;
        Ok(())
    }

    /// Turn the page into an empty page of the given type.
    pub fn zero(&mut self, flags: u8) -> Result<()> {
        let hdr = self.hdr_offset;
        let usable = self.usable();
        self.decode_flags(flags)?;
        if self.limits.secure_delete {
            self.data[hdr..usable].fill(0);
        }
        self.data[hdr + HDR_FLAGS] = flags;
        let first = hdr
            + if flags & PTF_LEAF != 0 {
                PAGE_HEADER_SIZE_LEAF
            } else {
                PAGE_HEADER_SIZE_INTERIOR
            };
        self.data[hdr + HDR_FIRST_FREEBLOCK..hdr + HDR_CONTENT_START].fill(0);
        self.data[hdr + HDR_FRAGMENTED] = 0;
        put2(&mut self.data, hdr + HDR_CONTENT_START, usable);
        if flags & PTF_LEAF == 0 {
            put4(&mut self.data, hdr + HDR_RIGHT_CHILD, 0);
        }
        self.n_free = (usable - first) as i32;
        self.cell_offset = first;
        self.n_cell = 0;
        self.overflow.clear();
        Ok(())
    }

    // ========================================================================
    // Header accessors
    // ========================================================================

    pub fn is_leaf(&self) -> bool {
        self.kind.is_leaf()
    }

    pub fn is_intkey(&self) -> bool {
        self.kind.is_intkey()
    }

    pub fn has_data(&self) -> bool {
        self.kind.has_data()
    }

    pub fn flags(&self) -> u8 {
        self.data[self.hdr_offset + HDR_FLAGS]
    }

    pub fn first_freeblock(&self) -> usize {
        get2(&self.data, self.hdr_offset + HDR_FIRST_FREEBLOCK)
    }

    pub fn content_start(&self) -> usize {
        get2_nonzero(&self.data, self.hdr_offset + HDR_CONTENT_START)
    }

    pub fn fragmented_bytes(&self) -> u8 {
        self.data[self.hdr_offset + HDR_FRAGMENTED]
    }

    pub fn right_child(&self) -> Pgno {
        get4(&self.data, self.hdr_offset + HDR_RIGHT_CHILD)
    }

    pub fn set_right_child(&mut self, pgno: Pgno) {
        let off = self.hdr_offset + HDR_RIGHT_CHILD;
        put4(&mut self.data, off, pgno);
    }

    /// Offset of cell `idx` as stored in the pointer array.
    pub fn cell_ptr(&self, idx: usize) -> usize {
        get2(&self.data, self.cell_offset + 2 * idx)
    }

    /// Bytes from the start of cell `idx` to the end of the usable area.
    pub fn cell(&self, idx: usize) -> Result<&[u8]> {
        if idx >= self.n_cell {
            return Err(self.corrupt("cell index out of range"));
        }
        let pc = self.cell_ptr(idx);
        if pc < self.cell_offset + 2 * self.n_cell || pc > self.usable() - 4 {
            return Err(self.corrupt("cell pointer out of range"));
        }
        Ok(&self.data[pc..self.usable()])
    }

    /// Owned copy of cell `idx`, exactly as many bytes as it occupies.
    pub fn cell_bytes(&self, idx: usize) -> Result<Vec<u8>> {
        let cell = self.cell(idx)?;
        let size = self.cell_size_bytes(cell);
        if size > cell.len() {
            return Err(self.corrupt("cell extends past the end of the page"));
        }
        Ok(cell[..size].to_vec())
    }

    /// Child page to the left of cell `idx`, or the right child for `n_cell`.
    pub fn child_pgno(&self, idx: usize) -> Result<Pgno> {
        if self.is_leaf() {
            return Err(self.corrupt("child pointer requested on a leaf"));
        }
        if idx == self.n_cell {
            return Ok(self.right_child());
        }
        Ok(get4(self.cell(idx)?, 0))
    }

    // ========================================================================
    // Cell parsing
    // ========================================================================

    /// Number of payload bytes stored locally for a payload of `n_payload` bytes.
    pub fn payload_to_local(&self, n_payload: u32) -> usize {
        let n_payload = n_payload as usize;
        if n_payload <= self.max_local {
            return n_payload;
        }
        let min = self.min_local;
        let surplus = min + (n_payload - min) % (self.usable() - 4);
        if surplus <= self.max_local {
            surplus
        } else {
            min
        }
    }

    pub fn parse_cell(&self, idx: usize) -> Result<CellInfo> {
        self.parse_cell_bytes(self.cell(idx)?)
    }

    /// Decode a cell image that starts at `cell[0]`.
    pub fn parse_cell_bytes(&self, cell: &[u8]) -> Result<CellInfo> {
        match self.kind {
            PageKind::TableInterior => {
                let (key, n) = read_varint(cell, 4).map_err(|_| self.corrupt("truncated cell"))?;
                let size = (4 + n) as u16;
                Ok(CellInfo {
                    n_key: key as i64,
                    n_payload: 0,
                    n_local: 0,
                    n_header: size,
                    n_size: size,
                    overflow_pgno: None,
                })
            }
            PageKind::TableLeaf | PageKind::IndexLeaf | PageKind::IndexInterior => {
                let mut off = self.child_ptr_size;
                let (n_payload, n) =
                    read_varint32(cell, off).map_err(|_| self.corrupt("truncated cell"))?;
                off += n;
                let n_key = if self.is_intkey() {
                    let (key, n) =
                        read_varint(cell, off).map_err(|_| self.corrupt("truncated cell"))?;
                    off += n;
                    key as i64
                } else {
                    n_payload as i64
                };
                let n_header = off;
                let (n_local, n_size, overflow_pgno) = if n_payload as usize <= self.max_local {
                    let local = n_payload as usize;
                    (local, (n_header + local).max(4), None)
                } else {
                    let local = self.payload_to_local(n_payload);
                    let end = n_header + local;
                    if end + 4 > cell.len() {
                        return Err(self.corrupt("overflow pointer past the end of the page"));
                    }
                    (local, end + 4, Some(get4(cell, end)))
                };
                if n_header + n_local > cell.len() {
                    return Err(self.corrupt("payload past the end of the page"));
                }
                Ok(CellInfo {
                    n_key,
                    n_payload,
                    n_local: n_local as u16,
                    n_header: n_header as u16,
                    n_size: n_size as u16,
                    overflow_pgno,
                })
            }
        }
    }

    /// Size of cell `idx` without a full parse.
    pub fn cell_size(&self, idx: usize) -> Result<usize> {
        Ok(self.cell_size_bytes(self.cell(idx)?))
    }

    /// Size-only computation; agrees with `parse_cell_bytes(cell).n_size`.
    pub fn cell_size_bytes(&self, cell: &[u8]) -> usize {
        if self.kind == PageKind::TableInterior {
            return 4 + varint_skip(cell, 4);
        }
        let mut off = self.child_ptr_size;
        let (n_payload, n) = read_varint_at(cell, off);
        off += n;
        if self.is_intkey() {
            off += varint_skip(cell, off);
        }
        let n_payload = u32::try_from(n_payload).unwrap_or(u32::MAX);
        if n_payload as usize <= self.max_local {
            (off + n_payload as usize).max(4)
        } else {
            off + self.payload_to_local(n_payload) + 4
        }
    }

    // ========================================================================
    // Free-space allocation
    // ========================================================================

    /// Search the freeblock list for a slot of at least `n_byte` bytes.
    fn find_slot(&mut self, n_byte: usize) -> Result<Option<usize>> {
        let hdr = self.hdr_offset;
        let usable = self.usable();
        let mut addr = hdr + HDR_FIRST_FREEBLOCK;
        let mut pc = get2(&self.data, addr);
        while pc != 0 {
            if pc > usable - 4 || pc < addr + 4 {
                return Err(self.corrupt("freeblock chain out of order"));
            }
            let size = get2(&self.data, pc + 2);
            if size >= n_byte {
                if pc < self.cell_offset + 2 * self.n_cell || pc + size > usable {
                    return Err(self.corrupt("freeblock outside the content area"));
                }
                let leftover = size - n_byte;
                if leftover < 4 {
                    if self.data[hdr + HDR_FRAGMENTED] > 57 {
                        return Ok(None);
                    }
                    let next = get2(&self.data, pc);
                    put2(&mut self.data, addr, next);
                    self.data[hdr + HDR_FRAGMENTED] += leftover as u8;
                } else {
                    put2(&mut self.data, pc + 2, leftover);
                }
                return Ok(Some(pc + leftover));
            }
            addr = pc;
            pc = get2(&self.data, pc);
        }
        Ok(None)
    }

    /// Reserve `n_byte` bytes of content area and return their offset.
    /// `n_free` is left for the caller to adjust.
    pub fn allocate_space(&mut self, n_byte: usize) -> Result<usize> {
        let hdr = self.hdr_offset;
        let gap = self.cell_offset + 2 * self.n_cell;
        let mut top = get2(&self.data, hdr + HDR_CONTENT_START);
        if gap > top {
            if top == 0 && self.usable() == 65536 {
                top = 65536;
            } else {
                return Err(self.corrupt("content area overlaps the cell pointer array"));
            }
        }
        if self.first_freeblock() != 0 && gap + 2 <= top {
            if let Some(pc) = self.find_slot(n_byte)? {
                return Ok(pc);
            }
        }
        if gap + 2 + n_byte > top {
            self.defragment()?;
            top = self.content_start();
            if gap + 2 + n_byte > top {
                return Err(self.corrupt("no room for cell after defragmentation"));
            }
        }
        top -= n_byte;
        put2(&mut self.data, hdr + HDR_CONTENT_START, top);
        Ok(top)
    }

    /// Return `size` bytes at `start` to the freeblock list, coalescing with
    /// neighbours that are at most three bytes away.
    pub fn free_space(&mut self, start: usize, size: usize) -> Result<()> {
        let hdr = self.hdr_offset;
        let usable = self.usable();
        let last = usable - 4;
        let orig_size = size;
        let mut start = start;
        let mut size = size;
        let mut end = start + size;
        if end > usable || start < self.cell_offset {
            return Err(self.corrupt("freed range outside the content area"));
        }
        if self.limits.secure_delete {
            self.data[start..end].fill(0);
        }

        let mut ptr = hdr + HDR_FIRST_FREEBLOCK;
        let mut free_blk;
        if self.first_freeblock() == 0 {
            free_blk = 0;
        } else {
            loop {
                free_blk = get2(&self.data, ptr);
                if free_blk >= start {
                    break;
                }
                if free_blk < ptr + 4 {
                    if free_blk == 0 {
                        break;
                    }
                    return Err(self.corrupt("freeblock chain out of order"));
                }
                ptr = free_blk;
            }
            if free_blk > last {
                return Err(self.corrupt("freeblock past the end of the page"));
            }
            let mut n_frag = 0usize;
            if free_blk != 0 && end + 3 >= free_blk {
                if end > free_blk {
                    return Err(self.corrupt("freed range overlaps a freeblock"));
                }
                n_frag = free_blk - end;
                end = free_blk + get2(&self.data, free_blk + 2);
                if end > usable {
                    return Err(self.corrupt("freeblock extends past the end of the page"));
                }
                size = end - start;
                free_blk = get2(&self.data, free_blk);
            }
            if ptr > hdr + HDR_FIRST_FREEBLOCK {
                let ptr_end = ptr + get2(&self.data, ptr + 2);
                if ptr_end + 3 >= start {
                    if ptr_end > start {
                        return Err(self.corrupt("freed range overlaps a freeblock"));
                    }
                    n_frag += start - ptr_end;
                    size = end - ptr;
                    start = ptr;
                }
            }
            if n_frag > self.data[hdr + HDR_FRAGMENTED] as usize {
                return Err(self.corrupt("fragment count underflow"));
            }
            self.data[hdr + HDR_FRAGMENTED] -= n_frag as u8;
        }

        if start == get2(&self.data, hdr + HDR_CONTENT_START) {
            if ptr != hdr + HDR_FIRST_FREEBLOCK {
                return Err(self.corrupt("freeblock before the content area"));
            }
            put2(&mut self.data, hdr + HDR_FIRST_FREEBLOCK, free_blk);
            put2(&mut self.data, hdr + HDR_CONTENT_START, end);
        } else {
            put2(&mut self.data, ptr, start);
            put2(&mut self.data, start, free_blk);
            put2(&mut self.data, start + 2, size);
        }
        self.n_free += orig_size as i32;
        Ok(())
    }

    /// Pack every cell against the end of the page, removing all freeblocks
    /// and fragments.
    pub fn defragment(&mut self) -> Result<()> {
        let hdr = self.hdr_offset;
        let usable = self.usable();
        let first = self.cell_offset + 2 * self.n_cell;
        let last = usable - 4;
        let src = self.data.clone();
        let mut cbrk = usable;
        for i in 0..self.n_cell {
            let addr = self.cell_offset + 2 * i;
            let pc = get2(&src, addr);
            if pc < first || pc > last {
                return Err(self.corrupt("cell pointer out of range"));
            }
            let size = self.cell_size_bytes(&src[pc..usable]);
            if size > cbrk || cbrk - size < first || pc + size > usable {
                return Err(self.corrupt("cell content overlaps during defragmentation"));
            }
            cbrk -= size;
            put2(&mut self.data, addr, cbrk);
            self.data[cbrk..cbrk + size].copy_from_slice(&src[pc..pc + size]);
        }
        put2(&mut self.data, hdr + HDR_CONTENT_START, cbrk);
        self.data[hdr + HDR_FIRST_FREEBLOCK] = 0;
        self.data[hdr + HDR_FIRST_FREEBLOCK + 1] = 0;
        self.data[hdr + HDR_FRAGMENTED] = 0;
        self.data[first..cbrk].fill(0);
        if (cbrk - first) as i32 != self.n_free {
            return Err(self.corrupt("free space mismatch after defragmentation"));
        }
        Ok(())
    }

    /// Walk the freeblock list, returning `(offset, size)` pairs.
    pub fn free_blocks(&self) -> Result<Vec<(usize, usize)>> {
        let usable = self.usable();
        let mut blocks = Vec::new();
        let mut prev_end = 0;
        let mut pc = self.first_freeblock();
        while pc != 0 {
            if pc < prev_end || pc > usable - 4 {
                return Err(self.corrupt("freeblock chain out of order"));
            }
            let size = get2(&self.data, pc + 2);
            blocks.push((pc, size));
            prev_end = pc + size;
            pc = get2(&self.data, pc);
        }
        Ok(blocks)
    }

    // ========================================================================
    // Cell insertion and removal
    // ========================================================================

    /// Insert `cell` as cell number `idx`. When `child` is set, its page number
    /// replaces the first four bytes. A cell that does not fit is kept in
    /// `overflow` for the balancer.
    pub fn insert_cell(&mut self, idx: usize, cell: &[u8], child: Option<Pgno>) -> Result<()> {
        if idx > self.n_cell + self.overflow.len() {
            return Err(self.corrupt("insert position out of range"));
        }
        let sz = cell.len();
        if !self.overflow.is_empty() || sz as i32 + 2 > self.n_free {
            let mut copy = cell.to_vec();
            if let Some(pgno) = child {
                put4(&mut copy, 0, pgno);
            }
            self.overflow.push(OverflowCell { idx, cell: copy });
            return Ok(());
        }
        let pc = self.allocate_space(sz)?;
        self.n_free -= (2 + sz) as i32;
        self.data[pc..pc + sz].copy_from_slice(cell);
        if let Some(pgno) = child {
            put4(&mut self.data, pc, pgno);
        }
        let ins = self.cell_offset + 2 * idx;
        let end = self.cell_offset + 2 * self.n_cell;
        self.data.copy_within(ins..end, ins + 2);
        put2(&mut self.data, ins, pc);
        self.n_cell += 1;
        let hdr = self.hdr_offset;
        put2(&mut self.data, hdr + HDR_CELL_COUNT, self.n_cell);
        Ok(())
    }

    /// Remove cell `idx`, which occupies `size` bytes.
    pub fn drop_cell(&mut self, idx: usize, size: usize) -> Result<()> {
        if idx >= self.n_cell {
            return Err(self.corrupt("drop position out of range"));
        }
        let hdr = self.hdr_offset;
        let usable = self.usable();
        let ptr = self.cell_offset + 2 * idx;
        let pc = get2(&self.data, ptr);
        if pc < get2(&self.data, hdr + HDR_CONTENT_START) || pc + size > usable {
            return Err(self.corrupt("cell outside the content area"));
        }
        self.free_space(pc, size)?;
        self.n_cell -= 1;
        if self.n_cell == 0 {
            self.data[hdr + HDR_FIRST_FREEBLOCK..hdr + HDR_CONTENT_START].fill(0);
            self.data[hdr + HDR_FRAGMENTED] = 0;
            put2(&mut self.data, hdr + HDR_CONTENT_START, usable);
            self.n_free = (usable - hdr - self.child_ptr_size - PAGE_HEADER_SIZE_LEAF) as i32;
        } else {
            let end = self.cell_offset + 2 * (self.n_cell + 1);
            self.data.copy_within(ptr + 2..end, ptr);
            put2(&mut self.data, hdr + HDR_CELL_COUNT, self.n_cell);
            self.n_free += 2;
        }
        Ok(())
    }

    /// Replace the whole cell area with `cells`, packed from the end of the page.
    pub fn rebuild(&mut self, cells: &[Vec<u8>]) -> Result<()> {
        let hdr = self.hdr_offset;
        let usable = self.usable();
        let first = self.cell_offset + 2 * cells.len();
        let mut data_end = usable;
        let mut ptr = self.cell_offset;
        for cell in cells {
            if data_end < first + cell.len() {
                return Err(self.corrupt("cells do not fit while rebuilding page"));
            }
            data_end -= cell.len();
            put2(&mut self.data, ptr, data_end);
            ptr += 2;
            self.data[data_end..data_end + cell.len()].copy_from_slice(cell);
        }
        self.n_cell = cells.len();
        self.overflow.clear();
        put2(&mut self.data, hdr + HDR_FIRST_FREEBLOCK, 0);
        put2(&mut self.data, hdr + HDR_CELL_COUNT, self.n_cell);
        put2(&mut self.data, hdr + HDR_CONTENT_START, data_end);
        self.data[hdr + HDR_FRAGMENTED] = 0;
        self.n_free = (data_end - first) as i32;
        Ok(())
    }

    /// Copy the header, pointer array and content of `src` into this page.
    /// The two pages may have different header offsets.
    pub fn copy_content_from(&mut self, src: &MemPage) -> Result<()> {
        let usable = self.usable();
        let from_hdr = src.hdr_offset;
        let to_hdr = self.hdr_offset;
        let data_start = src.content_start().min(usable);
        let hdr_len = src.cell_offset - from_hdr + 2 * src.n_cell;
        if to_hdr + hdr_len > data_start {
            return Err(self.corrupt("no room for copied header"));
        }
        self.data[data_start..usable].copy_from_slice(&src.data[data_start..usable]);
        self.data[to_hdr..to_hdr + hdr_len].copy_from_slice(&src.data[from_hdr..from_hdr + hdr_len]);
        self.decode()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::storage::btree::encoding::write_varint;
    use proptest::prelude::*;

    pub(crate) fn limits(page_size: u32) -> PageLimits {
        PageLimits::new(page_size, page_size)
    }

    /// Table-leaf cell with `len` payload bytes of value `fill`.
    pub(crate) fn table_cell(page: &MemPage, key: i64, len: usize, fill: u8) -> Vec<u8> {
        let mut cell = Vec::new();
        write_varint(len as u64, &mut cell);
        write_varint(key as u64, &mut cell);
        let local = page.payload_to_local(len as u32);
        cell.extend(std::iter::repeat(fill).take(local));
        if local < len {
            cell.extend_from_slice(&99u32.to_be_bytes());
        }
        while cell.len() < 4 {
            cell.push(0);
        }
        cell
    }

    fn accounted(page: &MemPage) -> usize {
        let cells: usize = (0..page.n_cell).map(|i| page.cell_size(i).unwrap()).sum();
        page.n_free as usize + cells + 2 * page.n_cell + page.cell_offset
    }

    #[test]
    fn test_zero_then_init_for_every_kind() {
        for flags in [PTF_TABLE_LEAF, PTF_TABLE_INTERIOR, PTF_INDEX_LEAF, PTF_INDEX_INTERIOR] {
            let page = MemPage::blank(2, limits(1024), flags).unwrap();
            let parsed = MemPage::from_image(2, page.data.clone(), None, limits(1024)).unwrap();
            assert_eq!(parsed.kind.flags(), flags);
            assert_eq!(parsed.n_cell, 0);
            assert_eq!(parsed.n_free, page.n_free);
        }
        let page1 = MemPage::blank(1, limits(1024), PTF_TABLE_LEAF).unwrap();
        assert_eq!(page1.hdr_offset, 100);
        assert_eq!(page1.n_free, 1024 - 108);
    }

    #[test]
    fn test_init_rejects_bad_flags() {
        let mut page = MemPage::blank(2, limits(512), PTF_TABLE_LEAF).unwrap();
        page.data[0] = 0x07;
        let err = MemPage::from_image(2, page.data, None, limits(512)).unwrap_err();
        assert!(err.is_corrupt());
    }

    #[test]
    fn test_content_start_zero_on_64k_page() {
        let page = MemPage::blank(2, limits(65536), PTF_INDEX_LEAF).unwrap();
        assert_eq!(get2(&page.data, HDR_CONTENT_START), 0);
        assert_eq!(page.content_start(), 65536);
        let parsed = MemPage::from_image(2, page.data.clone(), None, limits(65536)).unwrap();
        assert_eq!(parsed.n_free, 65536 - 8);
    }

    #[test]
    fn test_insert_drop_coalesces_freeblocks() {
        let mut page = MemPage::blank(2, limits(512), PTF_TABLE_LEAF).unwrap();
        for key in 0..4 {
            let cell = table_cell(&page, key, 20, key as u8);
            page.insert_cell(key as usize, &cell, None).unwrap();
        }
        let size = page.cell_size(1).unwrap();
        page.drop_cell(1, size).unwrap();
        assert_eq!(page.free_blocks().unwrap().len(), 1);
        let size = page.cell_size(1).unwrap();
        page.drop_cell(1, size).unwrap();
        let blocks = page.free_blocks().unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].1, 2 * size);
        assert_eq!(accounted(&page), 512);

        let reparsed = MemPage::from_image(2, page.data.clone(), None, limits(512)).unwrap();
        assert_eq!(reparsed.n_free, page.n_free);
        assert_eq!(reparsed.parse_cell(1).unwrap().n_key, 3);
    }

    #[test]
    fn test_freeing_next_to_content_start_moves_boundary() {
        let mut page = MemPage::blank(2, limits(512), PTF_TABLE_LEAF).unwrap();
        let cell = table_cell(&page, 1, 30, 1);
        page.insert_cell(0, &cell, None).unwrap();
        let cell = table_cell(&page, 2, 30, 2);
        page.insert_cell(1, &cell, None).unwrap();
        // the most recent cell sits at the content start
        let size = page.cell_size(1).unwrap();
        page.drop_cell(1, size).unwrap();
        assert!(page.free_blocks().unwrap().is_empty());
        assert_eq!(page.content_start(), 512 - cell.len());
    }

    #[test]
    fn test_last_cell_drop_resets_header() {
        let mut page = MemPage::blank(2, limits(512), PTF_TABLE_LEAF).unwrap();
        let cell = table_cell(&page, 7, 10, 1);
        page.insert_cell(0, &cell, None).unwrap();
        page.drop_cell(0, cell.len()).unwrap();
        assert_eq!(page.n_cell, 0);
        assert_eq!(page.n_free, 512 - 8);
        assert_eq!(page.content_start(), 512);
    }

    #[test]
    fn test_find_slot_refuses_fragment_when_fragmented() {
        let mut page = MemPage::blank(2, limits(512), PTF_TABLE_LEAF).unwrap();
        for key in 0..3 {
            let cell = table_cell(&page, key, 20, 0);
            page.insert_cell(key as usize, &cell, None).unwrap();
        }
        let size = page.cell_size(1).unwrap();
        page.drop_cell(1, size).unwrap();
        page.data[7] = 58;
        assert_eq!(page.find_slot(size - 2).unwrap(), None);
        page.data[7] = 10;
        assert!(page.find_slot(size - 2).unwrap().is_some());
        assert_eq!(page.fragmented_bytes(), 12);
    }

    #[test]
    fn test_defragment_packs_cells() {
        let mut page = MemPage::blank(2, limits(512), PTF_TABLE_LEAF).unwrap();
        for key in 0..6 {
            let cell = table_cell(&page, key, 12, key as u8);
            page.insert_cell(key as usize, &cell, None).unwrap();
        }
        for idx in [4usize, 2, 0] {
            let size = page.cell_size(idx).unwrap();
            page.drop_cell(idx, size).unwrap();
        }
        page.defragment().unwrap();
        assert!(page.free_blocks().unwrap().is_empty());
        assert_eq!(page.fragmented_bytes(), 0);
        assert_eq!(page.content_start() - (page.cell_offset + 6), page.n_free as usize);
        let keys: Vec<i64> = (0..3).map(|i| page.parse_cell(i).unwrap().n_key).collect();
        assert_eq!(keys, vec![1, 3, 5]);
    }

    #[test]
    fn test_backward_freeblock_pointer_is_corrupt() {
        let mut page = MemPage::blank(2, limits(512), PTF_TABLE_LEAF).unwrap();
        for key in 0..5 {
            let cell = table_cell(&page, key, 16, 0);
            page.insert_cell(key as usize, &cell, None).unwrap();
        }
        for idx in [3usize, 1] {
            let size = page.cell_size(idx).unwrap();
            page.drop_cell(idx, size).unwrap();
        }
        let blocks = page.free_blocks().unwrap();
        assert_eq!(blocks.len(), 2);
        // point the second freeblock back at the first
        let (first, _) = blocks[0];
        let (second, _) = blocks[1];
        put2(&mut page.data, second, first);
        let err = MemPage::from_image(2, page.data, None, limits(512)).unwrap_err();
        assert!(err.is_corrupt());
    }

    #[test]
    fn test_overflow_cell_is_parked() {
        let mut page = MemPage::blank(2, limits(512), PTF_TABLE_LEAF).unwrap();
        let mut key = 0;
        while page.overflow.is_empty() {
            let cell = table_cell(&page, key, 60, 1);
            page.insert_cell(key as usize, &cell, None).unwrap();
            key += 1;
        }
        assert_eq!(page.overflow[0].idx, page.n_cell);
        let cell = table_cell(&page, 1000, 1, 1);
        page.insert_cell(0, &cell, None).unwrap();
        assert_eq!(page.overflow.len(), 2);
    }

    #[test]
    fn test_spilled_payload_layout() {
        let page = MemPage::blank(2, limits(512), PTF_TABLE_LEAF).unwrap();
        let cell = table_cell(&page, 5, 2000, 3);
        let info = page.parse_cell_bytes(&cell).unwrap();
        assert_eq!(info.n_payload, 2000);
        assert_eq!(info.n_local as usize, page.payload_to_local(2000));
        assert_eq!(info.overflow_pgno, Some(99));
        assert_eq!(info.n_size as usize, cell.len());
    }

    #[test]
    fn test_interior_child_pointers() {
        let mut page = MemPage::blank(3, limits(512), PTF_TABLE_INTERIOR).unwrap();
        let mut cell = vec![0u8; 4];
        write_varint(10, &mut cell);
        page.insert_cell(0, &cell, Some(17)).unwrap();
        page.set_right_child(23);
        assert_eq!(page.child_pgno(0).unwrap(), 17);
        assert_eq!(page.child_pgno(1).unwrap(), 23);
        assert_eq!(page.parse_cell(0).unwrap().n_key, 10);
        assert_eq!(page.cell_size(0).unwrap(), 5);
    }

    proptest! {
        #[test]
        fn prop_cell_size_agrees_with_parse(len in 0usize..3000, key in any::<i64>(), index in any::<bool>()) {
            let flags = if index { PTF_INDEX_LEAF } else { PTF_TABLE_LEAF };
            let page = MemPage::blank(2, limits(1024), flags).unwrap();
            let mut cell = Vec::new();
            write_varint(len as u64, &mut cell);
            if !index {
                write_varint(key as u64, &mut cell);
            }
            let local = page.payload_to_local(len as u32);
            cell.extend(std::iter::repeat(7u8).take(local));
            if local < len {
                cell.extend_from_slice(&3u32.to_be_bytes());
            }
            while cell.len() < 4 {
                cell.push(0);
            }
            let info = page.parse_cell_bytes(&cell).unwrap();
            prop_assert_eq!(page.cell_size_bytes(&cell), info.n_size as usize);
            prop_assert_eq!(info.n_size as usize, cell.len());
        }

        #[test]
        fn prop_free_space_is_conserved(ops in proptest::collection::vec((any::<bool>(), 1usize..120, any::<u16>()), 1..80)) {
            let mut page = MemPage::blank(2, limits(1024), PTF_TABLE_LEAF).unwrap();
            let mut next_key = 0;
            for (insert, len, pick) in ops {
                if insert || page.n_cell == 0 {
                    let cell = table_cell(&page, next_key, len, 5);
                    if cell.len() as i32 + 2 > page.n_free {
                        continue;
                    }
                    let idx = pick as usize % (page.n_cell + 1);
                    page.insert_cell(idx, &cell, None).unwrap();
                    next_key += 1;
                } else {
                    let idx = pick as usize % page.n_cell;
                    let size = page.cell_size(idx).unwrap();
                    page.drop_cell(idx, size).unwrap();
                }
                prop_assert!(page.overflow.is_empty());
                prop_assert_eq!(accounted(&page), 1024);
                let reparsed = MemPage::from_image(2, page.data.clone(), None, limits(1024)).unwrap();
                prop_assert_eq!(reparsed.n_free, page.n_free);
            }
        }
    }
}
