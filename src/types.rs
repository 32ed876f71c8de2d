//! Core type aliases shared by the pager and the B-tree layer

// ============================================================================
// Numeric Type Aliases
// ============================================================================

/// Page number type (1-based; 0 means "no page")
pub type Pgno = u32;

/// Integer key of a table b-tree row
pub type RowId = i64;

/// Identifier handed out to each open Btree handle
pub type BtreeId = u64;

/// Identifier handed out to each open cursor
pub type CursorId = u64;
