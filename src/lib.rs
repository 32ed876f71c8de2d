//! btreedb - a disk-based B-tree storage engine using the SQLite page format

pub mod config;
pub mod error;
pub mod shared_cache;
pub mod storage;
pub mod types;
pub mod util;

// Re-export main public types
pub use config::BtreeConfig;
pub use error::{Error, ErrorCode, Result};
pub use storage::btree::{
    BtCursor, Btree, BtreeInsertFlags, BtreePayload, CursorState, IntegrityCheckResult, KeyInfo,
    RowStore, TransState, UnpackedRecord, BTREE_BLOBKEY, BTREE_INTKEY,
};
pub use storage::pager::SavepointOp;
pub use types::{Pgno, RowId};
