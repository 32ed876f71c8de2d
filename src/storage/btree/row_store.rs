//! Row-store bypass
//!
//! Some roots are backed by an external row store instead of b-tree pages.
//! A cursor opened with a [`RowStore`] forwards every public operation to it
//! and never touches the pager.

use crate::error::Result;
use crate::types::RowId;

use super::record::UnpackedRecord;
use super::BtreePayload;

/// Cursor operations implemented by an external row store. Return values
/// follow [`BtCursor`](super::BtCursor): `first`/`last` report an empty
/// store with `true`, seeks report the position relative to the key as a
/// negative, zero or positive number.
pub trait RowStore {
    fn first(&mut self) -> Result<bool>;
    fn last(&mut self) -> Result<bool>;
    fn next(&mut self) -> Result<()>;
    fn previous(&mut self) -> Result<()>;
    fn eof(&self) -> bool;
    fn table_moveto(&mut self, key: RowId, bias_right: bool) -> Result<i32>;
    fn index_moveto(&mut self, key: &mut UnpackedRecord) -> Result<i32>;
    fn insert(&mut self, payload: &BtreePayload) -> Result<()>;
    fn delete(&mut self) -> Result<()>;
    fn integer_key(&self) -> Result<RowId>;
    fn payload_size(&self) -> Result<u32>;
    fn payload(&self, offset: u32, amount: u32) -> Result<Vec<u8>>;
    fn count(&mut self) -> Result<i64>;
}
