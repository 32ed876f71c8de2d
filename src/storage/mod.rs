//! Storage layer: B-tree, pager, and page cache

pub mod btree;
pub mod pager;
pub mod pcache;
