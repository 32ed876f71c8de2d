use std::path::Path;
use std::sync::Arc;

use btreedb::shared_cache::set_shared_cache_enabled;
use btreedb::{Btree, BtreeConfig, BtreeInsertFlags, BtreePayload, ErrorCode, Pgno, BTREE_INTKEY};
use tempfile::tempdir;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
    set_shared_cache_enabled(true);
}

fn open(path: &Path, read_uncommitted: bool) -> Arc<Btree> {
    let cfg = BtreeConfig::default()
        .page_size(1024)
        .shared_cache(true)
        .read_uncommitted(read_uncommitted);
    Btree::open(Some(path), cfg).unwrap()
}

fn empty_table(bt: &Arc<Btree>) -> Pgno {
    bt.begin_trans(true).unwrap();
    let root = bt.create_table(BTREE_INTKEY).unwrap();
    bt.commit().unwrap();
    root
}

#[test]
fn test_reader_waits_for_writer_commit() {
    init();
    let dir = tempdir().unwrap();
    let path = dir.path().join("shared.db");
    let writer = open(&path, false);
    let reader = open(&path, false);
    assert!(writer.is_sharable());
    assert!(writer.shares_cache_with(&reader));
    let root = empty_table(&writer);

    writer.begin_trans(true).unwrap();
    let mut cur = writer.cursor(root, true, None).unwrap();
    cur.insert(&BtreePayload::table(1, b"one".to_vec()), BtreeInsertFlags::empty(), 0)
        .unwrap();

    reader.begin_trans(false).unwrap();
    let err = reader.cursor(root, false, None).unwrap_err();
    assert_eq!(err.code, ErrorCode::Locked);

    drop(cur);
    writer.commit().unwrap();

    let mut cur = reader.cursor(root, false, None).unwrap();
    assert!(!cur.first().unwrap());
    assert_eq!(cur.integer_key().unwrap(), 1);
    assert_eq!(cur.key().unwrap(), b"one".to_vec());
    drop(cur);
    reader.commit().unwrap();
}

#[test]
fn test_read_uncommitted_sees_pending_rows() {
    init();
    let dir = tempdir().unwrap();
    let path = dir.path().join("dirty.db");
    let writer = open(&path, false);
    let reader = open(&path, true);
    let root = empty_table(&writer);

    writer.begin_trans(true).unwrap();
    let mut cur = writer.cursor(root, true, None).unwrap();
    for key in 0..5 {
        cur.insert(&BtreePayload::table(key, vec![3u8; 8]), BtreeInsertFlags::empty(), 0)
            .unwrap();
    }

    reader.begin_trans(false).unwrap();
    let mut peek = reader.cursor(root, false, None).unwrap();
    assert_eq!(peek.count().unwrap(), 5);
    drop(peek);
    reader.commit().unwrap();

    drop(cur);
    writer.commit().unwrap();
}

#[test]
fn test_one_write_transaction_at_a_time() {
    init();
    let dir = tempdir().unwrap();
    let path = dir.path().join("writers.db");
    let a = open(&path, false);
    let b = open(&path, false);
    let root = empty_table(&a);

    a.begin_trans(true).unwrap();
    assert_eq!(b.begin_trans(true).unwrap_err().code, ErrorCode::Locked);
    a.commit().unwrap();

    b.begin_trans(true).unwrap();
    let mut cur = b.cursor(root, true, None).unwrap();
    cur.insert(&BtreePayload::table(9, b"nine".to_vec()), BtreeInsertFlags::empty(), 0)
        .unwrap();
    drop(cur);
    b.commit().unwrap();
}

#[test]
fn test_exclusive_transaction_blocks_readers() {
    init();
    let dir = tempdir().unwrap();
    let path = dir.path().join("exclusive.db");
    let a = open(&path, false);
    let b = open(&path, false);
    let root = empty_table(&a);

    a.begin_exclusive().unwrap();
    assert_eq!(b.begin_trans(false).unwrap_err().code, ErrorCode::Locked);
    a.commit().unwrap();

    b.begin_trans(false).unwrap();
    let cur = b.cursor(root, false, None).unwrap();
    drop(cur);
    b.commit().unwrap();
}
