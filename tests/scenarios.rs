use std::sync::Arc;

use btreedb::storage::btree::{BTREE_FREE_PAGE_COUNT, BTREE_USER_VERSION};
use btreedb::{
    Btree, BtreeConfig, BtreeInsertFlags, BtreePayload, ErrorCode, RowId, BTREE_INTKEY,
};
use tempfile::tempdir;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn memory_writer(page_size: u32) -> Arc<Btree> {
    let bt = Btree::open(None, BtreeConfig::default().page_size(page_size)).unwrap();
    bt.begin_trans(true).unwrap();
    bt
}

fn scan(bt: &Arc<Btree>, root: u32) -> Vec<(RowId, Vec<u8>)> {
    let mut cur = bt.cursor(root, false, None).unwrap();
    let mut rows = Vec::new();
    cur.first().unwrap();
    while !cur.eof() {
        rows.push((cur.integer_key().unwrap(), cur.key().unwrap()));
        cur.next().unwrap();
    }
    rows
}

fn assert_clean(bt: &Btree, roots: &[u32]) {
    let result = bt.integrity_check(roots, 0).unwrap();
    assert!(result.is_ok, "{:?}", result.errors);
}

#[test]
fn test_sequential_inserts_with_small_pages() {
    init();
    let bt = memory_writer(512);
    let root = bt.create_table(BTREE_INTKEY).unwrap();
    let mut cur = bt.cursor(root, true, None).unwrap();
    for key in 0..1000 {
        cur.insert(&BtreePayload::table(key, vec![0xab; 8]), BtreeInsertFlags::APPEND, 0)
            .unwrap();
    }
    drop(cur);

    let keys: Vec<RowId> = scan(&bt, root).into_iter().map(|(k, _)| k).collect();
    assert_eq!(keys, (0..1000).collect::<Vec<_>>());

    // cells are at least 10 bytes plus a 2-byte pointer, 504 usable leaf bytes
    let per_leaf = 504 / 12;
    let leaves = (1000 + per_leaf - 1) / per_leaf;
    let minimum = 1 + leaves + 1;
    let pages = bt.page_count().unwrap();
    assert!(pages >= minimum, "{} pages, expected at least {}", pages, minimum);
    assert!(pages <= 2 * minimum, "{} pages for {} leaves", pages, leaves);
    assert_clean(&bt, &[1, root]);
}

#[test]
fn test_delete_even_keys_from_shuffled_table() {
    init();
    let bt = memory_writer(512);
    let root = bt.create_table(BTREE_INTKEY).unwrap();
    let mut cur = bt.cursor(root, true, None).unwrap();
    for i in 0..1000i64 {
        let key = i * 7919 % 1000;
        cur.insert(&BtreePayload::table(key, key.to_be_bytes().to_vec()), BtreeInsertFlags::empty(), 0)
            .unwrap();
    }
    let free_before = bt.get_meta(BTREE_FREE_PAGE_COUNT).unwrap();
    for key in (0..1000).step_by(2) {
        assert_eq!(cur.table_moveto(key, false).unwrap(), 0);
        cur.delete(BtreeInsertFlags::empty()).unwrap();
    }
    drop(cur);

    let rows = scan(&bt, root);
    let keys: Vec<RowId> = rows.iter().map(|(k, _)| *k).collect();
    assert_eq!(keys, (1..1000).step_by(2).collect::<Vec<_>>());
    for (key, value) in rows {
        assert_eq!(value, key.to_be_bytes().to_vec());
    }
    assert!(bt.get_meta(BTREE_FREE_PAGE_COUNT).unwrap() >= free_before);
    assert_clean(&bt, &[1, root]);
}

#[test]
fn test_overflow_payload_sub_ranges() {
    init();
    let bt = memory_writer(1024);
    let root = bt.create_table(BTREE_INTKEY).unwrap();
    let value: Vec<u8> = (0..10_000u32).map(|i| (i * 31 % 256) as u8).collect();
    let mut cur = bt.cursor(root, true, None).unwrap();
    cur.insert(&BtreePayload::table(42, value.clone()), BtreeInsertFlags::empty(), 0)
        .unwrap();

    assert_eq!(cur.table_moveto(42, false).unwrap(), 0);
    let local = cur.payload_fetch().unwrap().len() as u32;
    assert!(local < 1024);
    for (offset, amount) in [
        (0, 10),
        (local - 5, 10),
        (local, 1020),
        (local + 1019, 2),
        (3000, 4000),
        (9990, 10),
        (0, 10_000),
    ] {
        let got = cur.payload(offset, amount).unwrap();
        assert_eq!(got, value[offset as usize..(offset + amount) as usize].to_vec());
    }
    let err = cur.payload(9_999, 2).unwrap_err();
    assert_eq!(err.code, ErrorCode::Corrupt);
}

#[test]
fn test_cursor_survives_delete_through_another_cursor() {
    init();
    let bt = memory_writer(512);
    let root = bt.create_table(BTREE_INTKEY).unwrap();
    let mut writer = bt.cursor(root, true, None).unwrap();
    for key in 0..200 {
        writer.insert(&BtreePayload::table(key, vec![1u8; 16]), BtreeInsertFlags::empty(), 0)
            .unwrap();
    }

    let mut reader = bt.cursor(root, false, None).unwrap();
    assert_eq!(reader.table_moveto(50, false).unwrap(), 0);
    assert_eq!(writer.table_moveto(50, false).unwrap(), 0);
    writer.delete(BtreeInsertFlags::empty()).unwrap();

    assert!(reader.has_moved());
    reader.next().unwrap();
    assert_eq!(reader.integer_key().unwrap(), 51);
    reader.next().unwrap();
    assert_eq!(reader.integer_key().unwrap(), 52);
}

#[test]
fn test_backwards_freeblock_pointer_is_reported_once() {
    init();
    let bt = memory_writer(1024);
    let root = bt.create_table(BTREE_INTKEY).unwrap();
    let mut cur = bt.cursor(root, true, None).unwrap();
    for key in 0..20 {
        cur.insert(&BtreePayload::table(key, vec![7u8; 24]), BtreeInsertFlags::empty(), 0)
            .unwrap();
    }
    for key in [4, 12] {
        assert_eq!(cur.table_moveto(key, false).unwrap(), 0);
        cur.delete(BtreeInsertFlags::empty()).unwrap();
    }
    drop(cur);

    let mut page = bt.get_page_data(root).unwrap();
    let first = u16::from_be_bytes([page[1], page[2]]) as usize;
    assert!(first > 0, "expected a freeblock");
    let backwards = (first - 16) as u16;
    page[first..first + 2].copy_from_slice(&backwards.to_be_bytes());
    bt.put_page_data(root, &page).unwrap();

    let result = bt.integrity_check(&[1, root], 0).unwrap();
    assert_eq!(result.errors.len(), 1, "{:?}", result.errors);
    assert!(!result.is_ok);

    let mut cur = bt.cursor(root, false, None).unwrap();
    assert_eq!(cur.first().unwrap_err().code, ErrorCode::Corrupt);
}

#[test]
fn test_reopen_returns_the_same_rows() {
    init();
    let dir = tempdir().unwrap();
    let path = dir.path().join("reopen.db");
    let cfg = BtreeConfig::default().page_size(1024);

    let (root, before) = {
        let bt = Btree::open(Some(&path), cfg.clone()).unwrap();
        bt.begin_trans(true).unwrap();
        let root = bt.create_table(BTREE_INTKEY).unwrap();
        bt.update_meta(BTREE_USER_VERSION, 7).unwrap();
        let mut cur = bt.cursor(root, true, None).unwrap();
        for key in 0..500i64 {
            let value = format!("row {} {}", key, "x".repeat((key % 40) as usize));
            cur.insert(&BtreePayload::table(key, value.into_bytes()), BtreeInsertFlags::empty(), 0)
                .unwrap();
        }
        drop(cur);
        bt.commit().unwrap();
        bt.begin_trans(false).unwrap();
        let rows = scan(&bt, root);
        bt.commit().unwrap();
        (root, rows)
    };

    let bt = Btree::open(Some(&path), cfg).unwrap();
    bt.begin_trans(false).unwrap();
    assert_eq!(bt.page_size().unwrap(), 1024);
    assert_eq!(bt.get_meta(BTREE_USER_VERSION).unwrap(), 7);
    assert_eq!(scan(&bt, root), before);
    assert_clean(&bt, &[1, root]);
    bt.commit().unwrap();
}

#[test]
fn test_rollback_discards_changes_and_trips_cursors() {
    init();
    let dir = tempdir().unwrap();
    let path = dir.path().join("rollback.db");
    let bt = Btree::open(Some(&path), BtreeConfig::default().page_size(1024)).unwrap();
    bt.begin_trans(true).unwrap();
    let root = bt.create_table(BTREE_INTKEY).unwrap();
    let mut cur = bt.cursor(root, true, None).unwrap();
    for key in 0..10 {
        cur.insert(&BtreePayload::table(key, vec![1u8; 4]), BtreeInsertFlags::empty(), 0)
            .unwrap();
    }
    drop(cur);
    bt.commit().unwrap();

    bt.begin_trans(true).unwrap();
    let mut cur = bt.cursor(root, true, None).unwrap();
    for key in 10..400 {
        cur.insert(&BtreePayload::table(key, vec![2u8; 40]), BtreeInsertFlags::empty(), 0)
            .unwrap();
    }
    bt.rollback().unwrap();
    assert_eq!(cur.first().unwrap_err().code, ErrorCode::Abort);
    drop(cur);

    bt.begin_trans(false).unwrap();
    let keys: Vec<RowId> = scan(&bt, root).into_iter().map(|(k, _)| k).collect();
    assert_eq!(keys, (0..10).collect::<Vec<_>>());
    assert_clean(&bt, &[1, root]);
}

#[test]
fn test_statement_rollback_keeps_outer_changes() {
    init();
    let bt = memory_writer(1024);
    let root = bt.create_table(BTREE_INTKEY).unwrap();
    let mut cur = bt.cursor(root, true, None).unwrap();
    cur.insert(&BtreePayload::table(1, b"kept".to_vec()), BtreeInsertFlags::empty(), 0)
        .unwrap();

    bt.begin_stmt(1).unwrap();
    cur.insert(&BtreePayload::table(2, b"dropped".to_vec()), BtreeInsertFlags::empty(), 0)
        .unwrap();
    bt.savepoint(btreedb::SavepointOp::Rollback, 0).unwrap();
    bt.savepoint(btreedb::SavepointOp::Release, 0).unwrap();
    drop(cur);

    let rows = scan(&bt, root);
    assert_eq!(rows, vec![(1, b"kept".to_vec())]);
}

#[test]
fn test_secure_delete_zeroes_freed_cells() {
    init();
    let bt = memory_writer(1024);
    bt.set_secure_delete(true).unwrap();
    assert!(bt.secure_delete().unwrap());
    let root = bt.create_table(BTREE_INTKEY).unwrap();
    let mut cur = bt.cursor(root, true, None).unwrap();
    for key in 0..3 {
        cur.insert(&BtreePayload::table(key, b"secret-value".to_vec()), BtreeInsertFlags::empty(), 0)
            .unwrap();
    }
    assert_eq!(cur.table_moveto(1, false).unwrap(), 0);
    cur.delete(BtreeInsertFlags::empty()).unwrap();
    drop(cur);

    let page = bt.get_page_data(root).unwrap();
    let hits = page
        .windows(b"secret-value".len())
        .filter(|w| *w == b"secret-value")
        .count();
    assert_eq!(hits, 2);
}
