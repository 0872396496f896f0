//! End-to-end tree operations against a real database file: insertion,
//! ordered traversal, multi-level growth, overflow payloads, and the
//! free-list accounting visible through the meta array.

use std::path::{Path, PathBuf};

use pagoda::{BTree, CursorId, PageNumber, ResultCode};

fn scratch(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(name);
    (dir, path)
}

fn open(path: &Path) -> BTree {
    BTree::open(path, 10).unwrap()
}

/// Collects every key in traversal order, decoding 4-byte big-endian keys.
fn collect_keys(tree: &mut BTree, cursor: CursorId) -> Vec<u32> {
    let mut keys = Vec::new();
    if tree.first(cursor).unwrap() {
        return keys;
    }
    loop {
        let key = tree.key(cursor, 0, 4).unwrap();
        keys.push(u32::from_be_bytes(key.try_into().unwrap()));
        if tree.next(cursor).unwrap() {
            break;
        }
    }
    keys
}

#[test]
fn single_insert_persists_across_reopen() {
    let (_dir, path) = scratch("single.db");
    let root;
    {
        let mut tree = open(&path);
        tree.begin_trans().unwrap();
        root = tree.create_table().unwrap();
        assert_eq!(root, 3, "pages 1 and 2 are reserved");
        let cursor = tree.cursor_open(root, true).unwrap();
        let mut empty = false;
        if tree.first(cursor).unwrap() {
            empty = true;
        }
        assert!(empty);
        tree.insert(cursor, &42u32.to_ne_bytes(), &24u32.to_ne_bytes())
            .unwrap();
        assert_eq!(tree.key_size(cursor).unwrap(), 4);
        assert_eq!(tree.key(cursor, 0, 4).unwrap(), 42u32.to_ne_bytes());
        assert_eq!(tree.data_size(cursor).unwrap(), 4);
        assert_eq!(tree.data(cursor, 0, 4).unwrap(), 24u32.to_ne_bytes());
        tree.cursor_close(cursor).unwrap();
        tree.commit().unwrap();
    }

    let mut tree = open(&path);
    let cursor = tree.cursor_open(root, false).unwrap();
    assert!(!tree.first(cursor).unwrap());
    assert_eq!(tree.key(cursor, 0, 4).unwrap(), 42u32.to_ne_bytes());
    assert_eq!(tree.data(cursor, 0, 4).unwrap(), 24u32.to_ne_bytes());
    assert!(tree.next(cursor).unwrap());
    tree.cursor_close(cursor).unwrap();
}

#[test]
fn hundred_ascending_inserts_grow_a_second_level() {
    let (_dir, path) = scratch("grow.db");
    let mut tree = open(&path);
    tree.begin_trans().unwrap();
    let root = tree.create_table().unwrap();
    let cursor = tree.cursor_open(root, true).unwrap();

    for n in 0u32..100 {
        tree.insert(cursor, &n.to_be_bytes(), &(n * 3).to_be_bytes())
            .unwrap();
    }

    // Depth grows past one level somewhere in the tree.
    let mut max_depth = 1;
    assert!(!tree.first(cursor).unwrap());
    loop {
        max_depth = max_depth.max(tree.node_depth(cursor).unwrap());
        if tree.next(cursor).unwrap() {
            break;
        }
    }
    assert!(max_depth >= 2, "100 entries cannot fit one 1024-byte page");

    assert_eq!(collect_keys(&mut tree, cursor), (0..100).collect::<Vec<_>>());

    // 100 cells of 28 bytes need at least three content pages, plus the
    // header page, the reserved root, and interior nodes.
    let cell_bytes = 100 * 28;
    let floor = (cell_bytes + 1015) / 1016 + 2;
    assert!(tree.page_count() as usize >= floor);

    tree.cursor_close(cursor).unwrap();
    tree.commit().unwrap();
}

#[test]
fn descending_and_shuffled_inserts_stay_sorted() {
    let (_dir, path) = scratch("shuffled.db");
    let mut tree = open(&path);
    tree.begin_trans().unwrap();
    let root = tree.create_table().unwrap();
    let cursor = tree.cursor_open(root, true).unwrap();

    // A fixed odd multiplier visits every residue once, in a scattered
    // order.
    let count = 257u32;
    for i in 0..count {
        let key = (i.wrapping_mul(101)) % count;
        tree.insert(cursor, &key.to_be_bytes(), &key.to_ne_bytes())
            .unwrap();
    }
    assert_eq!(
        collect_keys(&mut tree, cursor),
        (0..count).collect::<Vec<_>>()
    );
    tree.cursor_close(cursor).unwrap();
    tree.commit().unwrap();
}

#[test]
fn delete_half_keeps_the_rest_ordered() {
    let (_dir, path) = scratch("deletes.db");
    let mut tree = open(&path);
    tree.begin_trans().unwrap();
    let root = tree.create_table().unwrap();
    let cursor = tree.cursor_open(root, true).unwrap();

    let count = 200u32;
    for n in 0..count {
        tree.insert(cursor, &n.to_be_bytes(), b"payload").unwrap();
    }
    for n in 0..count {
        if n % 2 == 0 {
            assert_eq!(tree.move_to(cursor, &n.to_be_bytes()).unwrap(), 0);
            tree.delete(cursor).unwrap();
        }
    }
    let expected: Vec<u32> = (0..count).filter(|n| n % 2 == 1).collect();
    assert_eq!(collect_keys(&mut tree, cursor), expected);

    // Deleting the rest empties the tree completely.
    for n in expected {
        assert_eq!(tree.move_to(cursor, &n.to_be_bytes()).unwrap(), 0);
        tree.delete(cursor).unwrap();
    }
    assert!(tree.first(cursor).unwrap());

    // The tree is usable again afterwards.
    tree.insert(cursor, &7u32.to_be_bytes(), b"back").unwrap();
    assert_eq!(collect_keys(&mut tree, cursor), vec![7]);

    tree.cursor_close(cursor).unwrap();
    tree.commit().unwrap();
}

#[test]
fn overflow_payload_round_trips_byte_for_byte() {
    let (_dir, path) = scratch("overflow.db");
    let mut tree = open(&path);
    tree.begin_trans().unwrap();
    let root = tree.create_table().unwrap();
    let cursor = tree.cursor_open(root, true).unwrap();

    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    tree.insert(cursor, b"blob", &payload).unwrap();

    assert_eq!(tree.data_size(cursor).unwrap(), payload.len() as u32);
    let read = tree.data(cursor, 0, payload.len() as u32).unwrap();
    assert_eq!(read, payload);

    // Ranged reads cross overflow-page boundaries transparently.
    let window = tree.data(cursor, 1019, 2048).unwrap();
    assert_eq!(&window[..], &payload[1019..1019 + 2048]);

    // The key still compares exactly even with a huge value attached.
    assert_eq!(tree.move_to(cursor, b"blob").unwrap(), 0);

    tree.cursor_close(cursor).unwrap();
    tree.commit().unwrap();
}

#[test]
fn oversized_key_spans_overflow_pages() {
    let (_dir, path) = scratch("bigkey.db");
    let mut tree = open(&path);
    tree.begin_trans().unwrap();
    let root = tree.create_table().unwrap();
    let cursor = tree.cursor_open(root, true).unwrap();

    let mut big_key = vec![0x41u8; 3000];
    big_key[2999] = 0x5a;
    tree.insert(cursor, &big_key, b"v").unwrap();

    assert_eq!(tree.move_to(cursor, &big_key).unwrap(), 0);
    assert_eq!(tree.key(cursor, 0, 3000).unwrap(), big_key);

    // A key differing only in the final overflow page still misses.
    let mut other = big_key.clone();
    other[2999] = 0x59;
    assert_ne!(tree.move_to(cursor, &other).unwrap(), 0);

    tree.cursor_close(cursor).unwrap();
    tree.commit().unwrap();
}

#[test]
fn replacing_overflow_value_reclaims_chain_pages() {
    let (_dir, path) = scratch("reclaim.db");
    let mut tree = open(&path);
    tree.begin_trans().unwrap();
    let root = tree.create_table().unwrap();
    let cursor = tree.cursor_open(root, true).unwrap();

    let payload = vec![0xabu8; 10 * 1020];
    tree.insert(cursor, b"k", &payload).unwrap();
    assert_eq!(tree.get_meta().unwrap()[0], 0);

    // Replacing with a small value frees the whole chain.
    tree.insert(cursor, b"k", b"small").unwrap();
    assert_eq!(tree.get_meta().unwrap()[0], 10);
    assert_eq!(tree.data(cursor, 0, 5).unwrap(), b"small");

    // The freed pages feed later allocations before the file grows.
    let before = tree.page_count();
    tree.insert(cursor, b"k2", &payload).unwrap();
    assert_eq!(tree.page_count(), before);

    tree.cursor_close(cursor).unwrap();
    tree.commit().unwrap();
}

#[test]
fn two_tables_are_independent() {
    let (_dir, path) = scratch("twotables.db");
    let mut tree = open(&path);
    tree.begin_trans().unwrap();
    let table = tree.create_table().unwrap();
    let index = tree.create_index().unwrap();

    let tc = tree.cursor_open(table, true).unwrap();
    for n in 0u32..40 {
        tree.insert(tc, &n.to_be_bytes(), b"t").unwrap();
    }
    tree.cursor_close(tc).unwrap();

    let ic = tree.cursor_open(index, true).unwrap();
    for n in 100u32..120 {
        tree.insert(ic, &n.to_be_bytes(), b"i").unwrap();
    }
    tree.cursor_close(ic).unwrap();

    let tc = tree.cursor_open(table, false).unwrap();
    assert_eq!(collect_keys(&mut tree, tc), (0..40).collect::<Vec<_>>());
    tree.cursor_close(tc).unwrap();

    let ic = tree.cursor_open(index, false).unwrap();
    assert_eq!(collect_keys(&mut tree, ic), (100..120).collect::<Vec<_>>());
    tree.cursor_close(ic).unwrap();

    tree.commit().unwrap();
}

#[test]
fn clear_table_refuses_while_cursor_holds_root() {
    let (_dir, path) = scratch("locked.db");
    let mut tree = open(&path);
    tree.begin_trans().unwrap();
    let root = tree.create_table().unwrap();
    let cursor = tree.cursor_open(root, false).unwrap();
    assert_eq!(tree.clear_table(root).err(), Some(ResultCode::Locked));
    tree.cursor_close(cursor).unwrap();
    tree.clear_table(root).unwrap();
    tree.commit().unwrap();
}

#[test]
fn drop_table_returns_every_page_to_the_free_list() {
    let (_dir, path) = scratch("droptable.db");
    let mut tree = open(&path);
    tree.begin_trans().unwrap();
    let root = tree.create_table().unwrap();
    let cursor = tree.cursor_open(root, true).unwrap();
    for n in 0u32..150 {
        tree.insert(cursor, &n.to_be_bytes(), &[0u8; 16]).unwrap();
    }
    tree.cursor_close(cursor).unwrap();

    let populated = tree.page_count();
    tree.drop_table(root).unwrap();

    // Page accounting: every page is page 1, the reserved page 2, or on
    // the free list now.
    let free: PageNumber = tree.get_meta().unwrap()[0] as PageNumber;
    assert_eq!(free + 2, populated);
    tree.commit().unwrap();
}

#[test]
fn page_count_matches_file_size() {
    let (_dir, path) = scratch("accounting.db");
    let mut tree = open(&path);
    tree.begin_trans().unwrap();
    let root = tree.create_table().unwrap();
    let cursor = tree.cursor_open(root, true).unwrap();
    for n in 0u32..64 {
        tree.insert(cursor, &n.to_be_bytes(), &[7u8; 32]).unwrap();
    }
    tree.cursor_close(cursor).unwrap();
    tree.commit().unwrap();
    let pages = tree.page_count() as u64;
    drop(tree);

    let size = std::fs::metadata(&path).unwrap().len();
    assert_eq!(size, pages * 1024);
}

#[test]
fn lru_policy_produces_the_same_tree() {
    let (_dir, path) = scratch("lru.db");
    let mut tree =
        BTree::open_with_policy(&path, 10, pagoda::EvictionPolicy::Lru).unwrap();
    tree.begin_trans().unwrap();
    let root = tree.create_table().unwrap();
    let cursor = tree.cursor_open(root, true).unwrap();
    for n in 0u32..120 {
        tree.insert(cursor, &n.to_be_bytes(), &[3u8; 24]).unwrap();
    }
    assert_eq!(collect_keys(&mut tree, cursor), (0..120).collect::<Vec<_>>());
    tree.cursor_close(cursor).unwrap();
    tree.commit().unwrap();
}
