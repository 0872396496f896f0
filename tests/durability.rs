//! Durability and recovery: rollback byte-identity, crash simulation with
//! a hot journal, checkpoint semantics through the tree API, and the
//! cross-handle locking protocol.

use std::path::{Path, PathBuf};

use pagoda::{BTree, ResultCode};

fn scratch(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(name);
    (dir, path)
}

fn open(path: &Path) -> BTree {
    BTree::open(path, 10).unwrap()
}

fn journal_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push("-journal");
    PathBuf::from(os)
}

fn read_value(tree: &mut BTree, root: u32, key: &[u8]) -> Option<Vec<u8>> {
    let cursor = tree.cursor_open(root, false).unwrap();
    let hit = tree.move_to(cursor, key).unwrap();
    let value = if hit == 0 {
        let size = tree.data_size(cursor).unwrap();
        Some(tree.data(cursor, 0, size).unwrap())
    } else {
        None
    };
    tree.cursor_close(cursor).unwrap();
    value
}

fn write_value(tree: &mut BTree, root: u32, key: &[u8], value: &[u8]) {
    let cursor = tree.cursor_open(root, true).unwrap();
    tree.insert(cursor, key, value).unwrap();
    tree.cursor_close(cursor).unwrap();
}

#[test]
fn rollback_restores_previous_value() {
    let (_dir, path) = scratch("rollback.db");
    let mut tree = open(&path);
    tree.begin_trans().unwrap();
    let root = tree.create_table().unwrap();
    write_value(&mut tree, root, b"one", b"A");
    tree.commit().unwrap();

    tree.begin_trans().unwrap();
    write_value(&mut tree, root, b"one", b"B");
    assert_eq!(read_value(&mut tree, root, b"one").unwrap(), b"B");
    tree.rollback().unwrap();

    assert_eq!(read_value(&mut tree, root, b"one").unwrap(), b"A");
}

#[test]
fn rollback_leaves_the_file_byte_identical() {
    let (_dir, path) = scratch("byteident.db");
    let root;
    {
        let mut tree = open(&path);
        tree.begin_trans().unwrap();
        root = tree.create_table().unwrap();
        let cursor = tree.cursor_open(root, true).unwrap();
        for n in 0u32..60 {
            tree.insert(cursor, &n.to_be_bytes(), &[9u8; 20]).unwrap();
        }
        tree.cursor_close(cursor).unwrap();
        tree.commit().unwrap();
    }
    let before = std::fs::read(&path).unwrap();

    {
        let mut tree = open(&path);
        tree.begin_trans().unwrap();
        let cursor = tree.cursor_open(root, true).unwrap();
        // Enough churn to force dirty pages out through the small cache.
        for n in 0u32..200 {
            tree.insert(cursor, &(1000 + n).to_be_bytes(), &[1u8; 20])
                .unwrap();
        }
        for n in 0u32..30 {
            tree.move_to(cursor, &n.to_be_bytes()).unwrap();
            tree.delete(cursor).unwrap();
        }
        tree.cursor_close(cursor).unwrap();
        tree.rollback().unwrap();
    }

    let after = std::fs::read(&path).unwrap();
    assert_eq!(before, after);
}

#[test]
fn crash_before_commit_replays_on_reopen() {
    let (_dir, path) = scratch("crash.db");
    let root;
    {
        let mut tree = open(&path);
        tree.begin_trans().unwrap();
        root = tree.create_table().unwrap();
        write_value(&mut tree, root, b"k", b"committed");
        tree.commit().unwrap();
    }
    let committed = std::fs::read(&path).unwrap();

    {
        let mut tree = open(&path);
        tree.begin_trans().unwrap();
        let cursor = tree.cursor_open(root, true).unwrap();
        // Spill well past the cache so the database file itself is dirtied
        // before the "crash".
        for n in 0u32..300 {
            tree.insert(cursor, &n.to_be_bytes(), &[0x77u8; 16]).unwrap();
        }
        tree.cursor_close(cursor).unwrap();
        // Dropping the handle without commit abandons the transaction,
        // leaving the hot journal and a partially updated file behind.
    }
    assert!(journal_path(&path).exists(), "journal survives the crash");
    assert_ne!(
        std::fs::read(&path).unwrap(),
        committed,
        "the crash left partial writes in the database file"
    );

    let mut tree = open(&path);
    assert_eq!(read_value(&mut tree, root, b"k").unwrap(), b"committed");
    assert!(!journal_path(&path).exists(), "recovery consumed the journal");
    drop(tree);
    assert_eq!(std::fs::read(&path).unwrap(), committed);
}

#[test]
fn checkpoint_rollback_is_a_savepoint() {
    let (_dir, path) = scratch("ckpt.db");
    let mut tree = open(&path);
    tree.begin_trans().unwrap();
    let root = tree.create_table().unwrap();
    write_value(&mut tree, root, b"outer", b"kept");

    tree.begin_ckpt().unwrap();
    write_value(&mut tree, root, b"inner", b"discarded");
    assert!(read_value(&mut tree, root, b"inner").is_some());
    tree.rollback_ckpt().unwrap();

    assert_eq!(read_value(&mut tree, root, b"outer").unwrap(), b"kept");
    assert!(read_value(&mut tree, root, b"inner").is_none());
    tree.commit().unwrap();

    // And the outer commit survives a reopen.
    let mut tree = open(&path);
    assert_eq!(read_value(&mut tree, root, b"outer").unwrap(), b"kept");
    assert!(read_value(&mut tree, root, b"inner").is_none());
}

#[test]
fn checkpoint_commit_folds_into_transaction() {
    let (_dir, path) = scratch("ckptcommit.db");
    let mut tree = open(&path);
    tree.begin_trans().unwrap();
    let root = tree.create_table().unwrap();
    tree.begin_ckpt().unwrap();
    write_value(&mut tree, root, b"inner", b"kept");
    tree.commit_ckpt().unwrap();
    tree.commit().unwrap();

    let mut tree = open(&path);
    assert_eq!(read_value(&mut tree, root, b"inner").unwrap(), b"kept");
}

#[test]
fn checkpoint_requires_enclosing_transaction() {
    let (_dir, path) = scratch("ckptmisuse.db");
    let mut tree = open(&path);
    assert_eq!(tree.begin_ckpt().err(), Some(ResultCode::Error));
    tree.begin_trans().unwrap();
    tree.begin_ckpt().unwrap();
    assert_eq!(tree.begin_ckpt().err(), Some(ResultCode::Error));
    tree.commit_ckpt().unwrap();
    tree.rollback().unwrap();
}

#[test]
fn writer_makes_other_handles_busy() {
    let (_dir, path) = scratch("busy.db");
    let root;
    {
        let mut tree = open(&path);
        tree.begin_trans().unwrap();
        root = tree.create_table().unwrap();
        tree.commit().unwrap();
    }

    let mut writer = open(&path);
    writer.begin_trans().unwrap();
    write_value(&mut writer, root, b"w", b"1");

    let mut reader = open(&path);
    assert_eq!(
        reader.begin_trans().err(),
        Some(ResultCode::Busy),
        "the write lock excludes other handles"
    );

    writer.commit().unwrap();
    // After commit the writer handle is idle again and the reader
    // proceeds.
    reader.begin_trans().unwrap();
    reader.rollback().unwrap();
    assert_eq!(read_value(&mut reader, root, b"w").unwrap(), b"1");
}

#[test]
fn committed_state_visible_to_fresh_handle() {
    let (_dir, path) = scratch("visibility.db");
    let root;
    {
        let mut tree = open(&path);
        tree.begin_trans().unwrap();
        root = tree.create_table().unwrap();
        for n in 0u32..50 {
            write_value(&mut tree, root, &n.to_be_bytes(), &n.to_ne_bytes());
        }
        tree.commit().unwrap();
    }
    let mut tree = open(&path);
    for n in 0u32..50 {
        assert_eq!(
            read_value(&mut tree, root, &n.to_be_bytes()).unwrap(),
            n.to_ne_bytes()
        );
    }
}

#[test]
fn meta_array_survives_rollback_of_later_changes() {
    let (_dir, path) = scratch("meta.db");
    let mut tree = open(&path);
    tree.begin_trans().unwrap();
    tree.update_meta(&[0, 1, 2, 3]).unwrap();
    tree.commit().unwrap();

    tree.begin_trans().unwrap();
    tree.update_meta(&[0, 9, 9, 9]).unwrap();
    tree.rollback().unwrap();

    assert_eq!(&tree.get_meta().unwrap()[1..], &[1, 2, 3]);
}
