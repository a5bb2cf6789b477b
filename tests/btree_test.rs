use granite::btree::BPlusTree;
use granite::buffer_pool::{BufferPoolConfig, BufferPoolManager};
use granite::pager::Pager;
use rand::seq::SliceRandom;
use std::sync::Arc;
use tempfile::{tempdir, TempDir};

fn setup_tree(
    pool_size: usize,
    leaf_max: u16,
    internal_max: u16,
) -> (TempDir, Arc<BufferPoolManager>, BPlusTree<i64, u64>) {
    let dir = tempdir().unwrap();
    let pager = Pager::open(dir.path().join("test.db")).unwrap();
    let bpm = Arc::new(BufferPoolManager::new(
        pager,
        BufferPoolConfig {
            pool_size,
            replacer_k: 2,
        },
    ));
    let header_page_id = bpm.new_page().unwrap().page_id();
    let tree = BPlusTree::new(Arc::clone(&bpm), header_page_id, leaf_max, internal_max).unwrap();
    (dir, bpm, tree)
}

fn value_of(key: i64) -> u64 {
    key as u64 * 100
}

fn collect_keys(tree: &BPlusTree<i64, u64>) -> Vec<i64> {
    tree.iter()
        .unwrap()
        .map(|pair| pair.unwrap().0)
        .collect()
}

#[test]
fn test_empty_tree() {
    let (_dir, _bpm, tree) = setup_tree(16, 4, 3);

    assert!(tree.is_empty().unwrap());
    assert_eq!(tree.height().unwrap(), 0);
    assert!(tree.get(&1).unwrap().is_empty());
    assert_eq!(tree.iter().unwrap().count(), 0);
    tree.remove(&1).unwrap();
    tree.validate().unwrap();
}

#[test]
fn test_insert_get_and_duplicate_rejection() {
    let (_dir, _bpm, tree) = setup_tree(16, 4, 3);

    assert!(tree.insert(5, 50).unwrap());
    assert!(!tree.insert(5, 51).unwrap());
    assert_eq!(tree.get(&5).unwrap(), vec![50]);
    assert!(tree.get(&6).unwrap().is_empty());
    assert!(!tree.is_empty().unwrap());
    assert_eq!(tree.height().unwrap(), 1);
    tree.validate().unwrap();
}

/// Sequential inserts drive a chain of leaf splits and one root split.
#[test]
fn test_split_chain_on_sequential_inserts() {
    let (_dir, _bpm, tree) = setup_tree(64, 4, 3);

    for key in 1..=10 {
        assert!(tree.insert(key, value_of(key)).unwrap(), "insert {key}");
    }

    for key in 1..=10 {
        assert_eq!(tree.get(&key).unwrap(), vec![value_of(key)], "get {key}");
    }
    let pairs: Vec<(i64, u64)> = tree
        .iter()
        .unwrap()
        .map(|pair| pair.unwrap())
        .collect();
    let expected: Vec<(i64, u64)> = (1..=10).map(|k| (k, value_of(k))).collect();
    assert_eq!(pairs, expected);

    assert_eq!(tree.height().unwrap(), 3);
    tree.validate().unwrap();
}

/// Removing from the split-chain state first borrows from a sibling, then
/// merges, collapsing one level of the tree.
#[test]
fn test_borrow_then_merge_shrinks_the_tree() {
    let (_dir, _bpm, tree) = setup_tree(64, 4, 3);
    for key in 1..=10 {
        assert!(tree.insert(key, value_of(key)).unwrap());
    }
    assert_eq!(tree.height().unwrap(), 3);

    tree.remove(&5).unwrap();
    tree.validate().unwrap();
    assert_eq!(tree.height().unwrap(), 3);

    tree.remove(&6).unwrap();
    tree.validate().unwrap();

    tree.remove(&7).unwrap();
    tree.validate().unwrap();
    assert_eq!(tree.height().unwrap(), 2);

    tree.remove(&8).unwrap();
    tree.validate().unwrap();

    assert_eq!(collect_keys(&tree), vec![1, 2, 3, 4, 9, 10]);
    assert_eq!(tree.iter().unwrap().count(), 6);
    for key in 5..=8 {
        assert!(tree.get(&key).unwrap().is_empty());
    }
    for key in [1, 2, 3, 4, 9, 10] {
        assert_eq!(tree.get(&key).unwrap(), vec![value_of(key)]);
    }
}

#[test]
fn test_remove_everything_then_reuse() {
    let (_dir, _bpm, tree) = setup_tree(32, 4, 3);

    for key in 1..=20 {
        assert!(tree.insert(key, value_of(key)).unwrap());
    }
    for key in 1..=20 {
        tree.remove(&key).unwrap();
        tree.validate().unwrap();
    }
    assert!(tree.is_empty().unwrap());
    assert_eq!(tree.height().unwrap(), 0);
    assert_eq!(tree.iter().unwrap().count(), 0);

    assert!(tree.insert(99, value_of(99)).unwrap());
    assert_eq!(tree.get(&99).unwrap(), vec![value_of(99)]);
    tree.validate().unwrap();
}

#[test]
fn test_descending_inserts_stay_sorted() {
    let (_dir, _bpm, tree) = setup_tree(64, 4, 3);

    for key in (1..=30).rev() {
        assert!(tree.insert(key, value_of(key)).unwrap());
    }
    assert_eq!(collect_keys(&tree), (1..=30).collect::<Vec<_>>());
    tree.validate().unwrap();
}

#[test]
fn test_iter_from_positions_at_first_key_not_below() {
    let (_dir, _bpm, tree) = setup_tree(64, 4, 3);
    for key in (2..=40).step_by(2) {
        assert!(tree.insert(key, value_of(key)).unwrap());
    }

    let from_present: Vec<i64> = tree
        .iter_from(&8)
        .unwrap()
        .map(|pair| pair.unwrap().0)
        .collect();
    assert_eq!(from_present, (8..=40).step_by(2).collect::<Vec<_>>());

    let from_absent: Vec<i64> = tree
        .iter_from(&7)
        .unwrap()
        .map(|pair| pair.unwrap().0)
        .collect();
    assert_eq!(from_absent, (8..=40).step_by(2).collect::<Vec<_>>());

    assert_eq!(tree.iter_from(&41).unwrap().count(), 0);
}

/// Random workload over a pool small enough to keep pages cycling through
/// eviction while the tree is used.
#[test]
fn test_randomized_workload_with_eviction() {
    let (_dir, _bpm, tree) = setup_tree(16, 4, 3);

    let mut keys: Vec<i64> = (0..300).collect();
    let mut rng = rand::thread_rng();
    keys.shuffle(&mut rng);

    for &key in &keys {
        assert!(tree.insert(key, value_of(key)).unwrap());
    }
    tree.validate().unwrap();
    for &key in &keys {
        assert_eq!(tree.get(&key).unwrap(), vec![value_of(key)]);
    }

    let (gone, kept) = keys.split_at(150);
    for &key in gone {
        tree.remove(&key).unwrap();
    }
    tree.validate().unwrap();

    for &key in gone {
        assert!(tree.get(&key).unwrap().is_empty());
    }
    let mut expected: Vec<i64> = kept.to_vec();
    expected.sort_unstable();
    assert_eq!(collect_keys(&tree), expected);
}

#[test]
fn test_values_are_not_confused_between_keys() {
    let (_dir, _bpm, tree) = setup_tree(32, 4, 3);
    for key in 0..100 {
        assert!(tree.insert(key, (key as u64) << 32 | 0xF00D).unwrap());
    }
    for key in 0..100 {
        assert_eq!(tree.get(&key).unwrap(), vec![(key as u64) << 32 | 0xF00D]);
    }
}
