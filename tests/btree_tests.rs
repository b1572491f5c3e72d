use std::collections::BTreeMap;
use std::sync::Arc;

use corvusdb::config::BufferPoolConfig;
use corvusdb::index::default_comparator;
use corvusdb::{
    BPlusTree, BufferPoolManager, DiskScheduler, FileDiskManager, MemoryDiskManager, RecordId,
};
use tempfile::TempDir;

fn setup_tree<const TOMBS: usize>(
    pool_pages: usize,
    leaf_max_size: u32,
    internal_max_size: u32,
) -> BPlusTree<i64, RecordId, TOMBS> {
    let disk_manager = Arc::new(MemoryDiskManager::new());
    let disk_scheduler = Arc::new(DiskScheduler::new(disk_manager));
    let buffer_pool = Arc::new(BufferPoolManager::new(pool_pages, disk_scheduler));
    let header_page_id = buffer_pool.new_page().unwrap();
    BPlusTree::new(
        "test_index",
        header_page_id,
        buffer_pool,
        default_comparator,
        leaf_max_size,
        internal_max_size,
    )
    .unwrap()
}

fn rid(key: i64) -> RecordId {
    RecordId::new((key >> 32) as u32, (key & 0xFFFF_FFFF) as u32)
}

fn scan_keys<const TOMBS: usize>(tree: &BPlusTree<i64, RecordId, TOMBS>) -> Vec<i64> {
    tree.begin()
        .unwrap()
        .collect_remaining()
        .unwrap()
        .into_iter()
        .map(|(key, _)| key)
        .collect()
}

#[test]
fn basic_insert_and_get() {
    let tree = setup_tree::<0>(50, 3, 2);

    assert!(tree.is_empty().unwrap());
    assert!(tree.insert(&42, RecordId::new(0, 42)).unwrap());
    assert!(!tree.is_empty().unwrap());

    let mut result = vec![];
    assert!(tree.get_value(&42, &mut result).unwrap());
    assert_eq!(result, vec![RecordId::new(0, 42)]);

    let entries = tree.begin().unwrap().collect_remaining().unwrap();
    assert_eq!(entries, vec![(42, RecordId::new(0, 42))]);
}

#[test]
fn duplicate_insert_is_rejected_without_side_effects() {
    let tree = setup_tree::<0>(50, 3, 2);
    assert!(tree.insert(&7, RecordId::new(0, 7)).unwrap());
    assert!(!tree.insert(&7, RecordId::new(0, 99)).unwrap());

    let mut result = vec![];
    assert!(tree.get_value(&7, &mut result).unwrap());
    assert_eq!(result, vec![RecordId::new(0, 7)]);
}

#[test]
fn remove_is_a_no_op_for_absent_keys() {
    let tree = setup_tree::<0>(50, 3, 2);
    tree.remove(&5).unwrap();
    assert!(tree.insert(&5, rid(5)).unwrap());
    tree.remove(&5).unwrap();

    let mut result = vec![];
    assert!(!tree.get_value(&5, &mut result).unwrap());
    assert!(result.is_empty());

    // removing twice changes nothing
    tree.remove(&5).unwrap();
    assert!(tree.is_empty().unwrap());
}

#[test]
fn ordered_scan_after_mixed_insertions() {
    let tree = setup_tree::<0>(50, 3, 2);
    for key in [5i64, 4, 3, 2, 1] {
        assert!(tree.insert(&key, rid(key)).unwrap());
    }

    assert_eq!(scan_keys(&tree), vec![1, 2, 3, 4, 5]);

    let seek: Vec<i64> = tree
        .begin_at(&3)
        .unwrap()
        .collect_remaining()
        .unwrap()
        .into_iter()
        .map(|(key, _)| key)
        .collect();
    assert_eq!(seek, vec![3, 4, 5]);

    // seeking past the largest key lands on the end sentinel
    assert!(tree.begin_at(&9).unwrap().is_end());
}

#[test]
fn tombstones_hide_deleted_keys_from_readers() {
    let tree = setup_tree::<2>(100, 4, 4);
    for key in 0i64..17 {
        assert!(tree.insert(&key, rid(key)).unwrap());
    }
    for key in [1i64, 5, 9] {
        tree.remove(&key).unwrap();
    }

    let mut expected: Vec<i64> = (0..17).collect();
    expected.retain(|k| ![1, 5, 9].contains(k));
    assert_eq!(scan_keys(&tree), expected);

    for key in [1i64, 5, 9] {
        let mut result = vec![];
        assert!(!tree.get_value(&key, &mut result).unwrap());
    }

    // The deletes were buffered, not applied: in leaf order the tombstone
    // arrays spell out exactly the deleted keys, oldest first.
    let tombstones: Vec<i64> = tree
        .leaf_pages()
        .unwrap()
        .iter()
        .flat_map(|leaf| leaf.get_tombstones())
        .collect();
    assert_eq!(tombstones, vec![1, 5, 9]);
}

#[test]
fn reinserting_a_tombstoned_key_revives_the_slot() {
    let tree = setup_tree::<2>(100, 4, 4);
    for key in 0i64..17 {
        assert!(tree.insert(&key, rid(key)).unwrap());
    }
    for key in [1i64, 5, 9] {
        tree.remove(&key).unwrap();
    }
    for key in [1i64, 5, 9] {
        assert!(tree.insert(&key, RecordId::new(7, (2 * key) as u32)).unwrap());
    }

    for leaf in tree.leaf_pages().unwrap() {
        assert!(leaf.get_tombstones().is_empty());
    }
    for key in [1i64, 5, 9] {
        let mut result = vec![];
        assert!(tree.get_value(&key, &mut result).unwrap());
        assert_eq!(result, vec![RecordId::new(7, (2 * key) as u32)]);
    }
}

#[test]
fn full_tombstone_buffer_applies_the_oldest_delete() {
    let tree = setup_tree::<3>(100, 5, 4);
    for key in 0i64..6 {
        assert!(tree.insert(&key, rid(key)).unwrap());
    }
    // leaves are now [0, 1] and [2, 3, 4, 5]

    tree.remove(&2).unwrap(); // first key of the right leaf
    tree.remove(&4).unwrap(); // its middle key
    tree.remove(&3).unwrap(); // its first remaining live key
    {
        let leaves = tree.leaf_pages().unwrap();
        assert_eq!(leaves[1].get_tombstones(), vec![2, 4, 3]);
        assert_eq!(leaves[1].header.current_size, 4);
    }

    // Fourth delete to the same leaf: the buffer is full, so the oldest
    // tombstone (key 2, slot 0) is applied physically and the survivors'
    // indexes shift down.
    tree.remove(&5).unwrap();
    let leaves = tree.leaf_pages().unwrap();
    let keys: Vec<i64> = leaves[1].array.iter().map(|(k, _)| *k).collect();
    assert_eq!(keys, vec![3, 4, 5]);
    assert_eq!(leaves[1].get_tombstones(), vec![4, 3, 5]);
    assert_eq!(leaves[1].tombstones, vec![1, 0, 2]);

    // Only the first leaf still answers queries.
    assert_eq!(scan_keys(&tree), vec![0, 1]);

    // The separator was repaired to the leaf's new first key, so a fresh
    // insert of 2 routes into the left leaf.
    assert!(tree.insert(&2, rid(2)).unwrap());
    assert_eq!(scan_keys(&tree), vec![0, 1, 2]);
    assert_eq!(tree.leaf_pages().unwrap()[0].header.current_size, 3);
}

#[test]
fn live_deficit_borrows_from_the_right_sibling() {
    let tree = setup_tree::<1>(100, 4, 4);
    for key in 0i64..5 {
        assert!(tree.insert(&key, rid(key)).unwrap());
    }
    // leaves: [0, 1] (at min size) and [2, 3, 4]

    tree.remove(&0).unwrap();

    let leaves = tree.leaf_pages().unwrap();
    assert_eq!(leaves.len(), 2);

    // The borrower kept its tombstone (the deleted 0) and pulled 2 over.
    let borrower_keys: Vec<i64> = leaves[0].array.iter().map(|(k, _)| *k).collect();
    assert_eq!(borrower_keys, vec![0, 1, 2]);
    assert_eq!(leaves[0].get_tombstones(), vec![0]);

    let donor_keys: Vec<i64> = leaves[1].array.iter().map(|(k, _)| *k).collect();
    assert_eq!(donor_keys, vec![3, 4]);
    assert!(leaves[1].get_tombstones().is_empty());

    assert_eq!(scan_keys(&tree), vec![1, 2, 3, 4]);

    // The separator now names the donor's new first key: lookups on both
    // sides of the old boundary still land correctly.
    let mut result = vec![];
    assert!(tree.get_value(&2, &mut result).unwrap());
    assert!(tree.get_value(&3, &mut result).unwrap());
    assert!(tree.insert(&0, RecordId::new(9, 0)).unwrap());
    result.clear();
    assert!(tree.get_value(&0, &mut result).unwrap());
    assert_eq!(result, vec![RecordId::new(9, 0)]);
}

#[test]
fn delete_everything_keeps_the_iterator_valid() {
    const NUM_KEYS: i64 = 17;
    const LEAF_MAX: i64 = 4;
    let tree = setup_tree::<2>(100, LEAF_MAX as u32, 4);
    for key in 0..NUM_KEYS {
        assert!(tree.insert(&key, rid(key)).unwrap());
    }
    for key in 0..NUM_KEYS {
        tree.remove(&key).unwrap();
    }

    assert!(tree.begin().unwrap().is_end());
    for key in 0..NUM_KEYS {
        let mut result = vec![];
        assert!(!tree.get_value(&key, &mut result).unwrap());
    }

    // Deletion was lazy: the leaves still hold most keys as tombstones,
    // compacting only when a full buffer forced it.
    let total_tombstones: usize = tree
        .leaf_pages()
        .unwrap()
        .iter()
        .map(|leaf| leaf.tombstones.len())
        .sum();
    assert!(total_tombstones as i64 > ((NUM_KEYS - 1) / LEAF_MAX) * 2);
    assert!((total_tombstones as i64) < NUM_KEYS);
}

#[test]
fn physical_deletes_merge_down_to_an_empty_tree() {
    let tree = setup_tree::<0>(200, 4, 4);
    for key in 0i64..40 {
        assert!(tree.insert(&key, rid(key)).unwrap());
    }
    assert_eq!(scan_keys(&tree), (0..40).collect::<Vec<_>>());

    for key in 0i64..40 {
        tree.remove(&key).unwrap();
        let mut result = vec![];
        assert!(!tree.get_value(&key, &mut result).unwrap());
    }

    assert!(tree.is_empty().unwrap());
    assert!(tree.begin().unwrap().is_end());

    // The tree still works after being emptied.
    for key in [3i64, 1, 2] {
        assert!(tree.insert(&key, rid(key)).unwrap());
    }
    assert_eq!(scan_keys(&tree), vec![1, 2, 3]);
}

#[test]
fn descending_inserts_repair_separators_all_the_way_up() {
    let tree = setup_tree::<0>(200, 4, 4);
    for key in (0i64..300).rev() {
        assert!(tree.insert(&key, rid(key)).unwrap());
    }
    assert_eq!(scan_keys(&tree), (0..300).collect::<Vec<_>>());
    for key in (0i64..300).step_by(37) {
        let mut result = vec![];
        assert!(tree.get_value(&key, &mut result).unwrap());
        assert_eq!(result, vec![rid(key)]);
    }
}

#[test]
fn small_pool_forces_tree_pages_through_eviction() {
    // 8 frames for a tree that needs far more pages: node pages constantly
    // round-trip through the disk scheduler.
    let tree = setup_tree::<0>(8, 4, 4);
    for key in 0i64..120 {
        assert!(tree.insert(&key, rid(key)).unwrap());
    }
    assert_eq!(scan_keys(&tree), (0..120).collect::<Vec<_>>());
    for key in 0i64..120 {
        let mut result = vec![];
        assert!(tree.get_value(&key, &mut result).unwrap());
    }
}

fn oracle_workload<const TOMBS: usize>(seed: u64) {
    use rand::{Rng, SeedableRng};

    let tree = setup_tree::<TOMBS>(100, 4, 4);
    let mut oracle: BTreeMap<i64, RecordId> = BTreeMap::new();
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);

    for _ in 0..600 {
        let key = rng.gen_range(0i64..64);
        if rng.gen_bool(0.6) {
            let value = rid(key);
            let inserted = tree.insert(&key, value).unwrap();
            assert_eq!(inserted, !oracle.contains_key(&key));
            oracle.entry(key).or_insert(value);
        } else {
            tree.remove(&key).unwrap();
            oracle.remove(&key);
        }
    }

    let scanned: Vec<(i64, RecordId)> = tree.begin().unwrap().collect_remaining().unwrap();
    let expected: Vec<(i64, RecordId)> = oracle.iter().map(|(k, v)| (*k, *v)).collect();
    assert_eq!(scanned, expected);

    for key in 0i64..64 {
        let mut result = vec![];
        let found = tree.get_value(&key, &mut result).unwrap();
        assert_eq!(found, oracle.contains_key(&key), "key {}", key);
    }
}

#[test]
fn interleaved_inserts_and_removes_match_an_oracle() {
    oracle_workload::<0>(42);
}

#[test]
fn interleaved_inserts_and_removes_match_an_oracle_with_tombstones() {
    oracle_workload::<2>(1337);
}

#[test]
fn odd_max_size_maintains_ceiling_minimum_on_deletes() {
    // leaf_max_size = 5 puts the minimum fill at 3; a leaf dropping to two
    // physical slots must merge or borrow.
    let tree = setup_tree::<0>(100, 5, 4);
    for key in 0i64..7 {
        assert!(tree.insert(&key, rid(key)).unwrap());
    }
    // leaves: [0, 1], [2, 3], [4, 5, 6]
    assert_eq!(tree.leaf_pages().unwrap()[0].min_size(), 3);

    // [4, 5, 6] shrinks to two slots: below the ceiling minimum, so it is
    // absorbed by its left sibling (a floor minimum of 2 would have let it
    // sit there).
    tree.remove(&4).unwrap();
    {
        let leaves = tree.leaf_pages().unwrap();
        assert_eq!(leaves.len(), 2);
        let sizes: Vec<usize> = leaves.iter().map(|leaf| leaf.array.len()).collect();
        assert_eq!(sizes, vec![2, 4]);
    }
    assert_eq!(scan_keys(&tree), vec![0, 1, 2, 3, 5, 6]);

    // Rebuild a [2, 3] / [5, 6, 7, 8] pair, then underflow the middle leaf;
    // no sibling can spare entries, so it merges left.
    assert!(tree.insert(&7, rid(7)).unwrap());
    assert!(tree.insert(&8, rid(8)).unwrap());
    tree.remove(&2).unwrap();
    {
        let leaves = tree.leaf_pages().unwrap();
        assert_eq!(leaves.len(), 2);
        let keys: Vec<i64> = leaves[0].array.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec![0, 1, 3]);
    }

    // [0, 1, 3] sits exactly at the minimum; one more delete forces a
    // borrow from the four-slot right sibling, leaving both leaves at the
    // ceiling minimum.
    tree.remove(&1).unwrap();
    let leaves = tree.leaf_pages().unwrap();
    assert_eq!(leaves.len(), 2);
    let left_keys: Vec<i64> = leaves[0].array.iter().map(|(k, _)| *k).collect();
    let right_keys: Vec<i64> = leaves[1].array.iter().map(|(k, _)| *k).collect();
    assert_eq!(left_keys, vec![0, 3, 5]);
    assert_eq!(right_keys, vec![6, 7, 8]);
    for leaf in &leaves {
        assert!(leaf.array.len() as u32 >= leaf.min_size());
    }
    assert_eq!(scan_keys(&tree), vec![0, 3, 5, 6, 7, 8]);
}

#[test]
fn concurrent_writers_build_a_consistent_tree() {
    const THREADS: i64 = 4;
    const KEYS: i64 = 400;
    let tree = Arc::new(setup_tree::<0>(128, 4, 4));

    // Interleaved stripes: every thread keeps splitting the same leaves and
    // ancestors as the others.
    let mut handles = vec![];
    for stripe in 0..THREADS {
        let tree = Arc::clone(&tree);
        handles.push(std::thread::spawn(move || {
            let mut key = stripe;
            while key < KEYS {
                assert!(tree.insert(&key, rid(key)).unwrap());
                key += THREADS;
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(scan_keys(&tree), (0..KEYS).collect::<Vec<_>>());
    for key in (0..KEYS).step_by(29) {
        let mut result = vec![];
        assert!(tree.get_value(&key, &mut result).unwrap());
        assert_eq!(result, vec![rid(key)]);
    }

    // Concurrent removers drain the upper half, striped the same way.
    let mut handles = vec![];
    for stripe in 0..THREADS {
        let tree = Arc::clone(&tree);
        handles.push(std::thread::spawn(move || {
            let mut key = KEYS / 2 + stripe;
            while key < KEYS {
                tree.remove(&key).unwrap();
                key += THREADS;
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(scan_keys(&tree), (0..KEYS / 2).collect::<Vec<_>>());
    let mut result = vec![];
    assert!(!tree.get_value(&(KEYS / 2), &mut result).unwrap());
    assert!(tree.get_value(&0, &mut result).unwrap());
}

#[test]
fn readers_run_alongside_a_writer() {
    const STABLE: i64 = 100;
    let tree = Arc::new(setup_tree::<0>(256, 4, 4));
    for key in 0..STABLE {
        assert!(tree.insert(&key, rid(key)).unwrap());
    }

    let writer = {
        let tree = Arc::clone(&tree);
        std::thread::spawn(move || {
            for key in 1000i64..1400 {
                assert!(tree.insert(&key, rid(key)).unwrap());
            }
        })
    };

    let mut readers = vec![];
    for _ in 0..3 {
        let tree = Arc::clone(&tree);
        readers.push(std::thread::spawn(move || {
            for _ in 0..40 {
                // Keys inserted before the writer started must stay visible
                // throughout the writer's splits.
                for key in (0..STABLE).step_by(7) {
                    let mut result = vec![];
                    assert!(tree.get_value(&key, &mut result).unwrap());
                    assert_eq!(result, vec![rid(key)]);
                }
                let keys: Vec<i64> = tree
                    .begin()
                    .unwrap()
                    .collect_remaining()
                    .unwrap()
                    .into_iter()
                    .map(|(key, _)| key)
                    .collect();
                assert!(keys.windows(2).all(|pair| pair[0] < pair[1]));
                for key in 0..STABLE {
                    assert!(keys.binary_search(&key).is_ok());
                }
            }
        }));
    }

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }

    let mut expected: Vec<i64> = (0..STABLE).collect();
    expected.extend(1000..1400);
    assert_eq!(scan_keys(&tree), expected);
}

#[test]
fn deleting_a_middle_range_merges_interior_leaves() {
    let tree = setup_tree::<0>(200, 4, 4);
    for key in 0i64..60 {
        assert!(tree.insert(&key, rid(key)).unwrap());
    }
    for key in 20i64..40 {
        tree.remove(&key).unwrap();
    }

    let mut expected: Vec<i64> = (0..20).collect();
    expected.extend(40..60);
    assert_eq!(scan_keys(&tree), expected);

    for key in 20i64..40 {
        let mut result = vec![];
        assert!(!tree.get_value(&key, &mut result).unwrap());
    }
    for key in [0i64, 19, 40, 59] {
        let mut result = vec![];
        assert!(tree.get_value(&key, &mut result).unwrap());
    }

    // The vacated range is usable again.
    for key in 20i64..40 {
        assert!(tree.insert(&key, rid(key)).unwrap());
    }
    assert_eq!(scan_keys(&tree), (0..60).collect::<Vec<_>>());
}

#[test]
fn tree_survives_a_pool_restart() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("index.db");

    let header_page_id = {
        let disk_manager = Arc::new(FileDiskManager::try_new(&db_path).unwrap());
        let disk_scheduler = Arc::new(DiskScheduler::new(disk_manager));
        let buffer_pool = Arc::new(BufferPoolManager::new(16, disk_scheduler));
        let header_page_id = buffer_pool.new_page().unwrap();
        let tree: BPlusTree<i64, RecordId, 0> = BPlusTree::new(
            "restart_index",
            header_page_id,
            buffer_pool.clone(),
            default_comparator,
            4,
            4,
        )
        .unwrap();
        for key in 0i64..50 {
            assert!(tree.insert(&key, rid(key)).unwrap());
        }
        buffer_pool.flush_all_pages().unwrap();
        header_page_id
    };

    let disk_manager = Arc::new(FileDiskManager::try_new(&db_path).unwrap());
    let disk_scheduler = Arc::new(DiskScheduler::new(disk_manager));
    let buffer_pool = Arc::new(BufferPoolManager::new_with_config(
        BufferPoolConfig {
            buffer_pool_size: 16,
            first_page_id: 1000,
        },
        disk_scheduler,
    ));
    let tree: BPlusTree<i64, RecordId, 0> = BPlusTree::open(
        "restart_index",
        header_page_id,
        buffer_pool,
        default_comparator,
        4,
        4,
    );

    assert_eq!(scan_keys(&tree), (0..50).collect::<Vec<_>>());
    for key in 0i64..50 {
        let mut result = vec![];
        assert!(tree.get_value(&key, &mut result).unwrap());
        assert_eq!(result, vec![rid(key)]);
    }
    assert!(tree.insert(&50, rid(50)).unwrap());
    tree.remove(&0).unwrap();
    assert_eq!(scan_keys(&tree), (1..51).collect::<Vec<_>>());
}

#[test]
fn concurrent_readers_share_the_tree() {
    let tree = Arc::new(setup_tree::<0>(100, 4, 4));
    for key in 0i64..100 {
        assert!(tree.insert(&key, rid(key)).unwrap());
    }

    let mut handles = vec![];
    for t in 0..4i64 {
        let tree = Arc::clone(&tree);
        handles.push(std::thread::spawn(move || {
            for key in 0..100 {
                let mut result = vec![];
                assert!(tree.get_value(&key, &mut result).unwrap());
                assert_eq!(result, vec![rid(key)]);
            }
            let keys: Vec<i64> = tree
                .begin_at(&t)
                .unwrap()
                .collect_remaining()
                .unwrap()
                .into_iter()
                .map(|(key, _)| key)
                .collect();
            assert_eq!(keys, (t..100).collect::<Vec<_>>());
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
}
