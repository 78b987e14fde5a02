//! Cross-module scenarios that exercise `StorageDictionary` end to end,
//! through the crate's public API only.

use std::cmp::Ordering;
use std::io::Cursor;

use pagestore::progress::CancellationToken;
use pagestore::serializer::{I64Serializer, U64Serializer};
use pagestore::storage::streaming::StreamingPageStorage;
use pagestore::{InsertOutcome, PageStorage, StorageDictionary};

type Dict = StorageDictionary<
    StreamingPageStorage<Cursor<Vec<u8>>>,
    i64,
    u64,
    I64Serializer,
    U64Serializer,
    fn(&i64, &i64) -> Ordering,
>;

fn new_dict(page_size: u64, aux_data_size: usize) -> Dict {
    let none = CancellationToken::none();
    let storage =
        StreamingPageStorage::create(Cursor::new(Vec::new()), page_size, 1, None, &none, false, 4)
            .unwrap();
    StorageDictionary::create(
        storage,
        I64Serializer,
        U64Serializer,
        (|a: &i64, b: &i64| a.cmp(b)) as fn(&i64, &i64) -> Ordering,
        pagestore::btree::DEFAULT_MAX_MOVE_PAIR_COUNT,
        aux_data_size,
    )
    .unwrap()
}

/// P5: Count tracks live keys exactly; ascending traversal is strictly
/// increasing; a read-only reopen validates.
#[test]
fn count_tracks_live_keys_and_validate_succeeds_after_reopen() {
    let none = CancellationToken::none();
    let mut dict = new_dict(128, 0);
    for k in (0..300i64).rev() {
        dict.insert(k, k as u64 * 2, false).unwrap();
    }
    assert_eq!(dict.count(), 300);

    for k in (0..300i64).step_by(3) {
        assert!(dict.remove(&k).unwrap());
    }
    assert_eq!(dict.count(), 200);

    let pairs: Vec<(i64, u64)> = dict
        .traverse(true, CancellationToken::none())
        .collect::<pagestore::Result<_>>()
        .unwrap();
    assert_eq!(pairs.len(), 200);
    for w in pairs.windows(2) {
        assert!(w[0].0 < w[1].0);
    }
    for (k, v) in &pairs {
        assert_eq!(*v, *k as u64 * 2);
    }

    let handle_page = dict.handle_page();
    let medium = dict.into_tree().into_storage().into_inner();
    let storage = StreamingPageStorage::load(medium, true, true, false).unwrap();
    let mut reopened = StorageDictionary::load(
        storage,
        handle_page,
        I64Serializer,
        U64Serializer,
        (|a: &i64, b: &i64| a.cmp(b)) as fn(&i64, &i64) -> Ordering,
        pagestore::btree::DEFAULT_MAX_MOVE_PAIR_COUNT,
        0,
    )
    .unwrap();
    assert_eq!(reopened.count(), 200);
    assert!(reopened.validate(None, &none).unwrap());
}

/// P6: insert is idempotent under `update_if_exists=false`, and replaces
/// the value in place (without changing count) under `true`.
#[test]
fn insert_idempotence_and_update_semantics() {
    let mut dict = new_dict(128, 0);
    for k in 0..20i64 {
        dict.insert(k, k as u64, false).unwrap();
    }
    assert_eq!(dict.count(), 20);

    let outcome = dict.insert(5, 999, false).unwrap();
    assert_eq!(outcome, InsertOutcome::AlreadyExists);
    assert_eq!(dict.count(), 20);
    assert_eq!(
        dict.try_get_value(&5, &CancellationToken::none()).unwrap(),
        Some(5)
    );

    let outcome = dict.insert(5, 999, true).unwrap();
    assert_eq!(outcome, InsertOutcome::Updated);
    assert_eq!(dict.count(), 20);
    assert_eq!(
        dict.try_get_value(&5, &CancellationToken::none()).unwrap(),
        Some(999)
    );
}

/// P7: removing a key that was never present returns false and leaves
/// the dictionary's observable state untouched.
#[test]
fn remove_of_nonexistent_key_is_a_no_op() {
    let mut dict = new_dict(128, 0);
    for k in 0..10i64 {
        dict.insert(k, k as u64, false).unwrap();
    }
    let before: Vec<(i64, u64)> = dict
        .traverse(true, CancellationToken::none())
        .collect::<pagestore::Result<_>>()
        .unwrap();

    assert!(!dict.remove(&999).unwrap());
    assert_eq!(dict.count(), 10);

    let after: Vec<(i64, u64)> = dict
        .traverse(true, CancellationToken::none())
        .collect::<pagestore::Result<_>>()
        .unwrap();
    assert_eq!(before, after);
}

/// Run through `StorageDictionary` rather than the bare `BTree`: insert
/// 0..1024 ascending, then remove in the same order.
/// Allocated pages strictly decrease back to the handle page alone, and a
/// read-only reopen validates.
#[test]
fn scenario_insert_then_remove_1024_keys_shrinks_to_handle_page_only() {
    let none = CancellationToken::none();
    let mut dict = new_dict(128, 0);
    for k in 0..1024i64 {
        dict.insert(k, k as u64, false).unwrap();
    }
    assert_eq!(dict.count(), 1024);
    let peak = dict.storage().allocated_page_count();
    assert!(peak > 1);

    for k in 0..1024i64 {
        assert!(dict.remove(&k).unwrap());
    }
    assert_eq!(dict.count(), 0);
    assert_eq!(dict.storage().allocated_page_count(), 1); // the handle page

    let handle_page = dict.handle_page();
    let medium = dict.into_tree().into_storage().into_inner();
    let storage = StreamingPageStorage::load(medium, true, true, false).unwrap();
    let mut reopened = StorageDictionary::load(
        storage,
        handle_page,
        I64Serializer,
        U64Serializer,
        (|a: &i64, b: &i64| a.cmp(b)) as fn(&i64, &i64) -> Ordering,
        pagestore::btree::DEFAULT_MAX_MOVE_PAIR_COUNT,
        0,
    )
    .unwrap();
    assert!(reopened.validate(None, &none).unwrap());
}

/// Descending traversal and random-order insertion both still validate and
/// agree with each other on the surviving key set.
#[test]
fn random_order_insertion_validates_and_both_traversal_directions_agree() {
    let none = CancellationToken::none();
    let mut dict = new_dict(256, 0);
    let mut order: Vec<i64> = (0..500).collect();
    // deterministic shuffle: a fixed multiplicative permutation mod 500
    order.sort_by_key(|&k| (k * 37 + 11) % 500);
    for &k in &order {
        dict.insert(k, k as u64, false).unwrap();
    }

    let ascending: Vec<i64> = dict
        .traverse(true, CancellationToken::none())
        .map(|r| r.unwrap().0)
        .collect();
    let mut descending: Vec<i64> = dict
        .traverse(false, CancellationToken::none())
        .map(|r| r.unwrap().0)
        .collect();
    descending.reverse();
    assert_eq!(ascending, descending);
    assert_eq!(ascending, (0..500).collect::<Vec<_>>());

    let handle_page = dict.handle_page();
    let medium = dict.into_tree().into_storage().into_inner();
    let storage = StreamingPageStorage::load(medium, true, true, false).unwrap();
    let mut reopened = StorageDictionary::load(
        storage,
        handle_page,
        I64Serializer,
        U64Serializer,
        (|a: &i64, b: &i64| a.cmp(b)) as fn(&i64, &i64) -> Ordering,
        pagestore::btree::DEFAULT_MAX_MOVE_PAIR_COUNT,
        0,
    )
    .unwrap();
    assert!(reopened.validate(None, &none).unwrap());
}
