//! Secondary indexes stay in step with their primary.
//!
//! Every primary write is mirrored into each open index within the same
//! locker, so an abort rolls the index back with the primary and readers
//! resolve index entries to the current primary record.

#![allow(missing_docs)]

mod common;

use std::collections::BTreeSet;

use cairn::{
    CairnError, CursorConfig, Database, DatabaseConfig, Environment, KeyCreator, LockMode, Lookup,
    OperationStatus, Result, SecondaryConfig, SecondaryDatabase, TransactionConfig,
};
use common::{
    dump, env, env_with, every_byte_key, first_byte_key, index_entries, plain_db, small_bins, txn_db,
};
use proptest::prelude::*;

fn txn_index(env: &Environment, primary: &Database, name: &str, creator: KeyCreator) -> SecondaryDatabase {
    let config = SecondaryConfig {
        database: DatabaseConfig::create()
            .with_duplicates(true)
            .with_transactional(true),
        ..SecondaryConfig::new(creator)
    };
    env.open_secondary_database(name, primary, config)
        .expect("open secondary")
}

/// Index entries `(secondary key, primary key)` a primary dump should
/// produce under `creator`.
fn expected_entries(primary: &Database, creator: &dyn Fn(&[u8]) -> Vec<Vec<u8>>) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut entries = BTreeSet::new();
    for (key, data) in dump(primary)? {
        for secondary_key in creator(&data) {
            entries.insert((secondary_key, key.clone()));
        }
    }
    Ok(entries.into_iter().collect())
}

#[test]
fn secondary_reads_resolve_the_primary_record() -> Result<()> {
    let env = env();
    let primary = txn_db(&env, "people", false);
    let index = txn_index(&env, &primary, "people_by_initial", first_byte_key());

    primary.put(None, b"1", b"alice")?;
    primary.put(None, b"2", b"anna")?;
    primary.put(None, b"3", b"bob")?;

    let hit = index.get(None, b"a", LockMode::Default)?.found().unwrap();
    assert_eq!((hit.key.as_slice(), hit.primary_key.as_slice(), hit.data.as_slice()), (&b"a"[..], &b"1"[..], &b"alice"[..]));
    assert_eq!(index.get(None, b"z", LockMode::Default)?, Lookup::NotFound);

    let txn = env.begin_transaction(TransactionConfig::default())?;
    let mut cursor = index.open_cursor(Some(&txn), CursorConfig::default())?;
    assert_eq!(cursor.get_search_key(b"a", LockMode::Default)?.found().unwrap().data, b"alice");
    assert_eq!(cursor.count()?, 2);
    assert_eq!(cursor.get_next_dup(LockMode::Default)?.found().unwrap().data, b"anna");
    assert_eq!(cursor.get_next_dup(LockMode::Default)?, Lookup::NotFound);
    assert_eq!(cursor.get_next(LockMode::Default)?.found().unwrap().primary_key, b"3");

    let both = cursor.get_search_both(b"a", b"2", LockMode::Default)?.found().unwrap();
    assert_eq!(both.data, b"anna");
    assert_eq!(cursor.get_search_both(b"b", b"1", LockMode::Default)?, Lookup::NotFound);
    cursor.close()?;
    txn.commit()
}

#[test]
fn updates_move_entries_between_keys() -> Result<()> {
    let env = env();
    let primary = txn_db(&env, "tags", false);
    let index = txn_index(&env, &primary, "tags_by_letter", every_byte_key());

    primary.put(None, b"p1", b"abc")?;
    primary.put(None, b"p1", b"bcd")?;
    let entries = index_entries(&index)?;
    assert_eq!(
        entries,
        vec![
            (b"b".to_vec(), b"p1".to_vec()),
            (b"c".to_vec(), b"p1".to_vec()),
            (b"d".to_vec(), b"p1".to_vec()),
        ]
    );

    // Repeated bytes collapse to one entry per key.
    primary.put(None, b"p2", b"dd")?;
    assert_eq!(index.count()?, 4);

    primary.delete(None, b"p1")?;
    assert_eq!(index_entries(&index)?, vec![(b"d".to_vec(), b"p2".to_vec())]);
    Ok(())
}

#[test]
fn records_without_a_secondary_key_are_not_indexed() -> Result<()> {
    let env = env();
    let primary = txn_db(&env, "sparse", false);
    let index = txn_index(&env, &primary, "sparse_by_initial", first_byte_key());

    primary.put(None, b"empty", b"")?;
    primary.put(None, b"full", b"x")?;
    assert_eq!(index.count()?, 1);
    primary.put(None, b"full", b"")?;
    assert_eq!(index.count()?, 0);
    Ok(())
}

#[test]
fn abort_rolls_back_index_entries() -> Result<()> {
    let env = env();
    let primary = txn_db(&env, "orders", false);
    let index = txn_index(&env, &primary, "orders_by_status", first_byte_key());
    primary.put(None, b"o1", b"open")?;

    let txn = env.begin_transaction(TransactionConfig::default())?;
    primary.put(Some(&txn), b"o1", b"shipped")?;
    primary.put(Some(&txn), b"o2", b"open")?;
    assert_eq!(index.count()?, 2);
    txn.abort()?;

    assert_eq!(index_entries(&index)?, vec![(b"o".to_vec(), b"o1".to_vec())]);
    assert_eq!(primary.get(None, b"o2", LockMode::Default)?, Lookup::NotFound);
    Ok(())
}

#[test]
fn deleting_through_the_index_removes_primary_records() -> Result<()> {
    let env = env();
    let primary = txn_db(&env, "files", false);
    let index = txn_index(&env, &primary, "files_by_initial", first_byte_key());
    for (k, d) in [("1", "tmp-a"), ("2", "tmp-b"), ("3", "keep")] {
        primary.put(None, k.as_bytes(), d.as_bytes())?;
    }

    assert_eq!(index.delete(None, b"t")?, OperationStatus::Success);
    assert_eq!(index.delete(None, b"t")?, OperationStatus::NotFound);
    let left: Vec<_> = dump(&primary)?.into_iter().map(|(k, _)| k).collect();
    assert_eq!(left, vec![b"3".to_vec()]);

    let txn = env.begin_transaction(TransactionConfig::default())?;
    let mut cursor = index.open_cursor(Some(&txn), CursorConfig::default())?;
    assert!(cursor.get_search_key(b"k", LockMode::Default)?.is_found());
    assert_eq!(cursor.delete()?, OperationStatus::Success);
    assert_eq!(cursor.get_current(LockMode::Default)?, Lookup::KeyEmpty);
    cursor.close()?;
    txn.commit()?;
    assert_eq!(primary.count()?, 0);
    assert_eq!(index.count()?, 0);
    Ok(())
}

#[test]
fn non_transactional_cursor_writes_maintain_the_index() -> Result<()> {
    let env = env();
    let primary = plain_db(&env, "notes", false);
    let index = env.open_secondary_database("notes_by_initial", &primary, SecondaryConfig::new(first_byte_key()))?;
    for (k, d) in [("1", "apple"), ("2", "banana"), ("3", "cherry")] {
        primary.put(None, k.as_bytes(), d.as_bytes())?;
    }

    let mut cursor = primary.open_cursor(None, CursorConfig::default())?;
    assert!(cursor.get_search_key(b"2", LockMode::Default)?.is_found());
    assert_eq!(cursor.delete()?, OperationStatus::Success);
    assert_eq!(cursor.get_current(LockMode::Default)?, Lookup::KeyEmpty);
    assert_eq!(cursor.get_next(LockMode::Default)?.found().unwrap().key, b"3");
    assert_eq!(cursor.put_current(b"avocado")?, OperationStatus::Success);
    cursor.close()?;

    assert_eq!(
        index_entries(&index)?,
        vec![(b"a".to_vec(), b"1".to_vec()), (b"a".to_vec(), b"3".to_vec())]
    );
    assert_eq!(primary.get(None, b"2", LockMode::Default)?, Lookup::NotFound);
    assert_eq!(env.lock_stats().held_locks, 0);
    Ok(())
}

#[test]
fn secondary_handles_refuse_writes() -> Result<()> {
    let env = env();
    let primary = txn_db(&env, "guarded", false);
    let index = txn_index(&env, &primary, "guarded_idx", first_byte_key());
    primary.put(None, b"k", b"value")?;

    // The index tree cannot be reached as a writable primary either.
    assert!(matches!(
        env.open_database(
            "guarded_idx",
            DatabaseConfig::create()
                .with_duplicates(true)
                .with_transactional(true)
        ),
        Err(CairnError::ConfigMismatch(_))
    ));
    let txn = env.begin_transaction(TransactionConfig::default())?;
    let mut cursor = index.open_cursor(Some(&txn), CursorConfig::default())?;
    cursor.get_first(LockMode::Default)?;
    assert!(matches!(cursor.put(b"v", b"k"), Err(CairnError::NotPermitted { .. })));
    assert!(matches!(cursor.put_current(b"k"), Err(CairnError::NotPermitted { .. })));
    assert!(matches!(
        cursor.put_no_dup_data(b"v", b"k"),
        Err(CairnError::NotPermitted { .. })
    ));
    assert!(cursor.get_current(LockMode::Default)?.is_found());
    cursor.close()?;
    txn.commit()
}

#[test]
fn read_uncommitted_sees_pending_entries_until_abort() -> Result<()> {
    let env = env();
    let primary = txn_db(&env, "dirty", false);
    let index = txn_index(&env, &primary, "dirty_idx", first_byte_key());

    let writer = env.begin_transaction(TransactionConfig::default())?;
    primary.put(Some(&writer), b"k", b"pending")?;
    let dirty = index.get(None, b"p", LockMode::ReadUncommitted)?;
    assert_eq!(dirty.found().unwrap().data, b"pending");
    writer.abort()?;

    assert_eq!(index.get(None, b"p", LockMode::ReadUncommitted)?, Lookup::NotFound);
    Ok(())
}

#[test]
fn closed_index_stops_following_the_primary() -> Result<()> {
    let env = env();
    let primary = txn_db(&env, "detached", false);
    let index = txn_index(&env, &primary, "detached_idx", first_byte_key());
    primary.put(None, b"1", b"a")?;

    index.close()?;
    assert_eq!(primary.put(None, b"2", b"b")?, OperationStatus::Success);
    assert!(matches!(
        index.get(None, b"a", LockMode::Default),
        Err(CairnError::DatabaseClosed(_))
    ));
    Ok(())
}

#[test]
fn opening_checks_the_primary() -> Result<()> {
    let env = env();
    let transactional = txn_db(&env, "txn_primary", false);
    assert!(matches!(
        env.open_secondary_database("mismatch", &transactional, SecondaryConfig::new(first_byte_key())),
        Err(CairnError::ConfigMismatch(_))
    ));

    let dups = plain_db(&env, "dup_primary", true);
    assert!(matches!(
        env.open_secondary_database("over_dups", &dups, SecondaryConfig::new(first_byte_key())),
        Err(CairnError::Config(_))
    ));
    Ok(())
}

#[test]
fn populate_indexes_existing_records() -> Result<()> {
    let env = env_with(small_bins());
    let primary = txn_db(&env, "backfill", false);
    for i in 0u8..20 {
        primary.put(None, &[i], &[b'a' + i % 3])?;
    }
    let config = SecondaryConfig {
        database: DatabaseConfig::create()
            .with_duplicates(true)
            .with_transactional(true),
        allow_populate: true,
        ..SecondaryConfig::new(first_byte_key())
    };
    let index = env.open_secondary_database("backfill_idx", &primary, config)?;
    let expected = expected_entries(&primary, &|data| data.first().map(|b| vec![vec![*b]]).unwrap_or_default())?;
    assert_eq!(index_entries(&index)?, expected);
    Ok(())
}

#[derive(Debug, Clone)]
enum Op {
    Put(u8, Vec<u8>),
    Delete(u8),
    AbortedPut(u8, Vec<u8>),
    CursorPutCurrent(u8, Vec<u8>),
    CursorDelete(u8),
    IndexDelete(u8),
    IndexCursorDelete(u8),
}

fn arb_op() -> impl Strategy<Value = Op> {
    let data = prop::collection::vec(b'a'..b'h', 0..4);
    prop_oneof![
        5 => (0u8..16, data.clone()).prop_map(|(k, d)| Op::Put(k, d)),
        2 => (0u8..16).prop_map(Op::Delete),
        1 => (0u8..16, data.clone()).prop_map(|(k, d)| Op::AbortedPut(k, d)),
        2 => (0u8..16, data).prop_map(|(k, d)| Op::CursorPutCurrent(k, d)),
        1 => (0u8..16).prop_map(Op::CursorDelete),
        1 => (b'a'..b'h').prop_map(Op::IndexDelete),
        1 => (b'a'..b'h').prop_map(Op::IndexCursorDelete),
    ]
}

/// Applies `op` through whichever public handle it names.
fn apply(env: &Environment, primary: &Database, index: &SecondaryDatabase, op: Op) -> Result<()> {
    match op {
        Op::Put(k, d) => {
            primary.put(None, &[k], &d)?;
        }
        Op::Delete(k) => {
            primary.delete(None, &[k])?;
        }
        Op::AbortedPut(k, d) => {
            let txn = env.begin_transaction(TransactionConfig::default())?;
            primary.put(Some(&txn), &[k], &d)?;
            txn.abort()?;
        }
        Op::CursorPutCurrent(k, d) => {
            let txn = env.begin_transaction(TransactionConfig::default())?;
            let mut cursor = primary.open_cursor(Some(&txn), CursorConfig::default())?;
            if cursor.get_search_key(&[k], LockMode::Default)?.is_found() {
                cursor.put_current(&d)?;
            }
            cursor.close()?;
            txn.commit()?;
        }
        Op::CursorDelete(k) => {
            let txn = env.begin_transaction(TransactionConfig::default())?;
            let mut cursor = primary.open_cursor(Some(&txn), CursorConfig::default())?;
            if cursor.get_search_key(&[k], LockMode::Default)?.is_found() {
                cursor.delete()?;
            }
            cursor.close()?;
            txn.commit()?;
        }
        Op::IndexDelete(b) => {
            index.delete(None, &[b])?;
        }
        Op::IndexCursorDelete(b) => {
            let txn = env.begin_transaction(TransactionConfig::default())?;
            let mut cursor = index.open_cursor(Some(&txn), CursorConfig::default())?;
            if cursor.get_search_key(&[b], LockMode::Default)?.is_found() {
                cursor.delete()?;
            }
            cursor.close()?;
            txn.commit()?;
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn index_matches_primary_after_any_history(ops in prop::collection::vec(arb_op(), 1..80)) {
        let env = env_with(small_bins());
        let primary = txn_db(&env, "primary", false);
        let index = txn_index(&env, &primary, "index", every_byte_key());

        for op in ops {
            apply(&env, &primary, &index, op).unwrap();
        }

        let expected = expected_entries(&primary, &|data| data.iter().map(|b| vec![*b]).collect()).unwrap();
        prop_assert_eq!(index.count().unwrap(), expected.len() as u64);
        prop_assert_eq!(index_entries(&index).unwrap(), expected);
    }
}
