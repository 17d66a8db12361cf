//! Sorted duplicate sets: ordering, movement within and across sets, counts
//! and the duplicate-aware put variants.

#![allow(missing_docs)]

mod common;

use std::collections::{BTreeMap, BTreeSet};

use cairn::{CairnError, CursorConfig, LockMode, Lookup, OperationStatus, Result};
use common::{dump, env, env_with, plain_db, small_bins};
use proptest::prelude::*;

fn data_of(lookup: Lookup) -> Vec<u8> {
    lookup.found().map(|entry| entry.data).unwrap_or_default()
}

#[test]
fn duplicates_iterate_in_data_order() -> Result<()> {
    let env = env();
    let db = plain_db(&env, "colors", true);
    for (k, d) in [("b", "red"), ("a", "x"), ("b", "blue"), ("b", "green"), ("c", "y")] {
        db.put(None, k.as_bytes(), d.as_bytes())?;
    }

    let pairs: Vec<(String, String)> = dump(&db)?
        .into_iter()
        .map(|(k, d)| (String::from_utf8(k).unwrap(), String::from_utf8(d).unwrap()))
        .collect();
    let expected = [("a", "x"), ("b", "blue"), ("b", "green"), ("b", "red"), ("c", "y")];
    assert_eq!(
        pairs,
        expected
            .iter()
            .map(|(k, d)| (k.to_string(), d.to_string()))
            .collect::<Vec<_>>()
    );
    assert_eq!(db.count()?, 5);
    Ok(())
}

#[test]
fn dup_moves_stay_within_the_key() -> Result<()> {
    let env = env();
    let db = plain_db(&env, "dups", true);
    for (k, d) in [("a", "1"), ("b", "1"), ("b", "2"), ("b", "3"), ("c", "1")] {
        db.put(None, k.as_bytes(), d.as_bytes())?;
    }

    let mut cursor = db.open_cursor(None, CursorConfig::default())?;
    assert_eq!(data_of(cursor.get_search_key(b"b", LockMode::Default)?), b"1");
    assert_eq!(cursor.count()?, 3);
    assert_eq!(data_of(cursor.get_next_dup(LockMode::Default)?), b"2");
    assert_eq!(data_of(cursor.get_next_dup(LockMode::Default)?), b"3");
    assert_eq!(cursor.get_next_dup(LockMode::Default)?, Lookup::NotFound);
    assert_eq!(data_of(cursor.get_current(LockMode::Default)?), b"3");

    assert_eq!(data_of(cursor.get_prev_dup(LockMode::Default)?), b"2");
    assert_eq!(data_of(cursor.get_prev_dup(LockMode::Default)?), b"1");
    assert_eq!(cursor.get_prev_dup(LockMode::Default)?, Lookup::NotFound);
    assert_eq!(data_of(cursor.get_current(LockMode::Default)?), b"1");
    Ok(())
}

#[test]
fn no_dup_moves_skip_whole_sets() -> Result<()> {
    let env = env();
    let db = plain_db(&env, "skip", true);
    for (k, d) in [("a", "1"), ("a", "2"), ("b", "1"), ("b", "2"), ("b", "3"), ("c", "9")] {
        db.put(None, k.as_bytes(), d.as_bytes())?;
    }

    let mut cursor = db.open_cursor(None, CursorConfig::default())?;
    let first = cursor.get_next_no_dup(LockMode::Default)?.found().unwrap();
    assert_eq!((first.key.as_slice(), first.data.as_slice()), (&b"a"[..], &b"1"[..]));

    cursor.get_next_dup(LockMode::Default)?;
    let next = cursor.get_next_no_dup(LockMode::Default)?.found().unwrap();
    assert_eq!((next.key.as_slice(), next.data.as_slice()), (&b"b"[..], &b"1"[..]));

    // Backward, a no-dup move lands on the last duplicate of the previous key.
    cursor.get_last(LockMode::Default)?;
    let prev = cursor.get_prev_no_dup(LockMode::Default)?.found().unwrap();
    assert_eq!((prev.key.as_slice(), prev.data.as_slice()), (&b"b"[..], &b"3"[..]));
    let prev = cursor.get_prev_no_dup(LockMode::Default)?.found().unwrap();
    assert_eq!((prev.key.as_slice(), prev.data.as_slice()), (&b"a"[..], &b"2"[..]));
    assert_eq!(cursor.get_prev_no_dup(LockMode::Default)?, Lookup::NotFound);
    Ok(())
}

#[test]
fn put_variants_respect_existing_pairs() -> Result<()> {
    let env = env();
    let db = plain_db(&env, "puts", true);

    assert_eq!(db.put(None, b"k", b"a")?, OperationStatus::Success);
    assert_eq!(db.put(None, b"k", b"b")?, OperationStatus::Success);
    // The identical pair stays a single record.
    assert_eq!(db.put(None, b"k", b"a")?, OperationStatus::Success);
    assert_eq!(db.put_no_dup_data(None, b"k", b"a")?, OperationStatus::KeyExist);
    assert_eq!(db.put_no_dup_data(None, b"k", b"c")?, OperationStatus::Success);
    assert_eq!(db.put_no_overwrite(None, b"k", b"d")?, OperationStatus::KeyExist);
    assert_eq!(db.count()?, 3);

    let unique = plain_db(&env, "unique", false);
    assert!(matches!(
        unique.put_no_dup_data(None, b"k", b"a"),
        Err(CairnError::InvalidArgument(_))
    ));
    Ok(())
}

#[test]
fn put_current_keeps_duplicate_order() -> Result<()> {
    let env = env();
    let db = plain_db(&env, "current", true);
    db.put(None, b"k", b"b")?;
    db.put(None, b"k", b"d")?;

    let mut cursor = db.open_cursor(None, CursorConfig::default())?;
    cursor.get_search_both(b"k", b"b", LockMode::Default)?;
    assert!(matches!(
        cursor.put_current(b"z"),
        Err(CairnError::InvalidArgument(_))
    ));
    assert_eq!(data_of(cursor.get_current(LockMode::Default)?), b"b");
    assert_eq!(cursor.put_current(b"b")?, OperationStatus::Success);
    Ok(())
}

#[test]
fn search_both_range_stays_on_the_key() -> Result<()> {
    let env = env();
    let db = plain_db(&env, "both_range", true);
    for (k, d) in [("a", "5"), ("b", "2"), ("b", "4"), ("c", "0")] {
        db.put(None, k.as_bytes(), d.as_bytes())?;
    }

    let mut cursor = db.open_cursor(None, CursorConfig::default())?;
    assert_eq!(data_of(cursor.get_search_both_range(b"b", b"3", LockMode::Default)?), b"4");
    assert_eq!(cursor.get_search_both_range(b"b", b"5", LockMode::Default)?, Lookup::NotFound);
    assert_eq!(cursor.get_search_both(b"b", b"3", LockMode::Default)?, Lookup::NotFound);
    assert_eq!(data_of(cursor.get_current(LockMode::Default)?), b"4");
    Ok(())
}

#[test]
fn deleted_duplicates_are_skipped_and_not_counted() -> Result<()> {
    let env = env();
    let db = plain_db(&env, "holes", true);
    for d in ["1", "2", "3"] {
        db.put(None, b"k", d.as_bytes())?;
    }

    let mut cursor = db.open_cursor(None, CursorConfig::default())?;
    cursor.get_search_both(b"k", b"2", LockMode::Default)?;
    assert_eq!(cursor.delete()?, OperationStatus::Success);
    assert_eq!(cursor.count()?, 2);
    assert_eq!(data_of(cursor.get_next_dup(LockMode::Default)?), b"3");
    assert_eq!(data_of(cursor.get_prev_dup(LockMode::Default)?), b"1");

    assert_eq!(db.delete(None, b"k")?, OperationStatus::Success);
    assert_eq!(db.get(None, b"k", LockMode::Default)?, Lookup::NotFound);
    assert_eq!(db.delete(None, b"k")?, OperationStatus::NotFound);
    assert_eq!(db.count()?, 0);
    Ok(())
}

#[derive(Debug, Clone)]
enum Op {
    Put(u8, u8),
    Delete(u8),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0u8..12, 0u8..8).prop_map(|(k, d)| Op::Put(k, d)),
        1 => (0u8..12).prop_map(Op::Delete),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn duplicate_sets_match_a_sorted_model(ops in prop::collection::vec(arb_op(), 1..120)) {
        let env = env_with(small_bins());
        let db = plain_db(&env, "model", true);
        let mut model: BTreeMap<Vec<u8>, BTreeSet<Vec<u8>>> = BTreeMap::new();

        for op in ops {
            match op {
                Op::Put(k, d) => {
                    db.put(None, &[k], &[d]).unwrap();
                    model.entry(vec![k]).or_default().insert(vec![d]);
                }
                Op::Delete(k) => {
                    let status = db.delete(None, &[k]).unwrap();
                    let expected = if model.remove(&vec![k]).is_some() {
                        OperationStatus::Success
                    } else {
                        OperationStatus::NotFound
                    };
                    prop_assert_eq!(status, expected);
                }
            }
        }

        let expected: Vec<(Vec<u8>, Vec<u8>)> = model
            .iter()
            .flat_map(|(k, set)| set.iter().map(move |d| (k.clone(), d.clone())))
            .collect();
        prop_assert_eq!(dump(&db).unwrap(), expected);

        let mut cursor = db.open_cursor(None, CursorConfig::default()).unwrap();
        for (k, set) in &model {
            prop_assert!(cursor.get_search_key(k, LockMode::Default).unwrap().is_found());
            prop_assert_eq!(cursor.count().unwrap(), set.len());
        }
    }
}
