//! Equality joins across secondary indexes, and persistent sequences.

#![allow(missing_docs)]

mod common;

use cairn::{
    CairnError, CursorConfig, Database, Environment, JoinConfig, KeyCreator, LockMode, Lookup, Result,
    SecondaryConfig, SecondaryDatabase, SequenceConfig, TransactionConfig,
};
use common::{env, plain_db, txn_db};

/// Car records: data byte 0 is the color, byte 1 the make.
fn byte_at(index: usize) -> KeyCreator {
    KeyCreator::single(move |_, data: &[u8]| data.get(index).map(|byte| vec![*byte]))
}

fn cars(env: &Environment) -> Result<(Database, SecondaryDatabase, SecondaryDatabase)> {
    let cars = plain_db(env, "cars", false);
    let by_color = env.open_secondary_database("cars_by_color", &cars, SecondaryConfig::new(byte_at(0)))?;
    let by_make = env.open_secondary_database("cars_by_make", &cars, SecondaryConfig::new(byte_at(1)))?;
    for (k, d) in [("1", "rf"), ("2", "rb"), ("3", "bf"), ("4", "rf"), ("5", "gf")] {
        cars.put(None, k.as_bytes(), d.as_bytes())?;
    }
    Ok((cars, by_color, by_make))
}

fn joined_keys(join: &mut cairn::JoinCursor) -> Result<Vec<Vec<u8>>> {
    let mut keys = Vec::new();
    while let Lookup::Found(key) = join.get_next(LockMode::Default)? {
        keys.push(key);
    }
    Ok(keys)
}

#[test]
fn join_returns_records_matching_every_key() -> Result<()> {
    let env = env();
    let (cars, by_color, by_make) = cars(&env)?;

    let mut red = by_color.open_cursor(None, CursorConfig::default())?;
    let mut ford = by_make.open_cursor(None, CursorConfig::default())?;
    assert!(red.get_search_key(b"r", LockMode::Default)?.is_found());
    assert!(ford.get_search_key(b"f", LockMode::Default)?.is_found());

    let mut join = cars.join(&mut [&mut red, &mut ford], JoinConfig::default())?;
    assert_eq!(joined_keys(&mut join)?, vec![b"1".to_vec(), b"4".to_vec()]);
    join.close()?;

    // The input cursors keep their positions.
    assert_eq!(red.get_current(LockMode::Default)?.found().unwrap().primary_key, b"1");
    assert_eq!(ford.get_current(LockMode::Default)?.found().unwrap().primary_key, b"1");
    Ok(())
}

#[test]
fn join_with_data_reads_the_primary() -> Result<()> {
    let env = env();
    let (cars, by_color, by_make) = cars(&env)?;

    let mut green = by_color.open_cursor(None, CursorConfig::default())?;
    let mut ford = by_make.open_cursor(None, CursorConfig::default())?;
    green.get_search_key(b"g", LockMode::Default)?;
    ford.get_search_key(b"f", LockMode::Default)?;

    let mut join = cars.join(&mut [&mut ford, &mut green], JoinConfig { no_sort: true })?;
    let record = join.get_next_with_data(LockMode::Default)?.found().unwrap();
    assert_eq!((record.key.as_slice(), record.data.as_slice()), (&b"5"[..], &b"gf"[..]));
    assert_eq!(join.get_next_with_data(LockMode::Default)?, Lookup::NotFound);
    Ok(())
}

#[test]
fn join_with_no_common_record_is_empty() -> Result<()> {
    let env = env();
    let (cars, by_color, by_make) = cars(&env)?;

    let mut blue = by_color.open_cursor(None, CursorConfig::default())?;
    let mut bmw = by_make.open_cursor(None, CursorConfig::default())?;
    blue.get_search_key(b"b", LockMode::Default)?;
    bmw.get_search_key(b"b", LockMode::Default)?;
    let mut join = cars.join(&mut [&mut blue, &mut bmw], JoinConfig::default())?;
    assert!(joined_keys(&mut join)?.is_empty());
    Ok(())
}

#[test]
fn join_validates_its_cursors() -> Result<()> {
    let env = env();
    let (cars, by_color, by_make) = cars(&env)?;

    let mut unpositioned = by_color.open_cursor(None, CursorConfig::default())?;
    assert!(matches!(
        cars.join(&mut [&mut unpositioned], JoinConfig::default()),
        Err(CairnError::CursorNotInitialized)
    ));
    let mut none: [&mut cairn::SecondaryCursor; 0] = [];
    assert!(matches!(
        cars.join(&mut none, JoinConfig::default()),
        Err(CairnError::InvalidArgument(_))
    ));

    let trucks = plain_db(&env, "trucks", false);
    let mut make = by_make.open_cursor(None, CursorConfig::default())?;
    make.get_first(LockMode::Default)?;
    assert!(matches!(
        trucks.join(&mut [&mut make], JoinConfig::default()),
        Err(CairnError::InvalidArgument(_))
    ));
    Ok(())
}

#[test]
fn sequences_hand_out_increasing_values() -> Result<()> {
    let env = env();
    let db = plain_db(&env, "ids", false);

    let seq = db.open_sequence(None, b"order_id", SequenceConfig::default())?;
    assert_eq!(seq.key(), b"order_id");
    assert_eq!(seq.get(None, 1)?, 0);
    assert_eq!(seq.get(None, 1)?, 1);
    assert_eq!(seq.get(None, 5)?, 2);
    assert_eq!(seq.get(None, 1)?, 7);

    // A second handle continues from the stored value.
    let again = db.open_sequence(None, b"order_id", SequenceConfig::default())?;
    assert_eq!(again.get(None, 1)?, 8);
    assert!(matches!(seq.get(None, 0), Err(CairnError::InvalidArgument(_))));
    Ok(())
}

#[test]
fn cached_sequences_reserve_blocks() -> Result<()> {
    let env = env();
    let db = plain_db(&env, "cached", false);
    let config = SequenceConfig {
        cache_size: 10,
        ..SequenceConfig::default()
    };

    let a = db.open_sequence(None, b"seq", config)?;
    let b = db.open_sequence(None, b"seq", SequenceConfig::default())?;
    assert_eq!(a.get(None, 1)?, 0);
    assert_eq!(b.get(None, 1)?, 10);
    assert_eq!(a.get(None, 1)?, 1);

    let stats = a.stats();
    assert_eq!(stats.gets, 2);
    assert_eq!(stats.cached_gets, 1);
    assert_eq!(stats.cache_last, 9);
    assert_eq!(stats.cache_size, 10);
    Ok(())
}

#[test]
fn bounded_sequences_wrap_or_run_out() -> Result<()> {
    let env = env();
    let db = plain_db(&env, "bounded", false);
    let bounded = SequenceConfig {
        range_min: 0,
        range_max: 2,
        ..SequenceConfig::default()
    };

    let once = db.open_sequence(None, b"once", bounded)?;
    let values: Vec<i64> = (0..3).map(|_| once.get(None, 1)).collect::<Result<_>>()?;
    assert_eq!(values, vec![0, 1, 2]);
    assert!(matches!(once.get(None, 1), Err(CairnError::SequenceExhausted(_))));

    let cyclic = db.open_sequence(None, b"cyclic", SequenceConfig { wrap: true, ..bounded })?;
    let values: Vec<i64> = (0..4).map(|_| cyclic.get(None, 1)).collect::<Result<_>>()?;
    assert_eq!(values, vec![0, 1, 2, 0]);

    let down = db.open_sequence(
        None,
        b"down",
        SequenceConfig {
            decrement: true,
            initial_value: 2,
            ..bounded
        },
    )?;
    let values: Vec<i64> = (0..3).map(|_| down.get(None, 1)).collect::<Result<_>>()?;
    assert_eq!(values, vec![2, 1, 0]);
    Ok(())
}

#[test]
fn sequence_creation_flags_are_honored() -> Result<()> {
    let env = env();
    let db = plain_db(&env, "flags", false);
    db.open_sequence(None, b"exists", SequenceConfig::default())?;

    let exclusive = SequenceConfig {
        exclusive_create: true,
        ..SequenceConfig::default()
    };
    assert!(matches!(
        db.open_sequence(None, b"exists", exclusive),
        Err(CairnError::SequenceExists(_))
    ));
    let no_create = SequenceConfig {
        allow_create: false,
        ..SequenceConfig::default()
    };
    assert!(matches!(
        db.open_sequence(None, b"missing", no_create),
        Err(CairnError::SequenceNotFound(_))
    ));

    let dups = plain_db(&env, "dups", true);
    assert!(matches!(
        dups.open_sequence(None, b"seq", SequenceConfig::default()),
        Err(CairnError::Config(_))
    ));
    Ok(())
}

#[test]
fn transactional_sequence_values_roll_back() -> Result<()> {
    let env = env();
    let db = txn_db(&env, "txn_ids", false);
    let seq = db.open_sequence(None, b"id", SequenceConfig::default())?;

    let txn = env.begin_transaction(TransactionConfig::default())?;
    assert_eq!(seq.get(Some(&txn), 1)?, 0);
    assert_eq!(seq.get(Some(&txn), 1)?, 1);
    txn.abort()?;
    assert_eq!(seq.get(None, 1)?, 0);

    let cached = db.open_sequence(
        None,
        b"cached_id",
        SequenceConfig {
            cache_size: 4,
            ..SequenceConfig::default()
        },
    )?;
    let txn = env.begin_transaction(TransactionConfig::default())?;
    assert!(matches!(
        cached.get(Some(&txn), 1),
        Err(CairnError::InvalidArgument(_))
    ));
    txn.commit()
}
