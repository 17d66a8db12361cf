//! Transactions, record locking and isolation levels.

#![allow(missing_docs)]

mod common;

use std::thread;
use std::time::Duration;

use cairn::{
    CairnError, CursorConfig, LockMode, Lookup, OperationStatus, Result, TransactionConfig, TxnState,
};
use common::{env, env_with, small_bins, txn_db};

fn patient() -> TransactionConfig {
    TransactionConfig {
        lock_timeout_ms: Some(10_000),
        ..TransactionConfig::default()
    }
}

#[test]
fn commit_publishes_and_abort_discards() -> Result<()> {
    let env = env();
    let db = txn_db(&env, "ledger", false);

    let txn = env.begin_transaction(TransactionConfig::default())?;
    assert_eq!(txn.state(), TxnState::Open);
    db.put(Some(&txn), b"a", b"1")?;
    db.put(Some(&txn), b"b", b"2")?;
    txn.commit()?;
    assert_eq!(env.lock_stats().held_locks, 0);

    let txn = env.begin_transaction(TransactionConfig::default())?;
    db.delete(Some(&txn), b"a")?;
    db.put(Some(&txn), b"b", b"changed")?;
    db.put(Some(&txn), b"c", b"3")?;
    txn.abort()?;

    assert_eq!(db.get(None, b"a", LockMode::Default)?.found().unwrap().data, b"1");
    assert_eq!(db.get(None, b"b", LockMode::Default)?.found().unwrap().data, b"2");
    assert_eq!(db.get(None, b"c", LockMode::Default)?, Lookup::NotFound);
    assert_eq!(env.lock_stats().held_locks, 0);
    Ok(())
}

#[test]
fn conflicting_reads_time_out() -> Result<()> {
    let env = env_with(small_bins());
    let db = txn_db(&env, "contended", false);
    db.put(None, b"k", b"committed")?;

    let writer = env.begin_transaction(TransactionConfig::default())?;
    db.put(Some(&writer), b"k", b"pending")?;

    let reader = env.begin_transaction(TransactionConfig::default())?;
    assert!(matches!(
        db.get(Some(&reader), b"k", LockMode::Default),
        Err(CairnError::LockTimeout { .. })
    ));
    // Auto-commit writes wait the same way.
    assert!(matches!(
        db.put(None, b"k", b"other"),
        Err(CairnError::LockTimeout { .. })
    ));
    assert!(env.is_valid());

    writer.commit()?;
    assert_eq!(
        db.get(Some(&reader), b"k", LockMode::Default)?.found().unwrap().data,
        b"pending"
    );
    reader.commit()?;
    assert!(env.lock_stats().timeouts >= 2);
    Ok(())
}

#[test]
fn read_uncommitted_sees_pending_writes() -> Result<()> {
    let env = env_with(small_bins());
    let db = txn_db(&env, "dirty", false);
    db.put(None, b"k", b"old")?;

    let writer = env.begin_transaction(TransactionConfig::default())?;
    db.put(Some(&writer), b"k", b"new")?;

    let dirty = db.get(None, b"k", LockMode::ReadUncommitted)?;
    assert_eq!(dirty.found().unwrap().data, b"new");

    let reader = env.begin_transaction(TransactionConfig {
        read_uncommitted: true,
        ..TransactionConfig::default()
    })?;
    let mut cursor = db.open_cursor(Some(&reader), CursorConfig::default())?;
    assert_eq!(cursor.get_first(LockMode::Default)?.found().unwrap().data, b"new");
    cursor.close()?;
    reader.commit()?;

    writer.abort()?;
    assert_eq!(db.get(None, b"k", LockMode::ReadUncommitted)?.found().unwrap().data, b"old");
    Ok(())
}

#[test]
fn rmw_reads_exclude_other_readers() -> Result<()> {
    let env = env_with(small_bins());
    let db = txn_db(&env, "counters", false);
    db.put(None, b"n", b"1")?;

    let updater = env.begin_transaction(TransactionConfig::default())?;
    assert!(db.get(Some(&updater), b"n", LockMode::Rmw)?.is_found());
    assert!(env.lock_stats().held_write_locks >= 1);

    let reader = env.begin_transaction(TransactionConfig::default())?;
    assert!(matches!(
        db.get(Some(&reader), b"n", LockMode::Default),
        Err(CairnError::LockTimeout { .. })
    ));
    db.put(Some(&updater), b"n", b"2")?;
    updater.commit()?;
    assert_eq!(db.get(Some(&reader), b"n", LockMode::Default)?.found().unwrap().data, b"2");
    reader.commit()
}

#[test]
fn deadlocks_are_detected() -> Result<()> {
    let env = env();
    let db = txn_db(&env, "accounts", false);
    db.put(None, b"a", b"100")?;
    db.put(None, b"b", b"100")?;

    let first = env.begin_transaction(patient())?;
    db.put(Some(&first), b"a", b"90")?;

    let handle = {
        let (env, db) = (env.clone(), db.clone());
        thread::spawn(move || -> Result<OperationStatus> {
            let second = env.begin_transaction(patient())?;
            db.put(Some(&second), b"b", b"110")?;
            let status = db.put(Some(&second), b"a", b"80")?;
            second.commit()?;
            Ok(status)
        })
    };

    // Give the second transaction time to lock `b` and queue for `a`.
    thread::sleep(Duration::from_millis(200));
    assert!(matches!(
        db.put(Some(&first), b"b", b"120"),
        Err(CairnError::Deadlock { .. })
    ));
    first.abort()?;

    assert_eq!(handle.join().expect("second transaction")?, OperationStatus::Success);
    assert_eq!(db.get(None, b"a", LockMode::Default)?.found().unwrap().data, b"80");
    assert!(env.lock_stats().deadlocks >= 1);
    Ok(())
}

#[test]
fn count_takes_no_lasting_locks() -> Result<()> {
    let env = env_with(small_bins());
    let db = txn_db(&env, "members", true);
    for member in ["ann", "bob"] {
        db.put(None, b"team", member.as_bytes())?;
    }

    let reader = env.begin_transaction(TransactionConfig::default())?;
    let mut cursor = db.open_cursor(Some(&reader), CursorConfig::default())?;
    cursor.get_search_key(b"team", LockMode::Default)?;
    let held = reader.held_locks();
    assert_eq!(cursor.count()?, 2);
    assert_eq!(reader.held_locks(), held);

    // A writer adding a duplicate is not blocked by the count.
    let writer = env.begin_transaction(TransactionConfig::default())?;
    assert_eq!(
        db.put_no_dup_data(Some(&writer), b"team", b"cy")?,
        OperationStatus::Success
    );
    writer.commit()?;
    assert_eq!(cursor.count()?, 3);
    cursor.close()?;
    reader.commit()
}

#[test]
fn cursors_outliving_their_transaction_fail() -> Result<()> {
    let env = env();
    let db = txn_db(&env, "scoped", false);
    db.put(None, b"k", b"v")?;

    let txn = env.begin_transaction(TransactionConfig::default())?;
    let mut cursor = db.open_cursor(Some(&txn), CursorConfig::default())?;
    cursor.get_first(LockMode::Default)?;
    txn.commit()?;
    assert!(matches!(
        cursor.get_next(LockMode::Default),
        Err(CairnError::TransactionClosed(_))
    ));
    cursor.close()
}

#[test]
fn transaction_cursor_writes_roll_back() -> Result<()> {
    let env = env();
    let db = txn_db(&env, "cursor_writes", false);
    db.put(None, b"a", b"1")?;

    let txn = env.begin_transaction(TransactionConfig::default())?;
    let mut cursor = db.open_cursor(Some(&txn), CursorConfig::default())?;
    cursor.put(b"b", b"2")?;
    cursor.get_search_key(b"a", LockMode::Default)?;
    cursor.put_current(b"one")?;
    cursor.delete()?;
    cursor.close()?;
    assert!(txn.held_locks() > 0);
    txn.abort()?;

    assert_eq!(db.get(None, b"a", LockMode::Default)?.found().unwrap().data, b"1");
    assert_eq!(db.get(None, b"b", LockMode::Default)?, Lookup::NotFound);
    Ok(())
}

#[test]
fn concurrent_writers_on_distinct_keys_all_commit() -> Result<()> {
    let env = env();
    let db = txn_db(&env, "parallel", false);

    let handles: Vec<_> = (0..4u8)
        .map(|worker| {
            let (env, db) = (env.clone(), db.clone());
            thread::spawn(move || -> Result<()> {
                for i in 0..50u8 {
                    let txn = env.begin_transaction(patient())?;
                    db.put(Some(&txn), &[worker, i], &[i])?;
                    txn.commit()?;
                }
                Ok(())
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("writer thread")?;
    }
    assert_eq!(db.count()?, 200);
    assert_eq!(env.lock_stats().held_locks, 0);
    Ok(())
}
