//! Opening, closing and maintaining environments and databases.

#![allow(missing_docs)]

mod common;

use std::sync::Arc;

use cairn::{
    CairnError, CursorConfig, DatabaseConfig, DbState, EnvState, Environment, EnvironmentConfig,
    LockMode, MemoryLog, OperationStatus, Result, TransactionConfig,
};
use common::{env, env_with, init_tracing, plain_db, small_bins, txn_db};

#[test]
fn closing_with_open_cursors_closes_them_and_reports() -> Result<()> {
    let env = env();
    let db = plain_db(&env, "busy", false);
    db.put(None, b"k", b"v")?;

    let mut first = db.open_cursor(None, CursorConfig::default())?;
    let mut second = db.open_cursor(None, CursorConfig::default())?;
    first.get_first(LockMode::Default)?;
    assert_eq!(db.open_cursors(), 2);

    match db.close() {
        Err(CairnError::OpenCursors { count, .. }) => assert_eq!(count, 2),
        other => panic!("expected OpenCursors, got {other:?}"),
    }
    assert_eq!(db.state(), DbState::Closed);
    assert!(matches!(
        first.get_next(LockMode::Default),
        Err(CairnError::DatabaseClosed(_))
    ));
    second.close()?;
    assert_eq!(env.lock_stats().held_locks, 0);
    Ok(())
}

#[test]
fn closed_handles_refuse_everything() -> Result<()> {
    let env = env();
    let db = plain_db(&env, "closing", false);
    db.put(None, b"k", b"v")?;
    db.close()?;

    assert!(matches!(db.close(), Err(CairnError::DatabaseClosed(_))));
    assert!(matches!(
        db.get(None, b"k", LockMode::Default),
        Err(CairnError::DatabaseClosed(_))
    ));
    assert!(matches!(db.put(None, b"k", b"v"), Err(CairnError::DatabaseClosed(_))));
    assert!(matches!(
        db.open_cursor(None, CursorConfig::default()),
        Err(CairnError::DatabaseClosed(_))
    ));

    // The data outlives the handle.
    let reopened = env.open_database("closing", DatabaseConfig::default())?;
    assert!(reopened.get(None, b"k", LockMode::Default)?.is_found());
    Ok(())
}

#[test]
fn open_flags_are_enforced() -> Result<()> {
    let env = env();
    assert!(matches!(
        env.open_database("absent", DatabaseConfig::default()),
        Err(CairnError::DatabaseNotFound(_))
    ));
    plain_db(&env, "present", false);
    let exclusive = DatabaseConfig {
        exclusive_create: true,
        ..DatabaseConfig::create()
    };
    assert!(matches!(
        env.open_database("present", exclusive),
        Err(CairnError::DatabaseExists(_))
    ));
    assert!(matches!(
        env.open_database("present", DatabaseConfig::create().with_duplicates(true)),
        Err(CairnError::ConfigMismatch(_))
    ));
    assert_eq!(env.database_names(), vec!["present".to_string()]);
    Ok(())
}

#[test]
fn read_only_handles_refuse_writes() -> Result<()> {
    let env = env();
    let writer = plain_db(&env, "catalog", false);
    writer.put(None, b"k", b"v")?;

    let reader = env.open_database(
        "catalog",
        DatabaseConfig {
            read_only: true,
            ..DatabaseConfig::default()
        },
    )?;
    assert!(reader.get(None, b"k", LockMode::Default)?.is_found());
    assert!(matches!(
        reader.put(None, b"k", b"w"),
        Err(CairnError::NotPermitted { .. })
    ));
    assert!(matches!(reader.delete(None, b"k"), Err(CairnError::NotPermitted { .. })));

    let mut cursor = reader.open_cursor(None, CursorConfig::default())?;
    cursor.get_first(LockMode::Default)?;
    assert!(matches!(cursor.put_current(b"w"), Err(CairnError::NotPermitted { .. })));
    Ok(())
}

#[test]
fn compress_removes_unreferenced_tombstones() -> Result<()> {
    let env = env_with(small_bins());
    let db = plain_db(&env, "sparse", false);
    for i in 0u8..20 {
        db.put(None, &[i], b"v")?;
    }
    for i in (0u8..20).step_by(2) {
        assert_eq!(db.delete(None, &[i])?, OperationStatus::Success);
    }

    // A cursor parked on a tombstone keeps it alive.
    let mut cursor = db.open_cursor(None, CursorConfig::default())?;
    cursor.get_search_key(&[1], LockMode::Default)?;
    cursor.delete()?;

    let before = db.stats()?;
    assert_eq!(before.tree.live_records, 9);
    assert_eq!(before.tree.deleted_records, 11);
    assert!(before.deleted_ratio() > 0.5);

    assert_eq!(env.compress()?, 10);
    cursor.close()?;
    assert_eq!(env.compress()?, 1);

    let after = db.stats()?;
    assert_eq!(after.tree.deleted_records, 0);
    assert_eq!(after.tree.live_records, 9);
    assert_eq!(db.count()?, 9);
    assert!(after.counters.compacted >= 11);
    assert_eq!(common::dump(&db)?.len(), 9);
    Ok(())
}

#[test]
fn stats_track_splits_and_shape() -> Result<()> {
    let env = env_with(small_bins());
    let db = plain_db(&env, "shape", true);
    for i in 0u8..30 {
        db.put(None, &[i], b"a")?;
        db.put(None, &[i], b"b")?;
    }
    let stats = db.stats()?;
    assert_eq!(stats.tree.live_records, 60);
    assert_eq!(stats.tree.dup_sets, 30);
    assert_eq!(stats.tree.max_dup_set, 2);
    assert!(stats.tree.leaves > 1);
    assert!(stats.counters.leaf_splits > 0);
    stats.emit_tracing(db.name());
    Ok(())
}

#[test]
fn environment_config_loads_from_toml() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("cairn.toml");
    std::fs::write(
        &path,
        "lock_timeout_ms = 75\nmax_entries_per_bin = 8\ntxn_serializable_isolation = true\n",
    )?;
    let config = EnvironmentConfig::load(&path)?;
    assert_eq!(config.lock_timeout_ms, 75);
    assert!(config.transactional);
    assert!(config.txn_serializable_isolation);

    let env = env_with(config);
    let txn = env.begin_transaction(TransactionConfig::default())?;
    assert!(txn.is_serializable());
    txn.abort()?;

    std::fs::write(&path, "max_entries_per_bin = 1\n")?;
    assert!(matches!(EnvironmentConfig::load(&path), Err(CairnError::Config(_))));
    assert!(matches!(
        EnvironmentConfig::load(dir.path().join("missing.toml")),
        Err(CairnError::Io(_))
    ));
    Ok(())
}

#[test]
fn commits_reach_the_log() -> Result<()> {
    init_tracing();
    let log = Arc::new(MemoryLog::new());
    let env = Environment::with_log(EnvironmentConfig::default(), log.clone())?;
    let db = txn_db(&env, "logged", false);

    let txn = env.begin_transaction(TransactionConfig::default())?;
    db.put(Some(&txn), b"a", b"1")?;
    db.put(Some(&txn), b"b", b"2")?;
    txn.commit()?;
    assert_eq!(log.durable_lsn().0, 3);
    db.put(None, b"c", b"3")?;

    let stats = env.log_stats();
    assert_eq!(stats.frames_appended, 5);
    assert_eq!(stats.syncs, 1);
    env.sync()?;
    assert_eq!(log.durable_lsn().0, 5);
    assert_eq!(log.records()?.len(), 5);
    Ok(())
}

#[test]
fn closing_the_environment_closes_every_handle() -> Result<()> {
    let env = env();
    let first = plain_db(&env, "one", false);
    let second = txn_db(&env, "two", false);
    env.close()?;

    assert_eq!(env.state(), EnvState::Closed);
    assert_eq!(first.state(), DbState::Closed);
    assert_eq!(second.state(), DbState::Closed);
    assert!(env.open_database("one", DatabaseConfig::default()).is_err());
    assert!(env.begin_transaction(TransactionConfig::default()).is_err());
    assert!(env.close().is_err());
    Ok(())
}
