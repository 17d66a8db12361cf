//! Shared setup for the integration tests.

#![allow(dead_code)]

use std::sync::Once;

use cairn::{
    Database, DatabaseConfig, Environment, EnvironmentConfig, KeyCreator, LockMode, Lookup, Result,
    SecondaryDatabase,
};

static INIT: Once = Once::new();

/// Installs a `tracing` subscriber once per test binary; `RUST_LOG` selects
/// the events shown.
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn env() -> Environment {
    env_with(EnvironmentConfig::default())
}

pub fn env_with(config: EnvironmentConfig) -> Environment {
    init_tracing();
    Environment::open(config).expect("open environment")
}

/// Small leaves so a few dozen records already span several of them.
pub fn small_bins() -> EnvironmentConfig {
    EnvironmentConfig {
        max_entries_per_bin: 4,
        lock_timeout_ms: 200,
        ..EnvironmentConfig::default()
    }
}

pub fn txn_db(env: &Environment, name: &str, duplicates: bool) -> Database {
    env.open_database(
        name,
        DatabaseConfig::create()
            .with_duplicates(duplicates)
            .with_transactional(true),
    )
    .expect("open database")
}

pub fn plain_db(env: &Environment, name: &str, duplicates: bool) -> Database {
    env.open_database(name, DatabaseConfig::create().with_duplicates(duplicates))
        .expect("open database")
}

/// Every (key, data) pair of `db` in cursor order.
pub fn dump(db: &Database) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut cursor = db.open_cursor(None, Default::default())?;
    let mut out = Vec::new();
    let mut lookup = cursor.get_first(LockMode::Default)?;
    while let Lookup::Found(entry) = lookup {
        out.push((entry.key, entry.data));
        lookup = cursor.get_next(LockMode::Default)?;
    }
    cursor.close()?;
    Ok(out)
}

/// Every (secondary key, primary key) pair of `index` in cursor order.
pub fn index_entries(index: &SecondaryDatabase) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut cursor = index.open_cursor(None, Default::default())?;
    let mut out = Vec::new();
    let mut lookup = cursor.get_first(LockMode::Default)?;
    while let Lookup::Found(entry) = lookup {
        out.push((entry.key, entry.primary_key));
        lookup = cursor.get_next(LockMode::Default)?;
    }
    cursor.close()?;
    Ok(out)
}

/// Secondary key = first byte of the data.
pub fn first_byte_key() -> KeyCreator {
    KeyCreator::single(|_, data: &[u8]| data.first().map(|byte| vec![*byte]))
}

/// Secondary keys = every distinct byte of the data.
pub fn every_byte_key() -> KeyCreator {
    KeyCreator::multi(|_, data: &[u8]| data.iter().map(|byte| vec![*byte]).collect())
}
