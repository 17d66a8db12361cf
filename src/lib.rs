//! cairn: an embedded, transactional B-tree key/value engine.
//!
//! Records live in named databases inside an [`Environment`]. Databases can
//! hold sorted duplicates, be read and written through [`Cursor`]s, and be
//! indexed by [`SecondaryDatabase`]s that the engine keeps consistent on
//! every write. Serializable transactions lock key ranges so scans never see
//! phantoms.
//!
//! ```rust
//! use cairn::{DatabaseConfig, Environment, EnvironmentConfig, LockMode, Lookup};
//!
//! let env = Environment::open(EnvironmentConfig::default())?;
//! let db = env.open_database("fruit", DatabaseConfig::create().with_duplicates(true))?;
//! db.put(None, b"apple", b"green")?;
//! db.put(None, b"apple", b"red")?;
//! let Lookup::Found(entry) = db.get(None, b"apple", LockMode::Default)? else {
//!     unreachable!()
//! };
//! assert_eq!(entry.data, b"green");
//! # Ok::<(), cairn::CairnError>(())
//! ```

#![warn(missing_docs)]

pub mod db;
pub mod primitives;
pub mod storage;
pub mod types;

pub use db::{
    Cursor, CursorConfig, Database, DatabaseConfig, DatabaseStats, DbOperation, DbState, EnvState, Environment,
    EnvironmentConfig, ForeignKeyDeleteAction, HandleKind, JoinConfig, JoinCursor, KeyCreator, LockMode, Nullifier,
    SecondaryConfig, SecondaryCursor, SecondaryDatabase, Sequence, SequenceConfig, SequenceStats, Transaction,
    TransactionConfig,
};
pub use primitives::concurrency::{LockStats, TxnState};
pub use primitives::wal::{LogSink, MemoryLog, NoopLog};
pub use storage::btree::{byte_order, FnOrder, KeyOrder, SharedOrder, TreeStatsSnapshot, TreeSummary};
pub use types::{CairnError, Entry, Lookup, OperationStatus, Result, SecondaryEntry};
