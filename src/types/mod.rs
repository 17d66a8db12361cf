//! Identifiers, operation outcomes and the crate-wide error type.

#![forbid(unsafe_code)]

use std::fmt;

pub mod checksum;

pub use checksum::frame_crc32;

/// Identifier of a lockable node: a record, a duplicate-count node or a tree's EOF node.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct NodeId(pub u64);
/// Identifier of a lock owner.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct LockerId(pub u64);
/// Identifier of a tree inside an environment.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct TreeId(pub u32);
/// Identifier of one open database handle.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct HandleId(pub u64);
/// Log sequence number assigned by a [`crate::primitives::wal::LogSink`].
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Lsn(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for LockerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for NodeId {
    fn from(value: u64) -> Self {
        NodeId(value)
    }
}

impl From<NodeId> for u64 {
    fn from(value: NodeId) -> Self {
        value.0
    }
}

/// Logical outcome of a mutation or positioning call.
///
/// These are ordinary results, not errors: callers branch on them.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OperationStatus {
    /// The operation completed.
    Success,
    /// A no-overwrite insert found the key (or key/data pair) already present.
    KeyExist,
    /// The cursor's record was deleted underneath it.
    KeyEmpty,
    /// No matching record.
    NotFound,
}

impl OperationStatus {
    /// Returns true for [`OperationStatus::Success`].
    pub fn is_success(self) -> bool {
        matches!(self, OperationStatus::Success)
    }
}

/// A key/data pair returned by a primary read.
#[derive(Clone, Debug, Eq, PartialEq, Default)]
pub struct Entry {
    /// Record key.
    pub key: Vec<u8>,
    /// Record data.
    pub data: Vec<u8>,
}

impl Entry {
    /// Builds an entry from borrowed slices.
    pub fn new(key: &[u8], data: &[u8]) -> Self {
        Self {
            key: key.to_vec(),
            data: data.to_vec(),
        }
    }
}

/// A secondary read resolved through its primary.
#[derive(Clone, Debug, Eq, PartialEq, Default)]
pub struct SecondaryEntry {
    /// Secondary key.
    pub key: Vec<u8>,
    /// Key of the primary record the index entry points at.
    pub primary_key: Vec<u8>,
    /// Data of the primary record.
    pub data: Vec<u8>,
}

/// Result of a get-style operation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Lookup<T = Entry> {
    /// A record was found.
    Found(T),
    /// No matching record.
    NotFound,
    /// The cursor's record was deleted underneath it.
    KeyEmpty,
}

impl<T> Lookup<T> {
    /// Collapses the lookup into an [`OperationStatus`].
    pub fn status(&self) -> OperationStatus {
        match self {
            Lookup::Found(_) => OperationStatus::Success,
            Lookup::NotFound => OperationStatus::NotFound,
            Lookup::KeyEmpty => OperationStatus::KeyEmpty,
        }
    }

    /// Returns true when a record was found.
    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }

    /// Returns the found value, if any.
    pub fn found(self) -> Option<T> {
        match self {
            Lookup::Found(value) => Some(value),
            _ => None,
        }
    }

    /// Maps the found value, keeping the miss variants.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Lookup<U> {
        match self {
            Lookup::Found(value) => Lookup::Found(f(value)),
            Lookup::NotFound => Lookup::NotFound,
            Lookup::KeyEmpty => Lookup::KeyEmpty,
        }
    }
}

/// Errors surfaced by cairn.
#[derive(thiserror::Error, Debug)]
pub enum CairnError {
    /// IO failure while loading configuration.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// A lock request waited longer than the configured timeout.
    #[error("lock timeout: locker {locker} waited {timeout_ms}ms for node {node}")]
    LockTimeout {
        /// Waiting locker.
        locker: LockerId,
        /// Contended node.
        node: NodeId,
        /// Timeout that elapsed.
        timeout_ms: u64,
    },
    /// The lock request was chosen as a deadlock victim.
    #[error("deadlock: locker {locker} waiting for node {node}")]
    Deadlock {
        /// Victim locker.
        locker: LockerId,
        /// Contended node.
        node: NodeId,
    },
    /// An argument was rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// The operation is not allowed on this kind of handle.
    #[error("operation {operation} not permitted on a {handle} handle")]
    NotPermitted {
        /// Rejected operation.
        operation: &'static str,
        /// Handle kind.
        handle: &'static str,
    },
    /// The database handle was closed.
    #[error("database {0} is closed")]
    DatabaseClosed(String),
    /// The named database does not exist and creation was not allowed.
    #[error("database {0} not found")]
    DatabaseNotFound(String),
    /// Exclusive creation found an existing database.
    #[error("database {0} already exists")]
    DatabaseExists(String),
    /// The cursor was closed.
    #[error("cursor is closed")]
    CursorClosed,
    /// The cursor has no current position.
    #[error("cursor is not initialized")]
    CursorNotInitialized,
    /// The transaction already committed or aborted.
    #[error("transaction {0} is no longer active")]
    TransactionClosed(LockerId),
    /// Reopening a database with settings that differ from its persisted ones.
    #[error("configuration mismatch: {0}")]
    ConfigMismatch(String),
    /// Configuration could not be parsed or validated.
    #[error("configuration: {0}")]
    Config(String),
    /// A secondary insert referenced a key missing from the foreign database.
    #[error("foreign key violation: key absent from foreign database {database}")]
    ForeignKeyViolation {
        /// Foreign database name.
        database: String,
    },
    /// Deleting a foreign record was refused because references exist.
    #[error("foreign key delete aborted: secondary {database} still references the key")]
    ForeignKeyDeleteAborted {
        /// Secondary database name.
        database: String,
    },
    /// A secondary index disagrees with its primary.
    #[error("secondary {database} corrupt: {reason}")]
    SecondaryCorrupt {
        /// Secondary database name.
        database: String,
        /// What was inconsistent.
        reason: &'static str,
    },
    /// A secondary entry could not be inserted for a primary record.
    #[error("could not insert secondary key in {database}: {status:?}")]
    SecondaryInsertFailed {
        /// Secondary database name.
        database: String,
        /// Status reported by the insert.
        status: OperationStatus,
    },
    /// A database was closed while cursors were still open; they were force-closed.
    #[error("database {database} closed with {count} open cursors{details}")]
    OpenCursors {
        /// Database name.
        database: String,
        /// Cursors that were force-closed.
        count: usize,
        /// Failures seen while closing them, if any.
        details: String,
    },
    /// Exclusive creation found an existing sequence record.
    #[error("sequence {0} already exists")]
    SequenceExists(String),
    /// The sequence record is missing and creation was not allowed.
    #[error("sequence {0} not found")]
    SequenceNotFound(String),
    /// A sequence ran out of values and wrapping is disabled.
    #[error("sequence {0} exhausted")]
    SequenceExhausted(String),
    /// Internal structure invariant violated; fatal to the environment.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// The environment was invalidated by an earlier fatal error.
    #[error("environment invalid: {0}")]
    EnvironmentInvalid(String),
    /// The environment was closed.
    #[error("environment is closed")]
    EnvironmentClosed,
}

impl CairnError {
    /// Errors that must invalidate the whole environment.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CairnError::Corruption(_))
    }

    /// Lock conflicts the caller may retry after aborting.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CairnError::LockTimeout { .. } | CairnError::Deadlock { .. }
        )
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, CairnError>;
