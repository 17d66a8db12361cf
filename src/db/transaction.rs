use std::sync::Arc;

use tracing::{debug, warn};

use super::environment::Environment;
use crate::primitives::concurrency::{Locker, TxnState};
use crate::primitives::wal::{LogKind, LogRecord};
use crate::types::{LockerId, Result};

/// A user transaction.
///
/// Every write made through the transaction is recorded in its undo log and
/// every lock it takes is held until it ends. Reads and writes pass the
/// transaction to each call (`Some(&txn)`); cursors opened with it share its
/// locks.
///
/// # Lifecycle
///
/// 1. Start with [`Environment::begin_transaction`].
/// 2. Read and write through databases and cursors.
/// 3. [`commit`](Self::commit) or [`abort`](Self::abort).
///
/// A transaction dropped while still open is aborted.
///
/// # Example
///
/// ```rust
/// use cairn::{DatabaseConfig, Environment, EnvironmentConfig, TransactionConfig};
///
/// let env = Environment::open(EnvironmentConfig::default())?;
/// let db = env.open_database("accounts", DatabaseConfig::create().with_transactional(true))?;
/// let txn = env.begin_transaction(TransactionConfig::default())?;
/// db.put(Some(&txn), b"alice", b"10")?;
/// txn.commit()?;
/// # Ok::<(), cairn::CairnError>(())
/// ```
pub struct Transaction {
    env: Environment,
    locker: Arc<Locker>,
}

impl Transaction {
    pub(crate) fn new(env: Environment, locker: Arc<Locker>) -> Self {
        Self { env, locker }
    }

    pub(crate) fn locker(&self) -> &Arc<Locker> {
        &self.locker
    }

    pub(crate) fn belongs_to(&self, env: &Environment) -> bool {
        self.env.same_as(env)
    }

    /// Returns the id of the transaction's locker.
    pub fn id(&self) -> LockerId {
        self.locker.id()
    }

    /// Returns the current state of the transaction.
    pub fn state(&self) -> TxnState {
        self.locker.state()
    }

    /// True when the transaction runs with phantom protection.
    pub fn is_serializable(&self) -> bool {
        self.locker.is_serializable()
    }

    /// Number of locks currently held.
    pub fn held_locks(&self) -> usize {
        self.locker.held_count()
    }

    /// Makes the transaction's writes permanent and releases its locks.
    ///
    /// A transaction that wrote anything logs a commit record and flushes
    /// the log first. If that fails, the transaction is aborted.
    ///
    /// # Errors
    /// * `CairnError::TransactionClosed` - already committed or aborted
    /// * log errors from the environment's [`LogSink`](crate::primitives::wal::LogSink)
    pub fn commit(self) -> Result<()> {
        self.env.check_open()?;
        self.locker.check_open()?;
        let writes = self.locker.undo_len();
        let result = match self.log_outcome(LogKind::Commit, writes) {
            Ok(()) => self.locker.commit(),
            Err(err) => {
                if let Err(abort_err) = self.locker.abort() {
                    warn!(locker = %self.locker.id(), error = %abort_err, "txn.commit.abort_failed");
                }
                Err(err)
            }
        };
        match &result {
            Ok(()) => debug!(locker = %self.locker.id(), writes, "txn.commit.done"),
            Err(err) => warn!(locker = %self.locker.id(), error = %err, "txn.commit.failed"),
        }
        self.env.check_result(result)
    }

    /// Undoes the transaction's writes, newest first, and releases its locks.
    pub fn abort(self) -> Result<()> {
        self.locker.check_open()?;
        let writes = self.locker.undo_len();
        let logged = self.log_outcome(LogKind::Abort, writes);
        let result = self.locker.abort().and(logged);
        self.env.check_result(result)
    }

    fn log_outcome(&self, kind: LogKind, writes: usize) -> Result<()> {
        if writes == 0 {
            return Ok(());
        }
        let log = self.env.log();
        log.append(&LogRecord::outcome(kind, self.locker.id()))?;
        if kind == LogKind::Commit {
            log.flush()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.locker.id())
            .field("state", &self.locker.state())
            .finish()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.locker.state() == TxnState::Open {
            debug!(locker = %self.locker.id(), "txn.drop.abort");
            if let Err(err) = self.locker.abort() {
                warn!(locker = %self.locker.id(), error = %err, "txn.drop.abort_failed");
            }
        }
    }
}
