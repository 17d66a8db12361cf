//! Low-level primitives for building the storage engine.
//!
//! Includes record locking and the write-ahead log collaborator.

/// Record locks, lock owners and the deadlock-aware lock table.
pub mod concurrency;

/// Write-ahead log collaborator.
///
/// Receives every record mutation and transaction outcome.
pub mod wal;
