//! Record locking: lock types, the environment-wide lock table and lockers.

#![forbid(unsafe_code)]

mod lock;
mod locker;
mod manager;

pub use lock::{conflict, upgrade, LockConflict, LockType, LockUpgrade};
pub use locker::{Locker, LockerIds, LockerKind, LockerSettings, TxnState, Undo};
pub use manager::{LockGrant, LockManager, LockRequester, LockStats};
