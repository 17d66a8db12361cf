//! Lock types and the conflict/upgrade matrices used by [`super::LockManager`].

use std::fmt;

/// Kinds of record locks.
///
/// Range variants additionally protect the gap before the locked record so a
/// serializable reader observes no phantoms. `RangeInsert` is taken only by
/// inserters on the key that follows the insertion point.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum LockType {
    /// Shared record lock.
    Read,
    /// Exclusive record lock.
    Write,
    /// Shared record lock plus the preceding gap.
    RangeRead,
    /// Exclusive record lock plus the preceding gap.
    RangeWrite,
    /// Insert-intent lock on the key following an insertion point.
    RangeInsert,
}

impl LockType {
    /// True for the exclusive variants.
    pub fn is_write(self) -> bool {
        matches!(self, LockType::Write | LockType::RangeWrite)
    }

    /// True for the gap-protecting variants.
    pub fn is_range(self) -> bool {
        matches!(self, LockType::RangeRead | LockType::RangeWrite)
    }

    /// Returns the non-range counterpart of a range lock.
    pub fn without_range(self) -> LockType {
        match self {
            LockType::RangeRead => LockType::Read,
            LockType::RangeWrite => LockType::Write,
            other => other,
        }
    }

    /// Returns the range counterpart of a plain record lock.
    pub fn with_range(self) -> LockType {
        match self {
            LockType::Read => LockType::RangeRead,
            LockType::Write => LockType::RangeWrite,
            other => other,
        }
    }

    /// Short name used in tracing fields.
    pub fn as_str(self) -> &'static str {
        match self {
            LockType::Read => "read",
            LockType::Write => "write",
            LockType::RangeRead => "range_read",
            LockType::RangeWrite => "range_write",
            LockType::RangeInsert => "range_insert",
        }
    }
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a request relates to a lock another locker already holds.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LockConflict {
    /// Compatible; grant immediately.
    Allow,
    /// Incompatible; wait for release.
    Block,
    /// Wait for release, then report a restart instead of granting.
    Restart,
}

/// Result of combining a held lock with a new request by the same locker.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LockUpgrade {
    /// The held lock already covers the request.
    Existing,
    /// The held lock must be promoted to the given type.
    Promote(LockType),
}

/// Conflict matrix indexed by (requested, held).
pub fn conflict(requested: LockType, held: LockType) -> LockConflict {
    use LockConflict::{Allow, Block, Restart};
    use LockType::*;
    match (requested, held) {
        (Read, Read) | (Read, RangeRead) | (Read, RangeInsert) => Allow,
        (Read, Write) | (Read, RangeWrite) => Block,
        (Write, RangeInsert) => Allow,
        (Write, _) => Block,
        (RangeRead, Read) | (RangeRead, RangeRead) => Allow,
        (RangeRead, Write) | (RangeRead, RangeWrite) => Block,
        (RangeRead, RangeInsert) => Restart,
        (RangeWrite, RangeInsert) => Restart,
        (RangeWrite, _) => Block,
        (RangeInsert, Read) | (RangeInsert, Write) | (RangeInsert, RangeInsert) => Allow,
        (RangeInsert, RangeRead) | (RangeInsert, RangeWrite) => Block,
    }
}

/// Upgrade matrix indexed by (held, requested) for a single locker.
pub fn upgrade(held: LockType, requested: LockType) -> LockUpgrade {
    use LockType::*;
    if held == requested {
        return LockUpgrade::Existing;
    }
    match (held, requested) {
        (RangeInsert, other) => LockUpgrade::Promote(other),
        // Insert intent is only requested by fresh buddy lockers, so a held
        // record lock already covers it.
        (_, RangeInsert) => LockUpgrade::Existing,
        (held, requested) => {
            let write = held.is_write() || requested.is_write();
            let range = held.is_range() || requested.is_range();
            let combined = match (write, range) {
                (false, false) => Read,
                (true, false) => Write,
                (false, true) => RangeRead,
                (true, true) => RangeWrite,
            };
            if combined == held {
                LockUpgrade::Existing
            } else {
                LockUpgrade::Promote(combined)
            }
        }
    }
}
