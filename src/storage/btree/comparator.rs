use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// Total order over byte keys, injected per tree.
///
/// Implementations must be stable and side-effect free; the same order is
/// used for keys and, separately configured, for duplicate data.
pub trait KeyOrder: Send + Sync {
    /// Compares two keys.
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    /// Name reported in diagnostics.
    fn name(&self) -> &str {
        "custom"
    }
}

/// Shared handle to a key order.
pub type SharedOrder = Arc<dyn KeyOrder>;

/// Unsigned lexicographic byte order.
#[derive(Copy, Clone, Debug, Default)]
pub struct ByteOrder;

impl KeyOrder for ByteOrder {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn name(&self) -> &str {
        "bytes"
    }
}

/// Key order backed by a closure.
pub struct FnOrder<F> {
    name: &'static str,
    f: F,
}

impl<F> FnOrder<F>
where
    F: Fn(&[u8], &[u8]) -> Ordering + Send + Sync,
{
    /// Wraps `f` under `name`.
    pub fn new(name: &'static str, f: F) -> Self {
        Self { name, f }
    }
}

impl<F> KeyOrder for FnOrder<F>
where
    F: Fn(&[u8], &[u8]) -> Ordering + Send + Sync,
{
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        (self.f)(a, b)
    }

    fn name(&self) -> &str {
        self.name
    }
}

impl<F> fmt::Debug for FnOrder<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnOrder").field("name", &self.name).finish()
    }
}

/// Default shared order.
pub fn byte_order() -> SharedOrder {
    Arc::new(ByteOrder)
}
