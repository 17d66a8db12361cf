#![forbid(unsafe_code)]

//! In-memory B-tree: latched leaves, record nodes, duplicate sets and the
//! node cursor that walks them.

mod bin;
pub mod comparator;
mod latch;
pub(crate) mod node_cursor;
mod stats;
mod tree;

pub use comparator::{byte_order, ByteOrder, FnOrder, KeyOrder, SharedOrder};
pub use latch::latches_held;
pub(crate) use node_cursor::{step, NodeCursorImpl, SearchFlags, Step};
pub use node_cursor::SearchMode;
pub use stats::{TreeStats, TreeStatsSnapshot};
pub use tree::{NodeIds, Tree, TreeConfig, TreeSummary, DEFAULT_MAX_ENTRIES_PER_BIN};
