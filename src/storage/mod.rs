//! Storage engine: the ordered record trees behind every database handle.

/// B-tree data structure implementation.
pub mod btree;
