//! Opaque identifiers used across the batcher.
//!
//! The original implementation orders ops by raw `RemoteTablet*` pointer
//! identity — the spec notes this "need only be a total order, not
//! semantic." [`TabletId`] replaces that pointer with an owned, hashable,
//! orderable value so the sort in the dispatch driver doesn't depend on
//! allocator behavior.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Identifies the table an operation targets.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableId(pub String);

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<S: Into<String>> From<S> for TableId {
    fn from(s: S) -> Self {
        TableId(s.into())
    }
}

/// Identifies the tablet (shard) that owns a partition key, as resolved by
/// the meta-cache.
///
/// Only equality and a total order are required by the batcher; the value
/// carried here is otherwise opaque to it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TabletId(pub String);

impl fmt::Display for TabletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<S: Into<String>> From<S> for TabletId {
    fn from(s: S) -> Self {
        TabletId(s.into())
    }
}

/// Identifies a single batcher instance, handed to
/// [`crate::session::SessionHandle::flush_finished`] in place of a raw
/// pointer to the batcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatcherId(u64);

impl fmt::Display for BatcherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "batcher#{}", self.0)
    }
}

static NEXT_BATCHER_ID: AtomicU64 = AtomicU64::new(1);

impl BatcherId {
    /// Allocates a fresh, process-unique batcher id.
    pub fn next() -> Self {
        BatcherId(NEXT_BATCHER_ID.fetch_add(1, Ordering::Relaxed))
    }
}
