//! The error collector collaborator: accumulates per-op failures for later
//! retrieval by the session's caller.

use std::sync::Arc;

use parking_lot::Mutex;
use tablet_batcher_errors::BatcherError;

use crate::op::BatchableOp;

/// Accumulates per-operation failures.
///
/// The batcher never surfaces individual errors through the flush
/// callback (see the error propagation policy in the design docs); callers
/// retrieve them from here instead.
pub trait ErrorCollector: Send + Sync {
    /// Records that `op` failed with `status`.
    fn add_error(&self, op: Arc<dyn BatchableOp>, status: BatcherError);
}

/// A single recorded failure.
pub struct CollectedError {
    /// The op that failed.
    pub op: Arc<dyn BatchableOp>,
    /// Why it failed.
    pub status: BatcherError,
}

/// An in-memory [`ErrorCollector`] suitable for tests and for simple
/// single-session callers.
#[derive(Default)]
pub struct VecErrorCollector {
    errors: Mutex<Vec<CollectedError>>,
}

impl VecErrorCollector {
    /// Creates an empty collector.
    pub fn new() -> Self {
        VecErrorCollector::default()
    }

    /// Drains and returns every error recorded so far.
    pub fn drain(&self) -> Vec<CollectedError> {
        std::mem::take(&mut *self.errors.lock())
    }

    /// The number of errors recorded so far, without draining them.
    pub fn len(&self) -> usize {
        self.errors.lock().len()
    }

    /// Whether no errors have been recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ErrorCollector for VecErrorCollector {
    fn add_error(&self, op: Arc<dyn BatchableOp>, status: BatcherError) {
        self.errors.lock().push(CollectedError { op, status });
    }
}
