//! The optional distributed-transaction coordinator a batcher may be bound
//! to.

use std::sync::Arc;

use tablet_batcher_errors::BatcherResult;

use crate::clock::HybridTime;
use crate::op::BatchableOp;

/// A boxed, one-shot continuation a [`TransactionCoordinator`] invokes once
/// it becomes ready to let a deferred flush proceed.
pub type ReadyCallback = Box<dyn FnOnce(BatcherResult<()>) + Send>;

/// Prepares per-batch transactional metadata before RPCs for the batch can
/// be sent, and is notified once each segment has actually been flushed.
///
/// `prepare` mirrors the original's synchronous-ready-or-deferred contract:
/// returning `true` means the batch may dispatch immediately; returning
/// `false` means the coordinator has taken ownership of `ready` and will
/// invoke it exactly once, from any thread, once preparation completes.
pub trait TransactionCoordinator: Send + Sync {
    /// Attempts to prepare metadata for the given ops. Returns `true` if
    /// ready immediately; otherwise takes ownership of `ready` and invokes
    /// it later.
    fn prepare(&self, ops: &[Arc<dyn BatchableOp>], ready: ReadyCallback) -> bool;

    /// Notifies the coordinator that a dispatched segment has completed,
    /// carrying the RPC's status and any propagated clock reading.
    fn flushed(
        &self,
        ops: &[Arc<dyn BatchableOp>],
        status: &BatcherResult<()>,
        propagated_clock: Option<HybridTime>,
    );
}
