//! The async RPC layer collaborator: sends one write or read RPC per
//! dispatched segment.

use std::sync::Arc;

use async_trait::async_trait;
use tablet_batcher_errors::{BatcherError, BatcherResult};

use crate::clock::HybridTime;
use crate::ids::TabletId;
use crate::op::BatchableOp;

/// Which replica-selection policy a read RPC should use. Writes always go
/// to the leader, so there is no write analogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadConsistency {
    /// Default consistency: must be served by the tablet leader.
    Leader,
    /// May be served by a follower replica.
    ConsistentPrefix,
}

/// A failure reported against one row within an otherwise-ok (or
/// otherwise-failed) segment, carrying the row's index into the segment's op
/// list.
#[derive(Debug, Clone)]
pub struct PerRowError {
    /// Index into the segment's op list this error applies to.
    pub row_index: usize,
    /// Why that row failed.
    pub status: BatcherError,
}

/// The result of one dispatched RPC.
#[derive(Debug, Clone)]
pub struct RpcOutcome {
    /// The overall transport status. `Err` means every op in the segment
    /// failed; `Ok` means the RPC was delivered, though individual rows may
    /// still have failed (see `per_row_errors`).
    pub status: BatcherResult<()>,
    /// Per-row failures. Only ever populated on write RPCs in the original
    /// (spec open question #3); read RPCs always leave this empty here.
    pub per_row_errors: Vec<PerRowError>,
    /// The server's propagated hybrid-time clock reading, if the response
    /// carried one. Only meaningful for write RPCs.
    pub propagated_clock: Option<HybridTime>,
}

impl RpcOutcome {
    /// A bare success outcome with no per-row errors and no propagated
    /// clock reading.
    pub fn ok() -> Self {
        RpcOutcome {
            status: Ok(()),
            per_row_errors: Vec::new(),
            propagated_clock: None,
        }
    }

    /// A bare transport failure.
    pub fn failed(err: BatcherError) -> Self {
        RpcOutcome {
            status: Err(err),
            per_row_errors: Vec::new(),
            propagated_clock: None,
        }
    }
}

/// Sends the write/read RPCs the dispatch driver emits, one per contiguous
/// `(tablet, op-group)` segment.
#[async_trait]
pub trait RpcClient: Send + Sync {
    /// Sends a write RPC for `ops`, all destined for `tablet`.
    async fn send_write(&self, tablet: TabletId, ops: Vec<Arc<dyn BatchableOp>>) -> RpcOutcome;

    /// Sends a read RPC for `ops`, all destined for `tablet`, with the
    /// given replica-selection policy.
    async fn send_read(
        &self,
        tablet: TabletId,
        ops: Vec<Arc<dyn BatchableOp>>,
        consistency: ReadConsistency,
    ) -> RpcOutcome;
}
