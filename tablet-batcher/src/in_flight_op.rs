//! Per-operation state held by the batcher while an op is in flight.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::ids::TabletId;
use crate::op::BatchableOp;

/// An in-flight op's lifecycle state.
///
/// There is no explicit "done" state: removal from the batcher's `ops` set
/// *is* completion, whether by success or failure (invariant 3 in the
/// design docs).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InFlightState {
    /// Waiting on the meta-cache to resolve a tablet for this op's
    /// partition key.
    LookingUpTablet,
    /// Resolved and sitting in `ops_queue`, waiting for (or already part
    /// of) an RPC to its tablet.
    BufferedToTabletServer,
}

/// The mutable part of an in-flight op, guarded by its own lock.
///
/// Per the lock-ordering rule, this lock is only ever acquired while the
/// batcher-wide lock is already held, never the other way around.
#[derive(Debug)]
struct OpCell {
    state: InFlightState,
    tablet: Option<TabletId>,
}

/// A single operation the batcher owns between `Add` and its removal from
/// the in-flight set.
pub struct InFlightOp {
    /// The user-facing handle. Shared with the caller; the batcher treats
    /// it as read-only apart from the hash-code stamp applied in `Add`.
    pub op: Arc<dyn BatchableOp>,
    /// The partition key derived from `op` at insertion time.
    pub partition_key: Bytes,
    /// Unique within the owning batcher; assigned on insertion and used as
    /// the dispatch driver's tie-breaker sort key.
    pub sequence_number: u64,
    /// `op.payload_len()`, captured at insertion so `buffer_bytes_used` can
    /// be decremented without re-invoking the op once it may have already
    /// been handed to an RPC.
    pub payload_len: usize,
    cell: Mutex<OpCell>,
}

impl InFlightOp {
    pub(crate) fn new(
        op: Arc<dyn BatchableOp>,
        partition_key: Bytes,
        sequence_number: u64,
        payload_len: usize,
    ) -> Self {
        InFlightOp {
            op,
            partition_key,
            sequence_number,
            payload_len,
            cell: Mutex::new(OpCell {
                state: InFlightState::LookingUpTablet,
                tablet: None,
            }),
        }
    }

    /// The op's current state.
    pub fn state(&self) -> InFlightState {
        self.cell.lock().state
    }

    /// The resolved tablet, if lookup has completed successfully.
    pub fn tablet(&self) -> Option<TabletId> {
        self.cell.lock().tablet.clone()
    }

    /// Transitions this op from `LookingUpTablet` to `BufferedToTabletServer`
    /// once a tablet has been resolved.
    ///
    /// Returns an error if the op was not in the expected state — the
    /// original `CHECK_EQ`s this; here it surfaces as an internal error
    /// instead of aborting the process.
    pub(crate) fn mark_buffered(&self, tablet: TabletId) -> Result<(), &'static str> {
        let mut cell = self.cell.lock();
        if cell.state != InFlightState::LookingUpTablet {
            return Err("op was not LookingUpTablet when tablet lookup completed");
        }
        cell.state = InFlightState::BufferedToTabletServer;
        cell.tablet = Some(tablet);
        Ok(())
    }
}

impl std::fmt::Debug for InFlightOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cell = self.cell.lock();
        f.debug_struct("InFlightOp")
            .field("sequence_number", &self.sequence_number)
            .field("state", &cell.state)
            .field("tablet", &cell.tablet)
            .finish()
    }
}
