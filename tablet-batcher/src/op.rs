//! The operation handle the batcher accepts, and the classification logic
//! used to group operations for dispatch.
//!
//! The original implementation switches on a closed set of `YBOperation`
//! subclasses (`QL_READ`, `QL_WRITE`, `REDIS_READ`, `REDIS_WRITE`). Rust
//! favors a trait at that seam over a class hierarchy (see `REDESIGN FLAGS`
//! in the design docs): [`BatchableOp`] is the single interface the batcher
//! needs, and [`OpKind`] is the sum type that replaces the switch.

use bytes::Bytes;
use tablet_batcher_errors::BatcherResult;

use crate::ids::TableId;
use crate::ids::TabletId;

/// Whether a read operation follows "tabular" semantics (a declared
/// consistency level) or "key-value" semantics (consistency is governed by
/// the process-wide follower-read flag).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStyle {
    /// A SQL-like read with an explicit per-statement consistency level.
    Tabular,
    /// A key-value read, gated only by the global
    /// `allow_reads_from_followers` flag.
    KeyValue,
}

/// The consistency level declared on a tabular read. Irrelevant for writes
/// and for key-value reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consistency {
    /// Must be served by the tablet's current leader.
    Strong,
    /// May be served by a follower replica.
    ConsistentPrefix,
}

/// The operation shape, used to decide both hash-code stamping behavior and
/// op-group classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// A write (insert/update/delete); always dispatched as a write RPC.
    Write,
    /// A read, with the style and declared consistency needed to classify
    /// it into [`crate::op::OpGroup::LeaderRead`] or
    /// [`crate::op::OpGroup::ConsistentPrefixRead`].
    Read {
        /// Read style (tabular vs key-value).
        style: ReadStyle,
        /// The statement's declared consistency (ignored for key-value
        /// reads).
        consistency: Consistency,
    },
}

impl OpKind {
    /// Whether this op is read-only.
    pub fn is_read(&self) -> bool {
        matches!(self, OpKind::Read { .. })
    }
}

/// The classification the dispatch driver groups and sorts operations by.
///
/// Ordering matters: it is the dispatch driver's secondary sort key, and
/// the discriminant values below must stay in the order `Write < LeaderRead
/// < ConsistentPrefixRead` to match the original's `OpGroup` enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OpGroup {
    /// Any non-read operation.
    Write = 0,
    /// A read that must be served by the tablet leader.
    LeaderRead = 1,
    /// A read that may be served by a follower replica.
    ConsistentPrefixRead = 2,
}

/// Classifies an op into its [`OpGroup`], given the current value of the
/// process-wide `allow_reads_from_followers` flag.
pub fn classify(kind: OpKind, allow_reads_from_followers: bool) -> OpGroup {
    match kind {
        OpKind::Write => OpGroup::Write,
        OpKind::Read { style, consistency } => {
            let consistent_prefix = match style {
                ReadStyle::KeyValue => allow_reads_from_followers,
                ReadStyle::Tabular => consistency == Consistency::ConsistentPrefix,
            };
            if consistent_prefix {
                OpGroup::ConsistentPrefixRead
            } else {
                OpGroup::LeaderRead
            }
        }
    }
}

/// The opaque, user-facing operation handle the batcher accepts via
/// [`crate::batcher::Batcher::add`].
///
/// Implementations are shared with the caller (held both by the batcher and
/// by whatever produced the op), so every method here takes `&self`;
/// [`stamp_hash_code`](BatchableOp::stamp_hash_code) is the sole exception
/// to read-only access and must be implemented with interior mutability
/// (an `AtomicU16`, a `Cell`, etc.) — exactly as the original stamps a hash
/// code onto a `shared_ptr<YBOperation>` still held by the caller.
pub trait BatchableOp: Send + Sync + 'static {
    /// The table this operation targets.
    fn table_id(&self) -> TableId;

    /// Derives the partition key for this row. A decoding failure here is
    /// the only error `Add` returns synchronously.
    fn partition_key(&self) -> BatcherResult<Bytes>;

    /// The operation's shape, used for op-group classification.
    fn op_kind(&self) -> OpKind;

    /// If the op already carries a resolved tablet (the "fast path" in
    /// `Add`), returns it so the batcher can skip the meta-cache lookup.
    fn tablet_hint(&self) -> Option<TabletId> {
        None
    }

    /// Approximate wire size of this operation's payload, used against
    /// `max_buffer_size`.
    fn payload_len(&self) -> usize;

    /// Whether this op's type carries a hash-coded key that should be
    /// stamped on insertion (`QL_READ`/`QL_WRITE`/`REDIS_READ`/
    /// `REDIS_WRITE` in the original; everything else leaves this `false`).
    fn carries_hash_code(&self) -> bool {
        false
    }

    /// Stamps a hash code decoded from the partition key onto this op.
    /// Only called when [`carries_hash_code`](Self::carries_hash_code) is
    /// true and the partition key is non-empty.
    fn stamp_hash_code(&self, _hash_code: u16) {}
}

/// Decodes a hash code from a partition key, the way
/// `PartitionSchema::DecodeMultiColumnHashValue` does in the original: the
/// hash code is carried in the key's first two bytes, big-endian.
pub fn decode_multi_column_hash_value(partition_key: &[u8]) -> u16 {
    match partition_key {
        [hi, lo, ..] => u16::from_be_bytes([*hi, *lo]),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_is_always_write_group() {
        assert_eq!(classify(OpKind::Write, true), OpGroup::Write);
        assert_eq!(classify(OpKind::Write, false), OpGroup::Write);
    }

    #[test]
    fn key_value_read_follows_global_flag() {
        let kind = OpKind::Read {
            style: ReadStyle::KeyValue,
            consistency: Consistency::Strong,
        };
        assert_eq!(classify(kind, false), OpGroup::LeaderRead);
        assert_eq!(classify(kind, true), OpGroup::ConsistentPrefixRead);
    }

    #[test]
    fn tabular_read_follows_declared_consistency() {
        let strong = OpKind::Read {
            style: ReadStyle::Tabular,
            consistency: Consistency::Strong,
        };
        let prefix = OpKind::Read {
            style: ReadStyle::Tabular,
            consistency: Consistency::ConsistentPrefix,
        };
        // The global flag must not affect tabular reads.
        assert_eq!(classify(strong, true), OpGroup::LeaderRead);
        assert_eq!(classify(prefix, false), OpGroup::ConsistentPrefixRead);
    }

    #[test]
    fn op_group_ordering_matches_dispatch_priority() {
        assert!(OpGroup::Write < OpGroup::LeaderRead);
        assert!(OpGroup::LeaderRead < OpGroup::ConsistentPrefixRead);
    }

    #[test]
    fn hash_code_decoding_is_big_endian_prefix() {
        assert_eq!(decode_multi_column_hash_value(&[0x01, 0x02, 0xff]), 0x0102);
        assert_eq!(decode_multi_column_hash_value(&[0x01]), 0);
        assert_eq!(decode_multi_column_hash_value(&[]), 0);
    }
}
