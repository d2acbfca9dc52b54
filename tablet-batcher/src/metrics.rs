//! Metric key names and small helpers, in the style of
//! `readyset_client::metrics::recorded` (imported directly by name
//! elsewhere, e.g. `readyset/src/lib.rs`).

/// Metric key name constants recorded by the batcher.
pub mod recorded {
    /// Counter: total ops added via `Add`.
    pub const BATCHER_OPS_ADDED: &str = "tablet_batcher.ops_added";
    /// Counter: ops dispatched, labeled by op-group.
    pub const BATCHER_OPS_DISPATCHED: &str = "tablet_batcher.ops_dispatched";
    /// Counter: RPCs emitted by the dispatch driver.
    pub const BATCHER_RPCS_EMITTED: &str = "tablet_batcher.rpcs_emitted";
    /// Histogram: RPC latency in seconds, from emission to result ingestion.
    pub const BATCHER_RPC_LATENCY_SECONDS: &str = "tablet_batcher.rpc_latency_seconds";
    /// Counter: batchers that completed a flush with at least one error.
    pub const BATCHER_FLUSHES_WITH_ERRORS: &str = "tablet_batcher.flushes_with_errors";
    /// Gauge: bytes currently accounted against `max_buffer_size`.
    pub const BATCHER_BUFFER_BYTES_USED: &str = "tablet_batcher.buffer_bytes_used";
}

/// Labels an op-group for metric label values.
pub fn op_group_label(group: crate::op::OpGroup) -> &'static str {
    match group {
        crate::op::OpGroup::Write => "write",
        crate::op::OpGroup::LeaderRead => "leader_read",
        crate::op::OpGroup::ConsistentPrefixRead => "consistent_prefix_read",
    }
}
