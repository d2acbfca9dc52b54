//! In-memory collaborator doubles, in the style of the
//! `readyset-client-test-helpers` crate: enough of a fake meta-cache, RPC
//! layer, session, and transaction coordinator to drive a [`Batcher`]
//! end-to-end without a real tablet server.

use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use tablet_batcher_errors::{BatcherError, BatcherResult};

use crate::batcher::Batcher;
use crate::clock::HybridTime;
use crate::ids::{BatcherId, TableId, TabletId};
use crate::meta_cache::MetaCache;
use crate::op::{BatchableOp, OpKind};
use crate::rpc::{PerRowError, ReadConsistency, RpcClient, RpcOutcome};
use crate::session::SessionHandle;
use crate::transaction::{ReadyCallback, TransactionCoordinator};

/// A plain operation handle for tests: a fixed table, partition key (or
/// failure), op kind, and payload length, with an atomic slot recording any
/// hash code the batcher stamps onto it.
pub struct TestOp {
    table: TableId,
    partition_key: BatcherResult<Bytes>,
    kind: OpKind,
    payload_len: usize,
    tablet_hint: Option<TabletId>,
    carries_hash_code: bool,
    stamped_hash_code: AtomicU16,
}

impl TestOp {
    /// A well-formed op with the given partition key.
    pub fn new(table: impl Into<TableId>, partition_key: impl Into<Bytes>, kind: OpKind, payload_len: usize) -> Self {
        TestOp {
            table: table.into(),
            partition_key: Ok(partition_key.into()),
            kind,
            payload_len,
            tablet_hint: None,
            carries_hash_code: false,
            stamped_hash_code: AtomicU16::new(0),
        }
    }

    /// An op whose partition key derivation always fails, exercising the
    /// synchronous-failure path of [`Batcher::add`].
    pub fn failing_partition_key(table: impl Into<TableId>, err: BatcherError) -> Self {
        TestOp {
            table: table.into(),
            partition_key: Err(err),
            kind: OpKind::Write,
            payload_len: 0,
            tablet_hint: None,
            carries_hash_code: false,
            stamped_hash_code: AtomicU16::new(0),
        }
    }

    /// Skips the meta-cache lookup, as if this op already carried a
    /// resolved tablet.
    pub fn with_tablet_hint(mut self, tablet: impl Into<TabletId>) -> Self {
        self.tablet_hint = Some(tablet.into());
        self
    }

    /// Marks this op as carrying a hash-coded key, so `add` stamps the
    /// decoded hash code onto it.
    pub fn with_hash_code_support(mut self) -> Self {
        self.carries_hash_code = true;
        self
    }

    /// The hash code stamped by `add`, if any (0 if none has been stamped).
    pub fn stamped_hash_code(&self) -> u16 {
        self.stamped_hash_code.load(Ordering::Relaxed)
    }
}

impl BatchableOp for TestOp {
    fn table_id(&self) -> TableId {
        self.table.clone()
    }

    fn partition_key(&self) -> BatcherResult<Bytes> {
        self.partition_key.clone()
    }

    fn op_kind(&self) -> OpKind {
        self.kind
    }

    fn tablet_hint(&self) -> Option<TabletId> {
        self.tablet_hint.clone()
    }

    fn payload_len(&self) -> usize {
        self.payload_len
    }

    fn carries_hash_code(&self) -> bool {
        self.carries_hash_code
    }

    fn stamp_hash_code(&self, hash_code: u16) {
        self.stamped_hash_code.store(hash_code, Ordering::Relaxed);
    }
}

/// A [`MetaCache`] backed by a plain routing function, so tests can decide
/// per-key whether (and where) a lookup resolves.
pub struct FakeMetaCache {
    route: Box<dyn Fn(&TableId, &Bytes) -> BatcherResult<TabletId> + Send + Sync>,
    lookups: AtomicUsize,
}

impl FakeMetaCache {
    /// Builds a meta-cache from a routing function.
    pub fn new(route: impl Fn(&TableId, &Bytes) -> BatcherResult<TabletId> + Send + Sync + 'static) -> Self {
        FakeMetaCache {
            route: Box::new(route),
            lookups: AtomicUsize::new(0),
        }
    }

    /// A meta-cache that resolves every key to the same tablet.
    pub fn single_tablet(tablet: impl Into<TabletId>) -> Self {
        let tablet = tablet.into();
        FakeMetaCache::new(move |_table, _key| Ok(tablet.clone()))
    }

    /// The number of lookups performed so far.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MetaCache for FakeMetaCache {
    async fn lookup_tablet(&self, table: &TableId, partition_key: Bytes, _deadline: Instant) -> BatcherResult<TabletId> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        (self.route)(table, &partition_key)
    }
}

/// One segment as seen by [`FakeRpcClient`]: everything the dispatch driver
/// handed it in a single `send_write`/`send_read` call.
#[derive(Debug, Clone)]
pub struct DispatchedSegment {
    pub tablet: TabletId,
    pub is_write: bool,
    pub consistency: Option<ReadConsistency>,
    pub op_count: usize,
    /// Each op's partition key, in segment order — lets tests identify
    /// which ops landed in a segment, and in what order, without needing
    /// to downcast the type-erased op handles.
    pub row_keys: Vec<Bytes>,
}

/// An [`RpcClient`] that records every dispatched segment and answers with
/// an outcome produced by a configurable function.
pub struct FakeRpcClient {
    segments: Mutex<Vec<DispatchedSegment>>,
    outcome_for: Box<dyn Fn(&TabletId, bool) -> RpcOutcome + Send + Sync>,
}

impl FakeRpcClient {
    /// Builds an RPC client from an outcome-producing function.
    pub fn new(outcome_for: impl Fn(&TabletId, bool) -> RpcOutcome + Send + Sync + 'static) -> Self {
        FakeRpcClient {
            segments: Mutex::new(Vec::new()),
            outcome_for: Box::new(outcome_for),
        }
    }

    /// An RPC client that always succeeds, with no propagated clock.
    pub fn always_ok() -> Self {
        FakeRpcClient::new(|_tablet, _is_write| RpcOutcome::ok())
    }

    /// Every segment dispatched so far, in dispatch order observed by this
    /// client (note: with no write applied, segments from concurrently
    /// dispatched groups may interleave across calls to this method).
    pub fn dispatched(&self) -> Vec<DispatchedSegment> {
        self.segments.lock().unwrap().clone()
    }

    fn record(&self, tablet: TabletId, is_write: bool, consistency: Option<ReadConsistency>, ops: &[Arc<dyn BatchableOp>]) {
        let row_keys = ops.iter().map(|op| op.partition_key().unwrap_or_default()).collect();
        self.segments.lock().unwrap().push(DispatchedSegment {
            tablet,
            is_write,
            consistency,
            op_count: ops.len(),
            row_keys,
        });
    }
}

#[async_trait]
impl RpcClient for FakeRpcClient {
    async fn send_write(&self, tablet: TabletId, ops: Vec<Arc<dyn BatchableOp>>) -> RpcOutcome {
        self.record(tablet.clone(), true, None, &ops);
        (self.outcome_for)(&tablet, true)
    }

    async fn send_read(&self, tablet: TabletId, ops: Vec<Arc<dyn BatchableOp>>, consistency: ReadConsistency) -> RpcOutcome {
        self.record(tablet.clone(), false, Some(consistency), &ops);
        (self.outcome_for)(&tablet, false)
    }
}

/// Builds an [`RpcOutcome`] carrying one per-row failure at `row_index`,
/// leaving the rest of the segment as successfully delivered.
pub fn outcome_with_row_error(row_index: usize, status: BatcherError) -> RpcOutcome {
    RpcOutcome {
        status: Ok(()),
        per_row_errors: vec![PerRowError { row_index, status }],
        propagated_clock: None,
    }
}

/// An [`RpcOutcome`] carrying a propagated clock reading, as a successful
/// write response would.
pub fn outcome_with_clock(value: u64) -> RpcOutcome {
    RpcOutcome {
        status: Ok(()),
        per_row_errors: Vec::new(),
        propagated_clock: Some(HybridTime(value)),
    }
}

/// A [`SessionHandle`] that records every `flush_finished` notification.
#[derive(Default)]
pub struct FakeSessionHandle {
    notified: Mutex<Vec<BatcherId>>,
}

impl FakeSessionHandle {
    /// Creates an empty session handle.
    pub fn new() -> Self {
        FakeSessionHandle::default()
    }

    /// The ids of every batcher that has notified this session so far.
    pub fn notified(&self) -> Vec<BatcherId> {
        self.notified.lock().unwrap().clone()
    }
}

impl SessionHandle for FakeSessionHandle {
    fn flush_finished(&self, batcher: BatcherId) {
        self.notified.lock().unwrap().push(batcher);
    }
}

/// A [`TransactionCoordinator`] double that is either always ready, or
/// defers every `prepare` call until a test explicitly releases it via
/// [`release`](FakeTransactionCoordinator::release) — covering the
/// deferred-readiness scenario the synchronous-or-deferred contract exists
/// for.
#[derive(Default)]
pub struct FakeTransactionCoordinator {
    deferred: bool,
    ready_now: std::sync::atomic::AtomicBool,
    pending: Mutex<Option<ReadyCallback>>,
    flushed_calls: AtomicUsize,
}

impl FakeTransactionCoordinator {
    /// A coordinator that is ready immediately on every `prepare` call.
    pub fn ready_immediately() -> Self {
        FakeTransactionCoordinator::default()
    }

    /// A coordinator that defers every `prepare` call until `release` is
    /// called, at which point it becomes (and stays) ready.
    pub fn deferred() -> Self {
        FakeTransactionCoordinator {
            deferred: true,
            ready_now: std::sync::atomic::AtomicBool::new(false),
            pending: Mutex::new(None),
            flushed_calls: AtomicUsize::new(0),
        }
    }

    /// Marks this coordinator ready and invokes the pending `ready`
    /// callback, if `prepare` had deferred one. A no-op on a coordinator
    /// that was never deferred.
    pub fn release(&self, result: BatcherResult<()>) {
        self.ready_now.store(true, Ordering::Relaxed);
        if let Some(ready) = self.pending.lock().unwrap().take() {
            ready(result);
        }
    }

    /// How many times `flushed` has been called so far.
    pub fn flushed_calls(&self) -> usize {
        self.flushed_calls.load(Ordering::Relaxed)
    }
}

impl TransactionCoordinator for FakeTransactionCoordinator {
    fn prepare(&self, _ops: &[Arc<dyn BatchableOp>], ready: ReadyCallback) -> bool {
        if self.deferred && !self.ready_now.load(Ordering::Relaxed) {
            *self.pending.lock().unwrap() = Some(ready);
            false
        } else {
            true
        }
    }

    fn flushed(&self, _ops: &[Arc<dyn BatchableOp>], _status: &BatcherResult<()>, _propagated_clock: Option<HybridTime>) {
        self.flushed_calls.fetch_add(1, Ordering::Relaxed);
    }
}

/// Awaits `flush_async` and returns the status handed to its callback, for
/// tests that just want to block on completion.
pub async fn flush_and_wait(batcher: &Arc<Batcher>) -> BatcherResult<()> {
    let (tx, rx) = tokio::sync::oneshot::channel();
    batcher
        .flush_async(Box::new(move |status| {
            let _ = tx.send(status);
        }))
        .await;
    rx.await.expect("flush callback dropped without firing")
}
