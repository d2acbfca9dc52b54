//! End-to-end scenario tests against the in-memory collaborator doubles in
//! `test_support`, plus property-based checks of the conservation
//! invariant across randomized add/abort/flush sequences.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use proptest::prelude::*;
use test_strategy::proptest;
use tablet_batcher::op::{Consistency, OpKind, ReadStyle};
use tablet_batcher::test_support::{
    flush_and_wait, outcome_with_clock, outcome_with_row_error, DispatchedSegment, FakeMetaCache, FakeRpcClient,
    FakeSessionHandle, FakeTransactionCoordinator, TestOp,
};
use tablet_batcher::{
    Batcher, BatcherConfig, BatcherError, ErrorCollector, InlineCallbackExecutor, MetaCache, ObservedClock,
    RpcClient, SessionHandle, TableId, TabletId, TransactionCoordinator, VecErrorCollector,
};

struct Harness {
    batcher: Arc<Batcher>,
    rpc: Arc<FakeRpcClient>,
    collector: Arc<VecErrorCollector>,
    session: Arc<FakeSessionHandle>,
}

fn build(meta: FakeMetaCache, rpc: FakeRpcClient, transaction: Option<Arc<dyn TransactionCoordinator>>) -> Harness {
    let meta = Arc::new(meta);
    let rpc = Arc::new(rpc);
    let collector = Arc::new(VecErrorCollector::new());
    let session = Arc::new(FakeSessionHandle::new());
    let session_dyn: Arc<dyn SessionHandle> = session.clone();
    let meta_dyn: Arc<dyn MetaCache> = meta.clone();
    let rpc_dyn: Arc<dyn RpcClient> = rpc.clone();
    let collector_dyn: Arc<dyn ErrorCollector> = collector.clone();

    let batcher = Batcher::new(
        TableId::from("orders"),
        BatcherConfig::default(),
        meta_dyn,
        collector_dyn,
        rpc_dyn,
        transaction,
        Arc::downgrade(&session_dyn),
        ObservedClock::new(),
        Arc::new(InlineCallbackExecutor),
    );

    Harness {
        batcher,
        rpc,
        collector,
        session,
    }
}

fn write_op(key: &'static str, tablet: &'static str) -> Arc<TestOp> {
    Arc::new(TestOp::new("orders", Bytes::from_static(key.as_bytes()), OpKind::Write, 16).with_tablet_hint(tablet))
}

fn read_op(key: &'static str, tablet: &'static str, consistency: Consistency) -> Arc<TestOp> {
    Arc::new(
        TestOp::new(
            "orders",
            Bytes::from_static(key.as_bytes()),
            OpKind::Read {
                style: ReadStyle::Tabular,
                consistency,
            },
            8,
        )
        .with_tablet_hint(tablet),
    )
}

fn segment<'a>(segments: &'a [DispatchedSegment], tablet: &str, is_write: bool) -> Vec<&'a DispatchedSegment> {
    segments
        .iter()
        .filter(|s| s.tablet == TabletId::from(tablet) && s.is_write == is_write)
        .collect()
}

/// S1 — two tablets, mixed ops: exactly three segments, one per
/// `(tablet, op-group)` pair, with the leader-read to T1 strictly after
/// the write to T1.
#[tokio::test]
async fn s1_two_tablets_mixed_ops() {
    let h = build(FakeMetaCache::single_tablet("unused"), FakeRpcClient::always_ok(), None);

    h.batcher.add(write_op("w1", "T1")).await.unwrap();
    h.batcher.add(write_op("w2", "T2")).await.unwrap();
    h.batcher.add(read_op("r1", "T1", Consistency::Strong)).await.unwrap();

    let status = flush_and_wait(&h.batcher).await;
    assert!(status.is_ok());

    let dispatched = h.rpc.dispatched();
    assert_eq!(dispatched.len(), 3, "expected one RPC per (tablet, op-group) segment");

    let t1_writes = segment(&dispatched, "T1", true);
    let t1_reads = segment(&dispatched, "T1", false);
    let t2_writes = segment(&dispatched, "T2", true);
    assert_eq!(t1_writes.len(), 1);
    assert_eq!(t1_reads.len(), 1);
    assert_eq!(t2_writes.len(), 1);
    assert_eq!(t1_writes[0].row_keys, vec![Bytes::from_static(b"w1")]);
    assert_eq!(t1_reads[0].row_keys, vec![Bytes::from_static(b"r1")]);
    assert_eq!(t2_writes[0].row_keys, vec![Bytes::from_static(b"w2")]);

    assert!(h.collector.is_empty());
    assert_eq!(h.session.notified().len(), 1);
}

/// S2 — consistent-prefix split: leader reads land in one segment ahead of
/// the consistent-prefix segment, preserving add order within each.
#[tokio::test]
async fn s2_consistent_prefix_split() {
    let h = build(FakeMetaCache::single_tablet("unused"), FakeRpcClient::always_ok(), None);

    h.batcher.add(read_op("r1", "T1", Consistency::Strong)).await.unwrap();
    h.batcher
        .add(read_op("r2", "T1", Consistency::ConsistentPrefix))
        .await
        .unwrap();
    h.batcher.add(read_op("r3", "T1", Consistency::Strong)).await.unwrap();

    assert!(flush_and_wait(&h.batcher).await.is_ok());

    let dispatched = h.rpc.dispatched();
    assert_eq!(dispatched.len(), 2);
    let leader = dispatched.iter().find(|s| s.row_keys.len() == 2).expect("leader segment");
    let prefix = dispatched.iter().find(|s| s.row_keys.len() == 1).expect("prefix segment");
    assert_eq!(leader.row_keys, vec![Bytes::from_static(b"r1"), Bytes::from_static(b"r3")]);
    assert_eq!(prefix.row_keys, vec![Bytes::from_static(b"r2")]);
}

/// S3 — lookup failure mid-batch: the failing op never reaches an RPC, its
/// failure lands in the collector, the rest dispatch normally, and the
/// callback reports the generic aggregate status.
#[tokio::test]
async fn s3_lookup_failure_mid_batch() {
    let meta = FakeMetaCache::new(|_table, key| {
        if key.as_ref() == b"b" {
            Err(BatcherError::TabletLookupFailed("no tablet owns this key".into()))
        } else {
            Ok(TabletId::from("T1"))
        }
    });
    let h = build(meta, FakeRpcClient::always_ok(), None);

    let a = Arc::new(TestOp::new("orders", Bytes::from_static(b"a"), OpKind::Write, 16));
    let b = Arc::new(TestOp::new("orders", Bytes::from_static(b"b"), OpKind::Write, 16));
    let c = Arc::new(TestOp::new("orders", Bytes::from_static(b"c"), OpKind::Write, 16));
    h.batcher.add(a).await.unwrap();
    h.batcher.add(b).await.unwrap();
    h.batcher.add(c).await.unwrap();

    let status = flush_and_wait(&h.batcher).await;
    assert_eq!(status, Err(BatcherError::SomeErrorsOccurred));

    let dispatched = h.rpc.dispatched();
    assert_eq!(dispatched.len(), 1);
    assert_eq!(
        dispatched[0].row_keys,
        vec![Bytes::from_static(b"a"), Bytes::from_static(b"c")]
    );

    let errors = h.collector.drain();
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0].status, BatcherError::TabletLookupFailed(_)));
}

/// S4 — abort during gathering: both ops eventually land in the error
/// collector with an aborted status, regardless of whether their lookup
/// had already resolved when `abort` was called.
#[tokio::test]
async fn s4_abort_during_gathering() {
    let h = build(FakeMetaCache::single_tablet("T1"), FakeRpcClient::always_ok(), None);

    h.batcher.add(write_op("a", "T1")).await.unwrap();
    h.batcher.add(write_op("b", "T1")).await.unwrap();

    h.batcher.abort(BatcherError::Aborted("session closing".into()));

    // Give the spawned lookups (now racing against an aborted batcher) a
    // chance to run.
    tokio::task::yield_now().await;
    tokio::task::yield_now().await;

    assert_eq!(h.batcher.lifecycle_state(), tablet_batcher::LifecycleState::Aborted);
    assert!(!h.batcher.has_pending_operations());

    let errors = h.collector.drain();
    assert_eq!(errors.len(), 2);
    assert!(errors.iter().all(|e| matches!(e.status, BatcherError::Aborted(_))));
    assert!(h.rpc.dispatched().is_empty());
}

/// S5 — per-row write error: the failing row is recorded individually; the
/// rest of the segment is treated as delivered.
#[tokio::test]
async fn s5_per_row_write_error() {
    let rpc = FakeRpcClient::new(|_tablet, is_write| {
        if is_write {
            outcome_with_row_error(1, BatcherError::RowError("constraint violation".into()))
        } else {
            unreachable!("scenario has no reads")
        }
    });
    let h = build(FakeMetaCache::single_tablet("T1"), rpc, None);

    h.batcher.add(write_op("w1", "T1")).await.unwrap();
    h.batcher.add(write_op("w2", "T1")).await.unwrap();
    h.batcher.add(write_op("w3", "T1")).await.unwrap();

    let status = flush_and_wait(&h.batcher).await;
    assert_eq!(status, Err(BatcherError::SomeErrorsOccurred));

    let errors = h.collector.drain();
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0].status, BatcherError::RowError(_)));
}

/// S6 — transaction not-ready gate: no RPC is emitted until the
/// coordinator signals readiness, after which dispatch proceeds normally
/// and `flushed` is invoked once per segment.
#[tokio::test]
async fn s6_transaction_not_ready_gate() {
    let transaction = Arc::new(FakeTransactionCoordinator::deferred());
    let transaction_dyn: Arc<dyn TransactionCoordinator> = transaction.clone();
    let h = build(
        FakeMetaCache::single_tablet("T1"),
        FakeRpcClient::always_ok(),
        Some(transaction_dyn),
    );

    h.batcher.add(write_op("a", "T1")).await.unwrap();
    h.batcher.add(write_op("b", "T1")).await.unwrap();
    h.batcher.add(write_op("c", "T1")).await.unwrap();

    let (tx, rx) = tokio::sync::oneshot::channel();
    let flush_task = {
        let batcher = h.batcher.clone();
        tokio::spawn(async move {
            batcher
                .flush_async(Box::new(move |status| {
                    let _ = tx.send(status);
                }))
                .await;
        })
    };

    // Let the flush reach the gate and confirm nothing dispatched yet.
    tokio::task::yield_now().await;
    tokio::task::yield_now().await;
    assert!(h.rpc.dispatched().is_empty());

    transaction.release(Ok(()));
    flush_task.await.unwrap();
    let status = rx.await.unwrap();
    assert!(status.is_ok());

    assert_eq!(h.rpc.dispatched().len(), 1);
    assert_eq!(transaction.flushed_calls(), 1);
}

/// A write RPC's propagated clock reading advances the batcher's observed
/// clock, and never regresses it.
#[tokio::test]
async fn write_success_advances_observed_clock() {
    let rpc = FakeRpcClient::new(|_tablet, _is_write| outcome_with_clock(42));
    let h = build(FakeMetaCache::single_tablet("T1"), rpc, None);

    h.batcher.add(write_op("a", "T1")).await.unwrap();
    assert!(flush_and_wait(&h.batcher).await.is_ok());

    assert_eq!(h.batcher.clock().current(), tablet_batcher::HybridTime(42));
}

/// Buffer-size enforcement: an op whose payload would push
/// `buffer_bytes_used` past `max_buffer_size` is rejected synchronously and
/// never registered.
#[tokio::test]
async fn add_rejects_ops_exceeding_buffer_size() {
    let mut config = BatcherConfig::default();
    config.max_buffer_size = 10;
    let meta: Arc<dyn MetaCache> = Arc::new(FakeMetaCache::single_tablet("T1"));
    let rpc: Arc<dyn RpcClient> = Arc::new(FakeRpcClient::always_ok());
    let collector: Arc<dyn ErrorCollector> = Arc::new(VecErrorCollector::new());
    let session: Arc<dyn SessionHandle> = Arc::new(FakeSessionHandle::new());
    let batcher = Batcher::new(
        TableId::from("orders"),
        config,
        meta,
        collector,
        rpc,
        None,
        Arc::downgrade(&session),
        ObservedClock::new(),
        Arc::new(InlineCallbackExecutor),
    );

    let op = Arc::new(TestOp::new("orders", Bytes::from_static(b"too-big"), OpKind::Write, 64));
    let err = batcher.add(op).await.unwrap_err();
    assert!(matches!(err, BatcherError::BufferSizeExceeded { .. }));
    assert_eq!(batcher.count_buffered_operations(), 0);
}

fn key_of(bytes: &Bytes) -> usize {
    std::str::from_utf8(bytes).unwrap().parse().unwrap()
}

/// Invariant 1 (conservation): for any sequence of adds against a single
/// tablet with some keys doomed to fail lookup, followed by a flush, every
/// added key ends up in exactly one of {error collector, dispatched RPC} —
/// never both, never neither.
#[proptest]
fn conservation_holds_for_random_batches(
    #[strategy(prop::collection::hash_set(0usize..20, 0..5))] fail_keys: HashSet<usize>,
    #[strategy(prop::collection::vec(0usize..20, 1..20))] keys: Vec<usize>,
) {
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
    runtime.block_on(async move {
        let meta = FakeMetaCache::new(move |_table, key| {
            if fail_keys.contains(&key_of(key)) {
                Err(BatcherError::TabletLookupFailed("synthetic failure".into()))
            } else {
                Ok(TabletId::from("T1"))
            }
        });
        let h = build(meta, FakeRpcClient::always_ok(), None);

        for key in &keys {
            let op = Arc::new(TestOp::new("orders", Bytes::from(key.to_string()), OpKind::Write, 8));
            h.batcher.add(op).await.unwrap();
        }

        flush_and_wait(&h.batcher).await.ok();

        let dispatched_keys: HashSet<usize> = h
            .rpc
            .dispatched()
            .iter()
            .flat_map(|s| s.row_keys.iter())
            .map(key_of)
            .collect();
        let failed_keys: HashSet<usize> = h
            .collector
            .drain()
            .into_iter()
            .map(|e| key_of(&e.op.partition_key().unwrap()))
            .collect();

        assert!(dispatched_keys.is_disjoint(&failed_keys));
        for key in &keys {
            assert!(
                dispatched_keys.contains(key) || failed_keys.contains(key),
                "key {key} accounted for in neither the collector nor a dispatched RPC",
            );
        }
        assert_eq!(h.batcher.lifecycle_state(), tablet_batcher::LifecycleState::Flushed);
        assert!(!h.batcher.has_pending_operations());
    });
}

/// Invariant 3 (ordering): within a single `(tablet, op-group)` segment,
/// ops are dispatched in the order they were added, regardless of how many
/// unrelated tablets and op-groups are interleaved in between.
#[proptest]
fn ordering_holds_within_tablet_and_group(
    #[strategy(prop::collection::vec(0usize..20, 1..20))] keys: Vec<usize>,
    #[strategy(prop::collection::vec(0usize..3, 1..20))] tablet_choices: Vec<usize>,
) {
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
    runtime.block_on(async move {
        let h = build(FakeMetaCache::single_tablet("unused"), FakeRpcClient::always_ok(), None);
        let tablets = ["T1", "T2", "T3"];

        let mut expected: std::collections::HashMap<&str, Vec<usize>> = std::collections::HashMap::new();
        for (i, key) in keys.iter().enumerate() {
            let tablet = tablets[tablet_choices[i % tablet_choices.len()] % tablets.len()];
            h.batcher.add(write_op_owned(*key, tablet)).await.unwrap();
            expected.entry(tablet).or_default().push(*key);
        }

        assert!(flush_and_wait(&h.batcher).await.is_ok());

        for (tablet, expected_keys) in expected {
            let dispatched = h.rpc.dispatched();
            let segments = segment(&dispatched, tablet, true);
            assert_eq!(segments.len(), 1, "expected exactly one write segment for {tablet}");
            let actual_keys: Vec<usize> = segments[0].row_keys.iter().map(key_of).collect();
            assert_eq!(actual_keys, expected_keys, "ops within a (tablet, group) segment must preserve add order");
        }
    });
}

fn write_op_owned(key: usize, tablet: &'static str) -> Arc<TestOp> {
    Arc::new(TestOp::new("orders", Bytes::from(key.to_string()), OpKind::Write, 8).with_tablet_hint(tablet))
}
