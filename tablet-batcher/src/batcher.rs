//! The batcher core: accumulates operations against a single table,
//! resolves each to a tablet, and dispatches them grouped into as few RPCs
//! as the resolved tablets and op-groups allow.
//!
//! This is the direct analogue of `readyset-client/src/table.rs`'s
//! `Table`/`TableHandle` dispatch path: accept requests, resolve each to a
//! shard, group by shard, and drive one `tower::Service` call per group.
//! Where that dispatch path resolves shards synchronously from an
//! in-memory map, this batcher resolves tablets asynchronously per op and
//! must cope with lookups completing out of order and after an abort —
//! which is most of what makes this module larger than its model.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tablet_batcher_errors::{internal, BatcherError, BatcherResult};
use tracing::{debug, debug_span, error, trace, warn};
use tracing_futures::Instrument;

use crate::callback::{CallbackExecutor, FlushCallback};
use crate::clock::ObservedClock;
use crate::config::{BatcherConfig, GlobalFlags};
use crate::error_collector::ErrorCollector;
use crate::ids::{BatcherId, TableId, TabletId};
use crate::in_flight_op::{InFlightOp, InFlightState};
use crate::meta_cache::MetaCache;
use crate::metrics::{op_group_label, recorded};
use crate::op::{classify, decode_multi_column_hash_value, BatchableOp, OpGroup};
use crate::rpc::{ReadConsistency, RpcClient, RpcOutcome};
use crate::session::SessionHandle;
use crate::transaction::TransactionCoordinator;

/// Where a batcher sits in its one-way lifecycle.
///
/// Mirrors the original's `BatcherState` enum; there is no "destroyed"
/// state here because the batcher's memory lifetime is governed by `Arc`
/// rather than by explicit bookkeeping (see the design docs' resolution of
/// the destruction-race open question).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Accepting new ops via [`Batcher::add`].
    Gathering,
    /// `flush_async` has been called; waiting for outstanding lookups and
    /// dispatched RPCs to finish.
    Flushing,
    /// Every op has been removed from the in-flight set and the flush
    /// callback has been invoked (or is about to be).
    Flushed,
    /// `abort` has been called. No further dispatch occurs; ops still
    /// arriving from in-flight lookups are failed immediately.
    Aborted,
}

/// The batcher-wide lock's contents (invariant 4: the op-lock is only ever
/// taken while this lock is already held, never the reverse).
struct BatcherState {
    lifecycle: LifecycleState,
    ops: std::collections::HashMap<u64, Arc<InFlightOp>>,
    ops_queue: Vec<Arc<InFlightOp>>,
    outstanding_lookups: i64,
    next_sequence_number: u64,
    had_errors: bool,
    buffer_bytes_used: usize,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    flush_callback: Option<FlushCallback>,
    /// The status `abort` was called with, kept around so tablet lookups
    /// that were still pending at abort time can fail their op with the
    /// same status once they complete.
    abort_status: Option<BatcherError>,
}

impl BatcherState {
    fn new() -> Self {
        BatcherState {
            lifecycle: LifecycleState::Gathering,
            ops: std::collections::HashMap::new(),
            ops_queue: Vec::new(),
            outstanding_lookups: 0,
            next_sequence_number: 0,
            had_errors: false,
            buffer_bytes_used: 0,
            timeout: None,
            deadline: None,
            flush_callback: None,
            abort_status: None,
        }
    }
}

/// Accumulates operations against one table, resolves each to a tablet, and
/// dispatches them grouped by `(tablet, op-group)` once flushed.
///
/// A `Batcher` is always held behind an `Arc`: every async step (tablet
/// lookup, RPC dispatch) is driven by a spawned task holding its own strong
/// reference, so the batcher outlives any single call into it for exactly
/// as long as work remains in flight.
pub struct Batcher {
    id: BatcherId,
    table: TableId,
    config: BatcherConfig,
    state: Mutex<BatcherState>,
    meta_cache: Arc<dyn MetaCache>,
    error_collector: Arc<dyn ErrorCollector>,
    rpc_client: Arc<dyn RpcClient>,
    transaction: Option<Arc<dyn TransactionCoordinator>>,
    session: Weak<dyn SessionHandle>,
    clock: ObservedClock,
    callback_executor: Arc<dyn CallbackExecutor>,
}

impl Batcher {
    /// Creates a new batcher for `table`, bound to the given collaborators.
    ///
    /// `session` is a weak reference: the batcher does not keep its owning
    /// session alive, matching `weak_session_data_` in the original.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        table: TableId,
        config: BatcherConfig,
        meta_cache: Arc<dyn MetaCache>,
        error_collector: Arc<dyn ErrorCollector>,
        rpc_client: Arc<dyn RpcClient>,
        transaction: Option<Arc<dyn TransactionCoordinator>>,
        session: Weak<dyn SessionHandle>,
        clock: ObservedClock,
        callback_executor: Arc<dyn CallbackExecutor>,
    ) -> Arc<Self> {
        Arc::new(Batcher {
            id: BatcherId::next(),
            table,
            config,
            state: Mutex::new(BatcherState::new()),
            meta_cache,
            error_collector,
            rpc_client,
            transaction,
            session,
            clock,
            callback_executor,
        })
    }

    /// This batcher's process-unique id.
    pub fn id(&self) -> BatcherId {
        self.id
    }

    /// The table this batcher accumulates operations against.
    pub fn table(&self) -> &TableId {
        &self.table
    }

    /// The observed hybrid-time clock this batcher advances on write RPC
    /// completion, shared with every other batcher from the same client.
    pub fn clock(&self) -> &ObservedClock {
        &self.clock
    }

    /// Sets the deadline budget used for this batcher's tablet lookups and
    /// RPCs. Must be called, if at all, before `flush_async`.
    pub fn set_timeout(&self, timeout: Duration) {
        self.state.lock().timeout = Some(timeout);
    }

    /// The batcher's current lifecycle state.
    pub fn lifecycle_state(&self) -> LifecycleState {
        self.state.lock().lifecycle
    }

    /// The deadline computed for the in-progress (or most recent) flush, if
    /// one has started.
    pub fn deadline(&self) -> Option<Instant> {
        self.state.lock().deadline
    }

    /// Whether any op is still in the in-flight set (looking up a tablet,
    /// buffered, or in the middle of dispatch).
    pub fn has_pending_operations(&self) -> bool {
        !self.state.lock().ops.is_empty()
    }

    /// The number of ops added so far, while still gathering. Returns 0
    /// once a flush has started, matching `CountBufferedOperations`'s
    /// contract of only being meaningful pre-flush.
    pub fn count_buffered_operations(&self) -> usize {
        let state = self.state.lock();
        if state.lifecycle == LifecycleState::Gathering {
            state.ops.len()
        } else {
            0
        }
    }

    fn compute_deadline(&self, timeout: Option<Duration>) -> Instant {
        let timeout = timeout.unwrap_or_else(|| {
            warn!(
                default_timeout = ?self.config.default_timeout,
                "flushing with no timeout set, falling back to the configured default",
            );
            self.config.default_timeout
        });
        Instant::now() + timeout
    }

    /// Registers `op`, deriving its partition key and either resolving its
    /// tablet from a hint or dispatching an async meta-cache lookup.
    ///
    /// Returns synchronously only for the handful of failures that prevent
    /// the op from being registered at all (partition key derivation,
    /// buffer exhaustion, calling `add` outside `Gathering`); every other
    /// failure surfaces later through the error collector.
    pub async fn add(self: &Arc<Self>, op: Arc<dyn BatchableOp>) -> BatcherResult<()> {
        let partition_key = op.partition_key()?;
        if op.carries_hash_code() && !partition_key.is_empty() {
            let hash_code = decode_multi_column_hash_value(&partition_key);
            op.stamp_hash_code(hash_code);
        }
        let payload_len = op.payload_len();
        let tablet_hint = op.tablet_hint();

        let (in_flight, deadline) = {
            let mut state = self.state.lock();
            if state.lifecycle != LifecycleState::Gathering {
                return Err(internal!(
                    "add called while batcher {:?} is {:?}, not Gathering",
                    self.id,
                    state.lifecycle
                ));
            }
            if state.buffer_bytes_used + payload_len > self.config.max_buffer_size {
                return Err(BatcherError::BufferSizeExceeded {
                    used: state.buffer_bytes_used,
                    incoming: payload_len,
                    limit: self.config.max_buffer_size,
                });
            }
            let sequence_number = state.next_sequence_number;
            state.next_sequence_number += 1;
            let in_flight = Arc::new(InFlightOp::new(
                op,
                partition_key.clone(),
                sequence_number,
                payload_len,
            ));
            state.ops.insert(sequence_number, in_flight.clone());
            state.outstanding_lookups += 1;
            state.buffer_bytes_used += payload_len;
            let deadline = self.compute_deadline(state.timeout);
            (in_flight, deadline)
        };

        metrics::counter!(recorded::BATCHER_OPS_ADDED).increment(1);
        metrics::gauge!(recorded::BATCHER_BUFFER_BYTES_USED).increment(payload_len as f64);

        let sequence_number = in_flight.sequence_number;
        let span = debug_span!("tablet_lookup", batcher = ?self.id, sequence_number);
        match tablet_hint {
            Some(tablet) => {
                let batcher = self.clone();
                tokio::spawn(
                    async move {
                        batcher.tablet_lookup_finished(sequence_number, Ok(tablet)).await;
                    }
                    .instrument(span),
                );
            }
            None => {
                let batcher = self.clone();
                let table = self.table.clone();
                let meta_cache = self.meta_cache.clone();
                let key = partition_key;
                tokio::spawn(
                    async move {
                        let result = meta_cache.lookup_tablet(&table, key, deadline).await;
                        batcher.tablet_lookup_finished(sequence_number, result).await;
                    }
                    .instrument(span),
                );
            }
        }

        Ok(())
    }

    /// Called once per op, when its tablet lookup (or hint) resolves.
    ///
    /// On an aborted batcher this fails the op with the status `abort` was
    /// called with — it was still `LookingUpTablet` at abort time, so
    /// `abort` itself could not fail it — but deliberately does not
    /// re-check for flush completion, because `abort` already consumed the
    /// flush callback synchronously and nothing may invoke it a second
    /// time.
    async fn tablet_lookup_finished(self: &Arc<Self>, sequence_number: u64, result: BatcherResult<TabletId>) {
        enum Next {
            Aborted,
            Failed,
            Resolved,
        }

        let mut freed_bytes = 0usize;
        let next = {
            let mut state = self.state.lock();
            state.outstanding_lookups -= 1;
            if state.lifecycle == LifecycleState::Aborted {
                if let Some(op) = state.ops.remove(&sequence_number) {
                    state.buffer_bytes_used = state.buffer_bytes_used.saturating_sub(op.payload_len);
                    freed_bytes += op.payload_len;
                    let status = state
                        .abort_status
                        .clone()
                        .unwrap_or_else(|| tablet_batcher_errors::aborted!("batch aborted"));
                    self.error_collector.add_error(op.op.clone(), status);
                    state.had_errors = true;
                }
                Next::Aborted
            } else {
                match result {
                    Err(status) => {
                        if let Some(op) = state.ops.remove(&sequence_number) {
                            state.buffer_bytes_used = state.buffer_bytes_used.saturating_sub(op.payload_len);
                            freed_bytes += op.payload_len;
                            self.error_collector.add_error(op.op.clone(), status);
                            state.had_errors = true;
                        }
                        Next::Failed
                    }
                    Ok(tablet) => {
                        if let Some(op) = state.ops.get(&sequence_number).cloned() {
                            match op.mark_buffered(tablet) {
                                Ok(()) => state.ops_queue.push(op),
                                Err(msg) => warn!(msg, sequence_number, "tablet lookup completed for op in unexpected state"),
                            }
                        }
                        Next::Resolved
                    }
                }
            }
        };
        if freed_bytes > 0 {
            metrics::gauge!(recorded::BATCHER_BUFFER_BYTES_USED).decrement(freed_bytes as f64);
        }

        match next {
            Next::Aborted => {}
            Next::Failed => {
                self.check_for_finished_flush();
                self.flush_buffers_if_ready().await;
            }
            Next::Resolved => {
                self.flush_buffers_if_ready().await;
            }
        }
    }

    /// Begins flushing: stops accepting new ops and, once every outstanding
    /// lookup and dispatched RPC has completed, invokes `callback` exactly
    /// once.
    pub async fn flush_async(self: &Arc<Self>, callback: FlushCallback) {
        {
            let mut state = self.state.lock();
            if state.lifecycle != LifecycleState::Gathering {
                drop(state);
                callback(Err(internal!(
                    "flush_async called on batcher {:?} while {:?}, not Gathering",
                    self.id,
                    self.lifecycle_state()
                )));
                return;
            }
            state.lifecycle = LifecycleState::Flushing;
            state.flush_callback = Some(callback);
            let deadline = self.compute_deadline(state.timeout);
            state.deadline = Some(deadline);
        }
        self.check_for_finished_flush();
        self.flush_buffers_if_ready().await;
    }

    /// Aborts the batch: every currently-resolved (buffered) op is failed
    /// immediately with `status`; ops still looking up a tablet are failed
    /// as their lookups complete (see `tablet_lookup_finished`). The flush
    /// callback, if one has been registered, is invoked with `status` right
    /// away — it will never be invoked again.
    pub fn abort(self: &Arc<Self>, status: BatcherError) {
        let mut freed_bytes = 0usize;
        let callback = {
            let mut state = self.state.lock();
            state.lifecycle = LifecycleState::Aborted;
            state.abort_status = Some(status.clone());

            let resolved: Vec<u64> = state
                .ops
                .iter()
                .filter(|(_, op)| op.state() == InFlightState::BufferedToTabletServer)
                .map(|(sequence_number, _)| *sequence_number)
                .collect();
            for sequence_number in resolved {
                if let Some(op) = state.ops.remove(&sequence_number) {
                    state.buffer_bytes_used = state.buffer_bytes_used.saturating_sub(op.payload_len);
                    freed_bytes += op.payload_len;
                    self.error_collector.add_error(op.op.clone(), status.clone());
                    state.had_errors = true;
                }
            }
            let remaining: HashSet<u64> = state.ops.keys().copied().collect();
            state.ops_queue.retain(|op| remaining.contains(&op.sequence_number));

            state.flush_callback.take()
        };
        if freed_bytes > 0 {
            metrics::gauge!(recorded::BATCHER_BUFFER_BYTES_USED).decrement(freed_bytes as f64);
        }
        if let Some(callback) = callback {
            self.callback_executor.execute(callback, Err(status));
        }
    }

    /// Runs the flush-completion check: if flushing and no op remains
    /// in-flight, transitions to `Flushed`, notifies the owning session
    /// (if still alive), and invokes the flush callback.
    fn check_for_finished_flush(self: &Arc<Self>) {
        let (session, had_errors, callback) = {
            let mut state = self.state.lock();
            if state.lifecycle != LifecycleState::Flushing || !state.ops.is_empty() {
                return;
            }
            state.lifecycle = LifecycleState::Flushed;
            let callback = state.flush_callback.take();
            (self.session.upgrade(), state.had_errors, callback)
        };

        if let Some(session) = session {
            session.flush_finished(self.id);
        } else {
            trace!(batcher = ?self.id, "owning session already dropped, skipping flush_finished");
        }

        if had_errors {
            metrics::counter!(recorded::BATCHER_FLUSHES_WITH_ERRORS).increment(1);
        }
        let status = if had_errors { Err(BatcherError::SomeErrorsOccurred) } else { Ok(()) };
        if let Some(callback) = callback {
            self.callback_executor.execute(callback, status);
        }
    }

    /// The dispatch driver: if flushing, every lookup has resolved, and the
    /// (optional) transaction coordinator is ready, sorts the buffered ops
    /// by `(tablet, op-group, sequence_number)`, segments them into
    /// contiguous runs sharing a tablet and op-group, and emits one RPC per
    /// segment.
    fn flush_buffers_if_ready(self: &Arc<Self>) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(self.flush_buffers_if_ready_inner())
    }

    async fn flush_buffers_if_ready_inner(self: &Arc<Self>) {
        let ops_queue = {
            let mut state = self.state.lock();
            if state.lifecycle != LifecycleState::Flushing {
                trace!(batcher = ?self.id, "not ready to dispatch: not flushing");
                return;
            }
            if state.outstanding_lookups != 0 {
                trace!(batcher = ?self.id, outstanding = state.outstanding_lookups, "not ready to dispatch: lookups pending");
                return;
            }
            if let Some(transaction) = &self.transaction {
                let handles: Vec<Arc<dyn BatchableOp>> = state.ops.values().map(|op| op.op.clone()).collect();
                let batcher = self.clone();
                let ready = Box::new(move |result: BatcherResult<()>| {
                    let batcher = batcher.clone();
                    tokio::spawn(async move {
                        match result {
                            Ok(()) => batcher.flush_buffers_if_ready().await,
                            Err(status) => batcher.abort(status),
                        }
                    });
                });
                if !transaction.prepare(&handles, ready) {
                    trace!(batcher = ?self.id, "not ready to dispatch: waiting on transaction readiness");
                    return;
                }
            }
            std::mem::take(&mut state.ops_queue)
        };

        if ops_queue.is_empty() {
            return;
        }

        let allow_followers = GlobalFlags::allow_reads_from_followers();
        let mut sortable: Vec<(TabletId, OpGroup, u64, Arc<InFlightOp>)> = ops_queue
            .into_iter()
            .map(|op| {
                let tablet = op
                    .tablet()
                    .expect("ops in ops_queue must have a resolved tablet");
                let group = classify(op.op.op_kind(), allow_followers);
                (tablet, group, op.sequence_number, op)
            })
            .collect();
        sortable.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

        let mut segments: Vec<(TabletId, OpGroup, Vec<Arc<InFlightOp>>)> = Vec::new();
        for (tablet, group, _sequence_number, op) in sortable {
            match segments.last_mut() {
                Some((last_tablet, last_group, ops)) if *last_tablet == tablet && *last_group == group => {
                    ops.push(op);
                }
                _ => segments.push((tablet, group, vec![op])),
            }
        }

        debug!(batcher = ?self.id, segments = segments.len(), "dispatching flush");

        let last = segments.len().saturating_sub(1);
        for (index, (tablet, group, ops)) in segments.into_iter().enumerate() {
            metrics::counter!(recorded::BATCHER_OPS_DISPATCHED, "op_group" => op_group_label(group))
                .increment(ops.len() as u64);
            let batcher = self.clone();
            let span = debug_span!("dispatch_segment", batcher = ?self.id, tablet = %tablet, group = ?group);
            let task = async move { batcher.dispatch_segment(tablet, group, ops).await }.instrument(span);
            if self.config.allow_local_calls_in_curr_thread && index == last {
                task.await;
            } else {
                tokio::spawn(task);
            }
        }
    }

    /// Sends one RPC for a `(tablet, op-group)` segment and feeds the
    /// result back into the batcher.
    async fn dispatch_segment(self: &Arc<Self>, tablet: TabletId, group: OpGroup, ops: Vec<Arc<InFlightOp>>) {
        let handles: Vec<Arc<dyn BatchableOp>> = ops.iter().map(|op| op.op.clone()).collect();
        metrics::counter!(recorded::BATCHER_RPCS_EMITTED).increment(1);
        let started = Instant::now();

        let outcome = match group {
            OpGroup::Write => self.rpc_client.send_write(tablet, handles.clone()).await,
            OpGroup::LeaderRead => {
                self.rpc_client.send_read(tablet, handles.clone(), ReadConsistency::Leader).await
            }
            OpGroup::ConsistentPrefixRead => {
                self.rpc_client
                    .send_read(tablet, handles.clone(), ReadConsistency::ConsistentPrefix)
                    .await
            }
        };

        metrics::histogram!(recorded::BATCHER_RPC_LATENCY_SECONDS).record(started.elapsed().as_secs_f64());
        self.process_rpc_result(ops, handles, outcome, group == OpGroup::Write);
    }

    /// Ingests one segment's RPC outcome: records errors against the error
    /// collector, removes every op in the segment from the in-flight set,
    /// advances the observed clock on write success, notifies the
    /// transaction coordinator, and re-checks for flush completion.
    fn process_rpc_result(
        self: &Arc<Self>,
        ops: Vec<Arc<InFlightOp>>,
        handles: Vec<Arc<dyn BatchableOp>>,
        outcome: RpcOutcome,
        is_write: bool,
    ) {
        if self.lifecycle_state() != LifecycleState::Flushing {
            warn!(batcher = ?self.id, "rpc result arrived while batcher is not Flushing");
        }

        if let Err(status) = &outcome.status {
            for op in &handles {
                self.error_collector.add_error(op.clone(), status.clone());
            }
        }
        let mut recorded_row_error = false;
        for per_row in &outcome.per_row_errors {
            match handles.get(per_row.row_index) {
                Some(op) => {
                    self.error_collector.add_error(op.clone(), per_row.status.clone());
                    recorded_row_error = true;
                }
                None => error!(
                    row_index = per_row.row_index,
                    segment_len = handles.len(),
                    "rpc reported a per-row error outside the segment's bounds",
                ),
            }
        }

        let mut freed_bytes = 0usize;
        {
            let mut state = self.state.lock();
            for op in &ops {
                if state.ops.remove(&op.sequence_number).is_none() {
                    error!(sequence_number = op.sequence_number, "op missing from in-flight set at rpc completion");
                }
                state.buffer_bytes_used = state.buffer_bytes_used.saturating_sub(op.payload_len);
                freed_bytes += op.payload_len;
            }
            if outcome.status.is_err() || recorded_row_error {
                state.had_errors = true;
            }
        }
        if freed_bytes > 0 {
            metrics::gauge!(recorded::BATCHER_BUFFER_BYTES_USED).decrement(freed_bytes as f64);
        }

        if is_write {
            if let Some(observed) = outcome.propagated_clock {
                self.clock.advance(observed);
            }
        }

        if let Some(transaction) = &self.transaction {
            let status = outcome.status.clone();
            transaction.flushed(&handles, &status, outcome.propagated_clock);
        }

        self.check_for_finished_flush();
    }
}
