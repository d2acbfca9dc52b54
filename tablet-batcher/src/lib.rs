//! A client-side batcher for sharded, tablet-based storage backends.
//!
//! An application adds operations to a [`batcher::Batcher`] while it is
//! gathering; each is resolved to a destination tablet asynchronously
//! through a [`meta_cache::MetaCache`], then flushed as a small number of
//! RPCs, grouped by destination tablet and op kind.

pub mod batcher;
pub mod callback;
pub mod clock;
pub mod config;
pub mod error_collector;
pub mod ids;
pub mod in_flight_op;
pub mod meta_cache;
pub mod metrics;
pub mod op;
pub mod rpc;
pub mod session;
pub mod transaction;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use batcher::{Batcher, LifecycleState};
pub use callback::{CallbackExecutor, FlushCallback, InlineCallbackExecutor, TokioCallbackExecutor};
pub use clock::{HybridTime, ObservedClock};
pub use config::{BatcherConfig, GlobalFlags};
pub use error_collector::{CollectedError, ErrorCollector, VecErrorCollector};
pub use ids::{BatcherId, TableId, TabletId};
pub use in_flight_op::{InFlightOp, InFlightState};
pub use meta_cache::MetaCache;
pub use op::{classify, BatchableOp, Consistency, OpGroup, OpKind, ReadStyle};
pub use rpc::{PerRowError, ReadConsistency, RpcClient, RpcOutcome};
pub use session::SessionHandle;
pub use transaction::{ReadyCallback, TransactionCoordinator};

pub use tablet_batcher_errors::{BatcherError, BatcherResult};
