//! The meta-cache collaborator: translates `(table, partition_key)` pairs
//! into tablets.

use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use tablet_batcher_errors::BatcherResult;

use crate::ids::{TableId, TabletId};

/// Client-side cache translating a partition key to the tablet that owns
/// it.
///
/// The original's `LookupTabletByKey` takes an output parameter and a
/// completion callback; `async fn` is the idiomatic replacement (see
/// `REDESIGN FLAGS`).
#[async_trait]
pub trait MetaCache: Send + Sync {
    /// Resolves `partition_key` within `table` to a tablet, failing if the
    /// lookup doesn't complete before `deadline`.
    async fn lookup_tablet(
        &self,
        table: &TableId,
        partition_key: Bytes,
        deadline: Instant,
    ) -> BatcherResult<TabletId>;
}
