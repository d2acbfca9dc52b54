//! Error types returned by the tablet batcher.
//!
//! The batcher never surfaces per-operation errors through its own return
//! values; those are handed to the error collector (see
//! `tablet_batcher::error_collector`). This crate defines the error shapes
//! used for the few places the batcher *does* need a concrete error: the
//! synchronous return of `Add`, the status recorded against an individual
//! op, and the generic "some errors occurred" signal given to the flush
//! callback.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Result alias used throughout the batcher crates.
pub type BatcherResult<T> = std::result::Result<T, BatcherError>;

/// The error taxonomy for the tablet batcher.
///
/// Variants map onto the "Kinds" enumerated in the batcher design: partition
/// key derivation failure, tablet lookup failure, RPC transport failure,
/// per-row write failure, abort, and the generic aggregate reported through
/// the flush callback.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum BatcherError {
    /// Failed to derive a partition key from a user operation.
    #[error("failed to derive partition key: {0}")]
    PartitionKeyDerivation(String),

    /// The meta-cache could not resolve a partition key to a tablet.
    #[error("tablet lookup failed: {0}")]
    TabletLookupFailed(String),

    /// The async RPC layer returned a non-OK status for an entire segment.
    #[error("rpc failed: {0}")]
    RpcFailed(String),

    /// A single row within an otherwise-successful RPC failed.
    #[error("row error: {0}")]
    RowError(String),

    /// The batcher (or the specific op) was aborted before completion.
    #[error("aborted: {0}")]
    Aborted(String),

    /// At least one operation in the batch failed; details are in the error
    /// collector. This is the only error ever delivered to the flush
    /// callback.
    #[error("some errors occurred")]
    SomeErrorsOccurred,

    /// The transaction coordinator reported a failure while preparing or
    /// flushing the batch.
    #[error("transaction error: {0}")]
    Transaction(String),

    /// The buffer-size cap (`max_buffer_size`) would be exceeded by adding
    /// this op.
    #[error("buffer size limit exceeded: {used} + {incoming} > {limit}")]
    BufferSizeExceeded {
        /// Bytes already accumulated before this op.
        used: usize,
        /// Bytes this op would add.
        incoming: usize,
        /// The configured cap.
        limit: usize,
    },

    /// An invariant the batcher relies on was violated. These indicate a
    /// programmer error in the batcher itself or in a collaborator, never
    /// in caller input.
    #[error("internal error: {0}")]
    Internal(String),

    /// A request asked for behavior the batcher intentionally does not
    /// support.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl BatcherError {
    /// True for the subset of errors that indicate a bug in the batcher or
    /// a collaborator rather than a legitimate runtime failure.
    pub fn is_internal(&self) -> bool {
        matches!(self, BatcherError::Internal(_))
    }
}

/// Constructs a [`BatcherError::Internal`], capturing the call site the way
/// the `internal!` macro used throughout `readyset-client/src/table.rs`
/// does.
#[macro_export]
macro_rules! internal {
    ($($arg:tt)*) => {
        $crate::BatcherError::Internal(format!(
            "{} ({}:{})",
            format_args!($($arg)*),
            file!(),
            line!(),
        ))
    };
}

/// Constructs a [`BatcherError::Unsupported`].
#[macro_export]
macro_rules! unsupported {
    ($($arg:tt)*) => {
        $crate::BatcherError::Unsupported(format!($($arg)*))
    };
}

/// Constructs a [`BatcherError::Aborted`].
#[macro_export]
macro_rules! aborted {
    ($($arg:tt)*) => {
        $crate::BatcherError::Aborted(format!($($arg)*))
    };
}

impl From<std::convert::Infallible> for BatcherError {
    fn from(i: std::convert::Infallible) -> Self {
        match i {}
    }
}

/// A lightweight, cloneable status used for transport-level outcomes, kept
/// distinct from [`BatcherError`] so RPC implementations aren't forced to
/// model every batcher-internal error kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportStatus {
    ok: bool,
    message: String,
}

impl TransportStatus {
    /// The canonical success status.
    pub fn ok() -> Self {
        TransportStatus {
            ok: true,
            message: String::new(),
        }
    }

    /// Construct a failure status with the given message.
    pub fn error(message: impl Into<String>) -> Self {
        TransportStatus {
            ok: false,
            message: message.into(),
        }
    }

    /// Whether this status represents success.
    pub fn is_ok(&self) -> bool {
        self.ok
    }
}

impl fmt::Display for TransportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ok {
            write!(f, "OK")
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl From<TransportStatus> for BatcherError {
    fn from(status: TransportStatus) -> Self {
        BatcherError::RpcFailed(status.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_macro_includes_location() {
        let err = internal!("bad state {}", 42);
        match err {
            BatcherError::Internal(msg) => {
                assert!(msg.contains("bad state 42"));
                assert!(msg.contains("lib.rs"));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn transport_status_ok_roundtrip() {
        let s = TransportStatus::ok();
        assert!(s.is_ok());
        assert_eq!(s.to_string(), "OK");
    }

    #[test]
    fn transport_status_error_converts_to_rpc_failed() {
        let s = TransportStatus::error("connection refused");
        let err: BatcherError = s.into();
        assert_eq!(err, BatcherError::RpcFailed("connection refused".into()));
    }
}
