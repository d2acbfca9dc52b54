//! Flush-completion callback dispatch.

use tablet_batcher_errors::BatcherResult;
use tracing::warn;

/// The user's flush-completion callback: `Ok(())` on a clean flush,
/// `Err(BatcherError::SomeErrorsOccurred)` if any op failed. Never any other
/// error variant — see the error propagation policy in the design docs.
pub type FlushCallback = Box<dyn FnOnce(BatcherResult<()>) + Send>;

/// Runs a [`FlushCallback`], matching the original's `RunCallback`: submit
/// to a shared thread pool, falling back to inline execution if submission
/// fails.
pub trait CallbackExecutor: Send + Sync {
    /// Executes `callback(status)`, on whatever thread this executor
    /// chooses.
    fn execute(&self, callback: FlushCallback, status: BatcherResult<()>);
}

/// The default executor: spawns onto the ambient Tokio runtime, falling
/// back to running the callback inline if no runtime is available to spawn
/// onto (mirroring `client_->callback_threadpool()` being unset or
/// `Submit` failing in the original).
#[derive(Default)]
pub struct TokioCallbackExecutor;

impl CallbackExecutor for TokioCallbackExecutor {
    fn execute(&self, callback: FlushCallback, status: BatcherResult<()>) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { callback(status) });
            }
            Err(_) => {
                warn!("no tokio runtime available for flush callback dispatch, running inline");
                callback(status);
            }
        }
    }
}

/// An executor that always runs the callback inline on the calling thread,
/// useful for tests that want deterministic ordering.
#[derive(Default)]
pub struct InlineCallbackExecutor;

impl CallbackExecutor for InlineCallbackExecutor {
    fn execute(&self, callback: FlushCallback, status: BatcherResult<()>) {
        callback(status);
    }
}
