//! The owning session collaborator.

use crate::ids::BatcherId;

/// The session that owns a batcher's lifetime.
///
/// The batcher holds only a [`std::sync::Weak`] reference to its session
/// (see [`crate::batcher::Batcher`]); if the session has already been
/// dropped by the time a flush finishes, notification is simply skipped,
/// matching the original's `weak_session_data_.lock()` behavior.
pub trait SessionHandle: Send + Sync {
    /// Called exactly once per batcher, after every op has been removed
    /// from the in-flight set and before the flush callback fires.
    fn flush_finished(&self, batcher: BatcherId);
}
