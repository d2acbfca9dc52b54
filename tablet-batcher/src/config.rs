//! Batcher configuration and the one process-wide runtime flag the design
//! calls for.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Deserialize;

/// Default cap on accumulated payload bytes per batcher (7 MiB, matching
/// the original's `7 * 1024 * 1024`).
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 7 * 1024 * 1024;

/// Default flush deadline when no timeout has been set, matching the
/// original's `ComputeDeadlineUnlocked` fallback.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Per-batcher configuration, analogous to the per-table settings carried
/// by `TableBuilder` in `readyset-client/src/table.rs`.
#[derive(Debug, Clone)]
pub struct BatcherConfig {
    /// Hard cap on `buffer_bytes_used`; `Add` rejects an op that would
    /// exceed it (see DESIGN.md for why this resolves spec open question
    /// #2 rather than leaving the cap unenforced).
    pub max_buffer_size: usize,
    /// Used to compute `deadline` when none has been set explicitly via
    /// `set_timeout`.
    pub default_timeout: Duration,
    /// Whether the final RPC of a flush may run inline on the calling task
    /// instead of being spawned separately.
    pub allow_local_calls_in_curr_thread: bool,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        BatcherConfig {
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            default_timeout: DEFAULT_TIMEOUT,
            allow_local_calls_in_curr_thread: false,
        }
    }
}

/// The subset of [`BatcherConfig`] that can be overlaid from the
/// environment, in the style of `readyset`'s `envy`-based config loading.
#[derive(Debug, Deserialize, Default)]
struct EnvOverlay {
    tablet_batcher_max_buffer_size: Option<usize>,
    tablet_batcher_default_timeout_secs: Option<u64>,
    tablet_batcher_allow_local_calls_in_curr_thread: Option<bool>,
}

impl BatcherConfig {
    /// Builds a config from defaults overlaid with any
    /// `TABLET_BATCHER_*` environment variables present. Malformed
    /// environment values are ignored rather than treated as fatal, since
    /// this is a library with no dedicated startup/validation phase.
    pub fn from_env() -> Self {
        let mut config = BatcherConfig::default();
        if let Ok(overlay) = envy::from_env::<EnvOverlay>() {
            if let Some(v) = overlay.tablet_batcher_max_buffer_size {
                config.max_buffer_size = v;
            }
            if let Some(v) = overlay.tablet_batcher_default_timeout_secs {
                config.default_timeout = Duration::from_secs(v);
            }
            if let Some(v) = overlay.tablet_batcher_allow_local_calls_in_curr_thread {
                config.allow_local_calls_in_curr_thread = v;
            }
        }
        config
    }
}

/// Process-wide flag widening the `ConsistentPrefixRead` classifier for
/// key-value reads, matching `FLAGS_redis_allow_reads_from_followers` in
/// the original (`TAG_FLAG(..., runtime)`: mutable at runtime, not just at
/// startup).
static ALLOW_READS_FROM_FOLLOWERS: AtomicBool = AtomicBool::new(false);

/// Runtime-mutable flags shared by every batcher in the process.
pub struct GlobalFlags;

impl GlobalFlags {
    /// Reads the current value of `allow_reads_from_followers`.
    pub fn allow_reads_from_followers() -> bool {
        ALLOW_READS_FROM_FOLLOWERS.load(Ordering::Relaxed)
    }

    /// Sets `allow_reads_from_followers`, taking effect for any dispatch
    /// that has not yet sorted its buffer.
    pub fn set_allow_reads_from_followers(value: bool) {
        ALLOW_READS_FROM_FOLLOWERS.store(value, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_spec_defaults() {
        let config = BatcherConfig::default();
        assert_eq!(config.max_buffer_size, 7 * 1024 * 1024);
        assert_eq!(config.default_timeout, Duration::from_secs(60));
        assert!(!config.allow_local_calls_in_curr_thread);
    }

    #[test]
    fn global_flag_round_trips() {
        let before = GlobalFlags::allow_reads_from_followers();
        GlobalFlags::set_allow_reads_from_followers(true);
        assert!(GlobalFlags::allow_reads_from_followers());
        GlobalFlags::set_allow_reads_from_followers(before);
    }
}
