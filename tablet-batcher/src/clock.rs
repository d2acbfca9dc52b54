//! The propagated hybrid-time clock the batcher advances on write RPC
//! completion.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A server-produced logical clock reading, propagated back to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct HybridTime(pub u64);

/// A monotonic high-water mark over observed [`HybridTime`] values, shared
/// by every batcher created from the same client.
#[derive(Clone, Default)]
pub struct ObservedClock {
    value: Arc<AtomicU64>,
}

impl ObservedClock {
    /// Creates a fresh clock starting at zero.
    pub fn new() -> Self {
        ObservedClock::default()
    }

    /// The current high-water mark.
    pub fn current(&self) -> HybridTime {
        HybridTime(self.value.load(Ordering::Acquire))
    }

    /// Advances the high-water mark to `observed` if it is greater than the
    /// current value. Matches `UpdateLatestObservedHybridTime`'s
    /// monotonic-max semantics.
    pub fn advance(&self, observed: HybridTime) {
        self.value.fetch_max(observed.0, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_is_monotonic_max() {
        let clock = ObservedClock::new();
        clock.advance(HybridTime(5));
        assert_eq!(clock.current(), HybridTime(5));
        clock.advance(HybridTime(3));
        assert_eq!(clock.current(), HybridTime(5), "clock must never move backward");
        clock.advance(HybridTime(9));
        assert_eq!(clock.current(), HybridTime(9));
    }
}
