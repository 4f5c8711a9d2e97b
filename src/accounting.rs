//! Byte accounting sinks.
//!
//! The decoder reports how many bytes each `decode` call took from its
//! input, the encode path reports how many bytes each `encode` call
//! produced. Sinks are observability hooks only and never affect control
//! flow.
//!
//! # Example
//!
//! ```
//! use stagewire::accounting::ByteTally;
//!
//! let tally = ByteTally::new();
//! let sink = tally.sink();
//!
//! sink(4);
//! sink(3);
//! assert_eq!(tally.total(), 7);
//! assert_eq!(tally.calls(), 2);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Callback receiving a byte count.
pub type ByteCounter = Arc<dyn Fn(usize) + Send + Sync>;

/// Sink that ignores every count. Used when no counter is configured.
pub fn noop() -> ByteCounter {
    Arc::new(|_: usize| {})
}

/// Lock-free accumulator that can hand out [`ByteCounter`] sinks.
///
/// Clones share the same totals.
#[derive(Debug, Clone, Default)]
pub struct ByteTally {
    total: Arc<AtomicU64>,
    calls: Arc<AtomicU64>,
}

impl ByteTally {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `n` bytes to the tally.
    #[inline]
    pub fn record(&self, n: usize) {
        self.total.fetch_add(n as u64, Ordering::Relaxed);
        self.calls.fetch_add(1, Ordering::Relaxed);
    }

    /// Total bytes recorded.
    #[inline]
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Number of times a count was recorded.
    #[inline]
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// A sink feeding this tally.
    pub fn sink(&self) -> ByteCounter {
        let tally = self.clone();
        Arc::new(move |n: usize| tally.record(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_accepts_counts() {
        let sink = noop();
        sink(0);
        sink(usize::MAX);
    }

    #[test]
    fn test_tally_clone_shares_state() {
        let tally = ByteTally::new();
        let other = tally.clone();

        tally.record(10);
        other.record(5);

        assert_eq!(tally.total(), 15);
        assert_eq!(other.calls(), 2);
    }

    #[test]
    fn test_zero_counts_are_recorded_as_calls() {
        let tally = ByteTally::new();
        let sink = tally.sink();

        sink(0);

        assert_eq!(tally.total(), 0);
        assert_eq!(tally.calls(), 1);
    }
}
