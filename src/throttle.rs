//! Rate-limited logging for repeating hot-path errors
//!
//! A storm of identical failures (malformed payloads, a crashing user
//! callback) must not flood the log. Each error category gets a throttle:
//! the first occurrences log in full, after that only every Nth logs as a
//! summary. The occurrence counter doubles as the canonical error counter
//! — logs are supplementary, counters are the signal.

use std::sync::atomic::{AtomicU64, Ordering};

/// Occurrences logged with full diagnostic detail.
pub const DETAIL_COUNT: u64 = 10;
/// After the detailed window, log every Nth occurrence.
pub const SUMMARY_EVERY: u64 = 1000;

/// Logging verdict for one occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    /// Within the first [`DETAIL_COUNT`]: log full diagnostics
    Detailed,
    /// A multiple of [`SUMMARY_EVERY`]: log a one-line summary
    Summary,
    /// Everything else: count only
    Suppressed,
}

/// One occurrence as recorded by [`LogThrottle::record`].
#[derive(Debug, Clone, Copy)]
pub struct Occurrence {
    /// 1-based ordinal of this occurrence
    pub ordinal: u64,
    pub verbosity: Verbosity,
}

/// Error-category counter with a built-in logging decision.
#[derive(Debug, Default)]
pub struct LogThrottle {
    count: AtomicU64,
}

impl LogThrottle {
    pub const fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
        }
    }

    /// Counts one occurrence and decides whether it should be logged.
    pub fn record(&self) -> Occurrence {
        let ordinal = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        let verbosity = if ordinal <= DETAIL_COUNT {
            Verbosity::Detailed
        } else if ordinal % SUMMARY_EVERY == 0 {
            Verbosity::Summary
        } else {
            Verbosity::Suppressed
        };
        Occurrence { ordinal, verbosity }
    }

    /// Total occurrences so far.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_occurrences_are_detailed() {
        let throttle = LogThrottle::new();
        for i in 1..=DETAIL_COUNT {
            let occ = throttle.record();
            assert_eq!(occ.ordinal, i);
            assert_eq!(occ.verbosity, Verbosity::Detailed);
        }
        assert_eq!(throttle.record().verbosity, Verbosity::Suppressed);
    }

    #[test]
    fn test_summary_every_thousandth() {
        let throttle = LogThrottle::new();
        let mut summaries = Vec::new();
        for _ in 0..2500 {
            let occ = throttle.record();
            if occ.verbosity == Verbosity::Summary {
                summaries.push(occ.ordinal);
            }
        }
        assert_eq!(summaries, vec![1000, 2000]);
        assert_eq!(throttle.count(), 2500);
    }
}
