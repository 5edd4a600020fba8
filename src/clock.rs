//! Receive-timestamp helpers
//!
//! Every event carries two timestamps captured at the same instant: a
//! wall-clock one for human correlation and a monotonic one for gap and
//! latency arithmetic. Both live here so all call sites agree on epoch
//! and unit (nanoseconds).

use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

static MONO_ANCHOR: OnceLock<Instant> = OnceLock::new();

/// Wall-clock nanoseconds since the unix epoch.
#[inline]
pub fn wall_ns() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_nanos() as i64,
        // Clock set before 1970; negative offset keeps the value ordered
        Err(e) => -(e.duration().as_nanos() as i64),
    }
}

/// Wall-clock seconds since the unix epoch.
#[inline]
pub fn wall_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Monotonic nanoseconds. The zero point is the first call in the
/// process; only differences between two readings are meaningful.
#[inline]
pub fn mono_ns() -> u64 {
    MONO_ANCHOR.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mono_is_non_decreasing() {
        let a = mono_ns();
        let b = mono_ns();
        assert!(b >= a);
    }

    #[test]
    fn test_wall_is_past_2020() {
        // 2020-01-01 in ns; catches a unit mixup (s vs ms vs ns)
        assert!(wall_ns() > 1_577_836_800_000_000_000);
    }
}
