//! Feed-liveness monitoring
//!
//! Two staleness signals over monotonic time only (wall-clock jumps from
//! NTP must never produce a false stall): whether the feed as a whole has
//! gone quiet, and whether individual symbols have. Startup is "unknown",
//! not "dead" — nothing is reported stale before the first event.
//!
//! Runs on the strategy thread and is not internally synchronized.

use ahash::AHashMap;
use compact_str::CompactString;

use crate::config::LivenessConfig;

const NANOS_PER_SEC: f64 = 1e9;

/// Tracks last-seen monotonic timestamps globally and per symbol.
pub struct FeedLiveness {
    max_gap_ns: u64,
    overrides: AHashMap<CompactString, u64>,
    last_seen: AHashMap<CompactString, u64>,
    global_last: Option<u64>,
}

impl FeedLiveness {
    pub fn new(config: &LivenessConfig) -> Self {
        let overrides = config
            .per_symbol_max_gap
            .iter()
            .map(|(symbol, secs)| {
                (
                    CompactString::from(symbol.to_ascii_uppercase()),
                    (secs * NANOS_PER_SEC) as u64,
                )
            })
            .collect();
        Self {
            max_gap_ns: (config.max_gap_seconds * NANOS_PER_SEC) as u64,
            overrides,
            last_seen: AHashMap::new(),
            global_last: None,
        }
    }

    /// Records an event for `symbol` observed at `now_mono_ns`.
    pub fn on_event(&mut self, symbol: &str, now_mono_ns: u64) {
        match self.last_seen.get_mut(symbol) {
            Some(last) => *last = now_mono_ns,
            None => {
                self.last_seen
                    .insert(CompactString::from(symbol), now_mono_ns);
            }
        }
        self.global_last = Some(now_mono_ns);
    }

    /// False until the first event (startup is unknown, not dead); then
    /// true iff the global gap exceeds the configured maximum.
    pub fn is_feed_dead(&self, now_mono_ns: u64) -> bool {
        match self.global_last {
            Some(last) => gap(now_mono_ns, last) > self.max_gap_ns,
            None => false,
        }
    }

    pub fn has_ever_received(&self) -> bool {
        self.global_last.is_some()
    }

    pub fn has_seen(&self, symbol: &str) -> bool {
        self.last_seen.contains_key(symbol)
    }

    /// False for never-seen symbols; `has_seen` distinguishes that case.
    pub fn is_stale(&self, symbol: &str, now_mono_ns: u64) -> bool {
        match self.last_seen.get(symbol) {
            Some(last) => gap(now_mono_ns, *last) > self.threshold_ns(symbol),
            None => false,
        }
    }

    /// All observed symbols currently over their staleness threshold.
    pub fn stale_symbols(&self, now_mono_ns: u64) -> Vec<CompactString> {
        let mut stale: Vec<CompactString> = self
            .last_seen
            .iter()
            .filter(|(symbol, last)| gap(now_mono_ns, **last) > self.threshold_ns(symbol))
            .map(|(symbol, _)| symbol.clone())
            .collect();
        stale.sort_unstable();
        stale
    }

    /// Milliseconds since the symbol's last event, or `None` if never seen.
    pub fn last_seen_gap_ms(&self, symbol: &str, now_mono_ns: u64) -> Option<u64> {
        self.last_seen
            .get(symbol)
            .map(|last| gap(now_mono_ns, *last) / 1_000_000)
    }

    fn threshold_ns(&self, symbol: &str) -> u64 {
        self.overrides.get(symbol).copied().unwrap_or(self.max_gap_ns)
    }
}

/// Clamped at zero: a true monotonic source never goes backwards, but
/// injected test timestamps may invert.
#[inline]
fn gap(now_ns: u64, last_ns: u64) -> u64 {
    now_ns.saturating_sub(last_ns)
}
