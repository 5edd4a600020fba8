//! Typed market-data events
//!
//! Immutable snapshots produced by the adapter and handed to the strategy
//! through the dispatcher. Two shapes exist: a top-of-book quote and a
//! ten-level depth book. Events compare by value and never mutate after
//! construction.
//!
//! Two construction paths are provided on purpose:
//! - `*_unchecked` constructors for the decode hot path, which consumes
//!   fields already produced by the wire decoder and skips redundant
//!   validation;
//! - validating constructors for tests and any caller building events
//!   from untrusted inputs.

use std::fmt;

use compact_str::CompactString;

/// Number of price levels in a depth book.
pub const DEPTH_LEVELS: usize = 10;

/// Trading-session flag attached to each side of the book.
///
/// Values mirror the wire enum; unknown wire values collapse to
/// `Undefined`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum SessionFlag {
    Undefined = 0,
    Normal = 1,
    /// At-the-open auction period
    Ato = 2,
    /// At-the-close auction period
    Atc = 3,
}

impl SessionFlag {
    /// Maps a raw wire value; anything out of range is `Undefined`.
    #[inline]
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            1 => SessionFlag::Normal,
            2 => SessionFlag::Ato,
            3 => SessionFlag::Atc,
            _ => SessionFlag::Undefined,
        }
    }

    #[inline]
    pub fn as_raw(self) -> i32 {
        self as i32
    }

    #[inline]
    pub fn is_auction(self) -> bool {
        matches!(self, SessionFlag::Ato | SessionFlag::Atc)
    }
}

// Events store flags as raw integers; comparisons against the enum must
// work in both directions without an explicit conversion.
impl PartialEq<i32> for SessionFlag {
    fn eq(&self, other: &i32) -> bool {
        self.as_raw() == *other
    }
}

impl PartialEq<SessionFlag> for i32 {
    fn eq(&self, other: &SessionFlag) -> bool {
        *self == other.as_raw()
    }
}

/// Rejections from the validating constructors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// Symbol is empty after trimming
    EmptySymbol,
    /// Top-level volume below zero
    NegativeVolume(i64),
    /// Receive timestamp below zero
    NegativeTimestamp(i64),
}

impl fmt::Display for EventError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptySymbol => write!(f, "symbol must not be empty"),
            Self::NegativeVolume(v) => write!(f, "volume must be non-negative, got {}", v),
            Self::NegativeTimestamp(t) => write!(f, "timestamp must be non-negative, got {}", t),
        }
    }
}

impl std::error::Error for EventError {}

/// A decoded market-data event.
///
/// Prices are IEEE-754 doubles converted from fixed-precision wire values;
/// downstream comparisons must use an absolute tolerance (`<= 1e-9`).
/// Prices carry no lower bound: derivatives may quote negative and auction
/// periods may report zero. Depth volumes are passed through without
/// per-element range checks, so a malformed feed can surface a negative
/// depth volume to the strategy.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    TopOfBook {
        symbol: CompactString,
        bid: f64,
        ask: f64,
        bid_vol: i64,
        ask_vol: i64,
        bid_flag: i32,
        ask_flag: i32,
        recv_ts_ns: i64,
        recv_mono_ns: u64,
        connection_epoch: u64,
    },
    DepthBook {
        symbol: CompactString,
        bid_prices: [f64; DEPTH_LEVELS],
        ask_prices: [f64; DEPTH_LEVELS],
        bid_vols: [i64; DEPTH_LEVELS],
        ask_vols: [i64; DEPTH_LEVELS],
        bid_flag: i32,
        ask_flag: i32,
        recv_ts_ns: i64,
        recv_mono_ns: u64,
        connection_epoch: u64,
    },
}

impl Event {
    /// Hot-path constructor: trusts the caller for every field, including
    /// `connection_epoch` (the adapter stamps it; callers bypassing the
    /// adapter must not forget to).
    #[allow(clippy::too_many_arguments)]
    #[inline]
    pub fn top_of_book_unchecked(
        symbol: CompactString,
        bid: f64,
        ask: f64,
        bid_vol: i64,
        ask_vol: i64,
        bid_flag: i32,
        ask_flag: i32,
        recv_ts_ns: i64,
        recv_mono_ns: u64,
        connection_epoch: u64,
    ) -> Self {
        Event::TopOfBook {
            symbol,
            bid,
            ask,
            bid_vol,
            ask_vol,
            bid_flag,
            ask_flag,
            recv_ts_ns,
            recv_mono_ns,
            connection_epoch,
        }
    }

    /// Hot-path depth constructor; level elements are not range-checked.
    #[allow(clippy::too_many_arguments)]
    #[inline]
    pub fn depth_unchecked(
        symbol: CompactString,
        bid_prices: [f64; DEPTH_LEVELS],
        ask_prices: [f64; DEPTH_LEVELS],
        bid_vols: [i64; DEPTH_LEVELS],
        ask_vols: [i64; DEPTH_LEVELS],
        bid_flag: i32,
        ask_flag: i32,
        recv_ts_ns: i64,
        recv_mono_ns: u64,
        connection_epoch: u64,
    ) -> Self {
        Event::DepthBook {
            symbol,
            bid_prices,
            ask_prices,
            bid_vols,
            ask_vols,
            bid_flag,
            ask_flag,
            recv_ts_ns,
            recv_mono_ns,
            connection_epoch,
        }
    }

    /// Validating constructor for untrusted inputs: rejects empty symbols,
    /// negative top-level volumes, and negative timestamps; normalizes the
    /// symbol to upper case.
    #[allow(clippy::too_many_arguments)]
    pub fn top_of_book(
        symbol: &str,
        bid: f64,
        ask: f64,
        bid_vol: i64,
        ask_vol: i64,
        bid_flag: i32,
        ask_flag: i32,
        recv_ts_ns: i64,
        recv_mono_ns: u64,
        connection_epoch: u64,
    ) -> Result<Self, EventError> {
        let symbol = normalize_symbol(symbol)?;
        if bid_vol < 0 {
            return Err(EventError::NegativeVolume(bid_vol));
        }
        if ask_vol < 0 {
            return Err(EventError::NegativeVolume(ask_vol));
        }
        if recv_ts_ns < 0 {
            return Err(EventError::NegativeTimestamp(recv_ts_ns));
        }
        Ok(Self::top_of_book_unchecked(
            symbol,
            bid,
            ask,
            bid_vol,
            ask_vol,
            bid_flag,
            ask_flag,
            recv_ts_ns,
            recv_mono_ns,
            connection_epoch,
        ))
    }

    /// Validating depth constructor; level elements stay unchecked by
    /// contract, only symbol and timestamps are verified.
    #[allow(clippy::too_many_arguments)]
    pub fn depth(
        symbol: &str,
        bid_prices: [f64; DEPTH_LEVELS],
        ask_prices: [f64; DEPTH_LEVELS],
        bid_vols: [i64; DEPTH_LEVELS],
        ask_vols: [i64; DEPTH_LEVELS],
        bid_flag: i32,
        ask_flag: i32,
        recv_ts_ns: i64,
        recv_mono_ns: u64,
        connection_epoch: u64,
    ) -> Result<Self, EventError> {
        let symbol = normalize_symbol(symbol)?;
        if recv_ts_ns < 0 {
            return Err(EventError::NegativeTimestamp(recv_ts_ns));
        }
        Ok(Self::depth_unchecked(
            symbol,
            bid_prices,
            ask_prices,
            bid_vols,
            ask_vols,
            bid_flag,
            ask_flag,
            recv_ts_ns,
            recv_mono_ns,
            connection_epoch,
        ))
    }

    #[inline]
    pub fn symbol(&self) -> &str {
        match self {
            Event::TopOfBook { symbol, .. } | Event::DepthBook { symbol, .. } => symbol,
        }
    }

    #[inline]
    pub fn bid_flag(&self) -> SessionFlag {
        match self {
            Event::TopOfBook { bid_flag, .. } | Event::DepthBook { bid_flag, .. } => {
                SessionFlag::from_raw(*bid_flag)
            }
        }
    }

    #[inline]
    pub fn ask_flag(&self) -> SessionFlag {
        match self {
            Event::TopOfBook { ask_flag, .. } | Event::DepthBook { ask_flag, .. } => {
                SessionFlag::from_raw(*ask_flag)
            }
        }
    }

    /// True when either side is in an auction period (ATO or ATC).
    #[inline]
    pub fn is_auction(&self) -> bool {
        self.bid_flag().is_auction() || self.ask_flag().is_auction()
    }

    #[inline]
    pub fn recv_ts_ns(&self) -> i64 {
        match self {
            Event::TopOfBook { recv_ts_ns, .. } | Event::DepthBook { recv_ts_ns, .. } => {
                *recv_ts_ns
            }
        }
    }

    #[inline]
    pub fn recv_mono_ns(&self) -> u64 {
        match self {
            Event::TopOfBook { recv_mono_ns, .. } | Event::DepthBook { recv_mono_ns, .. } => {
                *recv_mono_ns
            }
        }
    }

    /// Transport epoch the event was emitted under; strategies reset
    /// derived state whenever this changes.
    #[inline]
    pub fn connection_epoch(&self) -> u64 {
        match self {
            Event::TopOfBook {
                connection_epoch, ..
            }
            | Event::DepthBook {
                connection_epoch, ..
            } => *connection_epoch,
        }
    }
}

fn normalize_symbol(symbol: &str) -> Result<CompactString, EventError> {
    if symbol.is_empty() {
        return Err(EventError::EmptySymbol);
    }
    Ok(CompactString::from(symbol.to_ascii_uppercase()))
}
