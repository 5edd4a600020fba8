//! Broker wire payloads
//!
//! `BidOfferV3` is the binary message published on
//! `proto/topic/bidofferv3/{SYMBOL}`. The schema is small and frozen, so
//! the messages are written out by hand as prost structs instead of being
//! generated at build time; tests use the derived encoder to build
//! payloads.

use prost::Message;

/// Fixed-precision decimal amount, interpreted as `units + nanos * 1e-9`.
#[derive(Clone, PartialEq, Message)]
pub struct Money {
    #[prost(int64, tag = "1")]
    pub units: i64,
    #[prost(int32, tag = "2")]
    pub nanos: i32,
}

/// Ten levels of bid/offer for one symbol plus per-side session flags.
///
/// Field numbering: `symbol` is 1, bid level N occupies tags `2N`
/// (price) and `2N+1` (volume), ask level N occupies `20+2N` and
/// `21+2N`, flags close the message at 42/43.
#[derive(Clone, PartialEq, Message)]
pub struct BidOfferV3 {
    #[prost(string, tag = "1")]
    pub symbol: String,
    #[prost(message, optional, tag = "2")]
    pub bid_price1: Option<Money>,
    #[prost(int64, tag = "3")]
    pub bid_volume1: i64,
    #[prost(message, optional, tag = "4")]
    pub bid_price2: Option<Money>,
    #[prost(int64, tag = "5")]
    pub bid_volume2: i64,
    #[prost(message, optional, tag = "6")]
    pub bid_price3: Option<Money>,
    #[prost(int64, tag = "7")]
    pub bid_volume3: i64,
    #[prost(message, optional, tag = "8")]
    pub bid_price4: Option<Money>,
    #[prost(int64, tag = "9")]
    pub bid_volume4: i64,
    #[prost(message, optional, tag = "10")]
    pub bid_price5: Option<Money>,
    #[prost(int64, tag = "11")]
    pub bid_volume5: i64,
    #[prost(message, optional, tag = "12")]
    pub bid_price6: Option<Money>,
    #[prost(int64, tag = "13")]
    pub bid_volume6: i64,
    #[prost(message, optional, tag = "14")]
    pub bid_price7: Option<Money>,
    #[prost(int64, tag = "15")]
    pub bid_volume7: i64,
    #[prost(message, optional, tag = "16")]
    pub bid_price8: Option<Money>,
    #[prost(int64, tag = "17")]
    pub bid_volume8: i64,
    #[prost(message, optional, tag = "18")]
    pub bid_price9: Option<Money>,
    #[prost(int64, tag = "19")]
    pub bid_volume9: i64,
    #[prost(message, optional, tag = "20")]
    pub bid_price10: Option<Money>,
    #[prost(int64, tag = "21")]
    pub bid_volume10: i64,
    #[prost(message, optional, tag = "22")]
    pub ask_price1: Option<Money>,
    #[prost(int64, tag = "23")]
    pub ask_volume1: i64,
    #[prost(message, optional, tag = "24")]
    pub ask_price2: Option<Money>,
    #[prost(int64, tag = "25")]
    pub ask_volume2: i64,
    #[prost(message, optional, tag = "26")]
    pub ask_price3: Option<Money>,
    #[prost(int64, tag = "27")]
    pub ask_volume3: i64,
    #[prost(message, optional, tag = "28")]
    pub ask_price4: Option<Money>,
    #[prost(int64, tag = "29")]
    pub ask_volume4: i64,
    #[prost(message, optional, tag = "30")]
    pub ask_price5: Option<Money>,
    #[prost(int64, tag = "31")]
    pub ask_volume5: i64,
    #[prost(message, optional, tag = "32")]
    pub ask_price6: Option<Money>,
    #[prost(int64, tag = "33")]
    pub ask_volume6: i64,
    #[prost(message, optional, tag = "34")]
    pub ask_price7: Option<Money>,
    #[prost(int64, tag = "35")]
    pub ask_volume7: i64,
    #[prost(message, optional, tag = "36")]
    pub ask_price8: Option<Money>,
    #[prost(int64, tag = "37")]
    pub ask_volume8: i64,
    #[prost(message, optional, tag = "38")]
    pub ask_price9: Option<Money>,
    #[prost(int64, tag = "39")]
    pub ask_volume9: i64,
    #[prost(message, optional, tag = "40")]
    pub ask_price10: Option<Money>,
    #[prost(int64, tag = "41")]
    pub ask_volume10: i64,
    /// Session flag, see [`crate::event::SessionFlag`] for values
    #[prost(int32, tag = "42")]
    pub bid_flag: i32,
    #[prost(int32, tag = "43")]
    pub ask_flag: i32,
}

impl BidOfferV3 {
    /// Single-pass decode of a raw broker payload.
    #[inline]
    pub fn decode_payload(payload: &[u8]) -> Result<Self, prost::DecodeError> {
        Self::decode(payload)
    }
}

/// Converts a fixed-precision amount to a double by the exact expression
/// `units + nanos * 1e-9`. No arbitrary-precision arithmetic; downstream
/// comparisons use an absolute tolerance.
#[inline]
pub fn money_to_f64(money: &Money) -> f64 {
    money.units as f64 + f64::from(money.nanos) * 1e-9
}

/// Missing prices on the wire read as zero.
#[inline]
pub fn opt_money_to_f64(money: &Option<Money>) -> f64 {
    money.as_ref().map(money_to_f64).unwrap_or(0.0)
}
