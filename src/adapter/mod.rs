//! Bid/offer normalization adapter
//!
//! Decodes binary `BidOfferV3` payloads from subscribed topics into typed
//! [`Event`]s and emits them through a user-supplied callback. The hot
//! path does a single decode with direct field access (no intermediate
//! map), converts fixed-precision prices to doubles, and stamps receive
//! timestamps plus the transport's connection epoch.
//!
//! Error accounting is strict: per inbound message exactly one of
//! `messages_parsed`, `parse_errors`, `callback_errors` increments. A
//! malformed payload is dropped without retry; a panicking callback is
//! isolated and never affects subsequent messages.

use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use compact_str::CompactString;
use parking_lot::RwLock;
use tracing::{error, warn};

use crate::clock;
use crate::config::AdapterConfig;
use crate::event::{Event, DEPTH_LEVELS};
use crate::proto::{opt_money_to_f64, BidOfferV3};
use crate::throttle::{LogThrottle, Verbosity};
use crate::transport::{FeedTransport, MessageCallback, TransportError};

/// Topic prefix for the bid/offer stream; the symbol is appended upper-cased.
pub const TOPIC_PREFIX: &str = "proto/topic/bidofferv3/";

/// Strategy-side sink for decoded events.
pub type EmitFn = Arc<dyn Fn(Event) + Send + Sync>;

/// Adapter counter snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterStats {
    pub messages_parsed: u64,
    pub parse_errors: u64,
    pub callback_errors: u64,
    pub subscribed_symbols: usize,
}

/// Decodes broker payloads into events and forwards them to the strategy.
///
/// Holds a non-owning handle to the transport for epoch reads and
/// subscribe calls. In top-of-book mode each message allocates only the
/// event itself; depth mode adds four ten-element arrays inline in the
/// event and is not intended for ultra-low-latency strategies.
pub struct BidOfferAdapter {
    transport: Arc<FeedTransport>,
    emit: EmitFn,
    full_depth: bool,
    messages_parsed: AtomicU64,
    parse_errors: LogThrottle,
    callback_errors: LogThrottle,
    symbols: RwLock<BTreeSet<CompactString>>,
}

impl BidOfferAdapter {
    pub fn new(transport: Arc<FeedTransport>, config: &AdapterConfig, emit: EmitFn) -> Arc<Self> {
        Arc::new(Self {
            transport,
            emit,
            full_depth: config.full_depth,
            messages_parsed: AtomicU64::new(0),
            parse_errors: LogThrottle::new(),
            callback_errors: LogThrottle::new(),
            symbols: RwLock::new(BTreeSet::new()),
        })
    }

    /// Subscribes the bid/offer topic for `symbol` (upper-cased) and
    /// registers the decode path as its message callback.
    pub async fn subscribe_symbol(self: &Arc<Self>, symbol: &str) -> Result<(), TransportError> {
        let symbol = CompactString::from(symbol.to_ascii_uppercase());
        let topic = format!("{}{}", TOPIC_PREFIX, symbol);
        let adapter = Arc::clone(self);
        let callback: MessageCallback =
            Arc::new(move |topic, payload| adapter.handle_message(topic, payload));
        self.transport.subscribe(&topic, callback).await?;
        self.symbols.write().insert(symbol);
        Ok(())
    }

    /// Drops the symbol's topic and callback registration.
    pub async fn unsubscribe_symbol(&self, symbol: &str) -> Result<(), TransportError> {
        let symbol = symbol.to_ascii_uppercase();
        let topic = format!("{}{}", TOPIC_PREFIX, symbol);
        self.transport.unsubscribe(&topic).await?;
        self.symbols.write().remove(symbol.as_str());
        Ok(())
    }

    /// Hot path: decode one payload and emit the event.
    ///
    /// Two separate catch scopes keep the accounting exact: a decode
    /// failure counts as a parse error only, a panicking user callback as
    /// a callback error only, and a clean pass as parsed only.
    pub fn handle_message(&self, topic: &str, payload: &[u8]) {
        let recv_ts_ns = clock::wall_ns();
        let recv_mono_ns = clock::mono_ns();

        let event = match BidOfferV3::decode_payload(payload) {
            Ok(msg) => self.build_event(msg, recv_ts_ns, recv_mono_ns),
            Err(err) => {
                let occ = self.parse_errors.record();
                match occ.verbosity {
                    Verbosity::Detailed => warn!(
                        topic,
                        error = %err,
                        payload_len = payload.len(),
                        occurrence = occ.ordinal,
                        "dropping undecodable bid/offer payload"
                    ),
                    Verbosity::Summary => {
                        warn!(topic, total = occ.ordinal, "parse errors continuing")
                    }
                    Verbosity::Suppressed => {}
                }
                return;
            }
        };

        match catch_unwind(AssertUnwindSafe(|| (self.emit)(event))) {
            Ok(()) => {
                self.messages_parsed.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                let occ = self.callback_errors.record();
                match occ.verbosity {
                    Verbosity::Detailed => error!(
                        topic,
                        occurrence = occ.ordinal,
                        "event callback panicked; message dropped"
                    ),
                    Verbosity::Summary => {
                        error!(topic, total = occ.ordinal, "callback errors continuing")
                    }
                    Verbosity::Suppressed => {}
                }
            }
        }
    }

    /// Builds the event via the non-validating constructor: the decoder
    /// already produced well-formed protocol fields. The epoch is read
    /// from the transport at emission time.
    fn build_event(&self, msg: BidOfferV3, recv_ts_ns: i64, recv_mono_ns: u64) -> Event {
        let epoch = self.transport.connection_epoch();
        let symbol = if msg.symbol.bytes().any(|b| b.is_ascii_lowercase()) {
            CompactString::from(msg.symbol.to_ascii_uppercase())
        } else {
            CompactString::from(msg.symbol)
        };

        if self.full_depth {
            // Explicit level unroll: no per-field dispatch in the hot path
            let bid_prices: [f64; DEPTH_LEVELS] = [
                opt_money_to_f64(&msg.bid_price1),
                opt_money_to_f64(&msg.bid_price2),
                opt_money_to_f64(&msg.bid_price3),
                opt_money_to_f64(&msg.bid_price4),
                opt_money_to_f64(&msg.bid_price5),
                opt_money_to_f64(&msg.bid_price6),
                opt_money_to_f64(&msg.bid_price7),
                opt_money_to_f64(&msg.bid_price8),
                opt_money_to_f64(&msg.bid_price9),
                opt_money_to_f64(&msg.bid_price10),
            ];
            let ask_prices: [f64; DEPTH_LEVELS] = [
                opt_money_to_f64(&msg.ask_price1),
                opt_money_to_f64(&msg.ask_price2),
                opt_money_to_f64(&msg.ask_price3),
                opt_money_to_f64(&msg.ask_price4),
                opt_money_to_f64(&msg.ask_price5),
                opt_money_to_f64(&msg.ask_price6),
                opt_money_to_f64(&msg.ask_price7),
                opt_money_to_f64(&msg.ask_price8),
                opt_money_to_f64(&msg.ask_price9),
                opt_money_to_f64(&msg.ask_price10),
            ];
            let bid_vols: [i64; DEPTH_LEVELS] = [
                msg.bid_volume1,
                msg.bid_volume2,
                msg.bid_volume3,
                msg.bid_volume4,
                msg.bid_volume5,
                msg.bid_volume6,
                msg.bid_volume7,
                msg.bid_volume8,
                msg.bid_volume9,
                msg.bid_volume10,
            ];
            let ask_vols: [i64; DEPTH_LEVELS] = [
                msg.ask_volume1,
                msg.ask_volume2,
                msg.ask_volume3,
                msg.ask_volume4,
                msg.ask_volume5,
                msg.ask_volume6,
                msg.ask_volume7,
                msg.ask_volume8,
                msg.ask_volume9,
                msg.ask_volume10,
            ];
            Event::depth_unchecked(
                symbol,
                bid_prices,
                ask_prices,
                bid_vols,
                ask_vols,
                msg.bid_flag,
                msg.ask_flag,
                recv_ts_ns,
                recv_mono_ns,
                epoch,
            )
        } else {
            Event::top_of_book_unchecked(
                symbol,
                opt_money_to_f64(&msg.bid_price1),
                opt_money_to_f64(&msg.ask_price1),
                msg.bid_volume1,
                msg.ask_volume1,
                msg.bid_flag,
                msg.ask_flag,
                recv_ts_ns,
                recv_mono_ns,
                epoch,
            )
        }
    }

    pub fn stats(&self) -> AdapterStats {
        AdapterStats {
            messages_parsed: self.messages_parsed.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.count(),
            callback_errors: self.callback_errors.count(),
            subscribed_symbols: self.symbols.read().len(),
        }
    }

    /// Currently subscribed symbols, sorted.
    pub fn subscribed_symbols(&self) -> Vec<CompactString> {
        self.symbols.read().iter().cloned().collect()
    }
}
