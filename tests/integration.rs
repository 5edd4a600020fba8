//! End-to-end tests for the ingestion pipeline
//!
//! These drive the public surface the way a strategy process would: raw
//! broker payloads enter through the adapter, flow through the bounded
//! queue, and are drained on the consumer side, which feeds the liveness
//! monitor from the events' receive timestamps.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use prost::Message;
use test_case::test_case;

use feedlink::adapter::BidOfferAdapter;
use feedlink::config::{AdapterConfig, Config, LivenessConfig};
use feedlink::dispatcher::EventQueue;
use feedlink::event::Event;
use feedlink::liveness::FeedLiveness;
use feedlink::proto::{money_to_f64, BidOfferV3, Money};
use feedlink::transport::FeedTransport;

const SEC: u64 = 1_000_000_000;

/// Makes pipeline logs visible under `RUST_LOG=feedlink=debug`.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.transport.app_id = "app".to_string();
    config.transport.app_secret = "Zm9vYmFy".to_string();
    config.transport.app_code = "ALGO".to_string();
    config.transport.broker_id = "SANDBOX".to_string();
    config
}

fn test_transport() -> Arc<FeedTransport> {
    FeedTransport::new(test_config().transport).expect("transport construction")
}

fn quote_payload(symbol: &str, bid: Money, ask: Money, bid_vol: i64, ask_vol: i64) -> Vec<u8> {
    BidOfferV3 {
        symbol: symbol.to_string(),
        bid_price1: Some(bid),
        bid_volume1: bid_vol,
        ask_price1: Some(ask),
        ask_volume1: ask_vol,
        bid_flag: 1,
        ask_flag: 1,
        ..Default::default()
    }
    .encode_to_vec()
}

/// Adapter wired straight into a bounded queue, like the assembled feed.
fn pipeline(maxlen: usize) -> (Arc<BidOfferAdapter>, Arc<EventQueue>) {
    let queue = Arc::new(EventQueue::new(maxlen));
    let sink = Arc::clone(&queue);
    let adapter = BidOfferAdapter::new(
        test_transport(),
        &AdapterConfig { full_depth: false },
        Arc::new(move |event| sink.push(event)),
    );
    (adapter, queue)
}

#[test]
fn test_top_of_book_happy_path() {
    init_logging();
    let (adapter, queue) = pipeline(16);

    let payload = quote_payload(
        "aot",
        Money { units: 25, nanos: 500_000_000 },
        Money { units: 26, nanos: 0 },
        1000,
        500,
    );
    adapter.handle_message("proto/topic/bidofferv3/AOT", &payload);

    let batch = queue.poll(10).unwrap();
    assert_eq!(batch.len(), 1);
    match &batch[0] {
        Event::TopOfBook {
            symbol,
            bid,
            ask,
            bid_vol,
            ask_vol,
            bid_flag,
            ask_flag,
            recv_ts_ns,
            connection_epoch,
            ..
        } => {
            assert_eq!(symbol, "AOT");
            assert!((bid - 25.5).abs() < 1e-9);
            assert!((ask - 26.0).abs() < 1e-9);
            assert_eq!(*bid_vol, 1000);
            assert_eq!(*ask_vol, 500);
            assert_eq!(*bid_flag, 1);
            assert_eq!(*ask_flag, 1);
            assert!(*recv_ts_ns > 0);
            assert_eq!(*connection_epoch, 0);
        }
        other => panic!("expected top-of-book, got {:?}", other),
    }
    assert_eq!(adapter.stats().messages_parsed, 1);
}

#[test]
fn test_backpressure_drops_oldest() {
    let (adapter, queue) = pipeline(3);

    for (i, symbol) in ["E1", "E2", "E3", "E4"].iter().enumerate() {
        let payload = quote_payload(
            symbol,
            Money { units: 10 + i as i64, nanos: 0 },
            Money { units: 11 + i as i64, nanos: 0 },
            1,
            1,
        );
        adapter.handle_message("proto/topic/bidofferv3/X", &payload);
    }

    let batch = queue.poll(10).unwrap();
    let symbols: Vec<&str> = batch.iter().map(|e| e.symbol()).collect();
    assert_eq!(symbols, vec!["E2", "E3", "E4"]);

    let stats = queue.stats();
    assert_eq!(stats.total_pushed, 4);
    assert_eq!(stats.total_dropped, 1);
    assert_eq!(stats.total_polled, 3);
    assert_eq!(stats.queue_len, 0);
}

#[test]
fn test_parse_and_callback_errors_stay_isolated() {
    // The emit callback rejects one poisoned symbol; decode rejects one
    // garbage payload; the surrounding messages flow through untouched.
    let queue = Arc::new(EventQueue::new(16));
    let sink = Arc::clone(&queue);
    let adapter = BidOfferAdapter::new(
        test_transport(),
        &AdapterConfig { full_depth: false },
        Arc::new(move |event| {
            if event.symbol() == "ERR" {
                panic!("strategy rejects this symbol");
            }
            sink.push(event);
        }),
    );

    let good = |symbol: &str| {
        quote_payload(
            symbol,
            Money { units: 1, nanos: 0 },
            Money { units: 2, nanos: 0 },
            1,
            1,
        )
    };

    adapter.handle_message("t", &good("AOT"));
    adapter.handle_message("t", &[0xde, 0xad, 0xbe, 0xef]);
    adapter.handle_message("t", &good("ERR"));
    adapter.handle_message("t", &good("PTT"));

    let stats = adapter.stats();
    assert_eq!(stats.messages_parsed, 2);
    assert_eq!(stats.parse_errors, 1);
    assert_eq!(stats.callback_errors, 1);

    let survivors: Vec<String> = queue
        .poll(10)
        .unwrap()
        .iter()
        .map(|e| e.symbol().to_string())
        .collect();
    assert_eq!(survivors, vec!["AOT".to_string(), "PTT".to_string()]);
}

#[test]
fn test_consumer_side_liveness_tracking() {
    // The strategy loop pattern: drain the queue, stamp the liveness
    // monitor from each event's receive time, then ask staleness
    // questions against a later monotonic now.
    let (adapter, queue) = pipeline(16);
    let mut liveness = FeedLiveness::new(&LivenessConfig {
        max_gap_seconds: 5.0,
        per_symbol_max_gap: Default::default(),
    });

    adapter.handle_message(
        "t",
        &quote_payload(
            "AOT",
            Money { units: 25, nanos: 0 },
            Money { units: 26, nanos: 0 },
            1,
            1,
        ),
    );
    adapter.handle_message(
        "t",
        &quote_payload(
            "PTT",
            Money { units: 30, nanos: 0 },
            Money { units: 31, nanos: 0 },
            1,
            1,
        ),
    );

    let batch = queue.poll(10).unwrap();
    assert_eq!(batch.len(), 2);
    let mut last_mono = 0;
    for event in &batch {
        liveness.on_event(event.symbol(), event.recv_mono_ns());
        last_mono = event.recv_mono_ns();
    }

    assert!(liveness.has_ever_received());
    assert!(!liveness.is_feed_dead(last_mono + SEC));
    assert!(liveness.is_feed_dead(last_mono + 6 * SEC));
    assert_eq!(
        liveness.stale_symbols(last_mono + 6 * SEC),
        vec!["AOT", "PTT"]
    );
    assert!(!liveness.has_seen("BBL"));
}

#[test_case(25, 500_000_000, 25.5; "half satang")]
#[test_case(26, 0, 26.0; "whole units")]
#[test_case(0, 1, 1e-9; "single nano")]
#[test_case(-2, -250_000_000, -2.25; "negative derivative price")]
#[test_case(1_000_000, 500_000_000, 1_000_000.5; "large value")]
fn test_money_decode_precision(units: i64, nanos: i32, expected: f64) {
    let money = Money { units, nanos };
    assert!((money_to_f64(&money) - expected).abs() < 1e-12);

    // Survives an encode/decode round trip through the wire format
    let payload = BidOfferV3 {
        symbol: "X".to_string(),
        bid_price1: Some(money),
        ..Default::default()
    }
    .encode_to_vec();
    let decoded = BidOfferV3::decode(payload.as_slice()).unwrap();
    let roundtrip = money_to_f64(decoded.bid_price1.as_ref().unwrap());
    assert!((roundtrip - expected).abs() < 1e-12);
}

#[tokio::test]
async fn test_queue_clear_resets_pipeline_counters() {
    let (adapter, queue) = pipeline(4);
    adapter.subscribe_symbol("aot").await.unwrap();
    assert_eq!(adapter.subscribed_symbols(), vec!["AOT"]);

    adapter.handle_message(
        "t",
        &quote_payload(
            "AOT",
            Money { units: 1, nanos: 0 },
            Money { units: 2, nanos: 0 },
            1,
            1,
        ),
    );
    assert_eq!(queue.stats().total_pushed, 1);

    queue.clear();
    let stats = queue.stats();
    assert_eq!(stats.total_pushed, 0);
    assert_eq!(stats.total_polled, 0);
    assert_eq!(stats.total_dropped, 0);
    assert_eq!(stats.queue_len, 0);
    assert_eq!(stats.maxlen, 4);
    assert_eq!(queue.health().drop_rate_ema, 0.0);
}
