//! Strategy-facing feed assembly
//!
//! Wires the four subsystems together under the ownership rules they
//! expect: the transport owns the broker session, the adapter decodes
//! into the bounded queue, and the strategy thread drains the queue and
//! feeds the liveness monitor. Producer side and consumer side never
//! share more than the queue.

use std::fmt;
use std::sync::Arc;

use crate::adapter::{AdapterStats, BidOfferAdapter};
use crate::config::{Config, ConfigError};
use crate::dispatcher::{EventQueue, QueueError, QueueHealth, QueueStats};
use crate::event::Event;
use crate::liveness::FeedLiveness;
use crate::transport::{FeedTransport, TransportError, TransportStats};

/// Errors from feed assembly and transport-facing operations.
#[derive(Debug)]
pub enum FeedError {
    Config(ConfigError),
    Transport(TransportError),
}

impl fmt::Display for FeedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "config error: {}", e),
            Self::Transport(e) => write!(f, "transport error: {}", e),
        }
    }
}

impl std::error::Error for FeedError {}

impl From<ConfigError> for FeedError {
    fn from(e: ConfigError) -> Self {
        FeedError::Config(e)
    }
}

impl From<TransportError> for FeedError {
    fn from(e: TransportError) -> Self {
        FeedError::Transport(e)
    }
}

/// Aggregated health view for strategy-side decisions.
#[derive(Debug, Clone)]
pub struct FeedHealth {
    pub queue: QueueHealth,
    pub transport: TransportStats,
    pub adapter: AdapterStats,
    /// Global liveness verdict at the time of the call
    pub feed_dead: bool,
}

/// Assembled market-data feed.
///
/// `connect`/`subscribe`/`shutdown` run on the control plane; `poll` is
/// the consumer-side hot loop and stays synchronous. The liveness monitor
/// lives on the consumer side and is updated from the receive timestamps
/// of polled events.
pub struct MarketFeed {
    transport: Arc<FeedTransport>,
    adapter: Arc<BidOfferAdapter>,
    queue: Arc<EventQueue>,
    liveness: FeedLiveness,
}

impl MarketFeed {
    pub fn new(config: Config) -> Result<Self, FeedError> {
        config.validate()?;
        let transport = FeedTransport::new(config.transport.clone())?;
        let queue = Arc::new(EventQueue::with_config(
            config.dispatcher.maxlen,
            config.dispatcher.ema_alpha,
            config.dispatcher.drop_warning_threshold,
        ));
        let sink = Arc::clone(&queue);
        let adapter = BidOfferAdapter::new(
            Arc::clone(&transport),
            &config.adapter,
            Arc::new(move |event| sink.push(event)),
        );
        let liveness = FeedLiveness::new(&config.liveness);
        Ok(Self {
            transport,
            adapter,
            queue,
            liveness,
        })
    }

    /// Opens the broker session. Reconnects from here on are transparent;
    /// the strategy observes them only through `connection_epoch`.
    pub async fn connect(&self) -> Result<(), FeedError> {
        self.transport.connect().await?;
        Ok(())
    }

    /// Subscribes the bid/offer stream for `symbol`.
    pub async fn subscribe(&self, symbol: &str) -> Result<(), FeedError> {
        self.adapter.subscribe_symbol(symbol).await?;
        Ok(())
    }

    pub async fn unsubscribe(&self, symbol: &str) -> Result<(), FeedError> {
        self.adapter.unsubscribe_symbol(symbol).await?;
        Ok(())
    }

    /// Drains up to `max_events` events in FIFO order and stamps the
    /// liveness monitor with each event's receive time.
    pub fn poll(&mut self, max_events: usize) -> Result<Vec<Event>, QueueError> {
        let batch = self.queue.poll(max_events)?;
        for event in &batch {
            self.liveness.on_event(event.symbol(), event.recv_mono_ns());
        }
        Ok(batch)
    }

    pub fn health(&self) -> FeedHealth {
        FeedHealth {
            queue: self.queue.health(),
            transport: self.transport.stats(),
            adapter: self.adapter.stats(),
            feed_dead: self.liveness.is_feed_dead(crate::clock::mono_ns()),
        }
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub fn transport_stats(&self) -> TransportStats {
        self.transport.stats()
    }

    pub fn adapter_stats(&self) -> AdapterStats {
        self.adapter.stats()
    }

    /// Read access for the staleness queries (`is_stale`,
    /// `stale_symbols`, `last_seen_gap_ms`, ...).
    pub fn liveness(&self) -> &FeedLiveness {
        &self.liveness
    }

    pub async fn shutdown(&self) {
        self.transport.shutdown().await;
    }
}
