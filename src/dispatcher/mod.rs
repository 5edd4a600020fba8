//! Bounded single-producer/single-consumer event hand-off
//!
//! Decouples the broker I/O task (producer) from the strategy thread
//! (consumer) with a pre-sized ring, drop-oldest backpressure, exact drop
//! accounting, and an EMA-smoothed drop-rate health signal.
//!
//! Concurrency contract: strictly one producer and one consumer. Each
//! counter has exactly one writer (pushed/dropped on the producer side,
//! polled on the consumer side); readers tolerate a bounded skew between
//! counters. Multi-producer or multi-consumer use requires external
//! synchronization and is unsupported.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crossbeam_queue::ArrayQueue;
use tracing::{info, warn};

use crate::event::Event;

/// Default ring capacity.
pub const DEFAULT_MAXLEN: usize = 100_000;
/// Default EMA smoothing factor (roughly a 100-event half-life).
pub const DEFAULT_EMA_ALPHA: f64 = 0.01;
/// Default drop-rate level that triggers the warning edge log.
pub const DEFAULT_DROP_WARNING_THRESHOLD: f64 = 0.01;

/// Errors surfaced synchronously to the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// `poll` requires a positive batch size
    InvalidBatchSize,
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidBatchSize => write!(f, "poll batch size must be positive"),
        }
    }
}

impl std::error::Error for QueueError {}

/// Counter snapshot. Eventually consistent: each field has a single
/// writer and is read without locking, so the tuple is not transactional.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub total_pushed: u64,
    pub total_polled: u64,
    pub total_dropped: u64,
    pub queue_len: usize,
    pub maxlen: usize,
}

/// Health snapshot derived from the same counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueueHealth {
    pub drop_rate_ema: f64,
    pub queue_utilization: f64,
    pub total_dropped: u64,
    pub total_pushed: u64,
}

/// Drop-oldest bounded queue with a drop-rate health signal.
pub struct EventQueue {
    ring: ArrayQueue<Event>,
    total_pushed: AtomicU64,
    total_polled: AtomicU64,
    total_dropped: AtomicU64,
    /// f64 bits of the EMA; written only by the producer
    drop_ema_bits: AtomicU64,
    ema_alpha: f64,
    warn_threshold: f64,
    /// Edge latch so each threshold crossing logs once
    above_threshold: AtomicBool,
}

impl EventQueue {
    pub fn new(maxlen: usize) -> Self {
        Self::with_config(maxlen, DEFAULT_EMA_ALPHA, DEFAULT_DROP_WARNING_THRESHOLD)
    }

    /// `maxlen` must be positive; `ema_alpha` and `warn_threshold` are
    /// validated by the config layer (0 < x <= 1).
    pub fn with_config(maxlen: usize, ema_alpha: f64, warn_threshold: f64) -> Self {
        Self {
            ring: ArrayQueue::new(maxlen),
            total_pushed: AtomicU64::new(0),
            total_polled: AtomicU64::new(0),
            total_dropped: AtomicU64::new(0),
            drop_ema_bits: AtomicU64::new(0f64.to_bits()),
            ema_alpha,
            warn_threshold,
            above_threshold: AtomicBool::new(false),
        }
    }

    /// Producer-side append. Never fails: at capacity the oldest element
    /// is evicted atomically and counted as dropped. The eviction happens
    /// inside `force_push`, which returns the displaced element, so drop
    /// accounting is exact as long as this is the only pushing thread.
    pub fn push(&self, event: Event) {
        let dropped = self.ring.force_push(event).is_some();
        if dropped {
            self.total_dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.total_pushed.fetch_add(1, Ordering::Relaxed);
        self.update_ema(dropped);
    }

    /// Consumer-side batch removal in FIFO order, stopping early when the
    /// ring drains. An empty queue is not an error; a zero batch size is.
    pub fn poll(&self, max_events: usize) -> Result<Vec<Event>, QueueError> {
        if max_events == 0 {
            return Err(QueueError::InvalidBatchSize);
        }
        let mut batch = Vec::with_capacity(max_events.min(self.ring.capacity()));
        while batch.len() < max_events {
            match self.ring.pop() {
                Some(event) => batch.push(event),
                None => break,
            }
        }
        self.total_polled
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        Ok(batch)
    }

    /// Empties the ring and resets counters and the EMA. The caller must
    /// quiesce producer and consumer first; this is not safe to run
    /// concurrently with either.
    pub fn clear(&self) {
        while self.ring.pop().is_some() {}
        self.total_pushed.store(0, Ordering::Relaxed);
        self.total_polled.store(0, Ordering::Relaxed);
        self.total_dropped.store(0, Ordering::Relaxed);
        self.drop_ema_bits.store(0f64.to_bits(), Ordering::Relaxed);
        self.above_threshold.store(false, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            total_pushed: self.total_pushed.load(Ordering::Relaxed),
            total_polled: self.total_polled.load(Ordering::Relaxed),
            total_dropped: self.total_dropped.load(Ordering::Relaxed),
            queue_len: self.ring.len(),
            maxlen: self.ring.capacity(),
        }
    }

    pub fn health(&self) -> QueueHealth {
        QueueHealth {
            drop_rate_ema: self.drop_rate_ema(),
            queue_utilization: self.ring.len() as f64 / self.ring.capacity() as f64,
            total_dropped: self.total_dropped.load(Ordering::Relaxed),
            total_pushed: self.total_pushed.load(Ordering::Relaxed),
        }
    }

    pub fn drop_rate_ema(&self) -> f64 {
        f64::from_bits(self.drop_ema_bits.load(Ordering::Relaxed))
    }

    fn update_ema(&self, dropped: bool) {
        let sample = if dropped { 1.0 } else { 0.0 };
        let prev = f64::from_bits(self.drop_ema_bits.load(Ordering::Relaxed));
        let ema = self.ema_alpha * sample + (1.0 - self.ema_alpha) * prev;
        self.drop_ema_bits.store(ema.to_bits(), Ordering::Relaxed);

        if ema > self.warn_threshold {
            if !self.above_threshold.swap(true, Ordering::Relaxed) {
                warn!(
                    drop_rate = ema,
                    threshold = self.warn_threshold,
                    "event queue drop rate crossed warning threshold"
                );
            }
        } else if self.above_threshold.swap(false, Ordering::Relaxed) {
            info!(drop_rate = ema, "event queue drop rate recovered");
        }
    }
}
