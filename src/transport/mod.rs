//! Authenticated MQTT/WSS transport
//!
//! Owns the broker session end to end: REST login and host discovery,
//! client construction over WebSocket Secure, delivery of raw
//! `(topic, payload)` pairs to per-topic callbacks, and survival of
//! disconnects and token expiry through controlled reconnects.
//!
//! Key mechanics:
//! - the subscription table is the sole source of truth for what must be
//!   subscribed; the broker side is rebuilt on every connect
//!   (clean-session semantics);
//! - each MQTT client carries the generation it was built under, and the
//!   message dispatcher silently drops deliveries from a replaced client;
//! - `reconnect_epoch` increments after subscription replay, so an event
//!   stamped with a new epoch proves its subscription was restored;
//! - token refresh is a controlled reconnect with fresh credentials,
//!   never an in-place header mutation on a live client.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use rumqttc::QoS;
use smallvec::{smallvec, SmallVec};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::auth::{AuthError, BrokerEndpoint, RestSession};
use crate::clock;
use crate::config::TransportConfig;

mod mqtt;

use mqtt::{ConnectWatch, MqttSession};

/// Callback invoked with `(topic, payload)` for every inbound message on
/// a subscribed topic.
pub type MessageCallback = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Connection lifecycle states. Progression is monotonic except for the
/// `Reconnecting -> Connecting -> Connected` cycle; `Shutdown` is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Init,
    Connecting,
    Connected,
    Reconnecting,
    Shutdown,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Shutdown => "shutdown",
        };
        write!(f, "{}", name)
    }
}

/// Errors raised synchronously from transport operations.
#[derive(Debug)]
pub enum TransportError {
    /// Operation not allowed in the current state
    InvalidState {
        operation: &'static str,
        state: LinkState,
    },
    /// REST login failed
    AuthFailed(AuthError),
    /// Host/token discovery failed
    DiscoveryFailed(AuthError),
    /// Connection token is not usable as an HTTP header value
    BadToken,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidState { operation, state } => {
                write!(f, "{} not allowed in state {}", operation, state)
            }
            Self::AuthFailed(e) => write!(f, "authentication failed: {}", e),
            Self::DiscoveryFailed(e) => write!(f, "discovery failed: {}", e),
            Self::BadToken => write!(f, "connection token not header-safe"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Counter and state snapshot; consistent under the single writer of
/// each counter, read without locking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportStats {
    pub state: LinkState,
    pub messages_received: u64,
    pub callback_errors: u64,
    pub reconnect_count: u64,
    pub reconnect_epoch: u64,
    pub client_generation: u64,
    pub last_connect_ts: i64,
    pub last_disconnect_ts: i64,
}

/// Resilient broker transport.
pub struct FeedTransport {
    config: TransportConfig,
    rest: RestSession,
    state: Mutex<LinkState>,
    subscriptions: DashMap<String, SmallVec<[MessageCallback; 2]>>,
    session: tokio::sync::Mutex<Option<MqttSession>>,
    client_generation: AtomicU64,
    reconnect_epoch: AtomicU64,
    reconnect_count: AtomicU64,
    messages_received: AtomicU64,
    callback_errors: AtomicU64,
    last_connect_ts: AtomicI64,
    last_disconnect_ts: AtomicI64,
    /// Coalesces near-simultaneous reconnect triggers; toggled only under
    /// the state mutex
    reconnecting: AtomicBool,
    shutdown: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl FeedTransport {
    pub fn new(config: TransportConfig) -> Result<Arc<Self>, TransportError> {
        let rest = RestSession::new(&config).map_err(TransportError::AuthFailed)?;
        let (shutdown_tx, _) = broadcast::channel(4);
        Ok(Arc::new(Self {
            config,
            rest,
            state: Mutex::new(LinkState::Init),
            subscriptions: DashMap::new(),
            session: tokio::sync::Mutex::new(None),
            client_generation: AtomicU64::new(0),
            reconnect_epoch: AtomicU64::new(0),
            reconnect_count: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            callback_errors: AtomicU64::new(0),
            last_connect_ts: AtomicI64::new(0),
            last_disconnect_ts: AtomicI64::new(0),
            reconnecting: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            shutdown_tx,
        }))
    }

    /// Establishes the initial session: REST login, host discovery, MQTT
    /// client construction, I/O start, and the token-refresh watcher.
    /// Allowed only once, from `Init`. The `Connected` transition happens
    /// later, inside the on-connect handler.
    pub async fn connect(self: &Arc<Self>) -> Result<(), TransportError> {
        {
            let mut state = self.state.lock();
            if *state != LinkState::Init {
                return Err(TransportError::InvalidState {
                    operation: "connect",
                    state: *state,
                });
            }
            *state = LinkState::Connecting;
        }

        let result = self.connect_inner().await;
        if result.is_err() {
            // Back to Init so the caller may retry after a REST failure
            let mut state = self.state.lock();
            if *state == LinkState::Connecting {
                *state = LinkState::Init;
            }
        }
        result
    }

    async fn connect_inner(self: &Arc<Self>) -> Result<(), TransportError> {
        self.rest
            .login()
            .await
            .map_err(TransportError::AuthFailed)?;
        let endpoint = self
            .rest
            .discover()
            .await
            .map_err(TransportError::DiscoveryFailed)?;
        // Initial connect does not wait for CONNACK; a failed handshake
        // is handled by the reconnect machinery like any disconnect
        let _watch = self.open_session(&endpoint).await?;
        tokio::spawn(Self::token_watcher(Arc::clone(self)));
        Ok(())
    }

    /// Registers `callback` for `topic`. A topic new to the table is
    /// subscribed broker-side immediately when `Connected`; otherwise it
    /// is replayed on the next connect.
    pub async fn subscribe(
        &self,
        topic: &str,
        callback: MessageCallback,
    ) -> Result<(), TransportError> {
        {
            let state = self.state.lock();
            if *state == LinkState::Shutdown {
                return Err(TransportError::InvalidState {
                    operation: "subscribe",
                    state: *state,
                });
            }
        }

        let is_new = match self.subscriptions.entry(topic.to_string()) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().push(callback);
                false
            }
            Entry::Vacant(entry) => {
                entry.insert(smallvec![callback]);
                true
            }
        };

        if is_new && *self.state.lock() == LinkState::Connected {
            if let Some(session) = self.session.lock().await.as_ref() {
                session.subscribe(topic).await;
            }
        }
        Ok(())
    }

    /// Removes the topic and all its callbacks; issues a broker-side
    /// unsubscribe when connected.
    pub async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        {
            let state = self.state.lock();
            if *state == LinkState::Shutdown {
                return Err(TransportError::InvalidState {
                    operation: "unsubscribe",
                    state: *state,
                });
            }
        }

        let removed = self.subscriptions.remove(topic).is_some();
        if removed && *self.state.lock() == LinkState::Connected {
            if let Some(session) = self.session.lock().await.as_ref() {
                session.unsubscribe(topic).await;
            }
        }
        Ok(())
    }

    /// Idempotent terminal transition: signals every background task,
    /// stops the I/O pump, and disconnects. Errors during teardown are
    /// swallowed at debug level.
    pub async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::Relaxed) {
            return;
        }
        *self.state.lock() = LinkState::Shutdown;
        let _ = self.shutdown_tx.send(());
        if let Some(session) = self.session.lock().await.take() {
            session.stop().await;
        }
        info!("transport shut down");
    }

    pub fn state(&self) -> LinkState {
        *self.state.lock()
    }

    /// Epoch stamped onto emitted events; increments on each successful
    /// reconnect after subscription replay.
    pub fn connection_epoch(&self) -> u64 {
        self.reconnect_epoch.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> TransportStats {
        TransportStats {
            state: self.state(),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            callback_errors: self.callback_errors.load(Ordering::Relaxed),
            reconnect_count: self.reconnect_count.load(Ordering::Relaxed),
            reconnect_epoch: self.reconnect_epoch.load(Ordering::Relaxed),
            client_generation: self.client_generation.load(Ordering::Relaxed),
            last_connect_ts: self.last_connect_ts.load(Ordering::Relaxed),
            last_disconnect_ts: self.last_disconnect_ts.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub(crate) fn broker_id(&self) -> &str {
        self.rest.broker_id()
    }

    /// Builds a client for `endpoint` under a fresh generation, then
    /// stops and disconnects the predecessor. Late traffic from the old
    /// client is fenced by its stale generation, no thread join needed.
    async fn open_session(
        self: &Arc<Self>,
        endpoint: &BrokerEndpoint,
    ) -> Result<ConnectWatch, TransportError> {
        let generation = self.client_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (session, watch) = MqttSession::open(self, endpoint, generation)?;
        let previous = self.session.lock().await.replace(session);
        if let Some(previous) = previous {
            previous.stop().await;
        }
        Ok(watch)
    }

    #[inline]
    fn generation_is_current(&self, generation: u64) -> bool {
        generation == self.client_generation.load(Ordering::Relaxed)
    }

    /// On-connect success handler, driven by the event pump. Replays the
    /// subscription table and only then bumps the reconnect epoch: any
    /// message observed under the new epoch implies all prior
    /// subscriptions were restored.
    pub(crate) fn handle_connected(&self, generation: u64, client: &rumqttc::AsyncClient) {
        if !self.generation_is_current(generation) {
            return;
        }
        {
            let mut state = self.state.lock();
            if *state == LinkState::Shutdown {
                return;
            }
            *state = LinkState::Connected;
        }

        let topics: Vec<String> = self
            .subscriptions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for topic in &topics {
            // Replay runs on the pump task itself, which is not polling the
            // event loop right now; the non-blocking send avoids wedging on
            // a full request channel
            if let Err(e) = client.try_subscribe(topic.as_str(), QoS::AtMostOnce) {
                warn!(topic = %topic, error = %e, "subscription replay failed");
            }
        }

        let is_reconnect = self.last_connect_ts.load(Ordering::Relaxed) > 0;
        if is_reconnect {
            self.reconnect_epoch.fetch_add(1, Ordering::Relaxed);
            self.reconnect_count.fetch_add(1, Ordering::Relaxed);
        }
        self.last_connect_ts
            .store(clock::wall_ns(), Ordering::Relaxed);
        info!(
            generation,
            epoch = self.reconnect_epoch.load(Ordering::Relaxed),
            replayed = topics.len(),
            reconnect = is_reconnect,
            "broker session established"
        );
    }

    /// On-message hot path: generation fence, counter, per-topic callback
    /// fan-out. Each callback is isolated; one failing callback never
    /// starves its siblings or later messages.
    pub(crate) fn handle_publish(&self, generation: u64, topic: &str, payload: &[u8]) {
        if !self.generation_is_current(generation) {
            // Late delivery from a replaced client: drop without counting
            return;
        }
        self.messages_received.fetch_add(1, Ordering::Relaxed);

        let callbacks = match self.subscriptions.get(topic) {
            Some(entry) => entry.value().clone(),
            None => return,
        };
        for callback in callbacks.iter() {
            if catch_unwind(AssertUnwindSafe(|| callback(topic, payload))).is_err() {
                self.callback_errors.fetch_add(1, Ordering::Relaxed);
                debug!(topic, "message callback panicked");
            }
        }
    }

    /// Connection-loss handler: records the disconnect and schedules a
    /// reconnect unless shutting down. A replaced client's death is
    /// ignored entirely.
    pub(crate) fn handle_connection_lost(self: &Arc<Self>, generation: u64, reason: &str) {
        if !self.generation_is_current(generation) {
            return;
        }
        self.last_disconnect_ts
            .store(clock::wall_ns(), Ordering::Relaxed);
        if self.shutdown.load(Ordering::Relaxed) {
            debug!(reason, "connection closed during shutdown");
            return;
        }
        warn!(reason, "broker connection lost");
        self.trigger_reconnect("connection-lost");
    }

    /// Schedules the reconnect worker. Near-simultaneous triggers (a
    /// disconnect racing the token deadline) coalesce on the
    /// `reconnecting` latch; anything after shutdown is suppressed.
    pub(crate) fn trigger_reconnect(self: &Arc<Self>, cause: &'static str) {
        {
            let mut state = self.state.lock();
            if *state == LinkState::Shutdown {
                return;
            }
            if self.reconnecting.swap(true, Ordering::Relaxed) {
                debug!(cause, "reconnect already in progress");
                return;
            }
            *state = LinkState::Reconnecting;
        }
        info!(cause, "scheduling controlled reconnect");
        tokio::spawn(Self::reconnect_worker(Arc::clone(self)));
    }

    /// Reconnect loop: re-fetch host and token (refreshing the access
    /// token when near expiry), build a replacement client, and wait for
    /// its CONNACK. Failures back off exponentially with jitter; the
    /// sleep is cancellable by shutdown.
    async fn reconnect_worker(self: Arc<Self>) {
        let mut delay = self.config.reconnect_min_delay;
        let max_delay = self.config.reconnect_max_delay;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            {
                let mut state = self.state.lock();
                if *state == LinkState::Shutdown {
                    break;
                }
                *state = LinkState::Connecting;
            }

            match self.try_reconnect().await {
                Ok(()) => {
                    debug!("reconnect complete");
                    break;
                }
                Err(reason) => {
                    {
                        let mut state = self.state.lock();
                        if *state == LinkState::Shutdown {
                            break;
                        }
                        *state = LinkState::Reconnecting;
                    }
                    let jitter = rand::thread_rng().gen_range(0.8..1.2);
                    let wait = delay.mul_f64(jitter);
                    warn!(reason = %reason, backoff = ?wait, "reconnect attempt failed");
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        _ = tokio::time::sleep(wait) => {}
                    }
                    delay = std::cmp::min(delay * 2, max_delay);
                }
            }
        }
        self.reconnecting.store(false, Ordering::Relaxed);
    }

    async fn try_reconnect(self: &Arc<Self>) -> Result<(), String> {
        let endpoint = self
            .rest
            .discover()
            .await
            .map_err(|e| format!("discovery: {}", e))?;
        let watch = self
            .open_session(&endpoint)
            .await
            .map_err(|e| e.to_string())?;
        // Success means CONNACK, not TCP: the Connected transition has
        // already happened inside the on-connect handler by then
        watch.outcome().await
    }

    /// Wakes every `min(60 s, time-to-refresh)` and converts an imminent
    /// token expiry into a controlled reconnect. Live header mutation is
    /// not a refresh mechanism.
    async fn token_watcher(self: Arc<Self>) {
        let lead = self.config.token_refresh_lead.as_secs();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            let now = clock::wall_secs();
            let refresh_at = self
                .rest
                .token_deadline()
                .map(|deadline| deadline.saturating_sub(lead))
                .unwrap_or(now);
            if now >= refresh_at {
                info!("access token near expiry");
                self.trigger_reconnect("token-refresh");
            }
            let wait = refresh_at.saturating_sub(now).clamp(1, 60);
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = tokio::time::sleep(Duration::from_secs(wait)) => {}
            }
        }
        debug!("token refresh watcher exiting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::sync::atomic::AtomicUsize;

    fn transport() -> Arc<FeedTransport> {
        FeedTransport::new(Config::default().transport).expect("transport construction")
    }

    fn dummy_client() -> (rumqttc::AsyncClient, rumqttc::EventLoop) {
        // Never polled; only used as a subscribe sink in tests
        rumqttc::AsyncClient::new(rumqttc::MqttOptions::new("test", "localhost", 1883), 16)
    }

    fn counting_callback(counter: &Arc<AtomicUsize>) -> MessageCallback {
        let counter = Arc::clone(counter);
        Arc::new(move |_topic, _payload| {
            counter.fetch_add(1, Ordering::Relaxed);
        })
    }

    #[tokio::test]
    async fn test_subscribe_queues_before_connect() {
        let transport = transport();
        let hits = Arc::new(AtomicUsize::new(0));
        transport
            .subscribe("proto/topic/bidofferv3/AOT", counting_callback(&hits))
            .await
            .unwrap();
        assert_eq!(transport.state(), LinkState::Init);

        // Dispatching under the current generation reaches the callback
        transport.handle_publish(0, "proto/topic/bidofferv3/AOT", b"x");
        assert_eq!(hits.load(Ordering::Relaxed), 1);
        assert_eq!(transport.stats().messages_received, 1);
    }

    #[tokio::test]
    async fn test_stale_generation_is_fenced() {
        let transport = transport();
        let hits = Arc::new(AtomicUsize::new(0));
        transport
            .subscribe("t", counting_callback(&hits))
            .await
            .unwrap();

        // Generation 5 does not match the current generation 0
        transport.handle_publish(5, "t", b"payload");
        assert_eq!(hits.load(Ordering::Relaxed), 0);
        // Silently discarded: not even messages_received moves
        assert_eq!(transport.stats().messages_received, 0);
        assert_eq!(transport.stats().callback_errors, 0);
    }

    #[tokio::test]
    async fn test_panicking_callback_does_not_starve_siblings() {
        let transport = transport();
        let hits = Arc::new(AtomicUsize::new(0));
        transport
            .subscribe("t", Arc::new(|_, _| panic!("bad callback")))
            .await
            .unwrap();
        transport
            .subscribe("t", counting_callback(&hits))
            .await
            .unwrap();

        transport.handle_publish(0, "t", b"payload");
        transport.handle_publish(0, "t", b"payload");

        assert_eq!(hits.load(Ordering::Relaxed), 2);
        assert_eq!(transport.stats().callback_errors, 2);
        assert_eq!(transport.stats().messages_received, 2);
    }

    #[tokio::test]
    async fn test_epoch_bumps_only_on_reconnect() {
        let transport = transport();
        let (client, _eventloop) = dummy_client();
        transport.subscribe("t", Arc::new(|_, _| {})).await.unwrap();

        // Initial connect: no epoch bump, no reconnect counted
        transport.handle_connected(0, &client);
        assert_eq!(transport.state(), LinkState::Connected);
        assert_eq!(transport.connection_epoch(), 0);
        assert_eq!(transport.stats().reconnect_count, 0);
        assert!(transport.stats().last_connect_ts > 0);

        // Second successful connect is a reconnect
        transport.handle_connected(0, &client);
        assert_eq!(transport.connection_epoch(), 1);
        assert_eq!(transport.stats().reconnect_count, 1);

        transport.handle_connected(0, &client);
        assert_eq!(transport.connection_epoch(), 2);
    }

    #[tokio::test]
    async fn test_stale_connect_is_ignored() {
        let transport = transport();
        let (client, _eventloop) = dummy_client();
        transport.handle_connected(3, &client);
        assert_eq!(transport.state(), LinkState::Init);
        assert_eq!(transport.stats().last_connect_ts, 0);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_absorbing() {
        let transport = transport();
        transport.shutdown().await;
        assert_eq!(transport.state(), LinkState::Shutdown);
        transport.shutdown().await;
        assert_eq!(transport.state(), LinkState::Shutdown);

        // Strategy-side operations now fail synchronously
        let err = transport
            .subscribe("t", Arc::new(|_, _| {}))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidState { .. }));

        // A late CONNACK cannot resurrect the transport
        let (client, _eventloop) = dummy_client();
        transport.handle_connected(0, &client);
        assert_eq!(transport.state(), LinkState::Shutdown);

        // Reconnect triggers are suppressed after shutdown
        transport.trigger_reconnect("test");
        assert_eq!(transport.state(), LinkState::Shutdown);
    }

    #[tokio::test]
    async fn test_connect_rejected_outside_init() {
        let transport = transport();
        *transport.state.lock() = LinkState::Connected;
        let err = transport.connect().await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::InvalidState {
                operation: "connect",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_reconnect_triggers_coalesce() {
        let transport = transport();
        transport.trigger_reconnect("first");
        assert_eq!(transport.state(), LinkState::Reconnecting);
        assert!(transport.reconnecting.load(Ordering::Relaxed));

        // A racing second trigger is a no-op
        transport.trigger_reconnect("second");
        assert_eq!(transport.state(), LinkState::Reconnecting);

        // Shutdown stops the worker before it touches the network
        transport.shutdown().await;
        assert_eq!(transport.state(), LinkState::Shutdown);
    }

    #[tokio::test]
    async fn test_clean_disconnect_during_shutdown_never_reconnects() {
        let transport = transport();
        transport.shutdown().await;
        transport.handle_connection_lost(0, "connection closed");
        assert_eq!(transport.state(), LinkState::Shutdown);
        assert!(!transport.reconnecting.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_topic() {
        let transport = transport();
        let hits = Arc::new(AtomicUsize::new(0));
        transport
            .subscribe("t", counting_callback(&hits))
            .await
            .unwrap();
        transport.unsubscribe("t").await.unwrap();

        transport.handle_publish(0, "t", b"payload");
        assert_eq!(hits.load(Ordering::Relaxed), 0);
        // The message itself was still received and counted
        assert_eq!(transport.stats().messages_received, 1);
    }
}
