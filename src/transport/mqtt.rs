//! rumqttc session glue
//!
//! One `MqttSession` per broker connection: an `AsyncClient` plus the
//! event pump task that drives its event loop. The pump captures the
//! generation the session was built under and reports everything back to
//! the transport, which applies the generation fence. The pump never
//! polls past an error: rumqttc would transparently redial with the old
//! (possibly expired) credentials, and reconnection policy belongs to the
//! transport.

use std::sync::Arc;
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS, Transport,
};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{FeedTransport, TransportError};
use crate::auth::BrokerEndpoint;

/// Capacity of the request channel between `AsyncClient` and its event
/// loop. Subscription replay enqueues one request per topic while the
/// pump is busy inside the CONNACK handler, so this bounds the number of
/// replayable topics.
const REQUEST_CHANNEL_CAPACITY: usize = 1024;

/// Resolves once the session's first CONNACK (or terminal error) arrives.
pub(super) struct ConnectWatch(oneshot::Receiver<Result<(), String>>);

impl ConnectWatch {
    pub(super) async fn outcome(self) -> Result<(), String> {
        match self.0.await {
            Ok(result) => result,
            Err(_) => Err("event pump exited before CONNACK".to_string()),
        }
    }
}

/// A single MQTT client instance and its I/O pump.
pub(super) struct MqttSession {
    client: AsyncClient,
    pump: JoinHandle<()>,
    generation: u64,
}

impl MqttSession {
    /// Builds the client against the first discovered host and spawns the
    /// event pump. The WS upgrade carries the connection token as an
    /// `Authorization` header; the session is clean and QoS 0 throughout.
    pub(super) fn open(
        transport: &Arc<FeedTransport>,
        endpoint: &BrokerEndpoint,
        generation: u64,
    ) -> Result<(Self, ConnectWatch), TransportError> {
        let config = transport.config();
        let url = format!(
            "wss://{}:{}/api/dispatcher/v3/{}/mqtt",
            endpoint.hosts[0],
            config.port,
            transport.broker_id()
        );
        let client_id = format!("{}-{}", config.app_id, generation);

        let authorization = format!("{} {}", endpoint.token_type, endpoint.token);
        // Reject anything that cannot live in an HTTP header up front
        if !authorization
            .bytes()
            .all(|b| (0x20..0x7f).contains(&b))
        {
            return Err(TransportError::BadToken);
        }

        let mut options = MqttOptions::new(client_id, url, config.port);
        options.set_transport(Transport::wss_with_default_config());
        options.set_keep_alive(Duration::from_secs(u64::from(config.keepalive)));
        options.set_clean_session(true);
        options.set_request_modifier(move |mut request| {
            let value = authorization.clone();
            async move {
                if let Ok(header) = value.parse() {
                    request.headers_mut().insert("Authorization", header);
                }
                request
            }
        });

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let pump = tokio::spawn(Self::pump(
            Arc::clone(transport),
            client.clone(),
            eventloop,
            generation,
            outcome_tx,
        ));

        Ok((
            Self {
                client,
                pump,
                generation,
            },
            ConnectWatch(outcome_rx),
        ))
    }

    /// Drives the event loop until the connection dies. CONNACK handling
    /// runs to completion before the next poll, so no publish from this
    /// session can be dispatched before subscription replay and the epoch
    /// bump are done.
    async fn pump(
        transport: Arc<FeedTransport>,
        client: AsyncClient,
        mut eventloop: EventLoop,
        generation: u64,
        outcome: oneshot::Sender<Result<(), String>>,
    ) {
        let mut outcome = Some(outcome);
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        transport.handle_connected(generation, &client);
                        if let Some(tx) = outcome.take() {
                            let _ = tx.send(Ok(()));
                        }
                    } else {
                        let reason = format!("broker refused session: {:?}", ack.code);
                        if let Some(tx) = outcome.take() {
                            let _ = tx.send(Err(reason.clone()));
                        }
                        transport.handle_connection_lost(generation, &reason);
                        break;
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    transport.handle_publish(generation, &publish.topic, &publish.payload);
                }
                Ok(_) => {}
                Err(e) => {
                    let reason = e.to_string();
                    if let Some(tx) = outcome.take() {
                        let _ = tx.send(Err(reason.clone()));
                    }
                    transport.handle_connection_lost(generation, &reason);
                    break;
                }
            }
        }
        debug!(generation, "event pump exited");
    }

    pub(super) async fn subscribe(&self, topic: &str) {
        if let Err(e) = self.client.subscribe(topic, QoS::AtMostOnce).await {
            warn!(topic, error = %e, "broker-side subscribe failed");
        }
    }

    pub(super) async fn unsubscribe(&self, topic: &str) {
        if let Err(e) = self.client.unsubscribe(topic).await {
            warn!(topic, error = %e, "broker-side unsubscribe failed");
        }
    }

    /// Clean teardown: disconnect, then stop the pump. Failures only
    /// matter at debug level; by the time this runs the generation fence
    /// already makes the session inert.
    pub(super) async fn stop(self) {
        if let Err(e) = self.client.disconnect().await {
            debug!(generation = self.generation, error = %e, "disconnect on stop failed");
        }
        self.pump.abort();
    }
}
