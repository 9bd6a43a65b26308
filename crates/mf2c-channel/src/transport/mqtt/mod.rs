// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! MQTT transport handler.
//!
//! # Setup
//!
//! 1. Last will: signed `DU` status, retained, QoS 1, on `mf2c/{self}/status`.
//! 2. Durable session (clean-session off), blocking connect bounded by `timeOut`.
//! 3. Signed `C` status on the own status topic.
//! 4. Subscribe (QoS 1) to the own application, handshake and ping topics.
//! 5. With a destination: announce `C` on `mf2c/{destination}/handshake` and
//!    wait up to `timeOut` for the handshake worker to capture its key.
//!
//! Subscribing before the handshake announcement guarantees the peer's reply
//! has somewhere to land.
//!
//! # Publishing
//!
//! QoS 0 is fire-and-forget. QoS 1 and 2 block until the broker acknowledges
//! or `timeOut` elapses. While the connection is down, encoded messages go to
//! the outbound buffer (100 entries, oldest dropped) and are drained in order
//! once the broker reconnects.

mod handshake;
pub mod memory;
pub mod rumqtt;
pub mod session;
pub mod topics;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use rsa::RsaPublicKey;
use serde_json::Value;

use self::handshake::HandshakeWorker;
use self::memory::MemoryBroker;
use self::rumqtt::RumqttSession;
use self::session::{EventSink, MqttSession, SessionOptions, WireEvent};
use self::topics::{InboundKind, Status, TopicScheme};
use super::TransportHandler;
use crate::config::{BrokerUrl, HandlerConfig};
use crate::envelope::{encode_fields, epoch_secs, field, Envelope, Fields};
use crate::error::{MessageError, ProtocolError};
use crate::flags::{Protocol, QoS, Security};
use crate::identity::Identity;
use crate::queue::{HandlerQueues, OutboundMessage};
use crate::stats::HandlerStats;

/// Bound on the forcible disconnect path.
pub const FORCIBLE_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(30);

const HANDSHAKE_POLL: Duration = Duration::from_millis(100);

/// State shared with the wire callback and the handshake worker.
pub(crate) struct MqttCore {
    pub(crate) scheme: TopicScheme,
    pub(crate) identity: &'static Identity,
    pub(crate) queues: Arc<HandlerQueues>,
    pub(crate) stats: Arc<HandlerStats>,
    pub(crate) dest_key: ArcSwapOption<RsaPublicKey>,
    connack: AtomicBool,
    session: OnceLock<Arc<dyn MqttSession>>,
    timeout: Duration,
}

impl MqttCore {
    fn sink(core: &Arc<MqttCore>) -> EventSink {
        let weak = Arc::downgrade(core);
        Arc::new(move |event| {
            if let Some(core) = weak.upgrade() {
                core.on_event(event);
            }
        })
    }

    fn on_event(self: &Arc<Self>, event: WireEvent) {
        match event {
            WireEvent::Connected { reconnect } => {
                self.connack.store(true, Ordering::Release);
                if reconnect {
                    tracing::info!("Reconnected '{}' to broker", self.scheme.me());
                } else {
                    tracing::info!("Connected '{}' to broker", self.scheme.me());
                }
                if !self.queues.out_buf().is_empty() {
                    self.drain_async();
                }
            }
            WireEvent::ConnectionLost(reason) => {
                self.connack.store(false, Ordering::Release);
                tracing::warn!("Lost connection to MQTT broker: {}", reason);
            }
            WireEvent::Message { topic, payload } => self.route(&topic, &payload),
        }
    }

    fn route(&self, topic: &str, payload: &[u8]) {
        let Some(kind) = self.scheme.classify(topic) else {
            tracing::debug!("Ignoring message on unexpected topic {}", topic);
            return;
        };
        let env = Envelope::from_wire(payload);
        let (accepted, counter) = match kind {
            InboundKind::App => (self.queues.offer_app(env), &self.stats.received_app),
            InboundKind::PingRequest => (
                self.queues.offer_ping_request(env),
                &self.stats.received_ping_req,
            ),
            InboundKind::PingAck => (self.queues.offer_ping_ack(env), &self.stats.received_ping_ack),
            InboundKind::Handshake => (self.queues.offer_handshake(env), &self.stats.received_handshake),
        };
        if accepted {
            if kind != InboundKind::Handshake {
                HandlerStats::bump(counter);
            }
            tracing::debug!("Offered message on {} to {:?} queue", topic, kind);
        } else {
            tracing::trace!("Dropped message on {}, queues closed", topic);
        }
    }

    fn status_fields(&self, status: Status) -> Fields {
        let mut fields = Fields::new();
        fields.insert(field::SOURCE.into(), Value::String(self.scheme.me().to_string()));
        fields.insert(field::PAYLOAD.into(), Value::String(status.payload()));
        fields
    }

    /// Status message signed with our key.
    fn packed_status(&self, status: Status) -> Result<Fields, ProtocolError> {
        let mut env = Envelope::outbound(self.status_fields(status));
        env.pack_with(
            self.identity,
            Security::Protected,
            Protocol::Mqtt,
            QoS::AtLeastOnce,
            None,
        )?;
        Ok(env.into_fields())
    }

    /// Last will, without timestamp since the send time is unknown.
    fn will_message(&self) -> Result<OutboundMessage, ProtocolError> {
        let fields = self.packed_status(Status::DisconnectedUngracefully)?;
        Ok(OutboundMessage {
            topic: self.scheme.status(),
            qos: QoS::AtLeastOnce,
            retain: true,
            payload: encode_fields(&fields)?,
        })
    }

    /// Announce our connect status (and so our key) to `target`.
    pub(crate) fn send_pk(&self, target: &str) -> Result<(), ProtocolError> {
        let fields = self.packed_status(Status::Connected)?;
        self.publish_fields(&TopicScheme::handshake_of(target), QoS::AtLeastOnce, fields)
    }

    fn publish_fields(&self, topic: &str, qos: QoS, mut fields: Fields) -> Result<(), ProtocolError> {
        fields.insert(field::TIMESTAMP.into(), Value::from(epoch_secs()));
        let msg = OutboundMessage {
            topic: topic.to_string(),
            qos,
            retain: false,
            payload: encode_fields(&fields)?,
        };
        self.send(msg)
    }

    fn send(&self, msg: OutboundMessage) -> Result<(), ProtocolError> {
        let session = self.session.get().ok_or(ProtocolError::NotConnected)?;

        if !self.connack.load(Ordering::Acquire) {
            self.buffer(msg);
            if self.connack.load(Ordering::Acquire) {
                // Reconnected while we were buffering.
                self.drain_now();
            }
            return Ok(());
        }

        let token = session.publish(&msg).inspect_err(|_| self.stats.record_error())?;
        HandlerStats::bump(&self.stats.published);

        if msg.qos == QoS::AtMostOnce {
            tracing::debug!("Publishing asynchronously to {} qos {}", msg.topic, msg.qos);
            return Ok(());
        }
        tracing::debug!("Publishing synchronously to {} qos {}", msg.topic, msg.qos);
        token
            .wait(self.timeout)
            .inspect_err(|_| self.stats.record_error())?;
        tracing::debug!("Published message to {}", msg.topic);
        Ok(())
    }

    fn buffer(&self, msg: OutboundMessage) {
        tracing::debug!("Not connected, buffering message for {}", msg.topic);
        HandlerStats::bump(&self.stats.buffered);
        if let Some(evicted) = self.queues.out_buf().push(msg) {
            HandlerStats::bump(&self.stats.dropped_oldest);
            tracing::warn!("Outbound buffer full, dropped oldest message for {}", evicted.topic);
        }
    }

    /// Publish every buffered message, oldest first, without waiting for
    /// acknowledgements.
    fn drain_now(&self) {
        let Some(session) = self.session.get() else {
            return;
        };
        let pending = self.queues.out_buf().drain();
        if pending.is_empty() {
            return;
        }
        tracing::info!("Sending {} buffered messages", pending.len());
        for msg in pending {
            match session.publish(&msg) {
                Ok(_) => HandlerStats::bump(&self.stats.published),
                Err(e) => {
                    self.stats.record_error();
                    tracing::error!("Failed to send buffered message to {}: {}", msg.topic, e);
                }
            }
        }
    }

    // The wire thread must not block on its own acknowledgements.
    fn drain_async(self: &Arc<Self>) {
        let core = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name(format!("mf2c-drain-{}", self.scheme.me()))
            .spawn(move || core.drain_now());
        if let Err(e) = spawned {
            tracing::error!("Failed to spawn buffer drain thread: {}", e);
        }
    }

    fn await_dest_key(&self, destination: &str) -> Result<(), ProtocolError> {
        let deadline = Instant::now() + self.timeout;
        while self.dest_key.load().is_none() {
            if Instant::now() >= deadline {
                tracing::error!(
                    "Failed to get public key of '{}'. Timed out!",
                    destination
                );
                return Err(ProtocolError::HandshakeTimeout(self.timeout.as_secs()));
            }
            std::thread::sleep(HANDSHAKE_POLL);
        }
        Ok(())
    }
}

fn open_session(
    broker: &BrokerUrl,
    opts: &SessionOptions,
    sink: EventSink,
    timeout: Duration,
) -> Result<Arc<dyn MqttSession>, ProtocolError> {
    match broker {
        BrokerUrl::Tcp { host, port } => Ok(Arc::new(RumqttSession::connect(
            host, *port, opts, sink, timeout,
        )?)),
        BrokerUrl::Memory(name) => Ok(Arc::new(MemoryBroker::named(name).connect(opts, sink)?)),
    }
}

/// Reference transport handler over MQTT 3.1.1.
pub struct MqttHandler {
    scheme: TopicScheme,
    queues: Arc<HandlerQueues>,
    stats: Arc<HandlerStats>,
    core: Option<Arc<MqttCore>>,
    handshake: Mutex<Option<HandshakeWorker>>,
    disconnected: AtomicBool,
}

impl Default for MqttHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl MqttHandler {
    pub fn new() -> Self {
        Self {
            scheme: TopicScheme::default(),
            queues: Arc::new(HandlerQueues::new()),
            stats: Arc::new(HandlerStats::new()),
            core: None,
            handshake: Mutex::new(None),
            disconnected: AtomicBool::new(false),
        }
    }

    /// Whether the broker connection is currently up.
    pub fn is_connected(&self) -> bool {
        self.core
            .as_ref()
            .is_some_and(|c| c.connack.load(Ordering::Acquire))
    }

    /// Number of messages waiting in the outbound buffer.
    pub fn buffered(&self) -> usize {
        self.queues.out_buf().len()
    }

    fn establish(
        &self,
        core: &Arc<MqttCore>,
        broker: &BrokerUrl,
        opts: &SessionOptions,
    ) -> Result<(), ProtocolError> {
        tracing::info!("Connecting '{}' to {}", core.scheme.me(), broker);
        let session = open_session(broker, opts, MqttCore::sink(core), core.timeout)?;
        let _ = core.session.set(session);
        core.connack.store(true, Ordering::Release);
        tracing::info!("First connection established!");

        let status = core.packed_status(Status::Connected)?;
        core.publish_fields(&core.scheme.status(), QoS::AtLeastOnce, status)?;

        if let Some(session) = core.session.get() {
            session.subscribe(&core.scheme.subscriptions(), core.timeout)?;
        }

        if let Some(destination) = core.scheme.destination() {
            core.send_pk(destination)?;
            core.await_dest_key(destination)?;
        }
        Ok(())
    }

    fn teardown(&self) {
        if let Some(mut worker) = self.handshake.lock().take() {
            worker.stop();
        }
        if let Some(session) = self.core.as_ref().and_then(|c| c.session.get()) {
            session.close();
        }
    }
}

impl TransportHandler for MqttHandler {
    fn protocol(&self) -> Protocol {
        Protocol::Mqtt
    }

    fn setup(&mut self, config: HandlerConfig) -> Result<(), ProtocolError> {
        if self.core.is_some() {
            return Err(ProtocolError::Connect("handler is already set up".into()));
        }
        config.validate()?;
        let broker = BrokerUrl::parse(&config.broker)?;
        let identity = Identity::get_instance().map_err(MessageError::from)?;

        let scheme = TopicScheme::new(config.friendly_name.clone(), config.destination.clone());
        let core = Arc::new(MqttCore {
            scheme: scheme.clone(),
            identity,
            queues: Arc::clone(&self.queues),
            stats: Arc::clone(&self.stats),
            dest_key: ArcSwapOption::empty(),
            connack: AtomicBool::new(false),
            session: OnceLock::new(),
            timeout: Duration::from_secs(config.timeout_secs),
        });
        let opts = SessionOptions {
            client_id: config.friendly_name.clone(),
            keep_alive: Duration::from_secs(config.keep_alive_secs),
            will: core.will_message()?,
        };

        *self.handshake.lock() = Some(HandshakeWorker::spawn(Arc::clone(&core))?);
        self.scheme = scheme;
        self.core = Some(Arc::clone(&core));

        if let Err(e) = self.establish(&core, &broker, &opts) {
            tracing::error!("Failed to set up MQTT handler: {}", e);
            self.teardown();
            self.core = None;
            return Err(e);
        }
        Ok(())
    }

    fn disconnect(&self) -> Result<(), ProtocolError> {
        let core = self.core.as_ref().ok_or(ProtocolError::NotConnected)?;
        if self.disconnected.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let farewell = core
            .packed_status(Status::DisconnectedGracefully)
            .and_then(|f| core.publish_fields(&core.scheme.status(), QoS::AtLeastOnce, f));
        if let Err(e) = farewell {
            tracing::error!("Error publishing disconnect status: {}", e);
        }

        if let Some(session) = core.session.get() {
            if let Err(e) = session.disconnect(core.timeout) {
                tracing::error!("Error disconnecting: {}. Will disconnect forcibly", e);
                if let Err(e) = session.disconnect_forcibly(FORCIBLE_DISCONNECT_TIMEOUT) {
                    tracing::error!("Error disconnecting forcibly: {}. Swallowing it", e);
                }
            }
        }
        core.connack.store(false, Ordering::Release);
        self.teardown();
        self.queues.close();
        tracing::info!("Released MQTT client resources for '{}'", core.scheme.me());
        Ok(())
    }

    fn flush(&self) {
        let dropped = self.queues.out_buf().clear();
        tracing::debug!("Flushed {} buffered messages", dropped);
    }

    fn publish(&self, destination: &str, qos: QoS, fields: Fields) -> Result<(), ProtocolError> {
        let core = self.core.as_ref().ok_or(ProtocolError::NotConnected)?;
        if self.disconnected.load(Ordering::Acquire) {
            return Err(ProtocolError::NotConnected);
        }
        core.publish_fields(destination, qos, fields)
    }

    fn poll(&self) -> bool {
        self.queues.has_app()
    }

    fn pop(&self) -> Option<Envelope> {
        self.queues.pop_app()
    }

    fn pop_ping_request(&self) -> Option<Envelope> {
        self.queues.pop_ping_request()
    }

    fn pop_ping_ack(&self) -> Option<Envelope> {
        self.queues.pop_ping_ack()
    }

    fn status_message(&self, status: Status) -> Fields {
        let mut fields = Fields::new();
        fields.insert(field::SOURCE.into(), Value::String(self.scheme.me().to_string()));
        fields.insert(field::PAYLOAD.into(), Value::String(status.payload()));
        fields
    }

    fn ping_message(&self, request_ts: Option<u64>) -> Fields {
        let mut fields = Fields::new();
        fields.insert(field::SOURCE.into(), Value::String(self.scheme.me().to_string()));
        if let Some(ts) = request_ts {
            fields.insert(field::PING_REQUEST_TS.into(), Value::from(ts));
        }
        fields
    }

    fn ping_request_dest(&self) -> Option<String> {
        self.scheme.destination().map(TopicScheme::ping_request_of)
    }

    fn ping_ack_dest(&self, target: &str) -> String {
        TopicScheme::ping_ack_of(target)
    }

    fn destination_for(&self, security: Security) -> String {
        self.scheme.destination_for(security)
    }

    fn dest_key(&self) -> Option<Arc<RsaPublicKey>> {
        self.core.as_ref().and_then(|c| c.dest_key.load_full())
    }

    fn stats(&self) -> &HandlerStats {
        &self.stats
    }
}

impl Drop for MqttHandler {
    fn drop(&mut self) {
        if self.core.is_some() && !self.disconnected.load(Ordering::Acquire) {
            if let Err(e) = self.disconnect() {
                tracing::error!("Error disconnecting dropped handler: {}", e);
            }
        }
    }
}
