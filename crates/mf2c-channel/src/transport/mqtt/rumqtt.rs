// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Network MQTT session backed by `rumqttc`.
//!
//! # Architecture
//!
//! ```text
//! RumqttSession                       I/O thread ("mf2c-mqtt-<id>")
//! +-- client (request side) --------> Connection::iter()
//! +-- tracker <---------------------- Outgoing::Publish(pkid), PubAck, PubComp
//! +-- suback_rx <-------------------- SubAck
//! +-- disconnect_rx <---------------- Outgoing::Disconnect
//! +-- exited_rx <-------------------- (sender dropped on thread exit)
//!                                     EventSink <- ConnAck / Publish / errors
//! ```
//!
//! Reconnects are driven by the I/O thread: after a connection error it
//! sleeps with exponential backoff (1 s doubling to 2 min) and polls again.
//! The session is durable (clean-session off), so the broker keeps
//! subscriptions and `rumqttc` retransmits unacknowledged publishes.
//!
//! `rumqttc` reports packet ids only through outgoing events, in request
//! order. The tracker therefore keeps a FIFO of issued publishes and pairs
//! each `Outgoing::Publish` with its head; a pkid already in flight is a
//! retransmission and is skipped.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use rumqttc::{
    Client, ConnectReturnCode, Connection, Event, LastWill, MqttOptions, NetworkOptions, Outgoing,
    Packet, SubscribeFilter,
};

use super::session::{DeliveryToken, EventSink, MqttSession, SessionOptions, WireEvent};
use crate::error::ProtocolError;
use crate::flags::QoS;
use crate::queue::OutboundMessage;
use crate::signal::StopSignal;

/// Network connect timeout (seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 60;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(120);
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);
const REQUEST_CAPACITY: usize = 128;
const MAX_PACKET_SIZE: usize = 256 * 1024;

pub(crate) fn wire_qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

/// Pairs publish requests with their acknowledgements.
#[derive(Default)]
struct DeliveryTracker {
    queued: Mutex<VecDeque<(QoS, Sender<()>)>>,
    inflight: Mutex<HashMap<u16, Sender<()>>>,
}

impl DeliveryTracker {
    fn track(&self, qos: QoS) -> DeliveryToken {
        let (token, done) = DeliveryToken::pending();
        self.queued.lock().push_back((qos, done));
        token
    }

    fn untrack_last(&self) {
        self.queued.lock().pop_back();
    }

    fn sent(&self, pkid: u16) {
        if pkid != 0 && self.inflight.lock().contains_key(&pkid) {
            tracing::trace!("Retransmitted publish {}", pkid);
            return;
        }
        let Some((qos, done)) = self.queued.lock().pop_front() else {
            return;
        };
        if qos == QoS::AtMostOnce || pkid == 0 {
            tracing::debug!("Publish completed (QoS 0)");
            let _ = done.send(());
        } else {
            self.inflight.lock().insert(pkid, done);
        }
    }

    fn complete(&self, pkid: u16) {
        if let Some(done) = self.inflight.lock().remove(&pkid) {
            tracing::debug!("Message {} delivered", pkid);
            let _ = done.send(());
        }
    }

    /// Fail every pending delivery.
    fn clear(&self) {
        let pending = self.queued.lock().len() + self.inflight.lock().len();
        if pending > 0 {
            tracing::warn!("Abandoning {} undelivered publishes", pending);
        }
        self.queued.lock().clear();
        self.inflight.lock().clear();
    }
}

struct IoLoop {
    sink: EventSink,
    tracker: Arc<DeliveryTracker>,
    suback_tx: Sender<()>,
    disconnect_tx: Sender<()>,
    first_tx: Option<Sender<Result<(), String>>>,
    stop: Arc<StopSignal>,
    disconnecting: Arc<AtomicBool>,
    _exited: Sender<()>,
}

impl IoLoop {
    fn run(mut self, mut connection: Connection) {
        let mut connected = false;
        let mut connected_once = false;
        let mut backoff = INITIAL_BACKOFF;

        for notification in connection.iter() {
            if self.stop.is_stopped() {
                break;
            }
            let failure = match notification {
                Ok(Event::Incoming(Packet::ConnAck(ack))) if ack.code == ConnectReturnCode::Success => {
                    connected = true;
                    backoff = INITIAL_BACKOFF;
                    if let Some(tx) = self.first_tx.take() {
                        let _ = tx.send(Ok(()));
                    }
                    (self.sink)(WireEvent::Connected {
                        reconnect: connected_once,
                    });
                    connected_once = true;
                    None
                }
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    Some(format!("broker refused connection: {:?}", ack.code))
                }
                Ok(event) => {
                    self.dispatch(event);
                    None
                }
                Err(_) if self.disconnecting.load(Ordering::Acquire) => break,
                Err(e) => Some(e.to_string()),
            };

            if let Some(reason) = failure {
                if let Some(tx) = self.first_tx.take() {
                    let _ = tx.send(Err(reason));
                    break;
                }
                if std::mem::replace(&mut connected, false) {
                    tracing::warn!("Lost connection to MQTT broker: {}", reason);
                    (self.sink)(WireEvent::ConnectionLost(reason));
                } else {
                    tracing::debug!("Reconnect attempt failed: {}", reason);
                }
                if self.stop.sleep(backoff) {
                    break;
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }

        self.tracker.clear();
        tracing::debug!("MQTT I/O thread exiting");
    }

    fn dispatch(&self, event: Event) {
        match event {
            Event::Incoming(Packet::Publish(publish)) => (self.sink)(WireEvent::Message {
                topic: publish.topic.clone(),
                payload: publish.payload.to_vec(),
            }),
            Event::Incoming(Packet::PubAck(ack)) => self.tracker.complete(ack.pkid),
            Event::Incoming(Packet::PubComp(comp)) => self.tracker.complete(comp.pkid),
            Event::Incoming(Packet::SubAck(_)) => {
                let _ = self.suback_tx.send(());
            }
            Event::Outgoing(Outgoing::Publish(pkid)) => self.tracker.sent(pkid),
            Event::Outgoing(Outgoing::Disconnect) => {
                let _ = self.disconnect_tx.send(());
            }
            _ => {}
        }
    }
}

/// `rumqttc` connection plus its I/O thread.
pub struct RumqttSession {
    client: Mutex<Option<Client>>,
    tracker: Arc<DeliveryTracker>,
    publish_lock: Mutex<()>,
    suback_rx: Receiver<()>,
    disconnect_rx: Receiver<()>,
    exited_rx: Receiver<()>,
    stop: Arc<StopSignal>,
    disconnecting: Arc<AtomicBool>,
    io_thread: Mutex<Option<JoinHandle<()>>>,
}

impl RumqttSession {
    /// Connect to `host:port`, blocking until the first CONNACK, an error,
    /// or `timeout`.
    pub fn connect(
        host: &str,
        port: u16,
        opts: &SessionOptions,
        sink: EventSink,
        timeout: Duration,
    ) -> Result<Self, ProtocolError> {
        let mut mqtt = MqttOptions::new(opts.client_id.clone(), host, port);
        mqtt.set_keep_alive(opts.keep_alive.max(MIN_KEEP_ALIVE))
            .set_clean_session(false)
            .set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE)
            .set_last_will(LastWill::new(
                opts.will.topic.clone(),
                opts.will.payload.clone().into_bytes(),
                wire_qos(opts.will.qos),
                opts.will.retain,
            ));

        let (client, mut connection) = Client::new(mqtt, REQUEST_CAPACITY);
        let mut network = NetworkOptions::new();
        network.set_connection_timeout(CONNECT_TIMEOUT_SECS);
        connection.eventloop.set_network_options(network);

        let tracker = Arc::new(DeliveryTracker::default());
        let (suback_tx, suback_rx) = unbounded();
        let (disconnect_tx, disconnect_rx) = unbounded();
        let (first_tx, first_rx) = bounded(1);
        let (exited_tx, exited_rx) = bounded::<()>(0);
        let stop = Arc::new(StopSignal::new());
        let disconnecting = Arc::new(AtomicBool::new(false));

        let io = IoLoop {
            sink,
            tracker: Arc::clone(&tracker),
            suback_tx,
            disconnect_tx,
            first_tx: Some(first_tx),
            stop: Arc::clone(&stop),
            disconnecting: Arc::clone(&disconnecting),
            _exited: exited_tx,
        };
        let handle = std::thread::Builder::new()
            .name(format!("mf2c-mqtt-{}", opts.client_id))
            .spawn(move || io.run(connection))
            .map_err(|e| ProtocolError::Connect(format!("failed to spawn I/O thread: {}", e)))?;

        let session = Self {
            client: Mutex::new(Some(client)),
            tracker,
            publish_lock: Mutex::new(()),
            suback_rx,
            disconnect_rx,
            exited_rx,
            stop,
            disconnecting,
            io_thread: Mutex::new(Some(handle)),
        };

        let outcome = match first_rx.recv_timeout(timeout) {
            Ok(Ok(())) => return Ok(session),
            Ok(Err(reason)) => reason,
            Err(_) => format!("no CONNACK within {}s", timeout.as_secs()),
        };
        session.close();
        Err(ProtocolError::Connect(format!(
            "{}:{}: {}",
            host, port, outcome
        )))
    }

    fn client(&self) -> Option<Client> {
        self.client.lock().clone()
    }

    fn wait_exit(&self, timeout: Duration) -> bool {
        matches!(
            self.exited_rx.recv_timeout(timeout),
            Err(crossbeam::channel::RecvTimeoutError::Disconnected)
        )
    }
}

impl MqttSession for RumqttSession {
    fn publish(&self, msg: &OutboundMessage) -> Result<DeliveryToken, ProtocolError> {
        let client = self.client().ok_or(ProtocolError::NotConnected)?;
        let _order = self.publish_lock.lock();
        let token = self.tracker.track(msg.qos);
        if let Err(e) = client.publish(
            msg.topic.clone(),
            wire_qos(msg.qos),
            msg.retain,
            msg.payload.clone().into_bytes(),
        ) {
            self.tracker.untrack_last();
            return Err(ProtocolError::Publish(e.to_string()));
        }
        Ok(token)
    }

    fn subscribe(&self, topics: &[String], timeout: Duration) -> Result<(), ProtocolError> {
        let client = self.client().ok_or(ProtocolError::NotConnected)?;
        while self.suback_rx.try_recv().is_ok() {}
        let filters: Vec<SubscribeFilter> = topics
            .iter()
            .map(|t| SubscribeFilter::new(t.clone(), rumqttc::QoS::AtLeastOnce))
            .collect();
        client
            .subscribe_many(filters)
            .map_err(|e| ProtocolError::Subscribe(e.to_string()))?;
        self.suback_rx.recv_timeout(timeout).map_err(|_| {
            ProtocolError::Subscribe(format!("no SUBACK within {}s", timeout.as_secs()))
        })
    }

    fn disconnect(&self, timeout: Duration) -> Result<(), ProtocolError> {
        let client = self.client().ok_or(ProtocolError::NotConnected)?;
        self.disconnecting.store(true, Ordering::Release);
        client
            .disconnect()
            .map_err(|e| ProtocolError::Disconnect(e.to_string()))?;
        self.disconnect_rx.recv_timeout(timeout).map_err(|_| {
            ProtocolError::Disconnect(format!("DISCONNECT not sent within {}s", timeout.as_secs()))
        })
    }

    fn disconnect_forcibly(&self, timeout: Duration) -> Result<(), ProtocolError> {
        self.disconnecting.store(true, Ordering::Release);
        self.stop.stop();
        self.client.lock().take();
        if self.wait_exit(timeout) {
            Ok(())
        } else {
            Err(ProtocolError::Disconnect(format!(
                "I/O thread still running after {}s",
                timeout.as_secs()
            )))
        }
    }

    fn close(&self) {
        self.disconnecting.store(true, Ordering::Release);
        self.stop.stop();
        self.client.lock().take();
        self.tracker.clear();
        let handle = self.io_thread.lock().take();
        if let Some(handle) = handle {
            if self.wait_exit(Duration::from_secs(1)) {
                let _ = handle.join();
            } else {
                tracing::debug!("Detaching MQTT I/O thread still blocked on the network");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_pairs_in_order() {
        let tracker = DeliveryTracker::default();
        let t0 = tracker.track(QoS::AtMostOnce);
        let t1 = tracker.track(QoS::AtLeastOnce);
        let t2 = tracker.track(QoS::ExactlyOnce);

        tracker.sent(0);
        assert!(t0.wait(Duration::from_millis(10)).is_ok());

        tracker.sent(7);
        tracker.sent(8);
        // Retransmission of 7 must not consume anything.
        tracker.sent(7);

        tracker.complete(8);
        assert!(t2.wait(Duration::from_millis(10)).is_ok());
        assert!(t1.wait(Duration::from_millis(10)).is_err());
        tracker.complete(7);
    }

    #[test]
    fn test_tracker_clear_fails_waiters() {
        let tracker = DeliveryTracker::default();
        let token = tracker.track(QoS::AtLeastOnce);
        tracker.sent(3);
        tracker.clear();
        assert!(matches!(
            token.wait(Duration::from_secs(1)),
            Err(ProtocolError::Publish(_))
        ));
    }

    #[test]
    fn test_untrack_last() {
        let tracker = DeliveryTracker::default();
        let first = tracker.track(QoS::AtLeastOnce);
        let _second = tracker.track(QoS::AtLeastOnce);
        tracker.untrack_last();
        tracker.sent(1);
        tracker.complete(1);
        assert!(first.wait(Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn test_wire_qos() {
        assert_eq!(wire_qos(QoS::AtMostOnce), rumqttc::QoS::AtMostOnce);
        assert_eq!(wire_qos(QoS::ExactlyOnce), rumqttc::QoS::ExactlyOnce);
    }

    #[test]
    fn test_connect_refused_is_connect_error() {
        let opts = SessionOptions {
            client_id: "mf2c-refused".into(),
            keep_alive: Duration::from_secs(60),
            will: OutboundMessage {
                topic: "mf2c/refused/status".into(),
                qos: QoS::AtLeastOnce,
                retain: true,
                payload: "x".into(),
            },
        };
        let sink: EventSink = Arc::new(|_| {});
        // Port 1 on loopback is closed on any sane test host.
        let result = RumqttSession::connect("127.0.0.1", 1, &opts, sink, Duration::from_secs(10));
        assert!(matches!(result, Err(ProtocolError::Connect(_))));
    }
}
