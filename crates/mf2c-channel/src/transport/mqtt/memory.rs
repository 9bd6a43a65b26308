// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-process MQTT broker for `memory://<name>` URLs.
//!
//! Implements the subset of MQTT 3.1.1 the handler relies on, so channels in
//! one process can talk without a network broker.
//!
//! # Architecture
//!
//! ```text
//! BROKERS (static OnceLock)
//! +-- Mutex<HashMap<name, Arc<MemoryBroker>>>
//!
//! MemoryBroker
//! +-- sessions: client_id -> ClientSession
//! |     +-- subscriptions (exact topics, durable)
//! |     +-- sink (None while offline)
//! |     +-- will
//! |     +-- offline queue (QoS >= 1 while offline)
//! +-- retained: topic -> payload
//! ```
//!
//! Deliveries are collected under the broker lock and handed to the sinks
//! after it is released, so a sink may publish back into the broker.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;

use super::session::{DeliveryToken, EventSink, MqttSession, SessionOptions, WireEvent};
use crate::error::ProtocolError;
use crate::flags::QoS;
use crate::queue::OutboundMessage;

static BROKERS: OnceLock<Mutex<HashMap<String, Arc<MemoryBroker>>>> = OnceLock::new();

/// Offline queue bound per durable session.
const OFFLINE_CAPACITY: usize = 1000;

#[derive(Default)]
struct ClientSession {
    subscriptions: HashSet<String>,
    sink: Option<EventSink>,
    will: Option<OutboundMessage>,
    offline: VecDeque<(String, Vec<u8>)>,
}

#[derive(Default)]
struct BrokerState {
    sessions: HashMap<String, ClientSession>,
    retained: HashMap<String, Vec<u8>>,
}

type Delivery = (EventSink, WireEvent);

/// Sink and will of an interrupted client, kept for `restore`.
type Stashed = (EventSink, Option<OutboundMessage>);

/// A named in-process broker.
pub struct MemoryBroker {
    name: String,
    state: Mutex<BrokerState>,
    stashed: Mutex<HashMap<String, Stashed>>,
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl MemoryBroker {
    /// Broker registered under `name`, created on first use.
    pub fn named(name: &str) -> Arc<MemoryBroker> {
        let registry = BROKERS.get_or_init(|| Mutex::new(HashMap::new()));
        let mut brokers = registry.lock();
        Arc::clone(brokers.entry(name.to_string()).or_insert_with(|| {
            tracing::debug!("Creating in-process broker '{}'", name);
            Arc::new(MemoryBroker {
                name: name.to_string(),
                state: Mutex::new(BrokerState::default()),
                stashed: Mutex::new(HashMap::new()),
            })
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Connect `opts.client_id`, resuming its durable session if any.
    pub fn connect(
        self: &Arc<Self>,
        opts: &SessionOptions,
        sink: EventSink,
    ) -> Result<MemorySession, ProtocolError> {
        let pending = {
            let mut state = self.state.lock();
            let session = state.sessions.entry(opts.client_id.clone()).or_default();
            if session.sink.is_some() {
                tracing::warn!(
                    "Client '{}' already connected to '{}', taking over",
                    opts.client_id,
                    self.name
                );
            }
            session.sink = Some(Arc::clone(&sink));
            session.will = Some(opts.will.clone());
            session.offline.drain(..).collect::<Vec<_>>()
        };

        sink(WireEvent::Connected { reconnect: false });
        for (topic, payload) in pending {
            sink(WireEvent::Message { topic, payload });
        }
        Ok(MemorySession {
            broker: Arc::clone(self),
            client_id: opts.client_id.clone(),
        })
    }

    fn route(state: &mut BrokerState, topic: &str, qos: QoS, payload: &[u8]) -> Vec<Delivery> {
        let mut out = Vec::new();
        for session in state.sessions.values_mut() {
            if !session.subscriptions.contains(topic) {
                continue;
            }
            match &session.sink {
                Some(sink) => out.push((
                    Arc::clone(sink),
                    WireEvent::Message {
                        topic: topic.to_string(),
                        payload: payload.to_vec(),
                    },
                )),
                None if qos != QoS::AtMostOnce => {
                    if session.offline.len() >= OFFLINE_CAPACITY {
                        session.offline.pop_front();
                    }
                    session.offline.push_back((topic.to_string(), payload.to_vec()));
                }
                None => {}
            }
        }
        out
    }

    fn store_retained(state: &mut BrokerState, msg: &OutboundMessage) {
        if !msg.retain {
            return;
        }
        if msg.payload.is_empty() {
            state.retained.remove(&msg.topic);
        } else {
            state
                .retained
                .insert(msg.topic.clone(), msg.payload.as_bytes().to_vec());
        }
    }

    fn dispatch(deliveries: Vec<Delivery>) {
        for (sink, event) in deliveries {
            sink(event);
        }
    }

    fn publish_from(&self, client_id: &str, msg: &OutboundMessage) -> Result<(), ProtocolError> {
        let deliveries = {
            let mut state = self.state.lock();
            let online = state
                .sessions
                .get(client_id)
                .is_some_and(|s| s.sink.is_some());
            if !online {
                return Err(ProtocolError::Publish(format!(
                    "client '{}' is not connected",
                    client_id
                )));
            }
            Self::store_retained(&mut state, msg);
            Self::route(&mut state, &msg.topic, msg.qos, msg.payload.as_bytes())
        };
        Self::dispatch(deliveries);
        Ok(())
    }

    fn subscribe(&self, client_id: &str, topics: &[String]) -> Result<(), ProtocolError> {
        let deliveries = {
            let mut state = self.state.lock();
            let BrokerState { sessions, retained } = &mut *state;
            let session = sessions
                .get_mut(client_id)
                .filter(|s| s.sink.is_some())
                .ok_or_else(|| {
                    ProtocolError::Subscribe(format!("client '{}' is not connected", client_id))
                })?;
            let mut out = Vec::new();
            for topic in topics {
                session.subscriptions.insert(topic.clone());
                if let (Some(sink), Some(payload)) = (&session.sink, retained.get(topic)) {
                    out.push((
                        Arc::clone(sink),
                        WireEvent::Message {
                            topic: topic.clone(),
                            payload: payload.clone(),
                        },
                    ));
                }
            }
            out
        };
        Self::dispatch(deliveries);
        Ok(())
    }

    /// Take a client offline. Ungraceful drops publish the will and notify
    /// the client with `ConnectionLost`.
    fn go_offline(&self, client_id: &str, graceful: bool) {
        let (sink, deliveries) = {
            let mut state = self.state.lock();
            let Some(session) = state.sessions.get_mut(client_id) else {
                return;
            };
            let sink = session.sink.take();
            let will = session.will.take();
            if sink.is_none() {
                return;
            }
            let deliveries = match (graceful, will) {
                (false, Some(will)) => {
                    Self::store_retained(&mut state, &will);
                    Self::route(&mut state, &will.topic, will.qos, will.payload.as_bytes())
                }
                _ => Vec::new(),
            };
            (sink, deliveries)
        };
        if !graceful {
            if let Some(sink) = sink {
                sink(WireEvent::ConnectionLost("connection reset by broker".into()));
            }
        }
        Self::dispatch(deliveries);
    }

    /// Simulate a network drop for `client_id`: the will fires and the
    /// client sees a connection loss. Returns false if it was not online.
    pub fn interrupt(&self, client_id: &str) -> bool {
        let online = self.is_connected(client_id);
        if online {
            tracing::debug!("Interrupting '{}' on '{}'", client_id, self.name);
            self.stash_sink(client_id);
        }
        online
    }

    /// Reconnect a client previously taken down with [`interrupt`](Self::interrupt).
    pub fn restore(&self, client_id: &str) -> bool {
        let (sink, pending) = {
            let mut state = self.state.lock();
            let Some(session) = state.sessions.get_mut(client_id) else {
                return false;
            };
            if session.sink.is_some() {
                return false;
            }
            let Some((sink, will)) = self.stashed.lock().remove(client_id) else {
                return false;
            };
            session.sink = Some(Arc::clone(&sink));
            session.will = will;
            (sink, session.offline.drain(..).collect::<Vec<_>>())
        };
        sink(WireEvent::Connected { reconnect: true });
        for (topic, payload) in pending {
            sink(WireEvent::Message { topic, payload });
        }
        true
    }

    /// Drop `client_id` ungracefully and for good.
    pub fn kill(&self, client_id: &str) {
        self.go_offline(client_id, false);
    }

    pub fn is_connected(&self, client_id: &str) -> bool {
        self.state
            .lock()
            .sessions
            .get(client_id)
            .is_some_and(|s| s.sink.is_some())
    }

    /// Retained payload on `topic`, if any.
    pub fn retained(&self, topic: &str) -> Option<Vec<u8>> {
        self.state.lock().retained.get(topic).cloned()
    }

    /// Subscribe an observer sink that is not a handler (tooling, tests).
    pub fn observe(self: &Arc<Self>, client_id: &str, topics: &[String], sink: EventSink) {
        {
            let mut state = self.state.lock();
            let session = state.sessions.entry(client_id.to_string()).or_default();
            session.sink = Some(sink);
        }
        if let Err(e) = self.subscribe(client_id, topics) {
            tracing::warn!("Observer subscribe failed: {}", e);
        }
    }

    fn stash_sink(&self, client_id: &str) {
        let stash = {
            let state = self.state.lock();
            state
                .sessions
                .get(client_id)
                .and_then(|s| s.sink.clone().map(|sink| (sink, s.will.clone())))
        };
        if let Some(entry) = stash {
            self.stashed.lock().insert(client_id.to_string(), entry);
        }
        self.go_offline(client_id, false);
    }
}

/// Session handle of one client on a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemorySession {
    broker: Arc<MemoryBroker>,
    client_id: String,
}

impl MqttSession for MemorySession {
    fn publish(&self, msg: &OutboundMessage) -> Result<DeliveryToken, ProtocolError> {
        self.broker.publish_from(&self.client_id, msg)?;
        Ok(DeliveryToken::completed())
    }

    fn subscribe(&self, topics: &[String], _timeout: Duration) -> Result<(), ProtocolError> {
        self.broker.subscribe(&self.client_id, topics)
    }

    fn disconnect(&self, _timeout: Duration) -> Result<(), ProtocolError> {
        if !self.broker.is_connected(&self.client_id) {
            return Err(ProtocolError::Disconnect(format!(
                "client '{}' is not connected",
                self.client_id
            )));
        }
        self.broker.go_offline(&self.client_id, true);
        Ok(())
    }

    fn disconnect_forcibly(&self, _timeout: Duration) -> Result<(), ProtocolError> {
        self.broker.go_offline(&self.client_id, true);
        Ok(())
    }

    fn close(&self) {
        self.broker.stashed.lock().remove(&self.client_id);
        self.broker.go_offline(&self.client_id, true);
    }
}
