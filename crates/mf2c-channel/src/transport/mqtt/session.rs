// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broker session abstraction.
//!
//! The MQTT handler drives a [`MqttSession`] and receives [`WireEvent`]s
//! through an [`EventSink`]. Two backends exist: the `rumqttc` network
//! client and the in-process [`MemoryBroker`](super::memory::MemoryBroker).
//!
//! The sink is invoked on the backend's delivery thread and must only
//! enqueue.

use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::error::ProtocolError;
use crate::queue::OutboundMessage;

/// Event delivered by a session backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireEvent {
    /// Connection (re-)established.
    Connected { reconnect: bool },
    /// Connection dropped; the backend reconnects on its own.
    ConnectionLost(String),
    /// Message on a subscribed topic.
    Message { topic: String, payload: Vec<u8> },
}

/// Callback receiving wire events.
pub type EventSink = Arc<dyn Fn(WireEvent) + Send + Sync>;

/// Connect parameters shared by every backend.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub client_id: String,
    pub keep_alive: Duration,
    /// Published by the broker on ungraceful disconnect.
    pub will: OutboundMessage,
}

/// Completion handle for one publish.
#[derive(Debug)]
pub struct DeliveryToken {
    done: Option<Receiver<()>>,
}

impl DeliveryToken {
    /// Token that is already complete.
    pub fn completed() -> Self {
        Self { done: None }
    }

    /// Pending token and the sender that completes it. Dropping the sender
    /// fails the token.
    pub fn pending() -> (Self, Sender<()>) {
        let (tx, rx) = bounded(1);
        (Self { done: Some(rx) }, tx)
    }

    /// Block until delivered, or fail after `timeout`.
    pub fn wait(&self, timeout: Duration) -> Result<(), ProtocolError> {
        let Some(done) = &self.done else {
            return Ok(());
        };
        match done.recv_timeout(timeout) {
            Ok(()) => Ok(()),
            Err(RecvTimeoutError::Timeout) => Err(ProtocolError::Publish(format!(
                "no delivery acknowledgement after {}s",
                timeout.as_secs()
            ))),
            Err(RecvTimeoutError::Disconnected) => {
                Err(ProtocolError::Publish("client closed before delivery".into()))
            }
        }
    }
}

/// One live broker connection.
pub trait MqttSession: Send + Sync {
    /// Queue a message for delivery.
    fn publish(&self, msg: &OutboundMessage) -> Result<DeliveryToken, ProtocolError>;

    /// Subscribe at QoS 1 and wait for the acknowledgement.
    fn subscribe(&self, topics: &[String], timeout: Duration) -> Result<(), ProtocolError>;

    /// Graceful disconnect; the will is discarded.
    fn disconnect(&self, timeout: Duration) -> Result<(), ProtocolError>;

    /// Drop the connection without the disconnect handshake.
    fn disconnect_forcibly(&self, timeout: Duration) -> Result<(), ProtocolError>;

    /// Release all resources. Pending deliveries fail.
    fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_states() {
        assert!(DeliveryToken::completed().wait(Duration::ZERO).is_ok());

        let (token, tx) = DeliveryToken::pending();
        tx.send(()).expect("send");
        assert!(token.wait(Duration::from_millis(10)).is_ok());

        let (token, _tx) = DeliveryToken::pending();
        assert!(matches!(
            token.wait(Duration::from_millis(10)),
            Err(ProtocolError::Publish(_))
        ));

        let (token, tx) = DeliveryToken::pending();
        drop(tx);
        assert!(matches!(
            token.wait(Duration::from_secs(5)),
            Err(ProtocolError::Publish(_))
        ));
    }
}
