// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transport handlers.
//!
//! A handler owns the inbound queues (application, ping-request,
//! ping-acknowledgement), the outbound buffer, and the wire connection. The
//! [`Channel`](crate::Channel), [`Listener`](crate::Listener) and
//! [`PingService`](crate::PingService) only talk to it through
//! [`TransportHandler`].
//!
//! | Protocol | Handler                          |
//! |----------|----------------------------------|
//! | MQTT     | [`MqttHandler`]                  |
//! | HTTP     | [`ContractHandler`] (no wire yet) |
//! | BLE      | [`ContractHandler`] (no wire yet) |

pub mod contract;
pub mod mqtt;

use std::sync::Arc;

use rsa::RsaPublicKey;

use crate::config::HandlerConfig;
use crate::envelope::{Envelope, Fields};
use crate::error::{ChannelError, ProtocolError};
use crate::flags::{Protocol, QoS, Security};
use crate::stats::HandlerStats;

pub use contract::ContractHandler;
pub use mqtt::topics::{Status, TopicScheme};
pub use mqtt::MqttHandler;

/// Capability surface every protocol backend provides.
pub trait TransportHandler: Send + Sync {
    /// Protocol implemented by this handler.
    fn protocol(&self) -> Protocol;

    /// Connect, subscribe and exchange keys. Blocks up to the configured
    /// timeout for each of connect and handshake.
    fn setup(&mut self, config: HandlerConfig) -> Result<(), ProtocolError>;

    /// Announce a graceful disconnect and release the connection.
    fn disconnect(&self) -> Result<(), ProtocolError>;

    /// Discard buffered outbound messages.
    fn flush(&self);

    /// Stamp `timestamp` and publish `fields` to `destination`.
    fn publish(&self, destination: &str, qos: QoS, fields: Fields) -> Result<(), ProtocolError>;

    /// Whether the application queue has a message.
    fn poll(&self) -> bool;

    /// Head of the application queue, still packed.
    fn pop(&self) -> Option<Envelope>;

    fn pop_ping_request(&self) -> Option<Envelope>;

    fn pop_ping_ack(&self) -> Option<Envelope>;

    /// Unpacked fields of a status announcement.
    fn status_message(&self, status: Status) -> Fields;

    /// Fields of a ping request (`request_ts = None`) or acknowledgement.
    fn ping_message(&self, request_ts: Option<u64>) -> Fields;

    /// Where ping requests go. `None` for listen-only handlers.
    fn ping_request_dest(&self) -> Option<String>;

    /// Where the acknowledgement for `target`'s ping goes.
    fn ping_ack_dest(&self, target: &str) -> String;

    /// Topic for application messages at a security level.
    fn destination_for(&self, security: Security) -> String;

    /// Peer key captured by the handshake, if any.
    fn dest_key(&self) -> Option<Arc<RsaPublicKey>>;

    /// Shared counters.
    fn stats(&self) -> &HandlerStats;
}

/// Build the handler for `protocol`.
pub fn create_handler(protocol: Protocol) -> Result<Box<dyn TransportHandler>, ChannelError> {
    match protocol {
        Protocol::Mqtt => Ok(Box::new(MqttHandler::new())),
        Protocol::Http | Protocol::Ble => Ok(Box::new(ContractHandler::new(protocol))),
        other => Err(ChannelError::UnsupportedProtocol(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory() {
        assert_eq!(
            create_handler(Protocol::Mqtt).expect("mqtt").protocol(),
            Protocol::Mqtt
        );
        assert_eq!(
            create_handler(Protocol::Ble).expect("ble").protocol(),
            Protocol::Ble
        );
        assert!(matches!(
            create_handler(Protocol::Lora),
            Err(ChannelError::UnsupportedProtocol(Protocol::Lora))
        ));
    }
}
