// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! mF2C Secure Messaging Channel
//!
//! Per-agent publish/subscribe channels with signed and encrypted envelopes,
//! liveness pings, and an MQTT reference transport.
//!
//! # Features
//!
//! - **Envelopes**: base64(JSON) framing, RSA-SHA256 signatures, RSA PKCS#1
//!   encryption for private payloads
//! - **Key handshake**: peers swap public keys over `mf2c/{name}/handshake`
//! - **Liveness**: periodic ping requests, automatic acknowledgements
//! - **Resilience**: durable sessions, auto-reconnect, bounded outbound buffer
//!
//! # Quick Start
//!
//! ```bash
//! # Listen as "agent-b"
//! mf2c-channel listen --name agent-b
//!
//! # Send a signed message from "agent-a"
//! mf2c-channel send --name agent-a --to agent-b --security protected --qos at-least-once "hello"
//! ```
//!
//! # Configuration File
//!
//! ```toml
//! friendly_name = "agent-a"
//! destination = "agent-b"
//! protocol = "MQTT"
//! broker = "tcp://localhost:1883"
//! keep_alive_secs = 60
//! timeout_secs = 60
//! ```

pub mod channel;
pub mod config;
pub mod envelope;
pub mod error;
pub mod flags;
pub mod identity;
pub mod listener;
pub mod ping;
pub mod queue;
pub mod signal;
pub mod stats;
pub mod transport;

pub use channel::Channel;
pub use config::{BrokerUrl, ChannelConfig, HandlerConfig};
pub use envelope::{Direction, Envelope, Fields};
pub use error::{
    ChannelError, ChannelResult, ConfigError, IdentityError, MessageError, ProtocolError,
};
pub use flags::{Flag, Privacy, Protocol, QoS, Security};
pub use identity::Identity;
pub use listener::Listener;
pub use ping::{PingService, PingState};
pub use stats::{HandlerStats, HandlerStatsSnapshot};
pub use transport::mqtt::memory::MemoryBroker;
pub use transport::{create_handler, ContractHandler, MqttHandler, Status, TransportHandler};
