// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Public channel API.
//!
//! A [`Channel`] binds one friendly name to one transport. Construction
//! connects, exchanges keys with the destination (if any) and starts the
//! ping service; [`Channel::destruct`] tears all of it down again.
//!
//! ```no_run
//! use mf2c_channel::{Channel, Envelope, Protocol, QoS, Security, Privacy};
//!
//! let channel = Channel::new(Some("agent-b"), Protocol::Mqtt, "agent-a")?;
//! channel.send(
//!     Envelope::with_payload("hello"),
//!     &[Security::Protected.into(), QoS::AtLeastOnce.into(), Privacy::NotPii.into()],
//! )?;
//! while let Some(msg) = channel.pop() {
//!     println!("{:?}", msg.payload());
//! }
//! channel.destruct();
//! # Ok::<(), mf2c_channel::ChannelError>(())
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use rsa::RsaPublicKey;
use serde_json::Value;

use crate::config::ChannelConfig;
use crate::envelope::{field, Direction, Envelope};
use crate::error::{ChannelError, ChannelResult};
use crate::flags::{Flag, Privacy, Protocol, QoS, Security};
use crate::identity::Identity;
use crate::listener::Listener;
use crate::ping::{PingService, PingState};
use crate::stats::HandlerStatsSnapshot;
use crate::transport::{create_handler, TransportHandler};

/// Per-agent, per-protocol messaging channel.
pub struct Channel {
    config: ChannelConfig,
    identity: Mutex<Option<&'static Identity>>,
    handler: Arc<dyn TransportHandler>,
    ping: Arc<PingService>,
    ping_thread: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl Channel {
    /// Open a channel with default broker and timeouts. `destination = None`
    /// makes it listen-only.
    pub fn new(destination: Option<&str>, protocol: Protocol, friendly_name: &str) -> ChannelResult<Self> {
        let config = ChannelConfig::new(friendly_name, destination.map(str::to_string)).protocol(protocol);
        Self::with_config(config)
    }

    /// Open a channel from a full configuration.
    pub fn with_config(config: ChannelConfig) -> ChannelResult<Self> {
        if config.friendly_name.trim().is_empty() {
            return Err(ChannelError::InvalidArgument("friendly name must not be empty".into()));
        }
        config.validate()?;

        let identity = Identity::get_instance()?;
        let mut handler = create_handler(config.protocol)?;
        handler.setup(config.handler_config())?;
        let handler: Arc<dyn TransportHandler> = Arc::from(handler);

        let listener = Arc::new(Listener::new(
            Arc::clone(&handler),
            identity,
            config.timeout_secs,
        ));
        let ping = Arc::new(PingService::new(
            Arc::clone(&handler),
            identity,
            listener,
            Duration::from_secs(config.ping_interval()),
            config.destination.is_none(),
        ));
        let ping_thread = match ping.start() {
            Ok(handle) => handle,
            Err(e) => {
                if let Err(e) = handler.disconnect() {
                    tracing::error!("Error disconnecting after failed start: {}", e);
                }
                return Err(e);
            }
        };

        tracing::info!(
            "Channel '{}' open over {} ({})",
            config.friendly_name,
            config.protocol,
            config.destination.as_deref().unwrap_or("listen-only")
        );
        Ok(Self {
            config,
            identity: Mutex::new(Some(identity)),
            handler,
            ping,
            ping_thread: Mutex::new(Some(ping_thread)),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Sign, encrypt as requested and publish `message` to the destination.
    ///
    /// `flags` must hold exactly one [`Security`], one [`QoS`] and one
    /// [`Privacy`] flag. The payload must be a non-empty string. Any
    /// `source` already on the message is replaced by this channel's name.
    pub fn send(&self, mut message: Envelope, flags: &[Flag]) -> ChannelResult<()> {
        let identity = (*self.identity.lock()).ok_or(ChannelError::Shutdown)?;
        if self.shut_down.load(Ordering::Acquire) {
            return Err(ChannelError::Shutdown);
        }
        if message.direction() != Direction::Outbound {
            return Err(ChannelError::InvalidArgument(
                "only outbound envelopes can be sent".into(),
            ));
        }
        let (security, qos, privacy) = parse_flags(flags)?;
        check_payload(&message)?;

        // Peers key handshakes and ping acks on `source`; never send under
        // another agent's name.
        message.fields_mut().insert(
            field::SOURCE.into(),
            Value::String(self.config.friendly_name.clone()),
        );
        tracing::trace!("Sending {} / {} / {} message", security, qos, privacy);

        let dest_key = self.handler.dest_key();
        message.pack_with(
            identity,
            security,
            self.handler.protocol(),
            qos,
            dest_key.as_deref(),
        )?;
        self.handler.publish(
            &self.handler.destination_for(security),
            qos,
            message.into_fields(),
        )?;
        Ok(())
    }

    /// Discard messages buffered while disconnected.
    pub fn flush(&self) {
        self.handler.flush();
    }

    /// Stop pinging, flush, disconnect. Safe to call more than once.
    pub fn destruct(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("Shutting down channel '{}'", self.config.friendly_name);

        self.ping.set_keep_running(false);
        if let Some(handle) = self.ping_thread.lock().take() {
            if handle.join().is_err() {
                tracing::error!("Ping service thread panicked");
            }
        }
        self.flush();
        if let Err(e) = self.handler.disconnect() {
            tracing::error!("Error disconnecting channel: {}", e);
        }
        *self.identity.lock() = None;
    }

    /// Whether an application message is waiting.
    pub fn poll(&self) -> bool {
        self.handler.poll()
    }

    /// Next application message, unpacked. Messages that fail to unpack are
    /// logged and skipped as `None`.
    pub fn pop(&self) -> Option<Envelope> {
        let identity = (*self.identity.lock())?;
        let mut message = self.handler.pop()?;
        match message.unpack_with(identity) {
            Ok(()) => Some(message),
            Err(e) => {
                self.handler.stats().record_error();
                tracing::error!("Dropping inbound message: {}", e);
                None
            }
        }
    }

    pub fn friendly_name(&self) -> &str {
        &self.config.friendly_name
    }

    pub fn destination(&self) -> Option<&str> {
        self.config.destination.as_deref()
    }

    pub fn protocol(&self) -> Protocol {
        self.handler.protocol()
    }

    /// Destination public key obtained by the handshake.
    pub fn dest_key(&self) -> Option<Arc<RsaPublicKey>> {
        self.handler.dest_key()
    }

    pub fn ping_state(&self) -> PingState {
        self.ping.state()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> HandlerStatsSnapshot {
        self.handler.stats().snapshot()
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.destruct();
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("friendly_name", &self.config.friendly_name)
            .field("destination", &self.config.destination)
            .field("protocol", &self.config.protocol)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

fn check_payload(message: &Envelope) -> ChannelResult<()> {
    match message.fields().get(field::PAYLOAD) {
        None | Some(Value::Null) => Err(ChannelError::EmptyPayload),
        Some(Value::String(s)) if s.is_empty() => Err(ChannelError::EmptyPayload),
        Some(Value::String(_)) => Ok(()),
        Some(_) => Err(ChannelError::InvalidArgument(
            "payload must be a string".into(),
        )),
    }
}

/// Pick exactly one flag of each kind.
fn parse_flags(flags: &[Flag]) -> ChannelResult<(Security, QoS, Privacy)> {
    fn one<T: Copy>(found: &mut Option<T>, value: T, kind: &'static str) -> ChannelResult<()> {
        if found.replace(value).is_some() {
            return Err(ChannelError::ConflictingFlags(kind));
        }
        Ok(())
    }

    let (mut security, mut qos, mut privacy) = (None, None, None);
    for flag in flags {
        match *flag {
            Flag::Security(s) => one(&mut security, s, "Security")?,
            Flag::QoS(q) => one(&mut qos, q, "QoS")?,
            Flag::Privacy(p) => one(&mut privacy, p, "Privacy")?,
        }
    }
    Ok((
        security.ok_or(ChannelError::MissingFlag("Security"))?,
        qos.ok_or(ChannelError::MissingFlag("QoS"))?,
        privacy.ok_or(ChannelError::MissingFlag("Privacy"))?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flags() {
        let (s, q, p) = parse_flags(&[
            QoS::ExactlyOnce.into(),
            Privacy::Gdpr.into(),
            Security::Private.into(),
        ])
        .expect("flags");
        assert_eq!((s, q, p), (Security::Private, QoS::ExactlyOnce, Privacy::Gdpr));

        assert!(matches!(
            parse_flags(&[Security::Public.into(), Privacy::NotPii.into()]),
            Err(ChannelError::MissingFlag("QoS"))
        ));
        assert!(matches!(
            parse_flags(&[]),
            Err(ChannelError::MissingFlag("Security"))
        ));
        assert!(matches!(
            parse_flags(&[
                Security::Public.into(),
                Security::Private.into(),
                QoS::AtMostOnce.into(),
                Privacy::NotPii.into(),
            ]),
            Err(ChannelError::ConflictingFlags("Security"))
        ));
    }

    #[test]
    fn test_check_payload() {
        assert!(check_payload(&Envelope::with_payload("hi")).is_ok());
        assert!(matches!(
            check_payload(&Envelope::with_payload("")),
            Err(ChannelError::EmptyPayload)
        ));

        let mut fields = crate::envelope::Fields::new();
        fields.insert(field::SOURCE.into(), Value::from("A"));
        assert!(matches!(
            check_payload(&Envelope::outbound(fields.clone())),
            Err(ChannelError::EmptyPayload)
        ));
        fields.insert(field::PAYLOAD.into(), Value::from(7));
        assert!(matches!(
            check_payload(&Envelope::outbound(fields.clone())),
            Err(ChannelError::InvalidArgument(_))
        ));
        fields.insert(field::PAYLOAD.into(), serde_json::json!({ "k": "v" }));
        assert!(matches!(
            check_payload(&Envelope::outbound(fields)),
            Err(ChannelError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_rejects_unsupported_protocol() {
        assert!(matches!(
            Channel::new(Some("B"), Protocol::Lora, "A"),
            Err(ChannelError::UnsupportedProtocol(Protocol::Lora))
        ));
        assert!(matches!(
            Channel::new(Some("B"), Protocol::Http, "A"),
            Err(ChannelError::Protocol(crate::error::ProtocolError::Unsupported(Protocol::Http)))
        ));
        assert!(matches!(
            Channel::new(None, Protocol::Mqtt, " "),
            Err(ChannelError::InvalidArgument(_))
        ));
    }
}
