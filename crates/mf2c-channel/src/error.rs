// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types for identity, envelope, transport and channel operations.
//!
//! Lower layers convert upward with `?`: an [`IdentityError`] becomes a
//! [`MessageError`], which becomes a [`ProtocolError`], and everything
//! surfaces to the application as a single [`ChannelError`].

use crate::flags::Protocol;
use thiserror::Error;

/// Identity (key-pair) errors.
#[derive(Debug, Clone, Error)]
pub enum IdentityError {
    #[error("Identity initialisation failed: {0}")]
    Init(String),

    #[error("Signing failed: {0}")]
    Sign(String),

    #[error("Identity crypto error: {0}")]
    Crypto(String),
}

/// Envelope framing errors (pack / unpack).
#[derive(Debug, Clone, Error)]
pub enum MessageError {
    #[error("Wrong envelope direction: {0}")]
    BadDirection(&'static str),

    #[error("Nothing to process: envelope is empty")]
    Empty,

    #[error("Failed to generate signature: {0}")]
    SignFailed(String),

    #[error("Signature does not match payload")]
    BadSignature,

    #[error("Malformed envelope: {0}")]
    Malformed(String),

    #[error("Envelope crypto error: {0}")]
    Crypto(String),

    #[error("No recipient public key, cannot encrypt private payload")]
    NoRecipientKey,

    #[error(transparent)]
    Identity(#[from] IdentityError),
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Missing configuration key: {0}")]
    Missing(&'static str),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Transport handler errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Connect failed: {0}")]
    Connect(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Disconnect failed: {0}")]
    Disconnect(String),

    #[error("Timed out after {0}s waiting for the destination public key")]
    HandshakeTimeout(u64),

    #[error("Handler is not set up")]
    NotConnected,

    #[error("{0} handler is not implemented")]
    Unsupported(Protocol),

    #[error(transparent)]
    Message(#[from] MessageError),
}

/// Errors surfaced by the public [`Channel`](crate::Channel) API.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(Protocol),

    #[error("Missing {0} flag")]
    MissingFlag(&'static str),

    #[error("More than one {0} flag")]
    ConflictingFlags(&'static str),

    #[error("Message has no payload")]
    EmptyPayload,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Channel has been shut down")]
    Shutdown,

    #[error("Failed to spawn {0} thread: {1}")]
    Spawn(&'static str, std::io::Error),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Result alias for channel operations.
pub type ChannelResult<T> = Result<T, ChannelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_error_lifts_to_channel_error() {
        let err: MessageError = IdentityError::Sign("bad key".into()).into();
        let err: ProtocolError = err.into();
        let err: ChannelError = err.into();
        assert!(matches!(
            err,
            ChannelError::Protocol(ProtocolError::Message(MessageError::Identity(
                IdentityError::Sign(_)
            )))
        ));
        assert_eq!(err.to_string(), "Signing failed: bad key");
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(
            ProtocolError::HandshakeTimeout(60).to_string(),
            "Timed out after 60s waiting for the destination public key"
        );
        assert_eq!(
            ChannelError::MissingFlag("QoS").to_string(),
            "Missing QoS flag"
        );
        assert_eq!(
            ChannelError::UnsupportedProtocol(Protocol::Lora).to_string(),
            "Unsupported protocol: LORA"
        );
    }
}
