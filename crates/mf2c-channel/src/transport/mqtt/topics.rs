// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Topic naming.
//!
//! ```text
//! mf2c/{self}/public            mf2c/{self}/protected
//! mf2c/{self}/private           mf2c/{self}/handshake
//! mf2c/{self}/public/pingreq    mf2c/{self}/public/pingack
//! mf2c/{self}/status            mf2c/{target}/handshake
//! mf2c/{target}/public/pingreq  mf2c/{target}/public/pingack
//! ```

use crate::flags::Security;

const ROOT: &str = "mf2c";

/// Connection status published on the status topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Connected.
    Connected,
    /// Disconnected gracefully.
    DisconnectedGracefully,
    /// Disconnected ungracefully (last will).
    DisconnectedUngracefully,
}

impl Status {
    pub fn code(self) -> &'static str {
        match self {
            Self::Connected => "C",
            Self::DisconnectedGracefully => "DG",
            Self::DisconnectedUngracefully => "DU",
        }
    }

    /// `payload` value of a status message, e.g. `status : C`.
    pub fn payload(self) -> String {
        format!("status : {}", self.code())
    }
}

/// Queue an inbound topic is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundKind {
    App,
    PingRequest,
    PingAck,
    Handshake,
}

/// Topic names for one agent and its optional peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicScheme {
    me: String,
    destination: Option<String>,
}

impl TopicScheme {
    pub fn new(me: impl Into<String>, destination: Option<String>) -> Self {
        Self {
            me: me.into(),
            destination,
        }
    }

    pub fn me(&self) -> &str {
        &self.me
    }

    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    fn level(name: &str, security: Security) -> String {
        match security {
            Security::Public => format!("{}/{}/public", ROOT, name),
            Security::Protected => format!("{}/{}/protected", ROOT, name),
            Security::Private => format!("{}/{}/private", ROOT, name),
        }
    }

    pub fn public(&self) -> String {
        Self::level(&self.me, Security::Public)
    }

    pub fn protected(&self) -> String {
        Self::level(&self.me, Security::Protected)
    }

    pub fn private(&self) -> String {
        Self::level(&self.me, Security::Private)
    }

    pub fn handshake(&self) -> String {
        Self::handshake_of(&self.me)
    }

    pub fn ping_request(&self) -> String {
        Self::ping_request_of(&self.me)
    }

    pub fn ping_ack(&self) -> String {
        Self::ping_ack_of(&self.me)
    }

    pub fn status(&self) -> String {
        format!("{}/{}/status", ROOT, self.me)
    }

    pub fn handshake_of(target: &str) -> String {
        format!("{}/{}/handshake", ROOT, target)
    }

    pub fn ping_request_of(target: &str) -> String {
        format!("{}/{}/public/pingreq", ROOT, target)
    }

    pub fn ping_ack_of(target: &str) -> String {
        format!("{}/{}/public/pingack", ROOT, target)
    }

    /// Application topic of the peer at `security`. Listen-only schemes
    /// address their own topics.
    pub fn destination_for(&self, security: Security) -> String {
        Self::level(self.destination.as_deref().unwrap_or(&self.me), security)
    }

    /// Topics subscribed at setup.
    pub fn subscriptions(&self) -> Vec<String> {
        vec![
            self.public(),
            self.protected(),
            self.private(),
            self.handshake(),
            self.ping_request(),
            self.ping_ack(),
        ]
    }

    /// Route an inbound topic. Unknown topics map to `None`.
    pub fn classify(&self, topic: &str) -> Option<InboundKind> {
        let rest = topic
            .strip_prefix(ROOT)
            .and_then(|t| t.strip_prefix('/'))
            .and_then(|t| t.strip_prefix(self.me.as_str()))
            .and_then(|t| t.strip_prefix('/'))?;
        match rest {
            "public" | "protected" | "private" => Some(InboundKind::App),
            "public/pingreq" => Some(InboundKind::PingRequest),
            "public/pingack" => Some(InboundKind::PingAck),
            "handshake" => Some(InboundKind::Handshake),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_topics() {
        let t = TopicScheme::new("A", Some("B".into()));
        assert_eq!(t.public(), "mf2c/A/public");
        assert_eq!(t.protected(), "mf2c/A/protected");
        assert_eq!(t.private(), "mf2c/A/private");
        assert_eq!(t.handshake(), "mf2c/A/handshake");
        assert_eq!(t.ping_request(), "mf2c/A/public/pingreq");
        assert_eq!(t.ping_ack(), "mf2c/A/public/pingack");
        assert_eq!(t.status(), "mf2c/A/status");
    }

    #[test]
    fn test_target_topics() {
        assert_eq!(TopicScheme::handshake_of("B"), "mf2c/B/handshake");
        assert_eq!(TopicScheme::ping_request_of("B"), "mf2c/B/public/pingreq");
        assert_eq!(TopicScheme::ping_ack_of("B"), "mf2c/B/public/pingack");
    }

    #[test]
    fn test_destination_for() {
        let t = TopicScheme::new("A", Some("B".into()));
        assert_eq!(t.destination_for(Security::Public), "mf2c/B/public");
        assert_eq!(t.destination_for(Security::Protected), "mf2c/B/protected");
        assert_eq!(t.destination_for(Security::Private), "mf2c/B/private");

        let listen = TopicScheme::new("A", None);
        assert_eq!(listen.destination_for(Security::Public), "mf2c/A/public");
        assert_eq!(listen.destination_for(Security::Private), "mf2c/A/private");
    }

    #[test]
    fn test_classify() {
        let t = TopicScheme::new("A", None);
        assert_eq!(t.classify("mf2c/A/public"), Some(InboundKind::App));
        assert_eq!(t.classify("mf2c/A/private"), Some(InboundKind::App));
        assert_eq!(t.classify("mf2c/A/public/pingreq"), Some(InboundKind::PingRequest));
        assert_eq!(t.classify("mf2c/A/public/pingack"), Some(InboundKind::PingAck));
        assert_eq!(t.classify("mf2c/A/handshake"), Some(InboundKind::Handshake));
        assert_eq!(t.classify("mf2c/A/status"), None);
        assert_eq!(t.classify("mf2c/AB/public"), None);
        assert_eq!(t.classify("mf2c/B/public"), None);
        assert_eq!(t.subscriptions().len(), 6);
    }

    #[test]
    fn test_status_payload() {
        assert_eq!(Status::Connected.payload(), "status : C");
        assert_eq!(Status::DisconnectedGracefully.code(), "DG");
        assert_eq!(Status::DisconnectedUngracefully.payload(), "status : DU");
    }
}
