// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Message flags: security level, delivery QoS, privacy category, protocol.
//!
//! Security, QoS and Protocol travel on the wire as ordinals, so the
//! discriminants below are part of the wire format and must not be reordered.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Security level applied to an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Security {
    /// Plain payload, no signature.
    Public = 0,
    /// Payload signed with the sender's private key.
    Protected = 1,
    /// Payload signed, then encrypted with the recipient's public key.
    Private = 2,
}

impl Security {
    pub const ALL: &'static [Security] = &[Self::Public, Self::Protected, Self::Private];

    /// Wire ordinal.
    pub fn ordinal(self) -> u64 {
        self as u64
    }

    /// Parse a wire ordinal.
    pub fn from_ordinal(ordinal: u64) -> Option<Self> {
        match ordinal {
            0 => Some(Self::Public),
            1 => Some(Self::Protected),
            2 => Some(Self::Private),
            _ => None,
        }
    }
}

impl fmt::Display for Security {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Public => "PUBLIC",
            Self::Protected => "PROTECTED",
            Self::Private => "PRIVATE",
        };
        f.write_str(name)
    }
}

/// Delivery quality of service, mirroring the MQTT levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    pub const ALL: &'static [QoS] = &[Self::AtMostOnce, Self::AtLeastOnce, Self::ExactlyOnce];

    /// Wire ordinal.
    pub fn ordinal(self) -> u64 {
        self as u64
    }

    /// Parse a wire ordinal.
    pub fn from_ordinal(ordinal: u64) -> Option<Self> {
        match ordinal {
            0 => Some(Self::AtMostOnce),
            1 => Some(Self::AtLeastOnce),
            2 => Some(Self::ExactlyOnce),
            _ => None,
        }
    }
}

impl fmt::Display for QoS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AtMostOnce => "ATMOSTONCE",
            Self::AtLeastOnce => "ATLEASTONCE",
            Self::ExactlyOnce => "EXACTLYONCE",
        };
        f.write_str(name)
    }
}

/// GDPR privacy category. Carried with every send, not enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Privacy {
    /// Content must be processed according to GDPR.
    Gdpr,
    /// GDPR not applicable.
    NotGdpr,
    /// Not personally identifiable.
    NotPii,
}

impl Privacy {
    pub const ALL: &'static [Privacy] = &[Self::Gdpr, Self::NotGdpr, Self::NotPii];
}

impl fmt::Display for Privacy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Gdpr => "GDPR",
            Self::NotGdpr => "NOT_GDPR",
            Self::NotPii => "NOTPII",
        };
        f.write_str(name)
    }
}

macro_rules! protocols {
    ($($variant:ident => $name:literal),+ $(,)?) => {
        /// Transport protocols. Only MQTT, HTTP and BLE have handlers; the
        /// remaining names are reserved so their ordinals stay stable.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum Protocol {
            $(
                #[serde(rename = $name)]
                $variant,
            )+
        }

        impl Protocol {
            /// Every protocol in ordinal order.
            pub const ALL: &'static [Protocol] = &[$(Protocol::$variant),+];

            /// Canonical upper-case name.
            pub fn name(self) -> &'static str {
                match self {
                    $(Protocol::$variant => $name,)+
                }
            }
        }
    };
}

protocols! {
    Mqtt => "MQTT",
    Http => "HTTP",
    Ble => "BLE",
    B => "B",
    Lora => "LORA",
    Lorawan => "LORAWAN",
    Coap => "COAP",
    Zigbee => "ZIGBEE",
    Sigfox => "SIGFOX",
    Dds => "DDS",
    Sixlowpan => "SIXLOWPAN",
    Thread => "THREAD",
    Halow => "HALOW",
    TwoG => "TWO_G",
    ThreeG => "THREE_G",
    FourG => "FOUR_G",
    LteCat0 => "LTECAT0",
    LteCat1 => "LTECAT1",
    LteCat3 => "LTECAT3",
    Zwave => "ZWAVE",
    LteM1 => "LTEM1",
    NbIot => "NBIOT",
    Nfc => "NFC",
    Rfid => "RFID",
    Digimesh => "DIGIMESH",
    Ingenu => "INGENU",
    WeightlessN => "WEIGHTLESSN",
    WeightlessP => "WEIGHTLESSP",
    WeightlessW => "WEIGHTLESSW",
    Ant => "ANT",
    AntPlus => "ANTPLUS",
    Miwi => "MIWI",
    Enocean => "ENOCEAN",
    Dash7 => "DASH7",
    WirelessHart => "WIRELESSHART",
    Rpc => "RPC",
    Kafka => "KAFKA",
    Jms => "JMS",
    Amqp => "AMQP",
    RabbitMq => "RABBITMQ",
    ActiveMq => "ACTIVEMQ",
    ZeroMq => "ZEROMQ",
    Ice => "ICE",
    Corba => "CORBA",
    Thrift => "THRIFT",
    GooglePbuff => "GOOGLE_PBUFF",
    Zookeeper => "ZOOKEEPER",
    Go => "GO",
    Bridge => "BRIDGE",
    IpOnly => "IP_ONLY",
}

impl Protocol {
    /// Wire ordinal.
    pub fn ordinal(self) -> u64 {
        self as u64
    }

    /// Parse a wire ordinal.
    pub fn from_ordinal(ordinal: u64) -> Option<Self> {
        usize::try_from(ordinal)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
    }

    /// Case-insensitive lookup by name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|p| p.name().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Unknown flag name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownFlag(pub String);

impl fmt::Display for UnknownFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown flag '{}'", self.0)
    }
}

impl std::error::Error for UnknownFlag {}

macro_rules! from_display_name {
    ($($ty:ty),+) => {
        $(
            impl std::str::FromStr for $ty {
                type Err = UnknownFlag;

                /// Case-insensitive; `_` and `-` are ignored.
                fn from_str(s: &str) -> Result<Self, Self::Err> {
                    let wanted = normalize(s);
                    Self::ALL
                        .iter()
                        .copied()
                        .find(|v| normalize(&v.to_string()) == wanted)
                        .ok_or_else(|| UnknownFlag(s.to_string()))
                }
            }
        )+
    };
}

fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '_' && *c != '-')
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

from_display_name!(Security, QoS, Privacy);

/// A single send flag. `Channel::send` needs exactly one of each kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flag {
    Security(Security),
    QoS(QoS),
    Privacy(Privacy),
}

impl From<Security> for Flag {
    fn from(s: Security) -> Self {
        Self::Security(s)
    }
}

impl From<QoS> for Flag {
    fn from(q: QoS) -> Self {
        Self::QoS(q)
    }
}

impl From<Privacy> for Flag {
    fn from(p: Privacy) -> Self {
        Self::Privacy(p)
    }
}
