// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Channel and handler configuration.
//!
//! Supports both programmatic and file-based configuration. The handler
//! receives a [`HandlerConfig`], which also round-trips through the
//! property-map form (`friendlyName`, `broker`, `destination`, `keepAlive`,
//! `timeOut`).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use crate::error::ConfigError;
use crate::flags::Protocol;

/// Property key: agent name used in topics and the `source` field.
pub const KEY_FRIENDLY_NAME: &str = "friendlyName";
/// Property key: broker URL.
pub const KEY_BROKER: &str = "broker";
/// Property key: peer name, absent for listen-only channels.
pub const KEY_DESTINATION: &str = "destination";
/// Property key: keep-alive in seconds.
pub const KEY_KEEP_ALIVE: &str = "keepAlive";
/// Property key: connect / handshake / publish timeout in seconds.
pub const KEY_TIMEOUT: &str = "timeOut";

/// Default MQTT port.
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Agent name.
    pub friendly_name: String,

    /// Peer agent name. `None` makes the channel listen-only.
    #[serde(default)]
    pub destination: Option<String>,

    /// Transport protocol.
    #[serde(default = "default_protocol")]
    pub protocol: Protocol,

    /// Broker URL (`tcp://host:port`, `host:port`, `memory://name`).
    #[serde(default = "default_broker")]
    pub broker: String,

    /// Keep-alive (seconds).
    #[serde(default = "default_secs")]
    pub keep_alive_secs: u64,

    /// Connect, handshake and publish timeout (seconds).
    #[serde(default = "default_secs")]
    pub timeout_secs: u64,

    /// Ping interval (seconds). Defaults to the timeout.
    #[serde(default)]
    pub ping_interval_secs: Option<u64>,
}

fn default_protocol() -> Protocol {
    Protocol::Mqtt
}

fn default_broker() -> String {
    "tcp://localhost:1883".to_string()
}

fn default_secs() -> u64 {
    60
}

impl ChannelConfig {
    /// Configuration with defaults for everything but the names.
    pub fn new(friendly_name: impl Into<String>, destination: Option<String>) -> Self {
        Self {
            friendly_name: friendly_name.into(),
            destination,
            protocol: default_protocol(),
            broker: default_broker(),
            keep_alive_secs: default_secs(),
            timeout_secs: default_secs(),
            ping_interval_secs: None,
        }
    }

    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn broker(mut self, broker: impl Into<String>) -> Self {
        self.broker = broker.into();
        self
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn keep_alive_secs(mut self, secs: u64) -> Self {
        self.keep_alive_secs = secs;
        self
    }

    pub fn ping_interval_secs(mut self, secs: u64) -> Self {
        self.ping_interval_secs = Some(secs);
        self
    }

    /// Effective ping interval.
    pub fn ping_interval(&self) -> u64 {
        self.ping_interval_secs.unwrap_or(self.timeout_secs)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if matches!(self.ping_interval_secs, Some(0)) {
            return Err(ConfigError::Invalid("ping_interval_secs must be > 0".into()));
        }
        self.handler_config().validate()
    }

    /// Subset handed to the transport handler.
    pub fn handler_config(&self) -> HandlerConfig {
        HandlerConfig {
            friendly_name: self.friendly_name.clone(),
            broker: self.broker.clone(),
            destination: self.destination.clone(),
            keep_alive_secs: self.keep_alive_secs,
            timeout_secs: self.timeout_secs,
        }
    }
}

/// Transport handler setup parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerConfig {
    pub friendly_name: String,
    pub broker: String,
    pub destination: Option<String>,
    pub keep_alive_secs: u64,
    pub timeout_secs: u64,
}

impl HandlerConfig {
    /// Parse the property-map form. `destination` may be absent or empty.
    pub fn from_properties(props: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let get = |key: &'static str| {
            props
                .get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .ok_or(ConfigError::Missing(key))
        };
        let secs = |key: &'static str| -> Result<u64, ConfigError> {
            get(key)?
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("{} is not a number of seconds", key)))
        };

        let config = Self {
            friendly_name: get(KEY_FRIENDLY_NAME)?.to_string(),
            broker: get(KEY_BROKER)?.to_string(),
            destination: get(KEY_DESTINATION).ok().map(str::to_string),
            keep_alive_secs: secs(KEY_KEEP_ALIVE)?,
            timeout_secs: secs(KEY_TIMEOUT)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Property-map form. `destination` is omitted when unset.
    pub fn to_properties(&self) -> HashMap<String, String> {
        let mut props = HashMap::new();
        props.insert(KEY_FRIENDLY_NAME.into(), self.friendly_name.clone());
        props.insert(KEY_BROKER.into(), self.broker.clone());
        if let Some(dest) = &self.destination {
            props.insert(KEY_DESTINATION.into(), dest.clone());
        }
        props.insert(KEY_KEEP_ALIVE.into(), self.keep_alive_secs.to_string());
        props.insert(KEY_TIMEOUT.into(), self.timeout_secs.to_string());
        props
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.friendly_name.trim().is_empty() {
            return Err(ConfigError::Invalid("friendly name must not be empty".into()));
        }
        if self.friendly_name.contains(['/', '+', '#']) {
            return Err(ConfigError::Invalid(format!(
                "friendly name '{}' contains a topic separator or wildcard",
                self.friendly_name
            )));
        }
        if let Some(dest) = &self.destination {
            if dest.trim().is_empty() || dest.contains(['/', '+', '#']) {
                return Err(ConfigError::Invalid(format!("bad destination '{}'", dest)));
            }
        }
        if self.keep_alive_secs == 0 {
            return Err(ConfigError::Invalid("keepAlive must be > 0".into()));
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeOut must be > 0".into()));
        }
        BrokerUrl::parse(&self.broker)?;
        Ok(())
    }
}

/// Parsed broker address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerUrl {
    /// Network MQTT broker.
    Tcp { host: String, port: u16 },
    /// Named in-process broker.
    Memory(String),
}

impl BrokerUrl {
    /// Parse `tcp://host:port`, `mqtt://host:port`, `host:port`, `host` or
    /// `memory://name`.
    pub fn parse(url: &str) -> Result<Self, ConfigError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(ConfigError::Missing(KEY_BROKER));
        }
        if let Some(name) = url.strip_prefix("memory://") {
            if name.is_empty() {
                return Err(ConfigError::Invalid("memory broker needs a name".into()));
            }
            return Ok(Self::Memory(name.to_string()));
        }

        let rest = match url.split_once("://") {
            Some(("tcp" | "mqtt", rest)) => rest,
            Some((scheme, _)) => {
                return Err(ConfigError::Invalid(format!(
                    "unsupported broker scheme '{}'",
                    scheme
                )))
            }
            None => url,
        };
        let rest = rest.trim_end_matches('/');

        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| ConfigError::Invalid(format!("bad broker port in '{}'", url)))?;
                (host, port)
            }
            None => (rest, DEFAULT_MQTT_PORT),
        };
        if host.is_empty() {
            return Err(ConfigError::Invalid(format!("missing broker host in '{}'", url)));
        }
        Ok(Self::Tcp {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for BrokerUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
            Self::Memory(name) => write!(f, "memory://{}", name),
        }
    }
}
