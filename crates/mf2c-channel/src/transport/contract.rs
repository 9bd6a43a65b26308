// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Handler for protocols that have a contract but no wire implementation
//! (HTTP, BLE).
//!
//! Queue access and topic naming behave like the MQTT handler so callers
//! can be written against either; `setup` and `publish` fail with
//! [`ProtocolError::Unsupported`].

use std::sync::Arc;

use rsa::RsaPublicKey;
use serde_json::Value;

use super::{Status, TopicScheme, TransportHandler};
use crate::config::HandlerConfig;
use crate::envelope::{field, Envelope, Fields};
use crate::error::ProtocolError;
use crate::flags::{Protocol, QoS, Security};
use crate::queue::HandlerQueues;
use crate::stats::HandlerStats;

pub struct ContractHandler {
    protocol: Protocol,
    scheme: TopicScheme,
    queues: HandlerQueues,
    stats: HandlerStats,
}

impl ContractHandler {
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            scheme: TopicScheme::default(),
            queues: HandlerQueues::new(),
            stats: HandlerStats::new(),
        }
    }

    /// Queues backing this handler, for wire code that does not exist yet.
    pub fn queues(&self) -> &HandlerQueues {
        &self.queues
    }
}

impl TransportHandler for ContractHandler {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn setup(&mut self, config: HandlerConfig) -> Result<(), ProtocolError> {
        config.validate()?;
        self.scheme = TopicScheme::new(config.friendly_name, config.destination);
        tracing::error!("{} transport is not implemented", self.protocol);
        Err(ProtocolError::Unsupported(self.protocol))
    }

    fn disconnect(&self) -> Result<(), ProtocolError> {
        self.queues.close();
        Ok(())
    }

    fn flush(&self) {
        self.queues.out_buf().clear();
    }

    fn publish(&self, _destination: &str, _qos: QoS, _fields: Fields) -> Result<(), ProtocolError> {
        Err(ProtocolError::Unsupported(self.protocol))
    }

    fn poll(&self) -> bool {
        self.queues.has_app()
    }

    fn pop(&self) -> Option<Envelope> {
        self.queues.pop_app()
    }

    fn pop_ping_request(&self) -> Option<Envelope> {
        self.queues.pop_ping_request()
    }

    fn pop_ping_ack(&self) -> Option<Envelope> {
        self.queues.pop_ping_ack()
    }

    fn status_message(&self, status: Status) -> Fields {
        let mut fields = Fields::new();
        fields.insert(field::SOURCE.into(), Value::String(self.scheme.me().to_string()));
        fields.insert(field::PAYLOAD.into(), Value::String(status.payload()));
        fields
    }

    fn ping_message(&self, request_ts: Option<u64>) -> Fields {
        let mut fields = Fields::new();
        fields.insert(field::SOURCE.into(), Value::String(self.scheme.me().to_string()));
        if let Some(ts) = request_ts {
            fields.insert(field::PING_REQUEST_TS.into(), Value::from(ts));
        }
        fields
    }

    fn ping_request_dest(&self) -> Option<String> {
        self.scheme.destination().map(TopicScheme::ping_request_of)
    }

    fn ping_ack_dest(&self, target: &str) -> String {
        TopicScheme::ping_ack_of(target)
    }

    fn destination_for(&self, security: Security) -> String {
        self.scheme.destination_for(security)
    }

    fn dest_key(&self) -> Option<Arc<RsaPublicKey>> {
        None
    }

    fn stats(&self) -> &HandlerStats {
        &self.stats
    }
}
