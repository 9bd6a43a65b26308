// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Ping responder.
//!
//! One [`Listener::run`] drains the ping-request queue, answering each
//! request with an acknowledgement on the requester's `pingack` topic, then
//! drains the ping-acknowledgement queue and warns about late answers.
//! Per-message failures are logged and never escape `run`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::envelope::{epoch_secs, field, Envelope};
use crate::error::{MessageError, ProtocolError};
use crate::flags::{QoS, Security};
use crate::identity::Identity;
use crate::stats::HandlerStats;
use crate::transport::TransportHandler;

/// Drains the ping queues of one handler.
pub struct Listener {
    handler: Arc<dyn TransportHandler>,
    identity: &'static Identity,
    timeout_secs: u64,
    last_ping: AtomicU64,
    last_ping_ack: AtomicU64,
}

impl Listener {
    pub fn new(handler: Arc<dyn TransportHandler>, identity: &'static Identity, timeout_secs: u64) -> Self {
        Self {
            handler,
            identity,
            timeout_secs,
            last_ping: AtomicU64::new(0),
            last_ping_ack: AtomicU64::new(0),
        }
    }

    /// Epoch seconds of the last ping request answered, 0 if none.
    pub fn last_ping(&self) -> u64 {
        self.last_ping.load(Ordering::Relaxed)
    }

    /// Epoch seconds of the last acknowledgement received, 0 if none.
    pub fn last_ping_ack(&self) -> u64 {
        self.last_ping_ack.load(Ordering::Relaxed)
    }

    /// Drain both ping queues once.
    pub fn run(&self) {
        while let Some(request) = self.handler.pop_ping_request() {
            if let Err(e) = self.acknowledge(request) {
                self.handler.stats().record_error();
                tracing::error!("Failed to answer ping request: {}", e);
            }
        }
        while let Some(ack) = self.handler.pop_ping_ack() {
            if let Err(e) = self.check_ack(ack) {
                self.handler.stats().record_error();
                tracing::error!("Bad ping acknowledgement: {}", e);
            }
        }
    }

    fn acknowledge(&self, mut request: Envelope) -> Result<(), ProtocolError> {
        request.unpack_with(self.identity)?;
        let source = request
            .source()
            .ok_or_else(|| MessageError::Malformed("ping request without source".into()))?
            .to_string();
        let request_ts = request
            .timestamp()
            .ok_or_else(|| MessageError::Malformed("ping request without timestamp".into()))?;
        tracing::debug!("Ping request from '{}' at {}", source, request_ts);

        let mut ack = Envelope::outbound(self.handler.ping_message(Some(request_ts)));
        ack.pack_with(
            self.identity,
            Security::Public,
            self.handler.protocol(),
            QoS::ExactlyOnce,
            None,
        )?;
        self.handler
            .publish(&self.handler.ping_ack_dest(&source), QoS::ExactlyOnce, ack.into_fields())?;

        HandlerStats::bump(&self.handler.stats().acks_sent);
        self.last_ping.store(epoch_secs(), Ordering::Relaxed);
        Ok(())
    }

    fn check_ack(&self, mut ack: Envelope) -> Result<(), MessageError> {
        ack.unpack_with(self.identity)?;
        let sent = ack
            .get_u64(field::PING_REQUEST_TS)
            .ok_or_else(|| MessageError::Malformed("ping ack without pingRequestTS".into()))?;
        let answered = ack
            .timestamp()
            .ok_or_else(|| MessageError::Malformed("ping ack without timestamp".into()))?;

        let latency = answered.saturating_sub(sent);
        if latency > self.timeout_secs {
            tracing::warn!(
                "Ping from '{}' answered after {}s, timeout is {}s",
                ack.source().unwrap_or("?"),
                latency,
                self.timeout_secs
            );
        } else {
            tracing::trace!("Ping answered after {}s", latency);
        }
        self.last_ping_ack.store(epoch_secs(), Ordering::Relaxed);
        Ok(())
    }
}
