// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Public-key handshake worker.
//!
//! Until certificates are in place, peers exchange keys by publishing a
//! signed "connected" status on each other's handshake topic. The wire
//! callback only enqueues handshake messages; this worker unpacks them and
//! either captures the destination key or answers with our own status.
//!
//! | Sender is the destination | Destination key | Action                      |
//! |---------------------------|-----------------|-----------------------------|
//! | yes                       | unset           | store key, announce back    |
//! | yes                       | set             | ignore                      |
//! | no                        | any             | reply with our status       |

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{bounded, select, Sender};

use super::topics::Status;
use super::MqttCore;
use crate::envelope::Envelope;
use crate::error::{MessageError, ProtocolError};
use crate::stats::HandlerStats;

/// Background thread draining the handshake queue.
pub(crate) struct HandshakeWorker {
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl HandshakeWorker {
    pub(crate) fn spawn(core: Arc<MqttCore>) -> Result<Self, ProtocolError> {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let inbox = core.queues.handshake_receiver();
        let name = format!("mf2c-handshake-{}", core.scheme.me());

        let thread = std::thread::Builder::new()
            .name(name)
            .spawn(move || loop {
                select! {
                    recv(inbox) -> msg => match msg {
                        Ok(env) => {
                            if let Err(e) = process(&core, env) {
                                core.stats.record_error();
                                tracing::error!("Handshake error: {}. Bypassing this one.", e);
                            }
                        }
                        Err(_) => break,
                    },
                    recv(stop_rx) -> _ => break,
                }
            })
            .map_err(|e| ProtocolError::Connect(format!("failed to spawn handshake thread: {}", e)))?;

        Ok(Self {
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }

    /// Signal the thread and wait for it.
    pub(crate) fn stop(&mut self) {
        drop(self.stop_tx.take());
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for HandshakeWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn process(core: &MqttCore, mut env: Envelope) -> Result<(), ProtocolError> {
    HandlerStats::bump(&core.stats.received_handshake);
    env.unpack_with(core.identity)?;

    if env.payload() != Some(Status::Connected.payload().as_str()) {
        tracing::debug!("Ignoring handshake message that is not a connect status");
        return Ok(());
    }
    let source = env
        .source()
        .ok_or_else(|| MessageError::Malformed("handshake without source".into()))?
        .to_string();
    if source == core.scheme.me() {
        return Ok(());
    }

    if core.scheme.destination() == Some(source.as_str()) {
        if core.dest_key.load().is_some() {
            return Ok(());
        }
        let key = env
            .dest_key()
            .cloned()
            .ok_or_else(|| MessageError::Malformed("connect status carries no public key".into()))?;
        core.dest_key.store(Some(Arc::new(key)));
        tracing::info!("Received public key of destination '{}'", source);
        // The peer may have announced before our subscription existed.
        return core.send_pk(&source);
    }

    tracing::debug!("'{}' requested our public key", source);
    core.send_pk(&source)
}
