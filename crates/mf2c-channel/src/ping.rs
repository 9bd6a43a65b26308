// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Liveness pings.
//!
//! [`PingService`] runs on its own thread. Each cycle it publishes a ping
//! request to the peer (unless the channel is listen-only), makes sure a
//! [`Listener`] pass is running over the ping queues, then sleeps one
//! interval.
//!
//! ```text
//! Idle --start--> Pinging --> Sleeping --> Pinging ...
//!                     \            \
//!                      +------------+--set_keep_running(false)--> Stopping --> Stopped
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::envelope::Envelope;
use crate::error::{ChannelError, ProtocolError};
use crate::flags::{QoS, Security};
use crate::identity::Identity;
use crate::listener::Listener;
use crate::signal::StopSignal;
use crate::stats::HandlerStats;
use crate::transport::TransportHandler;

/// Ping service lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingState {
    Idle,
    Pinging,
    Sleeping,
    Stopping,
    Stopped,
}

/// Periodic ping emitter and listener scheduler.
pub struct PingService {
    handler: Arc<dyn TransportHandler>,
    identity: &'static Identity,
    listener: Arc<Listener>,
    interval: Duration,
    no_ping: bool,
    keep_running: AtomicBool,
    stop: StopSignal,
    last_ping_at: Mutex<Option<Instant>>,
    listener_thread: Mutex<Option<JoinHandle<()>>>,
    state: Mutex<PingState>,
}

impl PingService {
    /// `no_ping` suppresses ping requests; the listener still runs.
    pub fn new(
        handler: Arc<dyn TransportHandler>,
        identity: &'static Identity,
        listener: Arc<Listener>,
        interval: Duration,
        no_ping: bool,
    ) -> Self {
        Self {
            handler,
            identity,
            listener,
            interval,
            no_ping,
            keep_running: AtomicBool::new(true),
            stop: StopSignal::new(),
            last_ping_at: Mutex::new(None),
            listener_thread: Mutex::new(None),
            state: Mutex::new(PingState::Idle),
        }
    }

    pub fn state(&self) -> PingState {
        *self.state.lock()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn listener(&self) -> &Arc<Listener> {
        &self.listener
    }

    /// Stop (`false`) the loop at its next wake. Sleeps are interrupted.
    pub fn set_keep_running(&self, keep_running: bool) {
        self.keep_running.store(keep_running, Ordering::Release);
        if !keep_running {
            let mut state = self.state.lock();
            if *state != PingState::Stopped {
                *state = PingState::Stopping;
            }
            drop(state);
            self.stop.stop();
        }
    }

    pub fn keep_running(&self) -> bool {
        self.keep_running.load(Ordering::Acquire)
    }

    /// Spawn the service thread.
    pub fn start(self: &Arc<Self>) -> Result<JoinHandle<()>, ChannelError> {
        let service = Arc::clone(self);
        std::thread::Builder::new()
            .name("mf2c-ping".to_string())
            .spawn(move || service.run())
            .map_err(|e| ChannelError::Spawn("ping", e))
    }

    fn run(&self) {
        tracing::debug!(
            "Ping service started, interval {:?}, pings {}",
            self.interval,
            if self.no_ping { "disabled" } else { "enabled" }
        );
        while self.keep_running() {
            self.set_state(PingState::Pinging);
            if !self.no_ping {
                if self.stop.sleep(self.until_next_ping()) {
                    break;
                }
                self.ping();
            }
            self.schedule_listener();

            self.set_state(PingState::Sleeping);
            if self.stop.sleep(self.interval) {
                break;
            }
        }

        *self.state.lock() = PingState::Stopping;
        if let Some(handle) = self.listener_thread.lock().take() {
            let _ = handle.join();
        }
        *self.state.lock() = PingState::Stopped;
        tracing::debug!("Ping service stopped");
    }

    // A stop request wins over a concurrent state transition.
    fn set_state(&self, next: PingState) {
        let mut state = self.state.lock();
        if self.keep_running() {
            *state = next;
        }
    }

    fn until_next_ping(&self) -> Duration {
        match *self.last_ping_at.lock() {
            Some(at) => self.interval.saturating_sub(at.elapsed()),
            None => Duration::ZERO,
        }
    }

    /// Publish one ping request to the peer. Failures are logged.
    pub fn ping(&self) {
        let Some(destination) = self.handler.ping_request_dest() else {
            return;
        };
        match self.send_ping(&destination) {
            Ok(()) => {
                HandlerStats::bump(&self.handler.stats().pings_sent);
                tracing::trace!("Pinged {}", destination);
            }
            Err(e) => {
                self.handler.stats().record_error();
                tracing::error!("Failed to ping {}: {}", destination, e);
            }
        }
        *self.last_ping_at.lock() = Some(Instant::now());
    }

    fn send_ping(&self, destination: &str) -> Result<(), ProtocolError> {
        let mut request = Envelope::outbound(self.handler.ping_message(None));
        request.pack_with(
            self.identity,
            Security::Public,
            self.handler.protocol(),
            QoS::ExactlyOnce,
            None,
        )?;
        self.handler
            .publish(destination, QoS::ExactlyOnce, request.into_fields())
    }

    /// Start a listener pass unless the previous one is still running.
    fn schedule_listener(&self) {
        let mut slot = self.listener_thread.lock();
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            tracing::trace!("Listener still running, not relaunching");
            return;
        }
        if let Some(done) = slot.take() {
            let _ = done.join();
        }
        let listener = Arc::clone(&self.listener);
        match std::thread::Builder::new()
            .name("mf2c-listener".to_string())
            .spawn(move || listener.run())
        {
            Ok(handle) => *slot = Some(handle),
            Err(e) => tracing::error!("Failed to spawn listener thread: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ContractHandler;
    use crate::flags::Protocol;

    fn service(no_ping: bool, interval: Duration) -> Arc<PingService> {
        let identity = Identity::get_instance().expect("identity");
        let handler: Arc<dyn TransportHandler> = Arc::new(ContractHandler::new(Protocol::Http));
        let listener = Arc::new(Listener::new(Arc::clone(&handler), identity, 60));
        Arc::new(PingService::new(handler, identity, listener, interval, no_ping))
    }

    #[test]
    fn test_state_machine() {
        let ping = service(true, Duration::from_millis(50));
        assert_eq!(ping.state(), PingState::Idle);

        let handle = ping.start().expect("start");
        std::thread::sleep(Duration::from_millis(120));
        assert!(matches!(ping.state(), PingState::Pinging | PingState::Sleeping));

        ping.set_keep_running(false);
        handle.join().expect("join");
        assert_eq!(ping.state(), PingState::Stopped);
        assert!(!ping.keep_running());
    }

    #[test]
    fn test_stop_interrupts_long_sleep() {
        let ping = service(true, Duration::from_secs(3600));
        let handle = ping.start().expect("start");
        std::thread::sleep(Duration::from_millis(50));

        let start = Instant::now();
        ping.set_keep_running(false);
        handle.join().expect("join");
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_first_ping_is_immediate() {
        let ping = service(false, Duration::from_secs(30));
        assert_eq!(ping.until_next_ping(), Duration::ZERO);
        // No destination configured, so nothing is sent or timed.
        ping.ping();
        assert_eq!(ping.until_next_ping(), Duration::ZERO);

        *ping.last_ping_at.lock() = Some(Instant::now());
        let wait = ping.until_next_ping();
        assert!(wait > Duration::from_secs(29) && wait <= Duration::from_secs(30));
    }
}
