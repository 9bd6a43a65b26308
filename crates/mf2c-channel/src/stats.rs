// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Handler statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Counters shared between the caller, the wire thread and the background
/// tasks of one handler.
#[derive(Debug)]
pub struct HandlerStats {
    /// Messages handed to the wire.
    pub published: AtomicU64,

    /// Messages parked in the outbound buffer while disconnected.
    pub buffered: AtomicU64,

    /// Buffered messages discarded because the buffer was full.
    pub dropped_oldest: AtomicU64,

    /// Messages enqueued for the application.
    pub received_app: AtomicU64,

    /// Ping requests received.
    pub received_ping_req: AtomicU64,

    /// Ping acknowledgements received.
    pub received_ping_ack: AtomicU64,

    /// Handshake messages received.
    pub received_handshake: AtomicU64,

    /// Pings sent by the ping service.
    pub pings_sent: AtomicU64,

    /// Ping acknowledgements sent by the listener.
    pub acks_sent: AtomicU64,

    /// Errors encountered (publish failures, bad inbound messages).
    pub errors: AtomicU64,

    /// Handler creation time.
    pub created: Instant,
}

impl Default for HandlerStats {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerStats {
    /// Create new stats.
    pub fn new() -> Self {
        Self {
            published: AtomicU64::new(0),
            buffered: AtomicU64::new(0),
            dropped_oldest: AtomicU64::new(0),
            received_app: AtomicU64::new(0),
            received_ping_req: AtomicU64::new(0),
            received_ping_ack: AtomicU64::new(0),
            received_handshake: AtomicU64::new(0),
            pings_sent: AtomicU64::new(0),
            acks_sent: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            created: Instant::now(),
        }
    }

    /// Increment a counter.
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an error.
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get snapshot of current stats.
    pub fn snapshot(&self) -> HandlerStatsSnapshot {
        HandlerStatsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            buffered: self.buffered.load(Ordering::Relaxed),
            dropped_oldest: self.dropped_oldest.load(Ordering::Relaxed),
            received_app: self.received_app.load(Ordering::Relaxed),
            received_ping_req: self.received_ping_req.load(Ordering::Relaxed),
            received_ping_ack: self.received_ping_ack.load(Ordering::Relaxed),
            received_handshake: self.received_handshake.load(Ordering::Relaxed),
            pings_sent: self.pings_sent.load(Ordering::Relaxed),
            acks_sent: self.acks_sent.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            uptime_secs: self.created.elapsed().as_secs(),
        }
    }
}

/// Snapshot of handler statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandlerStatsSnapshot {
    pub published: u64,
    pub buffered: u64,
    pub dropped_oldest: u64,
    pub received_app: u64,
    pub received_ping_req: u64,
    pub received_ping_ack: u64,
    pub received_handshake: u64,
    pub pings_sent: u64,
    pub acks_sent: u64,
    pub errors: u64,
    pub uptime_secs: u64,
}

impl HandlerStatsSnapshot {
    /// Total inbound messages across all queues.
    pub fn received_total(&self) -> u64 {
        self.received_app + self.received_ping_req + self.received_ping_ack + self.received_handshake
    }

    /// Calculate published messages per second.
    pub fn messages_per_second(&self) -> f64 {
        if self.uptime_secs > 0 {
            self.published as f64 / self.uptime_secs as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_snapshot() {
        let stats = HandlerStats::new();
        HandlerStats::bump(&stats.published);
        HandlerStats::bump(&stats.published);
        HandlerStats::bump(&stats.received_app);
        HandlerStats::bump(&stats.received_ping_req);
        stats.record_error();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.published, 2);
        assert_eq!(snapshot.received_total(), 2);
        assert_eq!(snapshot.errors, 1);
        assert_eq!(snapshot.messages_per_second(), 0.0);
    }
}
