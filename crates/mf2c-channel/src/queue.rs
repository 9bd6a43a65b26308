// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Queues owned by a transport handler.
//!
//! ```text
//! wire callback --+--> app        (SegQueue)  --> Channel::pop
//!                 +--> ping_req   (SegQueue)  --> Listener
//!                 +--> ping_ack   (SegQueue)  --> Listener
//!                 +--> handshake  (channel)   --> handshake thread
//!
//! publish while disconnected --> out_buf (bounded, drop-oldest) --> drain on connect
//! ```
//!
//! Inbound queues are lock-free MPMC FIFOs. Offers hold the read side of a
//! gate lock; [`HandlerQueues::close`] takes the write side, so once it has
//! run every offer is discarded and nothing new becomes visible.

use std::collections::VecDeque;

use crossbeam::channel::{unbounded, Receiver, Sender};
use crossbeam::queue::SegQueue;
use parking_lot::{Mutex, RwLock};

use crate::envelope::Envelope;
use crate::flags::QoS;

/// Outbound buffer capacity while disconnected.
pub const OUT_BUF_CAPACITY: usize = 100;

/// A fully encoded message waiting to be published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub qos: QoS,
    pub retain: bool,
    pub payload: String,
}

/// Bounded FIFO that drops the oldest entry on overflow.
#[derive(Debug)]
pub struct OutBuffer {
    inner: Mutex<VecDeque<OutboundMessage>>,
    capacity: usize,
}

impl OutBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Append a message. Returns the evicted oldest message on overflow.
    pub fn push(&self, msg: OutboundMessage) -> Option<OutboundMessage> {
        let mut inner = self.inner.lock();
        let evicted = if inner.len() >= self.capacity {
            inner.pop_front()
        } else {
            None
        };
        inner.push_back(msg);
        evicted
    }

    /// Take every buffered message, oldest first.
    pub fn drain(&self) -> Vec<OutboundMessage> {
        self.inner.lock().drain(..).collect()
    }

    /// Discard everything. Returns how many messages were dropped.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let n = inner.len();
        inner.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// The inbound queues plus the outbound buffer of one handler.
#[derive(Debug)]
pub struct HandlerQueues {
    app: SegQueue<Envelope>,
    ping_req: SegQueue<Envelope>,
    ping_ack: SegQueue<Envelope>,
    handshake_tx: Sender<Envelope>,
    handshake_rx: Receiver<Envelope>,
    out_buf: OutBuffer,
    closed: RwLock<bool>,
}

impl Default for HandlerQueues {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerQueues {
    pub fn new() -> Self {
        let (handshake_tx, handshake_rx) = unbounded();
        Self {
            app: SegQueue::new(),
            ping_req: SegQueue::new(),
            ping_ack: SegQueue::new(),
            handshake_tx,
            handshake_rx,
            out_buf: OutBuffer::new(OUT_BUF_CAPACITY),
            closed: RwLock::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.read()
    }

    fn offer(&self, queue: &SegQueue<Envelope>, env: Envelope) -> bool {
        let closed = self.closed.read();
        if *closed {
            return false;
        }
        queue.push(env);
        true
    }

    pub fn offer_app(&self, env: Envelope) -> bool {
        self.offer(&self.app, env)
    }

    pub fn offer_ping_request(&self, env: Envelope) -> bool {
        self.offer(&self.ping_req, env)
    }

    pub fn offer_ping_ack(&self, env: Envelope) -> bool {
        self.offer(&self.ping_ack, env)
    }

    pub fn offer_handshake(&self, env: Envelope) -> bool {
        let closed = self.closed.read();
        !*closed && self.handshake_tx.send(env).is_ok()
    }

    pub fn has_app(&self) -> bool {
        !self.app.is_empty()
    }

    pub fn pop_app(&self) -> Option<Envelope> {
        self.app.pop()
    }

    pub fn pop_ping_request(&self) -> Option<Envelope> {
        self.ping_req.pop()
    }

    pub fn pop_ping_ack(&self) -> Option<Envelope> {
        self.ping_ack.pop()
    }

    /// Receiver side of the handshake queue, for the handshake thread.
    pub fn handshake_receiver(&self) -> Receiver<Envelope> {
        self.handshake_rx.clone()
    }

    pub fn out_buf(&self) -> &OutBuffer {
        &self.out_buf
    }

    /// Stop accepting messages and drop everything queued.
    pub fn close(&self) {
        *self.closed.write() = true;
        while self.app.pop().is_some() {}
        while self.ping_req.pop().is_some() {}
        while self.ping_ack.pop().is_some() {}
        while self.handshake_rx.try_recv().is_ok() {}
        self.out_buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(n: usize) -> OutboundMessage {
        OutboundMessage {
            topic: "mf2c/A/public".into(),
            qos: QoS::AtLeastOnce,
            retain: false,
            payload: n.to_string(),
        }
    }

    #[test]
    fn test_out_buffer_drops_oldest() {
        let buf = OutBuffer::new(3);
        for n in 0..3 {
            assert!(buf.push(msg(n)).is_none());
        }
        assert_eq!(buf.push(msg(3)), Some(msg(0)));
        let drained: Vec<_> = buf.drain().into_iter().map(|m| m.payload).collect();
        assert_eq!(drained, vec!["1", "2", "3"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_out_buffer_clear() {
        let buf = OutBuffer::new(OUT_BUF_CAPACITY);
        for n in 0..150 {
            buf.push(msg(n));
        }
        assert_eq!(buf.len(), OUT_BUF_CAPACITY);
        assert_eq!(buf.clear(), OUT_BUF_CAPACITY);
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn test_fifo_per_queue() {
        let queues = HandlerQueues::new();
        for n in 0..5 {
            queues.offer_app(Envelope::inbound(format!("app{}", n)));
            queues.offer_ping_request(Envelope::inbound(format!("req{}", n)));
        }
        for n in 0..5 {
            assert_eq!(
                queues.pop_app().and_then(|e| e.raw().map(str::to_string)),
                Some(format!("app{}", n))
            );
        }
        assert!(queues.pop_app().is_none());
        assert_eq!(
            queues.pop_ping_request().and_then(|e| e.raw().map(str::to_string)),
            Some("req0".to_string())
        );
    }

    #[test]
    fn test_close_discards_and_blocks() {
        let queues = HandlerQueues::new();
        queues.offer_app(Envelope::inbound("x"));
        queues.offer_handshake(Envelope::inbound("h"));
        queues.out_buf().push(msg(1));
        queues.close();

        assert!(!queues.has_app());
        assert!(queues.out_buf().is_empty());
        assert!(queues.handshake_receiver().try_recv().is_err());
        assert!(!queues.offer_app(Envelope::inbound("late")));
        assert!(!queues.offer_ping_ack(Envelope::inbound("late")));
        assert!(!queues.offer_handshake(Envelope::inbound("late")));
        assert!(!queues.has_app());
    }
}
