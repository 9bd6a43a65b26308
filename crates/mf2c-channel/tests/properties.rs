// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Channel-level guarantees: ordering, shutdown, last will, reconnect
// buffering, handshake timeout.

use std::time::{Duration, Instant};

use mf2c_channel::{
    Channel, ChannelConfig, ChannelError, Envelope, Flag, HandlerConfig, MemoryBroker,
    MqttHandler, Privacy, ProtocolError, QoS, Security, TransportHandler,
};

fn config(name: &str, destination: Option<&str>, broker: &str) -> ChannelConfig {
    ChannelConfig::new(name, destination.map(str::to_string))
        .broker(format!("memory://{}", broker))
        .timeout_secs(5)
        .ping_interval_secs(1)
}

fn pair(broker: &str) -> (Channel, Channel) {
    let b = Channel::with_config(config("B", None, broker)).expect("open B");
    let a = Channel::with_config(config("A", Some("B"), broker)).expect("open A");
    (a, b)
}

fn public() -> [Flag; 3] {
    [Security::Public.into(), QoS::AtLeastOnce.into(), Privacy::NotPii.into()]
}

fn drain(channel: &Channel, want: usize, within: Duration) -> Vec<String> {
    let deadline = Instant::now() + within;
    let mut got = Vec::new();
    while got.len() < want && Instant::now() < deadline {
        match channel.pop() {
            Some(msg) => got.push(msg.payload().unwrap_or_default().to_string()),
            None => std::thread::sleep(Duration::from_millis(20)),
        }
    }
    got
}

#[test]
fn messages_arrive_in_send_order() {
    let (a, b) = pair("prop-order");

    for n in 0..25 {
        a.send(Envelope::with_payload(n.to_string()), &public())
            .expect("send");
    }

    let expected: Vec<String> = (0..25).map(|n| n.to_string()).collect();
    assert_eq!(drain(&b, 25, Duration::from_secs(5)), expected);
    assert!(!b.poll());
}

#[test]
fn nothing_is_enqueued_after_destruct() {
    let (a, b) = pair("prop-shutdown");

    a.send(Envelope::with_payload("before"), &public()).expect("send");
    b.destruct();
    assert!(!b.poll());
    assert!(b.pop().is_none());

    a.send(Envelope::with_payload("after"), &public()).expect("send");
    std::thread::sleep(Duration::from_millis(200));
    assert!(!b.poll());
    assert!(b.pop().is_none());
}

#[test]
fn ungraceful_drop_leaves_retained_will() {
    let broker = MemoryBroker::named("prop-will");
    let mut handler = MqttHandler::new();
    handler
        .setup(HandlerConfig {
            friendly_name: "W".into(),
            broker: "memory://prop-will".into(),
            destination: None,
            keep_alive_secs: 60,
            timeout_secs: 5,
        })
        .expect("setup");
    assert!(broker.retained("mf2c/W/status").is_none());

    broker.kill("W");

    let raw = broker.retained("mf2c/W/status").expect("retained will");
    let mut will = Envelope::from_wire(&raw);
    will.unpack().expect("will is signed");
    assert_eq!(will.payload(), Some("status : DU"));
    assert_eq!(will.security(), Some(Security::Protected));
    assert_eq!(will.source(), Some("W"));
}

#[test]
fn graceful_destruct_leaves_no_will() {
    let broker = MemoryBroker::named("prop-graceful");
    let channel = Channel::with_config(config("G", None, "prop-graceful")).expect("open");
    channel.destruct();
    assert!(broker.retained("mf2c/G/status").is_none());
    assert!(!broker.is_connected("G"));
}

#[test]
fn sends_during_outage_are_delivered_after_reconnect() {
    let broker = MemoryBroker::named("prop-outage");
    let (a, b) = pair("prop-outage");

    assert!(broker.interrupt("A"));
    for n in 0..3 {
        a.send(Envelope::with_payload(format!("queued-{}", n)), &public())
            .expect("buffered send");
    }
    assert!(a.stats().buffered >= 3);
    assert!(!b.poll());

    assert!(broker.restore("A"));
    assert_eq!(
        drain(&b, 3, Duration::from_secs(5)),
        vec!["queued-0", "queued-1", "queued-2"]
    );
}

#[test]
fn flush_discards_outage_buffer() {
    let broker = MemoryBroker::named("prop-flush");
    let (a, b) = pair("prop-flush");

    broker.interrupt("A");
    a.send(Envelope::with_payload("dropped"), &public()).expect("buffered");
    a.flush();
    broker.restore("A");

    std::thread::sleep(Duration::from_millis(300));
    assert!(!b.poll());
}

#[test]
fn handshake_times_out_without_peer() {
    let start = Instant::now();
    let err = Channel::with_config(config("A", Some("ghost"), "prop-timeout").timeout_secs(1))
        .expect_err("no peer");
    assert!(matches!(
        err,
        ChannelError::Protocol(ProtocolError::HandshakeTimeout(1))
    ));
    assert!(start.elapsed() >= Duration::from_secs(1));
}

#[test]
fn private_send_without_key_is_rejected_for_listen_only() {
    let channel = Channel::with_config(config("L", None, "prop-nokey")).expect("open");
    let err = channel
        .send(
            Envelope::with_payload("secret"),
            &[Security::Private.into(), QoS::AtLeastOnce.into(), Privacy::Gdpr.into()],
        )
        .expect_err("no destination key");
    assert!(matches!(
        err,
        ChannelError::Message(mf2c_channel::MessageError::NoRecipientKey)
    ));
}

#[test]
fn bad_inbound_messages_are_skipped() {
    let (a, b) = pair("prop-garbage");

    // A bare handler publishing junk on B's public topic.
    let mut junk = MqttHandler::new();
    junk.setup(HandlerConfig {
        friendly_name: "J".into(),
        broker: "memory://prop-garbage".into(),
        destination: None,
        keep_alive_secs: 60,
        timeout_secs: 5,
    })
    .expect("setup");
    let mut fields = mf2c_channel::Fields::new();
    fields.insert("security".into(), serde_json::Value::from(9));
    junk.publish("mf2c/B/public", QoS::AtLeastOnce, fields)
        .expect("publish junk");

    a.send(Envelope::with_payload("good"), &public()).expect("send");

    assert!(b.poll());
    assert!(b.pop().is_none());
    assert_eq!(drain(&b, 1, Duration::from_secs(5)), vec!["good"]);
    assert_eq!(b.stats().errors, 1);
}
