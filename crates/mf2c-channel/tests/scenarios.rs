// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// End-to-end channel scenarios over the in-process broker.
// Each test uses its own memory:// broker so tests can run in parallel.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver};
use mf2c_channel::envelope::{field, Fields};
use mf2c_channel::transport::mqtt::session::{EventSink, WireEvent};
use mf2c_channel::{
    Channel, ChannelConfig, Envelope, HandlerConfig, Identity, MemoryBroker, MessageError,
    MqttHandler, Privacy, QoS, Security, TransportHandler,
};
use serde_json::Value;

fn config(name: &str, destination: Option<&str>, broker: &str) -> ChannelConfig {
    ChannelConfig::new(name, destination.map(str::to_string))
        .broker(format!("memory://{}", broker))
        .timeout_secs(5)
        .ping_interval_secs(1)
}

/// Listen-only B first, then A pointing at B.
fn pair(broker: &str) -> (Channel, Channel) {
    let b = Channel::with_config(config("B", None, broker)).expect("open B");
    let a = Channel::with_config(config("A", Some("B"), broker)).expect("open A");
    (a, b)
}

fn wait_pop(channel: &Channel, within: Duration) -> Option<Envelope> {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if channel.poll() {
            return channel.pop();
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    None
}

fn tap(broker: &str, client_id: &str, topic: &str) -> Receiver<WireEvent> {
    let (tx, rx) = unbounded();
    let sink: EventSink = Arc::new(move |e| {
        let _ = tx.send(e);
    });
    MemoryBroker::named(broker).observe(client_id, &[topic.to_string()], sink);
    rx
}

fn next_payload(rx: &Receiver<WireEvent>, within: Duration) -> Option<Vec<u8>> {
    let deadline = Instant::now() + within;
    loop {
        let left = deadline.checked_duration_since(Instant::now())?;
        match rx.recv_timeout(left).ok()? {
            WireEvent::Message { payload, .. } => return Some(payload),
            _ => continue,
        }
    }
}

#[test]
fn s1_public_message_reaches_peer() {
    let (a, b) = pair("s1");

    a.send(
        Envelope::with_payload("hi"),
        &[Security::Public.into(), QoS::AtMostOnce.into(), Privacy::NotPii.into()],
    )
    .expect("send");

    let msg = wait_pop(&b, Duration::from_secs(5)).expect("B receives");
    assert_eq!(msg.payload(), Some("hi"));
    assert_eq!(msg.security(), Some(Security::Public));
    assert_eq!(msg.get_u64(field::SECURITY), Some(0));
    assert_eq!(msg.source(), Some("A"));
    assert!(msg.timestamp().is_some());
    assert!(msg.received_tmsp().is_some());
    assert!(msg.get_str(field::SIGNATURE).is_none());
}

#[test]
fn s2_protected_message_is_verified_and_tampering_detected() {
    let taps = tap("s2", "s2-tap", "mf2c/B/protected");
    let (a, b) = pair("s2");

    a.send(
        Envelope::with_payload("hello"),
        &[Security::Protected.into(), QoS::AtLeastOnce.into(), Privacy::NotPii.into()],
    )
    .expect("send");

    let msg = wait_pop(&b, Duration::from_secs(5)).expect("B receives");
    assert_eq!(msg.payload(), Some("hello"));
    assert_eq!(msg.security(), Some(Security::Protected));
    assert!(msg.get_str(field::SIGNATURE).is_some());
    assert!(msg
        .get_str(field::PUBLIC_KEY)
        .is_some_and(|k| k.starts_with("-----BEGIN PUBLIC KEY-----")));

    // Same bytes as B saw, with the signature flipped.
    let raw = next_payload(&taps, Duration::from_secs(5)).expect("tapped");
    let mut fields = mf2c_channel::envelope::decode_fields(&raw).expect("decode");
    let sig = fields
        .get(field::SIGNATURE)
        .and_then(Value::as_str)
        .expect("signature")
        .to_string();
    let flipped: String = sig
        .chars()
        .enumerate()
        .map(|(i, c)| if i == 4 { if c == 'A' { 'B' } else { 'A' } } else { c })
        .collect();
    fields.insert(field::SIGNATURE.into(), Value::String(flipped));
    let tampered = mf2c_channel::envelope::encode_fields(&fields).expect("encode");

    let mut env = Envelope::inbound(tampered);
    assert!(matches!(env.unpack(), Err(MessageError::BadSignature)));
}

#[test]
fn s3_private_message_is_decrypted() {
    let (a, b) = pair("s3");
    assert!(a.dest_key().is_some());

    a.send(
        Envelope::with_payload("secret"),
        &[Security::Private.into(), QoS::ExactlyOnce.into(), Privacy::Gdpr.into()],
    )
    .expect("send");

    let msg = wait_pop(&b, Duration::from_secs(5)).expect("B receives");
    assert_eq!(msg.security(), Some(Security::Private));
    assert_eq!(msg.decrypted_payload(), Some("secret"));
    let ciphertext = msg.payload().expect("ciphertext");
    assert_ne!(ciphertext, "secret");
    assert!(!ciphertext.is_empty());
}

#[test]
fn s4_handshake_captures_destination_key() {
    let b = Channel::with_config(config("B", None, "s4")).expect("open B");
    let start = Instant::now();
    let a = Channel::with_config(config("A", Some("B"), "s4")).expect("open A");
    assert!(start.elapsed() < Duration::from_secs(5));

    let identity = Identity::get_instance().expect("identity");
    let key = a.dest_key().expect("A holds B's key");
    assert_eq!(key.as_ref(), identity.public_key());
    assert!(b.dest_key().is_none());
    assert!(a.stats().received_handshake >= 1);
}

#[test]
fn s5_listen_only_channel_answers_pings_but_never_pings() {
    let acks = tap("s5", "s5-tap", "mf2c/B/public/pingack");
    let a = Channel::with_config(config("A", None, "s5")).expect("open A");

    // B is a bare handler so nothing pings on its behalf.
    let mut b = MqttHandler::new();
    b.setup(HandlerConfig {
        friendly_name: "B".into(),
        broker: "memory://s5".into(),
        destination: None,
        keep_alive_secs: 60,
        timeout_secs: 5,
    })
    .expect("setup B");

    let mut request = Envelope::outbound(b.ping_message(None));
    request
        .pack(Security::Public, b.protocol(), QoS::ExactlyOnce, None)
        .expect("pack");
    b.publish("mf2c/A/public/pingreq", QoS::ExactlyOnce, request.into_fields())
        .expect("ping A");

    let raw = next_payload(&acks, Duration::from_secs(3)).expect("A acknowledges");
    let mut ack = Envelope::from_wire(&raw);
    ack.unpack().expect("unpack ack");
    assert_eq!(ack.source(), Some("A"));
    assert!(ack.get_u64(field::PING_REQUEST_TS).is_some());
    assert_eq!(ack.qos(), Some(QoS::ExactlyOnce));

    // One request, one answer, even after a few more listener passes.
    std::thread::sleep(Duration::from_millis(2500));
    assert!(next_payload(&acks, Duration::from_millis(100)).is_none());

    let stats = a.stats();
    assert_eq!(stats.pings_sent, 0);
    assert_eq!(stats.acks_sent, 1);
    b.disconnect().expect("disconnect B");
}

#[test]
fn s6_destruct_twice() {
    let (a, b) = pair("s6");
    a.destruct();
    a.destruct();
    b.destruct();
    b.destruct();
    assert!(a.is_shut_down());
    assert!(matches!(
        a.send(
            Envelope::with_payload("late"),
            &[Security::Public.into(), QoS::AtMostOnce.into(), Privacy::NotPii.into()],
        ),
        Err(mf2c_channel::ChannelError::Shutdown)
    ));
}

#[test]
fn pings_flow_between_paired_channels() {
    let (a, b) = pair("ping-pair");

    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline && a.stats().received_ping_ack == 0 {
        std::thread::sleep(Duration::from_millis(50));
    }
    assert!(a.stats().pings_sent >= 1);
    assert!(a.stats().received_ping_ack >= 1);
    assert!(b.stats().acks_sent >= 1);
    assert_eq!(b.stats().pings_sent, 0);
}

#[test]
fn send_requires_flags_and_payload() {
    let (a, _b) = pair("send-checks");

    assert!(matches!(
        a.send(Envelope::with_payload("x"), &[Security::Public.into(), QoS::AtMostOnce.into()]),
        Err(mf2c_channel::ChannelError::MissingFlag("Privacy"))
    ));
    assert!(matches!(
        a.send(
            Envelope::outbound(Fields::new()),
            &[Security::Public.into(), QoS::AtMostOnce.into(), Privacy::NotPii.into()],
        ),
        Err(mf2c_channel::ChannelError::EmptyPayload)
    ));
    assert!(matches!(
        a.send(
            Envelope::inbound("e30="),
            &[Security::Public.into(), QoS::AtMostOnce.into(), Privacy::NotPii.into()],
        ),
        Err(mf2c_channel::ChannelError::InvalidArgument(_))
    ));
}

#[test]
fn private_send_rejects_non_string_payload() {
    let wire = tap("non-string", "non-string-tap", "mf2c/B/private");
    let (a, b) = pair("non-string");

    let mut fields = Fields::new();
    fields.insert(field::PAYLOAD.into(), serde_json::json!({ "ssn": "123-45-6789" }));
    let err = a
        .send(
            Envelope::outbound(fields),
            &[Security::Private.into(), QoS::AtLeastOnce.into(), Privacy::Gdpr.into()],
        )
        .expect_err("object payload");
    assert!(matches!(err, mf2c_channel::ChannelError::InvalidArgument(_)));

    assert!(next_payload(&wire, Duration::from_millis(300)).is_none());
    assert!(wait_pop(&b, Duration::from_millis(100)).is_none());
}

#[test]
fn send_stamps_own_name_as_source() {
    let (a, b) = pair("source-stamp");

    let mut message = Envelope::with_payload("who");
    message
        .fields_mut()
        .insert(field::SOURCE.into(), Value::String("B".into()));
    a.send(
        message,
        &[Security::Protected.into(), QoS::AtLeastOnce.into(), Privacy::NotPii.into()],
    )
    .expect("send");

    let msg = wait_pop(&b, Duration::from_secs(5)).expect("B receives");
    assert_eq!(msg.source(), Some("A"));
}
