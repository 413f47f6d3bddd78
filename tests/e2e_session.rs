//! End-to-end session tests: handshake through counter discipline,
//! keepalive and teardown, against a scripted device.

mod support;

use std::time::Duration;

use corelink::coap::{Code, Message, MsgType};
use corelink::events::{CloudEvent, DeviceAttributeRepository, EventPublisher, SubscriptionFilter};
use corelink::session::SessionEvent;
use support::{connect_default, device_id_hex, hello_payload};

/// Wait for the first Disconnect on an event stream.
async fn disconnect_reason(
    events: &mut tokio::sync::broadcast::Receiver<SessionEvent>,
) -> String {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("no disconnect within 5s")
            .expect("event stream closed")
        {
            SessionEvent::Disconnect(reason) => return reason,
            _ => continue,
        }
    }
}

#[tokio::test]
async fn test_hello_exchange_stores_product_info() {
    let harness = connect_default().await;

    let product = harness.session.product_info().await.expect("product info");
    assert_eq!(product.product_id, 6);
    assert_eq!(product.firmware_version, 3);
    assert_eq!(product.platform_id, 10);

    // Ready persisted the attributes
    let mut attrs = None;
    for _ in 0..50 {
        attrs = harness.attributes.get(&device_id_hex());
        if attrs.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let attrs = attrs.expect("attributes persisted on Ready");
    assert_eq!(attrs.product_id, Some(6));
    assert_eq!(attrs.platform_id, Some(10));
}

#[tokio::test]
async fn test_hello_without_payload_has_no_product_info() {
    let harness = support::connect(corelink::config::CoreConfig::default(), 7, &[]).await;
    assert!(harness.session.product_info().await.is_none());
}

#[tokio::test]
async fn test_outbound_ids_are_sequential_from_the_seed() {
    let mut harness = connect_default().await;
    let hello_id = harness.broker_hello.message_id;

    // Kick off a describe; its id must be the Hello id + 1
    let session = harness.session.clone();
    let verb = tokio::spawn(async move { session.describe().await });

    let describe = harness.device.read().await;
    assert_eq!(describe.uri_path, "d");
    assert_eq!(describe.message_id, hello_id.wrapping_add(1));

    harness
        .device
        .respond(&describe, br#"{"f":[],"v":{}}"#)
        .await;
    verb.await.unwrap().expect("describe");
}

#[tokio::test]
async fn test_ping_is_acked_with_the_same_id() {
    let mut harness = connect_default().await;

    let ping_id = harness.device.ping().await;
    let ack = harness.device.read().await;

    assert_eq!(ack.kind, MsgType::Acknowledgement);
    assert!(ack.code.is_empty());
    assert_eq!(ack.message_id, ping_id);
}

#[tokio::test]
async fn test_counter_mismatch_disconnects_without_forwarding() {
    let mut harness = support::connect(corelink::config::CoreConfig::default(), 41, &hello_payload()).await;
    let mut events = harness.session.events();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    harness
        .publisher
        .subscribe("", tx, SubscriptionFilter::default(), "observer");

    // receiveCounter is 41; a confirmable non-empty message with id 43
    // skips a slot
    let mut message = Message::new(MsgType::Confirmable, Code::Post, 43);
    message.uri_path = "e/temperature".to_string();
    message.payload = b"21.5".to_vec();
    harness.device.send(&message).await;

    assert_eq!(disconnect_reason(&mut events).await, "Bad Counter");
    assert!(rx.try_recv().is_err(), "mismatched message must not fan out");
}

#[tokio::test]
async fn test_reset_frame_with_bad_id_reads_as_ignore() {
    let mut harness = connect_default().await;
    let mut events = harness.session.events();

    harness
        .device
        .send(&Message::new(MsgType::Reset, Code::Empty, 9_999))
        .await;

    assert_eq!(disconnect_reason(&mut events).await, "Got an Ignore");
}

#[tokio::test]
async fn test_peer_close_disconnects_once() {
    let harness = connect_default().await;
    let mut events = harness.session.events();

    drop(harness.device);

    assert_eq!(disconnect_reason(&mut events).await, "socket closed");

    // Further disconnects are no-ops
    harness.session.disconnect("again").await;
    assert!(matches!(
        tokio::time::timeout(Duration::from_millis(200), events.recv()).await,
        Err(_)
    ));
}

#[tokio::test]
async fn test_get_time_replies_with_epoch() {
    let mut harness = connect_default().await;

    let id = harness.device.next_id();
    let mut request = Message::new(MsgType::Confirmable, Code::Get, id);
    request.uri_path = "t".to_string();
    request.token = vec![0x09];
    harness.device.send(&request).await;

    let reply = harness.device.read().await;
    assert_eq!(reply.kind, MsgType::Acknowledgement);
    assert_eq!(reply.message_id, id);
    assert_eq!(reply.token, vec![0x09]);
    assert_eq!(reply.payload.len(), 4);

    let epoch = u32::from_be_bytes(reply.payload[..4].try_into().unwrap());
    assert!(epoch > 1_600_000_000);
}

#[tokio::test]
async fn test_device_event_fans_out_and_is_acked() {
    let mut harness = connect_default().await;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    harness
        .publisher
        .subscribe("temperature", tx, SubscriptionFilter::default(), "observer");

    let id = harness.device.publish("temperature", b"21.5", true).await;

    let ack = harness.device.read().await;
    assert_eq!(ack.kind, MsgType::Acknowledgement);
    assert_eq!(ack.message_id, id);

    let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("event within 2s")
        .expect("publisher closed");
    assert_eq!(event.name, "temperature");
    assert_eq!(event.data.as_deref(), Some(b"21.5".as_slice()));
    assert!(event.is_public);
    assert_eq!(event.device_id.as_deref(), Some(device_id_hex().as_str()));
}

#[tokio::test]
async fn test_system_events_stay_internal() {
    let mut harness = connect_default().await;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    harness
        .publisher
        .subscribe("", tx, SubscriptionFilter::default(), "observer");

    harness
        .device
        .publish("spark/device/ip", b"10.1.2.3", true)
        .await;
    let _ack = harness.device.read().await;

    // The attribute lands shortly after the ack
    let mut saved_ip = None;
    for _ in 0..100 {
        saved_ip = harness
            .attributes
            .get(&device_id_hex())
            .and_then(|attrs| attrs.ip);
        if saved_ip.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(saved_ip.as_deref(), Some("10.1.2.3"));
    assert!(rx.try_recv().is_err(), "system events never fan out");
}

#[tokio::test]
async fn test_device_capability_limits_are_recorded() {
    let mut harness = connect_default().await;

    harness
        .device
        .publish("spark/hardware/ota_chunk_size", b"128", true)
        .await;
    let _ack = harness.device.read().await;
    harness
        .device
        .publish("spark/hardware/max_binary", b"65536", true)
        .await;
    let _ack = harness.device.read().await;

    // The ack goes out before the limit handler runs; give it a beat
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Flash a binary over the reported max: refused up front
    let result = harness
        .session
        .flash(&vec![0u8; 100_000], Default::default())
        .await;
    let err = result.expect_err("binary over the device limit");
    assert!(err.to_string().starts_with("Update failed:"));
}

#[tokio::test]
async fn test_subscribe_bridges_published_events() {
    let mut harness = connect_default().await;

    let id = harness.device.next_id();
    let mut subscribe = Message::new(MsgType::Confirmable, Code::Get, id);
    subscribe.uri_path = "e/weather".to_string();
    subscribe.token = vec![0x21];
    harness.device.send(&subscribe).await;

    let ack = harness.device.read().await;
    assert_eq!(ack.kind, MsgType::Acknowledgement);
    assert_eq!(ack.message_id, id);

    // An event published into the cloud comes back out on the wire
    let mut event = CloudEvent::new("weather-update");
    event.data = Some(b"sunny".to_vec());
    event.ttl = 120;
    harness.publisher.publish(event);

    let frame = harness
        .device
        .try_read(Duration::from_secs(2))
        .await
        .expect("bridged event");
    assert_eq!(frame.uri_path, "e/weather-update");
    assert_eq!(frame.payload, b"sunny");
    assert_eq!(frame.max_age, Some(120));
}

#[tokio::test]
async fn test_subscribe_to_system_namespace_fails() {
    let mut harness = connect_default().await;

    let id = harness.device.next_id();
    let mut subscribe = Message::new(MsgType::Confirmable, Code::Get, id);
    subscribe.uri_path = "e/spark/status".to_string();
    harness.device.send(&subscribe).await;

    let reply = harness.device.read().await;
    assert_eq!(reply.kind, MsgType::Acknowledgement);
    assert_eq!(reply.code, Code::BadRequest);
}
