//! Shared end-to-end harness: a scripted device on the far end of an
//! in-process duplex stream, speaking the real handshake and wire
//! protocol against a live session.

#![allow(dead_code)]

use std::sync::Arc;

use corelink::coap::{self, Code, Message, MsgType};
use corelink::config::CoreConfig;
use corelink::crypto::{CryptoManager, DeviceId, InMemoryKeyRepository, KeyPair};
use corelink::events::{
    DeviceAttributeRepository, EventPublisher, InMemoryDeviceAttributes, InMemoryEventPublisher,
    NoRouting,
};
use corelink::handshake;
use corelink::pipe::{CipherReader, CipherWriter};
use corelink::session::{DeviceSession, SessionDeps};

pub const DEVICE_ID_BYTES: [u8; 12] = [0xA1; 12];

/// A connected session plus the device playing the other side.
pub struct Harness {
    pub session: Arc<DeviceSession>,
    pub device: DeviceSim,
    pub publisher: Arc<InMemoryEventPublisher>,
    pub attributes: Arc<InMemoryDeviceAttributes>,
    /// The broker Hello read right after session start
    pub broker_hello: Message,
}

/// The device side of the wire.
pub struct DeviceSim {
    reader: CipherReader,
    writer: CipherWriter,
    last_id: u16,
}

impl DeviceSim {
    /// Next sequential message id for a device-originated message.
    pub fn next_id(&mut self) -> u16 {
        self.last_id = self.last_id.wrapping_add(1);
        self.last_id
    }

    pub async fn send(&mut self, message: &Message) {
        let bytes = coap::encode(message).expect("encode");
        self.writer.write_frame(&bytes).await.expect("write frame");
    }

    pub async fn read(&mut self) -> Message {
        let frame = self
            .reader
            .read_frame()
            .await
            .expect("read frame")
            .expect("broker closed the stream");
        coap::parse(&frame).expect("parse frame")
    }

    /// Try to read a frame, returning `None` if nothing arrives in time.
    pub async fn try_read(&mut self, wait: std::time::Duration) -> Option<Message> {
        match tokio::time::timeout(wait, self.reader.read_frame()).await {
            Ok(Ok(Some(frame))) => Some(coap::parse(&frame).expect("parse frame")),
            _ => None,
        }
    }

    /// Piggybacked response: ACK with content, echoing id and token.
    pub async fn respond(&mut self, request: &Message, payload: &[u8]) {
        let mut reply = Message::new(MsgType::Acknowledgement, Code::Content, request.message_id);
        reply.token = request.token.clone();
        reply.payload = payload.to_vec();
        self.send(&reply).await;
    }

    /// Publish an event the way devices do: confirmable POST on
    /// `e/<name>` (public) or `E/<name>` (private).
    pub async fn publish(&mut self, name: &str, payload: &[u8], public: bool) -> u16 {
        let id = self.next_id();
        let mut message = Message::new(MsgType::Confirmable, Code::Post, id);
        message.uri_path = format!("{}/{name}", if public { "e" } else { "E" });
        message.payload = payload.to_vec();
        self.send(&message).await;
        id
    }

    /// Empty confirmable: the keepalive ping.
    pub async fn ping(&mut self) -> u16 {
        let id = self.next_id();
        self.send(&Message::new(MsgType::Confirmable, Code::Empty, id))
            .await;
        id
    }
}

/// Hello payload for product 6, firmware 3, platform 10.
pub fn hello_payload() -> Vec<u8> {
    vec![0x00, 0x06, 0x00, 0x03, 0x00, 0x0A]
}

/// Run the full handshake and session start over an in-process stream.
pub async fn connect(config: CoreConfig, hello_id: u16, hello_payload: &[u8]) -> Harness {
    let repository = Arc::new(InMemoryKeyRepository::new());
    let crypto = Arc::new(CryptoManager::new(KeyPair::generate(), repository));
    let device_id = DeviceId::from_bytes(DEVICE_ID_BYTES);
    let device_keys = KeyPair::generate();
    crypto.claim_device_key(&device_id, device_keys.public().clone());

    let (broker_io, device_io) = tokio::io::duplex(256 * 1024);
    let (broker_read, broker_write) = tokio::io::split(broker_io);
    let (device_read, device_write) = tokio::io::split(device_io);

    let server_public = crypto.server_public().clone();
    let broker_crypto = Arc::clone(&crypto);
    let accepting = tokio::spawn(async move {
        handshake::accept(&broker_crypto, Box::new(broker_read), Box::new(broker_write)).await
    });

    let device_side = handshake::initiate(
        &device_id,
        &device_keys,
        &server_public,
        Box::new(device_read),
        Box::new(device_write),
    )
    .await
    .expect("device handshake");

    let mut device = DeviceSim {
        reader: device_side.cipher_in,
        writer: device_side.cipher_out,
        last_id: hello_id,
    };

    // The Hello completes the handshake window
    let mut hello = Message::new(MsgType::Confirmable, Code::Post, hello_id);
    hello.uri_path = "h".to_string();
    hello.payload = hello_payload.to_vec();
    device.send(&hello).await;

    let outcome = accepting
        .await
        .expect("accept task")
        .expect("broker handshake");

    let publisher = Arc::new(InMemoryEventPublisher::new());
    let attributes = Arc::new(InMemoryDeviceAttributes::new());
    let deps = SessionDeps {
        config,
        crypto,
        publisher: Arc::clone(&publisher) as Arc<dyn EventPublisher>,
        routing: Arc::new(NoRouting),
        attributes: Arc::clone(&attributes) as Arc<dyn DeviceAttributeRepository>,
    };

    let session = DeviceSession::start(outcome, deps).await.expect("session start");

    let broker_hello = device.read().await;
    assert_eq!(broker_hello.uri_path, "h");

    Harness {
        session,
        device,
        publisher,
        attributes,
        broker_hello,
    }
}

/// Default-config harness with the standard Hello.
pub async fn connect_default() -> Harness {
    connect(CoreConfig::default(), 100, &hello_payload()).await
}

/// Config tuned so timeout paths run quickly.
pub fn fast_config() -> CoreConfig {
    let mut config = CoreConfig::default();
    config.protocol.listener_timeout_secs = 1;
    config.protocol.token_ttl_secs = 1;
    config.flash.chunk_ack_timeout_secs = 1;
    config
}

/// Device id as the attribute-store key.
pub fn device_id_hex() -> String {
    DeviceId::from_bytes(DEVICE_ID_BYTES).to_string()
}
