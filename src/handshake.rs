//! The handshake engine: mutual authentication and session key
//! agreement, run once per connection before the session exists.
//!
//! # Flow
//!
//! ```text
//! Device                                   Broker
//!    |                                        |
//!    |<------------ nonce (40) ---------------|
//!    |                                        |
//!    |-- id (12) | eph_pub (32) | tag (32) -->|  tag = HMAC(ss, nonce|id|eph)
//!    |                                        |  ss  = static-static X25519
//!    |<------- eph_pub (32) | tag (32) -------|  tag = HMAC(ss, nonce|eph)
//!    |                                        |
//!    |========= AES-128-CTR frames ==========>|  keys = HKDF(eph-eph, nonce)
//!    |   first frame: the device Hello        |
//! ```
//!
//! Both tags are keyed by the static-static agreement: only a device
//! holding the registered secret key (and a broker holding the server
//! secret) can produce them. Stream keys come from the ephemeral
//! agreement, so no long-term key compromise exposes past sessions.
//!
//! Any IO or verification error fails the handshake and the connection
//! goes straight to Disconnected with that error as the reason.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::crypto::{
    CryptoManager, DeviceId, KeyPair, PublicKey, DEVICE_ID_SIZE, NONCE_SIZE, TAG_SIZE,
};
use crate::error::{CoreError, Result};
use crate::pipe::{CipherReader, CipherWriter, IoReader, IoWriter};

/// What the broker-side handshake yields.
pub struct HandshakeOutcome {
    pub cipher_in: CipherReader,
    pub cipher_out: CipherWriter,
    pub device_id: DeviceId,
    /// The device's decrypted Hello, read during the handshake window
    pub initial_plaintext: Vec<u8>,
    /// Any further decrypted frames that arrived during the handshake
    /// window; the session must route these before reading `cipher_in`
    pub pending_frames: Vec<Vec<u8>>,
}

/// Run the broker side of the handshake on a fresh connection.
pub async fn accept(
    crypto: &CryptoManager,
    mut reader: IoReader,
    mut writer: IoWriter,
) -> Result<HandshakeOutcome> {
    let nonce: [u8; NONCE_SIZE] = crypto.random_bytes();
    writer
        .write_all(&nonce)
        .await
        .map_err(|e| CoreError::Handshake(format!("nonce write: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| CoreError::Handshake(format!("nonce write: {e}")))?;

    let mut response = [0u8; DEVICE_ID_SIZE + 32 + TAG_SIZE];
    reader
        .read_exact(&mut response)
        .await
        .map_err(|e| CoreError::Handshake(format!("device response: {e}")))?;

    let device_id = DeviceId::from_slice(&response[..DEVICE_ID_SIZE])?;
    let device_ephemeral = PublicKey::from_slice(&response[DEVICE_ID_SIZE..DEVICE_ID_SIZE + 32])?;
    let device_tag = &response[DEVICE_ID_SIZE + 32..];

    let auth_key = crypto
        .handshake_auth_key(&device_id)
        .map_err(|e| CoreError::Handshake(e.to_string()))?;

    let mut transcript = Vec::with_capacity(NONCE_SIZE + DEVICE_ID_SIZE + 32);
    transcript.extend_from_slice(&nonce);
    transcript.extend_from_slice(&response[..DEVICE_ID_SIZE + 32]);
    crypto
        .verify_tag(&auth_key, &transcript, device_tag)
        .map_err(|_| CoreError::Handshake(format!("device {device_id} failed verification")))?;

    let server_ephemeral = KeyPair::generate();
    let mut reply = Vec::with_capacity(32 + TAG_SIZE);
    reply.extend_from_slice(server_ephemeral.public().as_bytes());

    let mut reply_transcript = Vec::with_capacity(NONCE_SIZE + 32);
    reply_transcript.extend_from_slice(&nonce);
    reply_transcript.extend_from_slice(server_ephemeral.public().as_bytes());
    reply.extend_from_slice(&crypto.hmac_tag(&auth_key, &reply_transcript));

    writer
        .write_all(&reply)
        .await
        .map_err(|e| CoreError::Handshake(format!("key reply write: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| CoreError::Handshake(format!("key reply write: {e}")))?;

    let master = server_ephemeral.agree(&device_ephemeral);
    let keys = crypto.derive_stream_keys(&master, &nonce)?;

    let mut cipher_in = CipherReader::new(reader, &keys.inbound_key, &keys.inbound_iv);
    let cipher_out = CipherWriter::new(writer, &keys.outbound_key, &keys.outbound_iv);

    // The device speaks first: its Hello is part of the handshake window.
    let initial_plaintext = cipher_in
        .read_frame()
        .await?
        .ok_or_else(|| CoreError::Handshake("closed before Hello".to_string()))?;

    tracing::debug!(device_id = %device_id, "handshake complete");

    Ok(HandshakeOutcome {
        cipher_in,
        cipher_out,
        device_id,
        initial_plaintext,
        // Frames are length-delimited, so nothing is over-read past the
        // Hello; the field stays part of the contract for transports
        // that do buffer ahead.
        pending_frames: Vec::new(),
    })
}

/// What the device-side handshake yields (device simulators, tests).
pub struct DeviceHandshake {
    pub cipher_in: CipherReader,
    pub cipher_out: CipherWriter,
}

/// Run the device side of the handshake.
///
/// `device_keys` is the device's registered static keypair and
/// `server_public` the broker's static public key.
pub async fn initiate(
    device_id: &DeviceId,
    device_keys: &KeyPair,
    server_public: &PublicKey,
    mut reader: IoReader,
    mut writer: IoWriter,
) -> Result<DeviceHandshake> {
    let mut nonce = [0u8; NONCE_SIZE];
    reader
        .read_exact(&mut nonce)
        .await
        .map_err(|e| CoreError::Handshake(format!("nonce read: {e}")))?;

    let auth_key = device_keys.agree(server_public);
    let ephemeral = KeyPair::generate();

    let mut hello = Vec::with_capacity(DEVICE_ID_SIZE + 32 + TAG_SIZE);
    hello.extend_from_slice(device_id.as_bytes());
    hello.extend_from_slice(ephemeral.public().as_bytes());

    let mut transcript = Vec::with_capacity(NONCE_SIZE + DEVICE_ID_SIZE + 32);
    transcript.extend_from_slice(&nonce);
    transcript.extend_from_slice(&hello[..DEVICE_ID_SIZE + 32]);

    let tag = {
        use hmac::{Hmac, Mac};
        let mut mac = Hmac::<sha2::Sha256>::new_from_slice(&auth_key)
            .expect("HMAC accepts any key size");
        mac.update(&transcript);
        mac.finalize().into_bytes()
    };
    hello.extend_from_slice(&tag);

    writer
        .write_all(&hello)
        .await
        .map_err(|e| CoreError::Handshake(format!("hello write: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| CoreError::Handshake(format!("hello write: {e}")))?;

    let mut reply = [0u8; 32 + TAG_SIZE];
    reader
        .read_exact(&mut reply)
        .await
        .map_err(|e| CoreError::Handshake(format!("key reply read: {e}")))?;

    let server_ephemeral = PublicKey::from_slice(&reply[..32])?;

    let mut reply_transcript = Vec::with_capacity(NONCE_SIZE + 32);
    reply_transcript.extend_from_slice(&nonce);
    reply_transcript.extend_from_slice(&reply[..32]);
    {
        use hmac::{Hmac, Mac};
        let mut mac = Hmac::<sha2::Sha256>::new_from_slice(&auth_key)
            .expect("HMAC accepts any key size");
        mac.update(&reply_transcript);
        mac.verify_slice(&reply[32..])
            .map_err(|_| CoreError::Handshake("server failed verification".to_string()))?;
    }

    let master = ephemeral.agree(&server_ephemeral);
    let hk = hkdf::Hkdf::<sha2::Sha256>::new(Some(&nonce), &master);

    let mut outbound = [0u8; 32];
    hk.expand(b"core->cloud", &mut outbound)
        .map_err(|e| CoreError::Crypto(format!("HKDF expand failed: {e}")))?;
    let mut inbound = [0u8; 32];
    hk.expand(b"cloud->core", &mut inbound)
        .map_err(|e| CoreError::Crypto(format!("HKDF expand failed: {e}")))?;

    let mut out_key = [0u8; 16];
    let mut out_iv = [0u8; 16];
    out_key.copy_from_slice(&outbound[..16]);
    out_iv.copy_from_slice(&outbound[16..]);
    let mut in_key = [0u8; 16];
    let mut in_iv = [0u8; 16];
    in_key.copy_from_slice(&inbound[..16]);
    in_iv.copy_from_slice(&inbound[16..]);

    Ok(DeviceHandshake {
        cipher_in: CipherReader::new(reader, &in_key, &in_iv),
        cipher_out: CipherWriter::new(writer, &out_key, &out_iv),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::InMemoryKeyRepository;
    use std::sync::Arc;

    fn split_pair() -> (IoReader, IoWriter, IoReader, IoWriter) {
        let (a, b) = tokio::io::duplex(16 * 1024);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        (Box::new(ar), Box::new(aw), Box::new(br), Box::new(bw))
    }

    fn registered_device() -> (CryptoManager, DeviceId, KeyPair) {
        let repo = Arc::new(InMemoryKeyRepository::new());
        let crypto = CryptoManager::new(KeyPair::generate(), repo.clone());
        let device_id = DeviceId::from_bytes([0xAB; DEVICE_ID_SIZE]);
        let device_keys = KeyPair::generate();
        crypto.claim_device_key(&device_id, device_keys.public().clone());
        (crypto, device_id, device_keys)
    }

    #[tokio::test]
    async fn test_handshake_yields_working_pipes() {
        let (crypto, device_id, device_keys) = registered_device();
        let server_public = crypto.server_public().clone();
        let (broker_r, broker_w, device_r, device_w) = split_pair();

        let device = tokio::spawn(async move {
            let mut hs = initiate(&device_id, &device_keys, &server_public, device_r, device_w)
                .await
                .unwrap();
            hs.cipher_out.write_frame(b"hello-frame").await.unwrap();
            hs.cipher_out.write_frame(b"next-frame").await.unwrap();
            let from_broker = hs.cipher_in.read_frame().await.unwrap().unwrap();
            assert_eq!(from_broker, b"welcome");
        });

        let mut outcome = accept(&crypto, broker_r, broker_w).await.unwrap();
        assert_eq!(outcome.device_id, device_id);
        assert_eq!(outcome.initial_plaintext, b"hello-frame");
        assert!(outcome.pending_frames.is_empty());

        let next = outcome.cipher_in.read_frame().await.unwrap().unwrap();
        assert_eq!(next, b"next-frame");

        outcome.cipher_out.write_frame(b"welcome").await.unwrap();
        device.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_device_fails() {
        let repo = Arc::new(InMemoryKeyRepository::new());
        let crypto = CryptoManager::new(KeyPair::generate(), repo);
        let server_public = crypto.server_public().clone();

        // Device never registered its key
        let device_id = DeviceId::from_bytes([0xCD; DEVICE_ID_SIZE]);
        let device_keys = KeyPair::generate();
        let (broker_r, broker_w, device_r, device_w) = split_pair();

        let device = tokio::spawn(async move {
            let _ = initiate(&device_id, &device_keys, &server_public, device_r, device_w).await;
        });

        let result = accept(&crypto, broker_r, broker_w).await;
        assert!(matches!(result, Err(CoreError::Handshake(_))));
        let _ = device.await;
    }

    #[tokio::test]
    async fn test_wrong_device_key_fails_verification() {
        let (crypto, device_id, _real_keys) = registered_device();
        let server_public = crypto.server_public().clone();

        // Impostor with a different static key
        let impostor_keys = KeyPair::generate();
        let (broker_r, broker_w, device_r, device_w) = split_pair();

        let device = tokio::spawn(async move {
            let _ = initiate(&device_id, &impostor_keys, &server_public, device_r, device_w).await;
        });

        let result = accept(&crypto, broker_r, broker_w).await;
        assert!(matches!(result, Err(CoreError::Handshake(_))));
        let _ = device.await;
    }

    #[tokio::test]
    async fn test_early_close_fails_handshake() {
        let (crypto, _, _) = registered_device();
        let (broker_r, broker_w, device_r, device_w) = split_pair();

        drop(device_r);
        drop(device_w);

        let result = accept(&crypto, broker_r, broker_w).await;
        assert!(matches!(result, Err(CoreError::Handshake(_))));
    }
}
