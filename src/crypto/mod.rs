//! Session cryptography: key agreement, HMAC digests, session-key
//! derivation and the random sources the session state machine seeds
//! from.
//!
//! The broker holds one static X25519 keypair; every device registers
//! its static public key. Handshake authentication keys come from the
//! static-static agreement, session stream keys from an ephemeral
//! agreement expanded with HKDF-SHA256.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::error::{CoreError, Result};

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 tag size
pub const TAG_SIZE: usize = 32;

/// Length of the opaque device identifier
pub const DEVICE_ID_SIZE: usize = 12;

/// Handshake nonce length
pub const NONCE_SIZE: usize = 40;

/// AES-128 key/IV length used by the cipher pipe
pub const STREAM_KEY_SIZE: usize = 16;

/// Opaque device identifier (12 bytes, rendered lowercase hex).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId([u8; DEVICE_ID_SIZE]);

impl DeviceId {
    pub fn from_bytes(bytes: [u8; DEVICE_ID_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        if slice.len() != DEVICE_ID_SIZE {
            return Err(CoreError::Protocol(format!(
                "Device id must be {DEVICE_ID_SIZE} bytes, got {}",
                slice.len()
            )));
        }
        let mut bytes = [0u8; DEVICE_ID_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let bytes = hex::decode(hex_str)?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; DEVICE_ID_SIZE] {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({})", hex::encode(self.0))
    }
}

/// X25519 public key (32 bytes)
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        if slice.len() != 32 {
            return Err(CoreError::Crypto(format!(
                "Expected 32-byte public key, got {}",
                slice.len()
            )));
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey([{}...])", hex::encode(&self.0[..4]))
    }
}

/// X25519 keypair (static or ephemeral)
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret);
        Self {
            secret,
            public: PublicKey::from_bytes(public.to_bytes()),
        }
    }

    /// Rebuild a keypair from stored secret bytes
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = X25519Public::from(&secret);
        Self {
            secret,
            public: PublicKey::from_bytes(public.to_bytes()),
        }
    }

    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    /// Secret bytes, for persisting the server keypair
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    /// Diffie-Hellman agreement with a peer public key
    pub fn agree(&self, peer: &PublicKey) -> [u8; 32] {
        self.secret
            .diffie_hellman(&X25519Public::from(*peer.as_bytes()))
            .to_bytes()
    }
}

/// Per-direction AES-128-CTR stream key material derived for a session.
#[derive(Clone)]
pub struct StreamKeys {
    /// Device-to-broker direction
    pub inbound_key: [u8; STREAM_KEY_SIZE],
    pub inbound_iv: [u8; STREAM_KEY_SIZE],
    /// Broker-to-device direction
    pub outbound_key: [u8; STREAM_KEY_SIZE],
    pub outbound_iv: [u8; STREAM_KEY_SIZE],
}

/// Storage contract for device public keys.
///
/// The persistence format is someone else's problem; the broker only
/// needs lookup and first-claim save.
pub trait KeyRepository: Send + Sync {
    fn device_public_key(&self, device_id: &DeviceId) -> Option<PublicKey>;
    fn save_device_public_key(&self, device_id: &DeviceId, key: PublicKey);
}

/// In-memory key repository backing tests and the demo binary.
#[derive(Default)]
pub struct InMemoryKeyRepository {
    keys: Mutex<HashMap<DeviceId, PublicKey>>,
}

impl InMemoryKeyRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyRepository for InMemoryKeyRepository {
    fn device_public_key(&self, device_id: &DeviceId) -> Option<PublicKey> {
        self.keys.lock().expect("key repo poisoned").get(device_id).cloned()
    }

    fn save_device_public_key(&self, device_id: &DeviceId, key: PublicKey) {
        self.keys
            .lock()
            .expect("key repo poisoned")
            .insert(*device_id, key);
    }
}

/// The crypto collaborator a session is built around.
///
/// Owns the server's static keypair and the device key repository, and
/// supplies every random value the protocol consumes.
pub struct CryptoManager {
    server_keys: KeyPair,
    repository: Arc<dyn KeyRepository>,
}

impl CryptoManager {
    pub fn new(server_keys: KeyPair, repository: Arc<dyn KeyRepository>) -> Self {
        Self {
            server_keys,
            repository,
        }
    }

    pub fn server_public(&self) -> &PublicKey {
        self.server_keys.public()
    }

    /// Random 16-bit integer for send-counter seeding
    pub fn random_u16(&self) -> u16 {
        let mut bytes = [0u8; 2];
        OsRng.fill_bytes(&mut bytes);
        u16::from_be_bytes(bytes)
    }

    /// Secure random bytes (nonces)
    pub fn random_bytes<const N: usize>(&self) -> [u8; N] {
        let mut bytes = [0u8; N];
        OsRng.fill_bytes(&mut bytes);
        bytes
    }

    /// HMAC-SHA256 digest
    pub fn hmac_tag(&self, key: &[u8], data: &[u8]) -> [u8; TAG_SIZE] {
        let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key size");
        mac.update(data);
        let mut tag = [0u8; TAG_SIZE];
        tag.copy_from_slice(&mac.finalize().into_bytes());
        tag
    }

    /// Constant-time HMAC verification
    pub fn verify_tag(&self, key: &[u8], data: &[u8], tag: &[u8]) -> Result<()> {
        let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key size");
        mac.update(data);
        mac.verify_slice(tag)
            .map_err(|_| CoreError::Crypto("HMAC verification failed".to_string()))
    }

    /// The static-static agreement used to key handshake transcript tags.
    ///
    /// Fails for devices with no registered public key.
    pub fn handshake_auth_key(&self, device_id: &DeviceId) -> Result<[u8; 32]> {
        let device_key = self
            .repository
            .device_public_key(device_id)
            .ok_or_else(|| CoreError::UnknownDevice(device_id.to_string()))?;
        Ok(self.server_keys.agree(&device_key))
    }

    /// Record a device public key on first sight.
    pub fn claim_device_key(&self, device_id: &DeviceId, key: PublicKey) {
        self.repository.save_device_public_key(device_id, key);
    }

    /// Expand an ephemeral agreement into per-direction stream keys.
    ///
    /// The handshake nonce salts the extraction so a reused ephemeral
    /// pair still yields distinct sessions.
    pub fn derive_stream_keys(&self, master: &[u8; 32], nonce: &[u8]) -> Result<StreamKeys> {
        let hk = Hkdf::<Sha256>::new(Some(nonce), master);

        let mut inbound = [0u8; STREAM_KEY_SIZE * 2];
        hk.expand(b"core->cloud", &mut inbound)
            .map_err(|e| CoreError::Crypto(format!("HKDF expand failed: {e}")))?;

        let mut outbound = [0u8; STREAM_KEY_SIZE * 2];
        hk.expand(b"cloud->core", &mut outbound)
            .map_err(|e| CoreError::Crypto(format!("HKDF expand failed: {e}")))?;

        let mut keys = StreamKeys {
            inbound_key: [0; STREAM_KEY_SIZE],
            inbound_iv: [0; STREAM_KEY_SIZE],
            outbound_key: [0; STREAM_KEY_SIZE],
            outbound_iv: [0; STREAM_KEY_SIZE],
        };
        keys.inbound_key.copy_from_slice(&inbound[..STREAM_KEY_SIZE]);
        keys.inbound_iv.copy_from_slice(&inbound[STREAM_KEY_SIZE..]);
        keys.outbound_key.copy_from_slice(&outbound[..STREAM_KEY_SIZE]);
        keys.outbound_iv.copy_from_slice(&outbound[STREAM_KEY_SIZE..]);
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> CryptoManager {
        CryptoManager::new(KeyPair::generate(), Arc::new(InMemoryKeyRepository::new()))
    }

    #[test]
    fn test_agreement_is_symmetric() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        assert_eq!(a.agree(b.public()), b.agree(a.public()));
    }

    #[test]
    fn test_hmac_roundtrip_and_tamper() {
        let crypto = manager();
        let key = [7u8; 32];
        let tag = crypto.hmac_tag(&key, b"transcript");

        assert!(crypto.verify_tag(&key, b"transcript", &tag).is_ok());
        assert!(crypto.verify_tag(&key, b"transcripX", &tag).is_err());

        let mut bad = tag;
        bad[0] ^= 0xFF;
        assert!(crypto.verify_tag(&key, b"transcript", &bad).is_err());
    }

    #[test]
    fn test_stream_keys_deterministic_and_directional() {
        let crypto = manager();
        let master = [3u8; 32];
        let nonce = [9u8; NONCE_SIZE];

        let a = crypto.derive_stream_keys(&master, &nonce).unwrap();
        let b = crypto.derive_stream_keys(&master, &nonce).unwrap();
        assert_eq!(a.inbound_key, b.inbound_key);
        assert_eq!(a.outbound_iv, b.outbound_iv);

        // Directions must never share keystream
        assert_ne!(a.inbound_key, a.outbound_key);
        assert_ne!(a.inbound_iv, a.outbound_iv);

        // A different nonce yields a different session
        let c = crypto.derive_stream_keys(&master, &[1u8; NONCE_SIZE]).unwrap();
        assert_ne!(a.inbound_key, c.inbound_key);
    }

    #[test]
    fn test_unknown_device_fails_auth_key() {
        let crypto = manager();
        let id = DeviceId::from_bytes([1; DEVICE_ID_SIZE]);
        assert!(matches!(
            crypto.handshake_auth_key(&id),
            Err(CoreError::UnknownDevice(_))
        ));
    }

    #[test]
    fn test_claimed_device_key_round_trips() {
        let repo = Arc::new(InMemoryKeyRepository::new());
        let crypto = CryptoManager::new(KeyPair::generate(), repo.clone());
        let id = DeviceId::from_bytes([2; DEVICE_ID_SIZE]);
        let device = KeyPair::generate();

        crypto.claim_device_key(&id, device.public().clone());
        assert_eq!(
            repo.device_public_key(&id).unwrap().as_bytes(),
            device.public().as_bytes()
        );
        assert!(crypto.handshake_auth_key(&id).is_ok());
    }

    #[test]
    fn test_device_id_hex_roundtrip() {
        let id = DeviceId::from_hex("0123456789abcdef01234567").unwrap();
        assert_eq!(id.to_string(), "0123456789abcdef01234567");
        assert!(DeviceId::from_hex("0123").is_err());
    }
}
