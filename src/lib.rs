//! # Corelink - IoT Cloud Device-Session Core
//!
//! The device-session core of an IoT cloud message broker: terminates
//! many long-lived TCP connections from embedded devices speaking an
//! AES-encrypted, CoAP-framed protocol, and exposes the high-level
//! device verbs on top.
//!
//! ## Features
//!
//! - **Mutually authenticated handshake**: X25519 agreement with
//!   HMAC-verified transcripts, per-direction AES-128-CTR streams
//! - **CoAP state machine**: message-id counters with rollover, a
//!   256-slot token table, ack routing, ping keepalive
//! - **Device verbs**: describe/introspection, variable read, function
//!   call, signal raising, publish/subscribe event fan-out
//! - **OTA flashing**: chunked transfer with per-chunk CRC32 confirm
//!   and retransmit, under an exclusive session lock
//!
//! ## Architecture
//!
//! ```text
//! Device                         Broker
//!    |                             |
//!    |===== TCP + handshake ======>|  crypto::CryptoManager
//!    |                             |  handshake::accept
//!    |<==== AES-CTR cipher pipe ==>|  pipe::{CipherReader, CipherWriter}
//!    |                             |
//!    |------ Hello -------------->|  session::DeviceSession
//!    |<----- Hello ---------------|
//!    |                             |
//!    |<----- VariableRequest -----|  verbs (describe, getVariable, ...)
//!    |------ VariableValue ------>|
//!    |                             |
//!    |<----- UpdateBegin ---------|  flasher (ownership-locked)
//!    |------ UpdateReady -------->|
//!    |<----- Chunk + CRC ---------|
//!    |------ ChunkReceived ------>|
//! ```
//!
//! ## Session lifecycle
//!
//! ```text
//!                 handshake::accept()
//!  [Handshaking] ──────────────────> [Ready]
//!        │                             │
//!        │ any error                   │ verbs / flash
//!        v                             v
//!  [Disconnected] <─────────── [Active | Flashing]
//! ```
//!
//! Disconnected is terminal. Only counter violations, handshake
//! failure and socket errors disconnect; every other error surfaces to
//! the originating verb and the session keeps serving.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use corelink::{
//!     config::CoreConfig,
//!     crypto::{CryptoManager, InMemoryKeyRepository, KeyPair},
//!     events::{InMemoryDeviceAttributes, InMemoryEventPublisher, NoRouting},
//!     handshake,
//!     session::{DeviceSession, SessionDeps},
//! };
//!
//! let deps = SessionDeps {
//!     config: CoreConfig::default(),
//!     crypto: Arc::new(CryptoManager::new(
//!         KeyPair::generate(),
//!         Arc::new(InMemoryKeyRepository::new()),
//!     )),
//!     publisher: Arc::new(InMemoryEventPublisher::new()),
//!     routing: Arc::new(NoRouting),
//!     attributes: Arc::new(InMemoryDeviceAttributes::new()),
//! };
//!
//! // reader/writer are the halves of an accepted TCP connection
//! let outcome = handshake::accept(&deps.crypto, reader, writer).await?;
//! let session = DeviceSession::start(outcome, deps).await?;
//!
//! let value = session.get_variable("temperature").await?;
//! ```
//!
//! ## Modules
//!
//! - [`coap`]: CoAP datagram framing
//! - [`messages`]: the message table and payload codecs
//! - [`crypto`]: key agreement, digests, key repositories
//! - [`pipe`]: framed AES-128-CTR streams
//! - [`handshake`]: mutual authentication, session key derivation
//! - [`session`]: the per-connection state machine, verbs and flasher
//! - [`events`]: cloud events and the fan-out collaborators
//! - [`config`]: configuration management
//! - [`error`]: error types and the result alias

pub mod coap;
pub mod config;
pub mod crypto;
pub mod error;
pub mod events;
pub mod handshake;
pub mod messages;
pub mod pipe;
pub mod session;

// Re-exports for convenience
pub use config::CoreConfig;
pub use crypto::{CryptoManager, DeviceId, KeyPair};
pub use error::{CoreError, Result};
pub use events::{CloudEvent, EventPublisher};
pub use messages::{DeviceValue, MessageName};
pub use session::{DeviceSession, SessionDeps, SessionEvent};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Keepalive interval devices are expected to honor, in seconds
pub const KEEPALIVE_SECS: u64 = 15;
