//! The device session: one per accepted connection.
//!
//! A session owns the cipher pipe produced by the handshake and runs
//! the request/response state machine on top of it: send/receive
//! counters, the token table, ack routing, ping keepalive and
//! disconnect. The device verbs ([`verbs`]) and the OTA flasher
//! ([`flasher`]) build on the send path and the listener facility.
//!
//! # Lifecycle
//!
//! ```text
//! Handshaking ──> Ready ──> (Active | Flashing) ──> Disconnected
//! ```
//!
//! Disconnected is terminal; a returning device gets a fresh session.
//!
//! One reader task per session consumes `cipher_in`; verbs run on their
//! callers' tasks and share the session state behind its lock. Outbound
//! frames reach the wire in `send_message` order because the lock is
//! held across the write.

mod bus;
mod flasher;
mod verbs;

pub use bus::{EventBus, SessionEvent, WaiterHandle};
pub use flasher::{FlashOptions, FIRMWARE_STORE};
pub use verbs::Introspection;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, watch, Mutex};

use crate::coap::{Message, MsgType};
use crate::config::CoreConfig;
use crate::crypto::{CryptoManager, DeviceId};
use crate::error::{CoreError, Result};
use crate::events::{
    system_event, CloudEvent, ClusterRouting, DeviceAttributeRepository, DeviceAttributes,
    EventPublisher, SubscriptionFilter, SystemEventKind,
};
use crate::handshake::HandshakeOutcome;
use crate::messages::{self, Classification, FrameKind, MessageName, Params};
use crate::pipe::{CipherReader, CipherWriter};

/// Everything a session needs from the outside world.
#[derive(Clone)]
pub struct SessionDeps {
    pub config: CoreConfig,
    pub crypto: Arc<CryptoManager>,
    pub publisher: Arc<dyn EventPublisher>,
    pub routing: Arc<dyn ClusterRouting>,
    pub attributes: Arc<dyn DeviceAttributeRepository>,
}

/// Who is asking the send path to emit a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendAuth {
    /// A verb or internal reply
    Verb,
    /// The flasher holding the ownership lock
    Flasher(u64),
}

/// Result of a send attempt.
///
/// `Refused` is the soft-fail sentinel: the lock is held by someone
/// else, wrap failed, or the cipher pipe is gone. Nothing was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent { token: Option<u8> },
    Refused,
}

/// Product identity parsed from the device Hello payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProductInfo {
    pub product_id: u16,
    pub firmware_version: u16,
    pub platform_id: u16,
}

/// One slot of the token table.
///
/// `live` drops when a response is routed; the name mapping stays so a
/// follow-up response on the same token (the second describe) still
/// resolves. A dead or expired slot is reclaimed at allocation time.
#[derive(Debug, Clone, Copy)]
struct PendingToken {
    name: MessageName,
    issued_at: Instant,
    live: bool,
}

struct SessionInner {
    send_counter: u16,
    receive_counter: u16,
    send_token: u8,
    pending: [Option<PendingToken>; 256],
    cipher_out: Option<CipherWriter>,
    /// Single-slot ownership lock; set while a flasher holds the session
    owner: Option<u64>,
    introspection: Option<Introspection>,
    product: Option<ProductInfo>,
    last_ping: Instant,
    /// Capability limits reported by the device via system events
    reported_max_binary: Option<usize>,
    reported_chunk_size: Option<usize>,
    messages_sent: u64,
    messages_received: u64,
}

/// A live device session.
pub struct DeviceSession {
    device_id: DeviceId,
    connection_key: String,
    deps: SessionDeps,
    bus: EventBus,
    state: Mutex<SessionInner>,
    disconnect_counter: AtomicU32,
    shutdown: watch::Sender<bool>,
    connection_start: Instant,
}

impl DeviceSession {
    /// Bring a session up from a completed handshake: consume the
    /// device Hello, answer with the broker Hello, route any frames
    /// that arrived during the handshake window, then start reading.
    pub async fn start(outcome: HandshakeOutcome, deps: SessionDeps) -> Result<Arc<Self>> {
        let hello = messages::unwrap(&outcome.initial_plaintext)
            .ok_or_else(|| CoreError::Handshake("malformed Hello".to_string()))?;
        if hello.uri_path.split('/').next() != Some("h") {
            return Err(CoreError::Handshake(format!(
                "expected Hello, got uri {:?}",
                hello.uri_path
            )));
        }

        let product = parse_hello_payload(&hello.payload);
        let session = Self::assemble(
            outcome.device_id,
            outcome.cipher_out,
            hello.message_id,
            product,
            deps,
        );

        tracing::info!(
            connection_key = %session.connection_key,
            device_id = %session.device_id,
            product_id = ?product.map(|p| p.product_id),
            "device session starting"
        );

        // Our Hello carries the freshly seeded counter on the wire
        session
            .send_message(MessageName::Hello, &Params::new(), &[], SendAuth::Verb)
            .await?;

        for frame in &outcome.pending_frames {
            session.route_plaintext(frame).await?;
        }

        let reader = outcome.cipher_in;
        tokio::spawn(Arc::clone(&session).read_loop(reader));

        session.bus.emit_lifecycle(SessionEvent::Ready);
        session.persist_ready_attributes();
        // Fire-and-forget; the routing sidechannel never blocks Ready
        session
            .deps
            .routing
            .device_online(&session.device_id, &session.deps.config.server.server_id);

        Ok(session)
    }

    fn assemble(
        device_id: DeviceId,
        cipher_out: CipherWriter,
        hello_id: u16,
        product: Option<ProductInfo>,
        deps: SessionDeps,
    ) -> Arc<Self> {
        let seed = deps.crypto.random_u16();
        let (shutdown, _) = watch::channel(false);

        Arc::new(Self {
            device_id,
            connection_key: uuid::Uuid::new_v4().to_string(),
            deps,
            bus: EventBus::new(),
            state: Mutex::new(SessionInner {
                // Increment-first send path puts `seed` itself on the wire
                send_counter: seed.wrapping_sub(1),
                receive_counter: hello_id,
                send_token: 0,
                pending: [None; 256],
                cipher_out: Some(cipher_out),
                owner: None,
                introspection: None,
                product,
                last_ping: Instant::now(),
                reported_max_binary: None,
                reported_chunk_size: None,
                messages_sent: 0,
                messages_received: 0,
            }),
            disconnect_counter: AtomicU32::new(0),
            shutdown,
            connection_start: Instant::now(),
        })
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn connection_key(&self) -> &str {
        &self.connection_key
    }

    pub async fn product_info(&self) -> Option<ProductInfo> {
        self.state.lock().await.product
    }

    /// Subscribe to lifecycle events (Ready, Disconnect, flash progress).
    pub fn events(&self) -> tokio::sync::broadcast::Receiver<SessionEvent> {
        self.bus.subscribe()
    }

    /// Session counters for observability.
    pub async fn stats(&self) -> SessionStats {
        let inner = self.state.lock().await;
        SessionStats {
            device_id: self.device_id.to_string(),
            connection_key: self.connection_key.clone(),
            uptime: self.connection_start.elapsed(),
            last_ping_age: inner.last_ping.elapsed(),
            messages_sent: inner.messages_sent,
            messages_received: inner.messages_received,
            flashing: inner.owner.is_some(),
        }
    }

    // === Send path ===

    /// Send a table message, allocating a counter slot and (for
    /// token-bearing messages) a token.
    pub async fn send_message(
        &self,
        name: MessageName,
        params: &Params,
        payload: &[u8],
        auth: SendAuth,
    ) -> Result<SendOutcome> {
        Ok(self
            .send_listening(name, params, payload, auth, 0)
            .await?
            .outcome)
    }

    /// Send a request and register `waiters` one-shot listeners for its
    /// response type while the session lock is held, so the response
    /// can never outrun the waiters.
    pub(crate) async fn send_listening(
        &self,
        name: MessageName,
        params: &Params,
        payload: &[u8],
        auth: SendAuth,
        waiters: usize,
    ) -> Result<SendListen> {
        let spec = messages::spec(name);
        let mut inner = self.state.lock().await;

        if !gate_allows(inner.owner, auth) {
            tracing::warn!(
                connection_key = %self.connection_key,
                message = %name,
                "send refused: flash lock held"
            );
            return Ok(SendListen::refused());
        }

        inner.send_counter = inner.send_counter.wrapping_add(1);
        let message_id = inner.send_counter;

        let token = if spec.token {
            inner.send_token = inner.send_token.wrapping_add(1);
            let slot = inner.send_token;
            if let Some(entry) = inner.pending[slot as usize] {
                let ttl = self.deps.config.protocol.token_ttl();
                if entry.live && entry.issued_at.elapsed() < ttl {
                    drop(inner);
                    self.disconnect(&CoreError::TokenCollision(slot).to_string())
                        .await;
                    return Err(CoreError::TokenCollision(slot));
                }
            }
            inner.pending[slot as usize] = Some(PendingToken {
                name,
                issued_at: Instant::now(),
                live: true,
            });
            Some(slot)
        } else {
            None
        };

        let bytes = match messages::wrap(name, message_id, params, payload, token) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(
                    connection_key = %self.connection_key,
                    message = %name,
                    "wrap failed: {err}"
                );
                return Ok(SendListen::refused());
            }
        };

        let mut handles = Vec::with_capacity(waiters);
        if waiters > 0 {
            if let Some(response) = spec.response {
                for _ in 0..waiters {
                    handles.push(self.bus.register(response, None, token)?);
                }
            }
        }

        match self.write_locked(&mut inner, name, &bytes).await {
            Ok(WriteOutcome::Written) => Ok(SendListen {
                outcome: SendOutcome::Sent { token },
                handles,
            }),
            Ok(WriteOutcome::Refused) => {
                for handle in &handles {
                    self.bus.cancel(handle);
                }
                Ok(SendListen::refused())
            }
            Err(err) => {
                for handle in &handles {
                    self.bus.cancel(handle);
                }
                Err(err)
            }
        }
    }

    /// Answer a confirmable message. A `None` id allocates a fresh
    /// counter slot; `Some(id)` reuses the inbound id for ack parity
    /// and leaves the counter untouched.
    pub async fn send_reply(
        &self,
        name: MessageName,
        reuse_id: Option<u16>,
        params: &Params,
        payload: &[u8],
        token: Option<u8>,
        auth: SendAuth,
    ) -> Result<SendOutcome> {
        let mut inner = self.state.lock().await;

        if !gate_allows(inner.owner, auth) {
            tracing::warn!(
                connection_key = %self.connection_key,
                message = %name,
                "reply refused: flash lock held"
            );
            return Ok(SendOutcome::Refused);
        }

        let message_id = match reuse_id {
            Some(id) => id,
            None => {
                inner.send_counter = inner.send_counter.wrapping_add(1);
                inner.send_counter
            }
        };

        let bytes = match messages::wrap(name, message_id, params, payload, token) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(
                    connection_key = %self.connection_key,
                    message = %name,
                    "wrap failed: {err}"
                );
                return Ok(SendOutcome::Refused);
            }
        };

        match self.write_locked(&mut inner, name, &bytes).await? {
            WriteOutcome::Written => Ok(SendOutcome::Sent { token }),
            WriteOutcome::Refused => Ok(SendOutcome::Refused),
        }
    }

    async fn write_locked(
        &self,
        inner: &mut SessionInner,
        name: MessageName,
        bytes: &[u8],
    ) -> Result<WriteOutcome> {
        let Some(writer) = inner.cipher_out.as_mut() else {
            tracing::warn!(
                connection_key = %self.connection_key,
                message = %name,
                "send refused: cipher pipe closed"
            );
            return Ok(WriteOutcome::Refused);
        };

        match writer.write_frame(bytes).await {
            Ok(()) => {
                inner.messages_sent += 1;
                Ok(WriteOutcome::Written)
            }
            Err(err) => {
                // Socket failure is fatal; teardown runs on the reader
                // task, outside this lock
                inner.cipher_out = None;
                tracing::warn!(
                    connection_key = %self.connection_key,
                    "socket error: {err}"
                );
                let _ = self.shutdown.send(true);
                Err(err)
            }
        }
    }

    /// Await a response event with the configured listener timeout.
    pub async fn listen_for(
        &self,
        name: MessageName,
        uri_prefix: Option<&str>,
        token: Option<u8>,
    ) -> Result<Message> {
        let timeout = self.deps.config.protocol.listener_timeout();
        self.bus.await_event(name, uri_prefix, token, timeout).await
    }

    /// Await a response event with an explicit timeout.
    pub async fn listen_for_within(
        &self,
        name: MessageName,
        uri_prefix: Option<&str>,
        token: Option<u8>,
        timeout: Duration,
    ) -> Result<Message> {
        self.bus.await_event(name, uri_prefix, token, timeout).await
    }

    // === Receive path ===

    async fn read_loop(self: Arc<Self>, mut cipher_in: CipherReader) {
        let socket_timeout = self.deps.config.server.socket_timeout();
        let mut shutdown = self.shutdown.subscribe();

        loop {
            let frame = tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    self.disconnect("session shutdown").await;
                    break;
                }
                frame = tokio::time::timeout(socket_timeout, cipher_in.read_frame()) => frame,
            };

            match frame {
                Ok(Ok(Some(frame))) => {
                    if let Err(err) = self.route_plaintext(&frame).await {
                        if err.is_fatal() {
                            self.disconnect(&err.to_string()).await;
                            break;
                        }
                        tracing::warn!(
                            connection_key = %self.connection_key,
                            "inbound routing error: {err}"
                        );
                    }
                }
                Ok(Ok(None)) => {
                    self.disconnect("socket closed").await;
                    break;
                }
                Ok(Err(err)) => {
                    self.disconnect(&format!("socket error: {err}")).await;
                    break;
                }
                Err(_) => {
                    self.disconnect("socket timeout").await;
                    break;
                }
            }
        }
    }

    /// Route one decrypted frame: classify, advance counters, answer
    /// pings, then hand the event to waiters and built-in handlers.
    async fn route_plaintext(self: &Arc<Self>, bytes: &[u8]) -> Result<()> {
        let Some(message) = messages::unwrap(bytes) else {
            // Malformed frames are dropped; the session keeps serving
            return Ok(());
        };

        let classification = {
            let mut inner = self.state.lock().await;

            let classification = messages::classify(&message, |token| {
                inner.pending[token as usize].map(|entry| entry.name)
            });

            if classification.kind == FrameKind::Ack {
                if let Some(token) = message.token_byte() {
                    if let Some(entry) = inner.pending[token as usize].as_mut() {
                        entry.live = false;
                    }
                }
                inner.messages_received += 1;
                drop(inner);
                self.bus.emit(classification.name, &message);
                return Ok(());
            }

            inner.receive_counter = inner.receive_counter.wrapping_add(1);
            inner.messages_received += 1;

            if classification.kind == FrameKind::EmptyPing {
                inner.last_ping = Instant::now();
                drop(inner);
                self.send_reply(
                    MessageName::PingAck,
                    Some(message.message_id),
                    &Params::new(),
                    &[],
                    None,
                    SendAuth::Verb,
                )
                .await?;
                return Ok(());
            }

            if message.message_id != inner.receive_counter {
                tracing::warn!(
                    connection_key = %self.connection_key,
                    expected = inner.receive_counter,
                    got = message.message_id,
                    "message id out of sequence"
                );
                return Err(if classification.name == MessageName::Ignored {
                    CoreError::GotAnIgnore
                } else {
                    CoreError::BadCounter
                });
            }

            if classification.kind == FrameKind::Response {
                if let Some(token) = message.token_byte() {
                    if let Some(entry) = inner.pending[token as usize].as_mut() {
                        entry.live = false;
                    }
                }
            }

            classification
        };

        self.bus.emit(classification.name, &message);
        self.handle_request(&classification, &message).await;
        Ok(())
    }

    /// Built-in answers to device-originated requests. Failures here
    /// are logged and kept away from the reader loop; the send path
    /// already escalates socket errors.
    async fn handle_request(self: &Arc<Self>, classification: &Classification, message: &Message) {
        if classification.kind != FrameKind::Request {
            return;
        }

        let result = match classification.name {
            MessageName::Hello => self.handle_re_hello(message).await,
            MessageName::GetTime => self.handle_get_time(message).await,
            MessageName::PublicEvent => self.handle_device_event(message, true).await,
            MessageName::PrivateEvent => self.handle_device_event(message, false).await,
            MessageName::Subscribe => self.handle_subscribe(message).await,
            MessageName::ChunkMissed => self.handle_chunk_missed(message).await,
            _ => Ok(()),
        };

        if let Err(err) = result {
            tracing::warn!(
                connection_key = %self.connection_key,
                request = %classification.name,
                "request handler failed: {err}"
            );
        }
    }

    async fn handle_re_hello(&self, message: &Message) -> Result<()> {
        {
            let mut inner = self.state.lock().await;
            inner.last_ping = Instant::now();
            if let Some(product) = parse_hello_payload(&message.payload) {
                inner.product = Some(product);
            }
        }
        self.send_reply(
            MessageName::PingAck,
            Some(message.message_id),
            &Params::new(),
            &[],
            None,
            SendAuth::Verb,
        )
        .await?;
        Ok(())
    }

    async fn handle_get_time(&self, message: &Message) -> Result<()> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as u32;
        self.send_reply(
            MessageName::GetTimeReturn,
            Some(message.message_id),
            &Params::new(),
            &now.to_be_bytes(),
            message.token_byte(),
            SendAuth::Verb,
        )
        .await?;
        Ok(())
    }

    async fn handle_chunk_missed(&self, message: &Message) -> Result<()> {
        // The flasher's listener got the event; just settle the exchange
        self.send_reply(
            MessageName::ChunkMissedAck,
            Some(message.message_id),
            &Params::new(),
            &[],
            message.token_byte(),
            SendAuth::Verb,
        )
        .await?;
        Ok(())
    }

    async fn handle_device_event(&self, message: &Message, is_public: bool) -> Result<()> {
        let name = message
            .uri_path
            .splitn(2, '/')
            .nth(1)
            .unwrap_or_default()
            .to_string();

        if message.kind == MsgType::Confirmable {
            self.send_reply(
                MessageName::EventAck,
                Some(message.message_id),
                &Params::new(),
                &[],
                message.token_byte(),
                SendAuth::Verb,
            )
            .await?;
        }

        let event = CloudEvent {
            name,
            data: (!message.payload.is_empty()).then(|| message.payload.clone()),
            ttl: message.max_age.unwrap_or(60),
            published_at: message.timestamp,
            is_public,
            device_id: Some(self.device_id.to_string()),
        };

        if event.is_system() {
            self.handle_system_event(&event).await;
        } else {
            self.deps.publisher.publish(event);
        }
        Ok(())
    }

    /// `spark/` events stay internal: capability limits, attribute
    /// refreshes and claim codes.
    async fn handle_system_event(&self, event: &CloudEvent) {
        let text = event
            .data
            .as_deref()
            .map(|data| String::from_utf8_lossy(data).into_owned());

        match system_event(&event.name) {
            Some(SystemEventKind::MaxBinary) => {
                if let Some(size) = text.as_deref().and_then(|t| t.trim().parse().ok()) {
                    self.state.lock().await.reported_max_binary = Some(size);
                }
            }
            Some(SystemEventKind::OtaChunkSize) => {
                if let Some(size) = text.as_deref().and_then(|t| t.trim().parse().ok()) {
                    self.state.lock().await.reported_chunk_size = Some(size);
                }
            }
            Some(SystemEventKind::ClaimCode) => {
                self.update_attributes(|attrs| attrs.claim_code = text.clone());
            }
            Some(SystemEventKind::Ip) => {
                self.update_attributes(|attrs| attrs.ip = text.clone());
            }
            Some(SystemEventKind::Name) => {
                self.update_attributes(|attrs| attrs.name = text.clone());
            }
            Some(SystemEventKind::AppHash) => {
                self.update_attributes(|attrs| attrs.app_hash = text.clone());
            }
            Some(SystemEventKind::LastReset) => {
                self.update_attributes(|attrs| attrs.last_reset_reason = text.clone());
            }
            other => {
                tracing::debug!(
                    connection_key = %self.connection_key,
                    event = %event.name,
                    kind = ?other,
                    "system event consumed"
                );
            }
        }
    }

    async fn handle_subscribe(self: &Arc<Self>, message: &Message) -> Result<()> {
        let prefix = message
            .uri_path
            .splitn(2, '/')
            .nth(1)
            .unwrap_or_default()
            .to_string();

        if prefix.starts_with("spark/") {
            // The system namespace is not subscribable
            self.send_reply(
                MessageName::SubscribeFail,
                Some(message.message_id),
                &Params::new(),
                &[],
                message.token_byte(),
                SendAuth::Verb,
            )
            .await?;
            return Ok(());
        }

        // "u" scopes the subscription to this device's own events
        let filter = if message.uri_query.as_deref() == Some("u") {
            SubscriptionFilter {
                device_id: Some(self.device_id.to_string()),
            }
        } else {
            SubscriptionFilter::default()
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        self.deps
            .publisher
            .subscribe(&prefix, tx, filter, &self.connection_key);

        self.send_reply(
            MessageName::SubscribeAck,
            Some(message.message_id),
            &Params::new(),
            &[],
            message.token_byte(),
            SendAuth::Verb,
        )
        .await?;

        let session = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match session.on_core_event(&event).await {
                    Ok(()) => {}
                    Err(CoreError::Disconnected(_)) | Err(CoreError::NotReady) => break,
                    Err(err) => {
                        tracing::warn!(
                            connection_key = %session.connection_key,
                            "event bridge send failed: {err}"
                        );
                    }
                }
            }
        });

        Ok(())
    }

    // === Ownership lock ===

    /// Claim exclusive send rights. Succeeds only if the slot is empty.
    pub(crate) async fn take_ownership(&self, holder: u64) -> bool {
        let mut inner = self.state.lock().await;
        if inner.owner.is_some() {
            return false;
        }
        inner.owner = Some(holder);
        true
    }

    /// Release the lock; clears only if the holder matches.
    pub(crate) async fn release_ownership(&self, holder: u64) {
        let mut inner = self.state.lock().await;
        if inner.owner == Some(holder) {
            inner.owner = None;
        }
    }

    /// Fail fast when another holder owns the session.
    pub(crate) async fn ensure_unlocked(&self) -> Result<()> {
        if self.state.lock().await.owner.is_some() {
            return Err(CoreError::FlashInProgress);
        }
        Ok(())
    }

    pub(crate) async fn reported_limits(&self) -> (Option<usize>, Option<usize>) {
        let inner = self.state.lock().await;
        (inner.reported_max_binary, inner.reported_chunk_size)
    }

    pub(crate) async fn introspection_cached(&self) -> Option<Introspection> {
        self.state.lock().await.introspection.clone()
    }

    pub(crate) async fn store_introspection(&self, introspection: Introspection) {
        self.state.lock().await.introspection = Some(introspection);
    }

    pub(crate) fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub(crate) fn config(&self) -> &CoreConfig {
        &self.deps.config
    }

    // === Lifecycle ===

    /// Tear the session down. Safe to call any number of times; only
    /// the first call does work.
    pub async fn disconnect(&self, reason: &str) {
        if self.disconnect_counter.fetch_add(1, Ordering::SeqCst) > 0 {
            return;
        }

        tracing::info!(
            connection_key = %self.connection_key,
            device_id = %self.device_id,
            duration_secs = self.connection_start.elapsed().as_secs(),
            reason,
            "device session disconnecting"
        );

        // Stop the reader; it drops cipher_in with it
        let _ = self.shutdown.send(true);

        // Each teardown step is guarded so one failure cannot suppress
        // the others
        let writer = self.state.lock().await.cipher_out.take();
        if let Some(mut writer) = writer {
            if let Err(err) = writer.shutdown().await {
                tracing::warn!(
                    connection_key = %self.connection_key,
                    "cipher shutdown failed: {err}"
                );
            }
        }

        self.deps.publisher.unsubscribe_all(&self.connection_key);

        self.bus
            .emit_lifecycle(SessionEvent::Disconnect(reason.to_string()));
        self.bus.reject_all();
    }

    fn persist_ready_attributes(&self) {
        let product = {
            // Called from start before any contention; never blocks
            match self.state.try_lock() {
                Ok(inner) => inner.product,
                Err(_) => None,
            }
        };

        self.update_attributes(|attrs| {
            attrs.last_heard = Some(SystemTime::now());
            if let Some(product) = product {
                attrs.product_id = Some(product.product_id);
                attrs.firmware_version = Some(product.firmware_version);
                attrs.platform_id = Some(product.platform_id);
            }
        });
    }

    fn update_attributes(&self, apply: impl Fn(&mut DeviceAttributes)) {
        let device_id = self.device_id.to_string();
        let mut attrs = self
            .deps
            .attributes
            .get(&device_id)
            .unwrap_or_else(|| DeviceAttributes {
                device_id: device_id.clone(),
                ..Default::default()
            });
        apply(&mut attrs);
        self.deps.attributes.save(attrs);
    }
}

/// Snapshot of session counters.
#[derive(Debug, Clone)]
pub struct SessionStats {
    pub device_id: String,
    pub connection_key: String,
    pub uptime: Duration,
    pub last_ping_age: Duration,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub flashing: bool,
}

enum WriteOutcome {
    Written,
    Refused,
}

/// Result of [`DeviceSession::send_listening`].
pub(crate) struct SendListen {
    pub outcome: SendOutcome,
    pub handles: Vec<bus::WaiterHandle>,
}

impl SendListen {
    fn refused() -> Self {
        Self {
            outcome: SendOutcome::Refused,
            handles: Vec::new(),
        }
    }
}

fn gate_allows(owner: Option<u64>, auth: SendAuth) -> bool {
    match owner {
        None => true,
        Some(holder) => matches!(auth, SendAuth::Flasher(id) if id == holder),
    }
}

/// Hello payload: three big-endian u16s (product id, firmware version,
/// platform id). Absent or short payloads carry no product info.
fn parse_hello_payload(payload: &[u8]) -> Option<ProductInfo> {
    if payload.len() < 6 {
        return None;
    }
    Some(ProductInfo {
        product_id: u16::from_be_bytes([payload[0], payload[1]]),
        firmware_version: u16::from_be_bytes([payload[2], payload[3]]),
        platform_id: u16::from_be_bytes([payload[4], payload[5]]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{InMemoryKeyRepository, KeyPair};
    use crate::events::{InMemoryDeviceAttributes, InMemoryEventPublisher, NoRouting};

    fn test_deps() -> SessionDeps {
        SessionDeps {
            config: CoreConfig::default(),
            crypto: Arc::new(CryptoManager::new(
                KeyPair::generate(),
                Arc::new(InMemoryKeyRepository::new()),
            )),
            publisher: Arc::new(InMemoryEventPublisher::new()),
            routing: Arc::new(NoRouting),
            attributes: Arc::new(InMemoryDeviceAttributes::new()),
        }
    }

    /// The returned peer end must stay alive for writes to succeed.
    fn session() -> (Arc<DeviceSession>, tokio::io::DuplexStream) {
        let (a, peer) = tokio::io::duplex(64 * 1024);
        let (_, write_half) = tokio::io::split(a);
        let writer = CipherWriter::new(Box::new(write_half), &[0u8; 16], &[0u8; 16]);
        let session = DeviceSession::assemble(
            DeviceId::from_bytes([1; 12]),
            writer,
            100,
            None,
            test_deps(),
        );
        (session, peer)
    }

    #[test]
    fn test_parse_hello_payload() {
        let info = parse_hello_payload(&[0, 6, 0, 3, 0, 10]).unwrap();
        assert_eq!(info.product_id, 6);
        assert_eq!(info.firmware_version, 3);
        assert_eq!(info.platform_id, 10);

        assert!(parse_hello_payload(&[]).is_none());
        assert!(parse_hello_payload(&[0, 6, 0]).is_none());
    }

    #[tokio::test]
    async fn test_send_ids_increment_and_wrap() {
        let (session, _peer) = session();
        {
            let mut inner = session.state.lock().await;
            inner.send_counter = 65_534;
        }

        for expected in [65_535u16, 0, 1, 2] {
            let outcome = session
                .send_message(MessageName::Describe, &Params::new(), &[], SendAuth::Verb)
                .await
                .unwrap();
            assert!(matches!(outcome, SendOutcome::Sent { .. }));
            assert_eq!(session.state.lock().await.send_counter, expected);
        }
    }

    #[tokio::test]
    async fn test_token_allocation_and_reuse_after_routing() {
        let (session, _peer) = session();

        let outcome = session
            .send_message(MessageName::Describe, &Params::new(), &[], SendAuth::Verb)
            .await
            .unwrap();
        let SendOutcome::Sent { token: Some(token) } = outcome else {
            panic!("expected token-bearing send");
        };
        assert_eq!(token, 1);

        {
            let inner = session.state.lock().await;
            let entry = inner.pending[token as usize].unwrap();
            assert_eq!(entry.name, MessageName::Describe);
            assert!(entry.live);
        }

        // Route the response: the slot stays resolvable but is no
        // longer live, so a wrapped-around allocation may reclaim it
        {
            let mut inner = session.state.lock().await;
            inner.pending[token as usize].as_mut().unwrap().live = false;
            inner.send_token = 0; // next allocation lands on slot 1 again
        }

        let outcome = session
            .send_message(MessageName::GetTime, &Params::new(), &[], SendAuth::Verb)
            .await
            .unwrap();
        assert!(matches!(outcome, SendOutcome::Sent { token: Some(1) }));
    }

    #[tokio::test]
    async fn test_live_token_collision_disconnects() {
        let (session, _peer) = session();

        session
            .send_message(MessageName::Describe, &Params::new(), &[], SendAuth::Verb)
            .await
            .unwrap();

        // Force the allocator to land on the live slot again
        session.state.lock().await.send_token = 0;

        let result = session
            .send_message(MessageName::GetTime, &Params::new(), &[], SendAuth::Verb)
            .await;
        assert!(matches!(result, Err(CoreError::TokenCollision(1))));
        assert!(session.disconnect_counter.load(Ordering::SeqCst) > 0);
    }

    #[tokio::test]
    async fn test_lock_refuses_non_holders() {
        let (session, _peer) = session();
        assert!(session.take_ownership(42).await);
        assert!(!session.take_ownership(43).await);

        let refused = session
            .send_message(MessageName::Describe, &Params::new(), &[], SendAuth::Verb)
            .await
            .unwrap();
        assert_eq!(refused, SendOutcome::Refused);

        let refused = session
            .send_message(
                MessageName::Describe,
                &Params::new(),
                &[],
                SendAuth::Flasher(43),
            )
            .await
            .unwrap();
        assert_eq!(refused, SendOutcome::Refused);

        let sent = session
            .send_message(
                MessageName::Describe,
                &Params::new(),
                &[],
                SendAuth::Flasher(42),
            )
            .await
            .unwrap();
        assert!(matches!(sent, SendOutcome::Sent { .. }));

        // Mismatched release is ignored
        session.release_ownership(43).await;
        assert!(session.state.lock().await.owner.is_some());
        session.release_ownership(42).await;
        assert!(session.state.lock().await.owner.is_none());
    }

    #[tokio::test]
    async fn test_send_without_cipher_is_refused() {
        let (session, _peer) = session();
        session.state.lock().await.cipher_out = None;

        let result = session
            .send_message(MessageName::Describe, &Params::new(), &[], SendAuth::Verb)
            .await
            .unwrap();
        assert_eq!(result, SendOutcome::Refused);
    }

    #[tokio::test]
    async fn test_counter_mismatch_is_bad_counter() {
        let (session, _peer) = session();
        session.state.lock().await.receive_counter = 41;

        // Confirmable non-empty request with id 43 (expected 42)
        let bytes = messages::wrap(
            MessageName::Hello,
            43,
            &Params::new(),
            &[],
            None,
        )
        .unwrap();

        let result = session.route_plaintext(&bytes).await;
        assert!(matches!(result, Err(CoreError::BadCounter)));
    }

    #[tokio::test]
    async fn test_reset_frame_mismatch_is_got_an_ignore() {
        let (session, _peer) = session();
        session.state.lock().await.receive_counter = 41;

        let reset = Message::new(MsgType::Reset, crate::coap::Code::Empty, 900);
        let bytes = crate::coap::encode(&reset).unwrap();

        let result = session.route_plaintext(&bytes).await;
        assert!(matches!(result, Err(CoreError::GotAnIgnore)));
    }

    #[tokio::test]
    async fn test_ping_updates_last_ping_and_skips_counter_check() {
        let (session, _peer) = session();
        {
            let mut inner = session.state.lock().await;
            inner.receive_counter = 10;
            inner.last_ping = Instant::now() - Duration::from_secs(60);
        }

        // Ping with an arbitrary id; consumes a counter slot, no check
        let ping = Message::new(MsgType::Confirmable, crate::coap::Code::Empty, 777);
        let bytes = crate::coap::encode(&ping).unwrap();
        session.route_plaintext(&bytes).await.unwrap();

        let inner = session.state.lock().await;
        assert!(inner.last_ping.elapsed() < Duration::from_secs(5));
        assert_eq!(inner.receive_counter, 11);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (session, _peer) = session();
        let mut events = session.events();

        session.disconnect("Bad Counter").await;
        session.disconnect("Bad Counter").await;
        session.disconnect("again").await;

        let mut disconnects = 0;
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::Disconnect(reason) = event {
                assert_eq!(reason, "Bad Counter");
                disconnects += 1;
            }
        }
        assert_eq!(disconnects, 1);
    }

    #[tokio::test]
    async fn test_disconnect_rejects_waiters() {
        let (session, _peer) = session();
        let waiting = {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                session
                    .listen_for(MessageName::DescribeReturn, None, None)
                    .await
            })
        };

        tokio::task::yield_now().await;
        session.disconnect("socket closed").await;

        let result = waiting.await.unwrap();
        assert!(matches!(result, Err(CoreError::Disconnected(_))));
    }
}
