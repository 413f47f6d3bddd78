//! The session event bus: named-event dispatch with timed one-shot
//! waiters, plus lifecycle fan-out.
//!
//! Verbs await responses by registering a waiter keyed by event name,
//! optional URI prefix and optional token. Each inbound event resolves
//! at most one waiter (oldest registration first); a resolved waiter
//! detaches. A waiter rejects with `Timeout` when its timer fires and
//! with `Disconnected` when the session tears down.
//!
//! The send path registers waiters while the session lock is held, so
//! a response can never outrun its waiter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{broadcast, oneshot};

use crate::coap::Message;
use crate::error::{CoreError, Result};
use crate::messages::MessageName;

/// Lifecycle events observers subscribe to.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Ready,
    Disconnect(String),
    FlashStarted,
    FlashSuccess,
    FlashFailed(String),
}

/// A registered one-shot waiter, redeemed with [`EventBus::wait`].
pub struct WaiterHandle {
    id: u64,
    rx: oneshot::Receiver<Message>,
}

struct Waiter {
    id: u64,
    name: MessageName,
    uri_prefix: Option<String>,
    token: Option<u8>,
    tx: oneshot::Sender<Message>,
}

impl Waiter {
    fn matches(&self, name: MessageName, message: &Message) -> bool {
        if self.name != name {
            return false;
        }
        if let Some(prefix) = &self.uri_prefix {
            if !message.uri_path.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(token) = self.token {
            if message.token_byte() != Some(token) {
                return false;
            }
        }
        true
    }
}

/// Per-session dispatch table.
pub struct EventBus {
    waiters: Mutex<WaiterTable>,
    lifecycle: broadcast::Sender<SessionEvent>,
    next_id: AtomicU64,
}

struct WaiterTable {
    entries: Vec<Waiter>,
    /// Set on disconnect; all registration afterwards rejects
    closed: bool,
}

impl EventBus {
    pub fn new() -> Self {
        let (lifecycle, _) = broadcast::channel(16);
        Self {
            waiters: Mutex::new(WaiterTable {
                entries: Vec::new(),
                closed: false,
            }),
            lifecycle,
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.lifecycle.subscribe()
    }

    /// Emit a lifecycle event to all subscribers.
    pub fn emit_lifecycle(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.lifecycle.send(event);
    }

    /// Deliver a named message event to the oldest matching waiter, if
    /// any. Unclaimed events are dropped.
    pub fn emit(&self, name: MessageName, message: &Message) {
        let mut table = self.waiters.lock().expect("bus poisoned");
        if let Some(index) = table
            .entries
            .iter()
            .position(|waiter| waiter.matches(name, message))
        {
            let waiter = table.entries.remove(index);
            // Receiver may have given up already
            let _ = waiter.tx.send(message.clone());
        }
    }

    /// Register a one-shot waiter. Fails once the session has closed.
    pub fn register(
        &self,
        name: MessageName,
        uri_prefix: Option<&str>,
        token: Option<u8>,
    ) -> Result<WaiterHandle> {
        let (tx, rx) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut table = self.waiters.lock().expect("bus poisoned");
        if table.closed {
            return Err(CoreError::Disconnected("session closed".to_string()));
        }
        table.entries.push(Waiter {
            id,
            name,
            uri_prefix: uri_prefix.map(str::to_string),
            token,
            tx,
        });
        Ok(WaiterHandle { id, rx })
    }

    /// Redeem a registered waiter.
    ///
    /// Resolves with the message on match; `Timeout` after the given
    /// duration; `Disconnected` if the session tears down first.
    pub async fn wait(&self, handle: WaiterHandle, timeout: Duration) -> Result<Message> {
        let WaiterHandle { id, rx } = handle;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => Err(CoreError::Disconnected("session closed".to_string())),
            Err(_) => {
                self.detach(id);
                Err(CoreError::Timeout)
            }
        }
    }

    /// Register and redeem in one step, for listeners that are not tied
    /// to an in-flight request.
    pub async fn await_event(
        &self,
        name: MessageName,
        uri_prefix: Option<&str>,
        token: Option<u8>,
        timeout: Duration,
    ) -> Result<Message> {
        let handle = self.register(name, uri_prefix, token)?;
        self.wait(handle, timeout).await
    }

    /// Reject every outstanding waiter. Called once, synchronously,
    /// during disconnect before teardown returns.
    pub fn reject_all(&self) {
        let mut table = self.waiters.lock().expect("bus poisoned");
        table.closed = true;
        // Dropping the senders rejects the receivers
        table.entries.clear();
    }

    /// Remove an abandoned waiter so it cannot swallow an event.
    pub fn cancel(&self, handle: &WaiterHandle) {
        self.detach(handle.id);
    }

    fn detach(&self, id: u64) {
        let mut table = self.waiters.lock().expect("bus poisoned");
        table.entries.retain(|waiter| waiter.id != id);
    }

    #[cfg(test)]
    fn outstanding(&self) -> usize {
        self.waiters.lock().expect("bus poisoned").entries.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
