//! Cloud events and the collaborators the session fans them through.
//!
//! Device-published events either stay internal (the `spark/` system
//! namespace) or fan out through the [`EventPublisher`]; subscriptions
//! bridge back into the session as outbound PublicEvent/PrivateEvent
//! frames. The publisher, cluster routing and attribute storage are
//! contracts here; in-memory implementations back tests and the demo
//! binary.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::crypto::DeviceId;

/// Namespace of events consumed internally and never fanned out.
pub const SYSTEM_EVENT_PREFIX: &str = "spark/";

/// An event flowing between devices and the cloud.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudEvent {
    /// Event name, e.g. `temperature` or `spark/device/ip`
    pub name: String,
    /// Payload bytes, if any
    pub data: Option<Vec<u8>>,
    /// Time-to-live in seconds, carried as Max-Age on the wire
    pub ttl: u32,
    /// When the event was published
    pub published_at: SystemTime,
    /// Public events fan out to everyone; private only to the owner
    pub is_public: bool,
    /// Hex id of the originating device, if device-published
    pub device_id: Option<String>,
}

impl CloudEvent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: None,
            ttl: 60,
            published_at: SystemTime::now(),
            is_public: true,
            device_id: None,
        }
    }

    /// Whether this event belongs to the internal system namespace.
    pub fn is_system(&self) -> bool {
        self.name.starts_with(SYSTEM_EVENT_PREFIX)
    }
}

/// The system events the broker understands, by exact name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemEventKind {
    AppHash,
    ClaimCode,
    FlashAvailable,
    FlashProgress,
    FlashStatus,
    Ip,
    Name,
    Random,
    Ident0,
    LastReset,
    MaxBinary,
    OtaChunkSize,
    Reset,
    SafeMode,
    SafeModeUpdating,
    Cc3000PatchVersion,
    Status,
}

/// Map a device-published name to a known system event.
///
/// Unlisted `spark/` names are still consumed internally, just without
/// a dedicated handler.
pub fn system_event(name: &str) -> Option<SystemEventKind> {
    match name {
        "spark/device/app-hash" => Some(SystemEventKind::AppHash),
        "spark/device/claim/code" => Some(SystemEventKind::ClaimCode),
        "spark/flash/available" => Some(SystemEventKind::FlashAvailable),
        "spark/flash/progress" => Some(SystemEventKind::FlashProgress),
        "spark/flash/status" => Some(SystemEventKind::FlashStatus),
        "spark/device/ip" => Some(SystemEventKind::Ip),
        "spark/device/name" => Some(SystemEventKind::Name),
        "spark/device/random" => Some(SystemEventKind::Random),
        "spark/device/ident/0" => Some(SystemEventKind::Ident0),
        "spark/device/last_reset" => Some(SystemEventKind::LastReset),
        "spark/hardware/max_binary" => Some(SystemEventKind::MaxBinary),
        "spark/hardware/ota_chunk_size" => Some(SystemEventKind::OtaChunkSize),
        "spark/device/reset" => Some(SystemEventKind::Reset),
        "spark/device/safemode" => Some(SystemEventKind::SafeMode),
        "spark/safe-mode-updater/updating" => Some(SystemEventKind::SafeModeUpdating),
        "spark/cc3000-patch-version" => Some(SystemEventKind::Cc3000PatchVersion),
        "spark/status" => Some(SystemEventKind::Status),
        _ => None,
    }
}

/// Where subscribed events are delivered.
pub type EventSink = mpsc::UnboundedSender<CloudEvent>;

/// Narrowing applied to a subscription.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilter {
    /// Only events originating from this device
    pub device_id: Option<String>,
}

impl SubscriptionFilter {
    fn matches(&self, event: &CloudEvent) -> bool {
        match &self.device_id {
            Some(wanted) => event.device_id.as_deref() == Some(wanted.as_str()),
            None => true,
        }
    }
}

/// The cross-process event fan-out contract.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: CloudEvent);
    fn subscribe(
        &self,
        prefix: &str,
        sink: EventSink,
        filter: SubscriptionFilter,
        subscriber_id: &str,
    );
    fn unsubscribe_all(&self, subscriber_id: &str);
}

struct Subscription {
    prefix: String,
    sink: EventSink,
    filter: SubscriptionFilter,
    subscriber_id: String,
}

/// Single-process publisher for tests and the demo binary.
#[derive(Default)]
pub struct InMemoryEventPublisher {
    subscriptions: Mutex<Vec<Subscription>>,
}

impl InMemoryEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventPublisher for InMemoryEventPublisher {
    fn publish(&self, event: CloudEvent) {
        let mut subscriptions = self.subscriptions.lock().expect("publisher poisoned");
        // Closed sinks drop out as we go
        subscriptions.retain(|sub| {
            if !event.name.starts_with(&sub.prefix) || !sub.filter.matches(&event) {
                return true;
            }
            sub.sink.send(event.clone()).is_ok()
        });
    }

    fn subscribe(
        &self,
        prefix: &str,
        sink: EventSink,
        filter: SubscriptionFilter,
        subscriber_id: &str,
    ) {
        self.subscriptions
            .lock()
            .expect("publisher poisoned")
            .push(Subscription {
                prefix: prefix.to_string(),
                sink,
                filter,
                subscriber_id: subscriber_id.to_string(),
            });
    }

    fn unsubscribe_all(&self, subscriber_id: &str) {
        self.subscriptions
            .lock()
            .expect("publisher poisoned")
            .retain(|sub| sub.subscriber_id != subscriber_id);
    }
}

/// Out-of-band routing registry notified when a device comes online.
/// Emission is fire-and-forget; failures must never block Ready.
pub trait ClusterRouting: Send + Sync {
    fn device_online(&self, device_id: &DeviceId, server_id: &str);
}

/// Routing sink that drops everything (single-node deployments).
pub struct NoRouting;

impl ClusterRouting for NoRouting {
    fn device_online(&self, _device_id: &DeviceId, _server_id: &str) {}
}

/// Persisted device attributes, refreshed on Ready and on system events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceAttributes {
    pub device_id: String,
    pub name: Option<String>,
    pub ip: Option<String>,
    pub product_id: Option<u16>,
    pub firmware_version: Option<u16>,
    pub platform_id: Option<u16>,
    pub app_hash: Option<String>,
    pub claim_code: Option<String>,
    pub last_reset_reason: Option<String>,
    pub last_heard: Option<SystemTime>,
}

/// Attribute storage contract.
pub trait DeviceAttributeRepository: Send + Sync {
    fn get(&self, device_id: &str) -> Option<DeviceAttributes>;
    fn save(&self, attributes: DeviceAttributes);
}

/// In-memory attribute store for tests and the demo binary.
#[derive(Default)]
pub struct InMemoryDeviceAttributes {
    devices: Mutex<HashMap<String, DeviceAttributes>>,
}

impl InMemoryDeviceAttributes {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DeviceAttributeRepository for InMemoryDeviceAttributes {
    fn get(&self, device_id: &str) -> Option<DeviceAttributes> {
        self.devices
            .lock()
            .expect("attribute store poisoned")
            .get(device_id)
            .cloned()
    }

    fn save(&self, attributes: DeviceAttributes) {
        self.devices
            .lock()
            .expect("attribute store poisoned")
            .insert(attributes.device_id.clone(), attributes);
    }
}
