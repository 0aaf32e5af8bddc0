// ── Event vocabulary ─────────────────────────────────────────────────

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Where a status payload came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusSource {
    /// Pushed by the device over its socket.
    PushSocket,
    /// Gathered locally: an HTTP pull or a multicast broadcast.
    Local,
}

/// Normalized fleet event, as delivered to subscribers.
///
/// The enum is closed on purpose: consumers match exhaustively, and the
/// compiler flags every consumer when a variant is added.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    /// The device became reachable. Debounced: published only on an
    /// actual offline-to-online transition.
    DeviceOnline { name: String, address: String },
    /// The device became unreachable. Debounced the same way.
    DeviceOffline { name: String, reason: String },
    /// A full or partial status document for a device.
    FullStatus {
        name: String,
        payload: Value,
        source: StatusSource,
    },
}

impl Event {
    /// The device this event concerns.
    pub fn device(&self) -> &str {
        match self {
            Self::DeviceOnline { name, .. }
            | Self::DeviceOffline { name, .. }
            | Self::FullStatus { name, .. } => name,
        }
    }

    /// The discriminant, for filtered subscriptions.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::DeviceOnline { .. } => EventKind::DeviceOnline,
            Self::DeviceOffline { .. } => EventKind::DeviceOffline,
            Self::FullStatus { .. } => EventKind::FullStatus,
        }
    }
}

/// Discriminant-only mirror of [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    DeviceOnline,
    DeviceOffline,
    FullStatus,
}

/// Subscription predicate. The common cases are first-class variants;
/// `Custom` covers everything else.
pub enum EventFilter {
    /// Match every event.
    All,
    /// Match one event kind.
    Kind(EventKind),
    /// Match every event for one device.
    ForDevice(String),
    /// Arbitrary predicate.
    Custom(Box<dyn Fn(&Event) -> bool + Send + Sync>),
}

impl EventFilter {
    pub fn matches(&self, event: &Event) -> bool {
        match self {
            Self::All => true,
            Self::Kind(kind) => event.kind() == *kind,
            Self::ForDevice(name) => event.device() == name,
            Self::Custom(predicate) => predicate(event),
        }
    }
}
