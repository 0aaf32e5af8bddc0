// ── Device and connection types ──────────────────────────────────────

use serde::{Deserialize, Serialize};

/// A configured fleet member: a stable name plus a network address.
///
/// The hardware generation is deliberately not part of the
/// configuration. It is resolved by probing the device at connect time,
/// so a swapped-out unit picks up the right transport on the next
/// connection attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Stable fleet-wide name; the key for all queries and events.
    pub name: String,
    /// Host or `host:port` on the local network.
    pub address: String,
}

impl Device {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }
}

/// Hardware generation, resolved per connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Generation {
    /// First generation: HTTP polling plus CoIoT multicast assist.
    Gen1,
    /// Second generation or later: persistent RPC push socket.
    Gen2Plus(u8),
}

impl Generation {
    /// Classify a probed generation number. Anything below 2 is treated
    /// as first-generation hardware.
    pub fn from_probe(r#gen: u8) -> Self {
        if r#gen >= 2 {
            Self::Gen2Plus(r#gen)
        } else {
            Self::Gen1
        }
    }

    /// Whether the device speaks the push RPC protocol.
    pub fn supports_push(&self) -> bool {
        matches!(self, Self::Gen2Plus(_))
    }

    /// The raw generation number.
    pub fn number(&self) -> u8 {
        match self {
            Self::Gen1 => 1,
            Self::Gen2Plus(n) => *n,
        }
    }
}

/// How a connected device's status reaches the orchestrator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transport {
    /// No transport established yet.
    #[default]
    None,
    /// Persistent push socket (Gen2+).
    PushSocket,
    /// Periodic HTTP pulls with multicast assist (Gen1).
    Poll,
}

/// Public view of one connection record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub transport: Transport,
    pub generation: Generation,
}
