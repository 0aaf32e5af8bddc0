// ── Multicast freshness and key registration ─────────────────────────
//
// Tracks which CoIoT keys broadcast recently and which device names
// they map to. Freshness is a time-windowed gate for the poller, never
// a source of status truth: stamps only ever suppress pulls, they do
// not feed payloads anywhere. The key-to-name table is populated
// through explicit registration; broadcasts from unregistered keys are
// stamped but otherwise dropped at ingestion.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

pub(crate) struct CoiotTracker {
    /// Last broadcast instant per multicast key.
    last_seen: Mutex<HashMap<String, Instant>>,
    /// Explicit key-to-name registrations.
    names: RwLock<HashMap<String, String>>,
}

impl CoiotTracker {
    pub fn new() -> Self {
        Self {
            last_seen: Mutex::new(HashMap::new()),
            names: RwLock::new(HashMap::new()),
        }
    }

    /// Record a broadcast for `key` at the current instant.
    pub fn mark_seen(&self, key: &str) {
        self.last_seen
            .lock()
            .expect("freshness lock poisoned")
            .insert(key.to_string(), Instant::now());
    }

    /// Whether `key` broadcast within the last `window`.
    pub fn fresh_within(&self, key: &str, window: Duration) -> bool {
        self.last_seen
            .lock()
            .expect("freshness lock poisoned")
            .get(key)
            .is_some_and(|seen| seen.elapsed() < window)
    }

    /// Register the multicast key a device announces under.
    ///
    /// TODO: derive the key from the Gen1 `/settings` document during
    /// connect so explicit registration becomes optional.
    pub fn register(&self, name: &str, key: &str) {
        debug!(name, key, "registering multicast key");
        self.names
            .write()
            .expect("registration lock poisoned")
            .insert(key.to_string(), name.to_string());
    }

    /// Resolve a multicast key to its registered device name.
    pub fn resolve(&self, key: &str) -> Option<String> {
        self.names
            .read()
            .expect("registration lock poisoned")
            .get(key)
            .cloned()
    }

    /// The key registered for `name`, if any. Used to seed connection
    /// records when the registration predates the connect.
    pub fn key_for(&self, name: &str) -> Option<String> {
        self.names
            .read()
            .expect("registration lock poisoned")
            .iter()
            .find(|(_, owner)| owner.as_str() == name)
            .map(|(key, _)| key.clone())
    }

    /// Drop all registrations and stamps belonging to `name`.
    pub fn forget_device(&self, name: &str) {
        let keys: Vec<String> = {
            let mut names = self.names.write().expect("registration lock poisoned");
            let keys: Vec<String> = names
                .iter()
                .filter(|(_, owner)| owner.as_str() == name)
                .map(|(key, _)| key.clone())
                .collect();
            for key in &keys {
                names.remove(key);
            }
            keys
        };

        let mut last_seen = self.last_seen.lock().expect("freshness lock poisoned");
        for key in &keys {
            last_seen.remove(key);
        }
    }

    /// Clear everything, for shutdown.
    pub fn clear(&self) {
        self.last_seen
            .lock()
            .expect("freshness lock poisoned")
            .clear();
        self.names
            .write()
            .expect("registration lock poisoned")
            .clear();
    }
}
