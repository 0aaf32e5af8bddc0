// ── Connection registry ──────────────────────────────────────────────
//
// Arena-style ownership of per-device connection state. One locked map
// holds every record; records enter on connect and leave on remove or
// shutdown. No raw map access escapes this module, so the
// one-record-per-name invariant and the debounce rule live in exactly
// one place.
//
// Lock discipline: hold the write lock only for map mutation. Teardown
// of whatever a removed record owns (tokens, sockets) is the caller's
// job, outside the lock, as is publishing any resulting events.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, RwLock};

use tokio_util::sync::CancellationToken;

use crate::model::{ConnectionInfo, Generation, Transport};
use crate::transport::PushSocket;

/// Everything the orchestrator tracks for one connected device.
pub(crate) struct ConnectionRecord {
    pub name: String,
    pub address: String,
    pub generation: Generation,
    pub transport: Transport,
    /// Debounce state: the last reachability value actually published.
    pub online: bool,
    /// Multicast key this device announces under, if registered.
    pub coiot_key: Option<String>,
    /// Child token cancelling this record's background work.
    pub cancel: CancellationToken,
    /// Push socket handle for teardown (push records only).
    pub socket: Option<Arc<dyn PushSocket>>,
}

/// Outcome of a debounced reachability update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum OnlineTransition {
    /// The state flipped; the caller should publish. Carries the
    /// record's address for online events.
    Changed { address: String },
    /// Already in the requested state; stay quiet.
    Unchanged,
    /// No record under that name (likely being torn down concurrently).
    Missing,
}

pub(crate) struct ConnectionRegistry {
    records: RwLock<HashMap<String, ConnectionRecord>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a record. Refuses to overwrite: returns `false` and
    /// leaves the map untouched if the name is already present.
    pub fn insert(&self, record: ConnectionRecord) -> bool {
        let mut records = self.records.write().expect("registry lock poisoned");
        match records.entry(record.name.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(record);
                true
            }
        }
    }

    /// Remove and return a record. The caller tears it down outside the
    /// lock.
    pub fn remove(&self, name: &str) -> Option<ConnectionRecord> {
        self.records
            .write()
            .expect("registry lock poisoned")
            .remove(name)
    }

    /// Remove and return every record, for shutdown.
    pub fn drain(&self) -> Vec<ConnectionRecord> {
        let mut records = self.records.write().expect("registry lock poisoned");
        records.drain().map(|(_, record)| record).collect()
    }

    /// Debounced reachability update. The caller publishes an event
    /// only on [`OnlineTransition::Changed`].
    pub fn set_online(&self, name: &str, online: bool) -> OnlineTransition {
        let mut records = self.records.write().expect("registry lock poisoned");
        match records.get_mut(name) {
            None => OnlineTransition::Missing,
            Some(record) if record.online == online => OnlineTransition::Unchanged,
            Some(record) => {
                record.online = online;
                OnlineTransition::Changed {
                    address: record.address.clone(),
                }
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.records
            .read()
            .expect("registry lock poisoned")
            .contains_key(name)
    }

    /// Names with a live record, sorted for stable output.
    pub fn connected_devices(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .records
            .read()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn connection_info(&self, name: &str) -> Option<ConnectionInfo> {
        self.records
            .read()
            .expect("registry lock poisoned")
            .get(name)
            .map(|record| ConnectionInfo {
                transport: record.transport,
                generation: record.generation,
            })
    }

    pub fn all_connection_info(&self) -> HashMap<String, ConnectionInfo> {
        self.records
            .read()
            .expect("registry lock poisoned")
            .iter()
            .map(|(name, record)| {
                (
                    name.clone(),
                    ConnectionInfo {
                        transport: record.transport,
                        generation: record.generation,
                    },
                )
            })
            .collect()
    }

    /// The multicast key registered for `name`, if any.
    pub fn coiot_key(&self, name: &str) -> Option<String> {
        self.records
            .read()
            .expect("registry lock poisoned")
            .get(name)
            .and_then(|record| record.coiot_key.clone())
    }

    /// Attach a multicast key to an existing record. Returns `false`
    /// when no record exists yet.
    pub fn set_coiot_key(&self, name: &str, key: &str) -> bool {
        let mut records = self.records.write().expect("registry lock poisoned");
        match records.get_mut(name) {
            Some(record) => {
                record.coiot_key = Some(key.to_string());
                true
            }
            None => false,
        }
    }
}
