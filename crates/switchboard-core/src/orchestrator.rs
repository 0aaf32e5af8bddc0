//! The device orchestrator: one object supervising a whole fleet.
//!
//! [`DeviceOrchestrator`] resolves each configured device's hardware
//! generation, establishes the right transport (push socket for Gen2+,
//! polling with multicast assist for Gen1), and turns everything the
//! transports report into debounced [`Event`]s on the bus.
//!
//! ```rust,ignore
//! let transports = Transports::new(
//!     &HttpConfig::default(),
//!     SocketConfig::default(),
//!     CoiotConfig::default(),
//! )?;
//! let orchestrator = DeviceOrchestrator::new(config, transports)?;
//! orchestrator.subscribe(Box::new(|event| println!("{event:?}")));
//! orchestrator.start().await;
//! // ...
//! orchestrator.stop().await;
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use switchboard_api::CoiotStatus;
use switchboard_api::rpc::{NotificationHandler, RpcRequest, SocketState, StateHandler};

use crate::bus::{EventBus, EventHandler};
use crate::coiot::CoiotTracker;
use crate::config::FleetConfig;
use crate::error::CoreError;
use crate::model::{ConnectionInfo, Event, EventFilter, Generation, StatusSource, Transport};
use crate::poller::{PollContext, poll_device};
use crate::registry::{ConnectionRecord, ConnectionRegistry, OnlineTransition};
use crate::transport::Transports;

// ── DeviceOrchestrator ───────────────────────────────────────────────

/// Supervises a fleet of mixed-generation devices.
///
/// Cheaply cloneable; all clones share one fleet. Construction
/// validates, [`start`](Self::start) connects, [`stop`](Self::stop)
/// tears everything down. After construction nothing here returns an
/// error: per-device failures surface as [`Event::DeviceOffline`].
#[derive(Clone)]
pub struct DeviceOrchestrator {
    inner: Arc<OrchestratorInner>,
}

struct OrchestratorInner {
    config: FleetConfig,
    registry: Arc<ConnectionRegistry>,
    tracker: Arc<CoiotTracker>,
    bus: Arc<EventBus>,
    transports: Transports,
    /// Root token; every record's token is a child of this one.
    cancel: CancellationToken,
    poll_tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl DeviceOrchestrator {
    /// Build an orchestrator from configuration. Does not connect
    /// anything; call [`start`](Self::start) for that.
    ///
    /// Validation failures here are the only hard errors this type
    /// produces.
    pub fn new(config: FleetConfig, transports: Transports) -> Result<Self, CoreError> {
        validate(&config)?;
        Ok(Self {
            inner: Arc::new(OrchestratorInner {
                config,
                registry: Arc::new(ConnectionRegistry::new()),
                tracker: Arc::new(CoiotTracker::new()),
                bus: Arc::new(EventBus::new()),
                transports,
                cancel: CancellationToken::new(),
                poll_tasks: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
            }),
        })
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Connect every configured device.
    ///
    /// Fans out one connection attempt per device and returns once all
    /// attempts have settled, so registry queries are deterministic
    /// immediately afterwards. Attempt failures become
    /// [`Event::DeviceOffline`], never errors. Starting twice is a
    /// logged no-op.
    pub async fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            warn!("orchestrator already started");
            return;
        }

        self.start_multicast().await;

        let mut attempts = Vec::new();
        for device in &self.inner.config.devices {
            let orchestrator = self.clone();
            let name = device.name.clone();
            let address = device.address.clone();
            attempts.push(tokio::spawn(async move {
                orchestrator.connect_device(name, address).await;
            }));
        }

        for attempt in attempts {
            let _ = attempt.await;
        }

        info!(
            devices = self.inner.config.devices.len(),
            connected = self.inner.registry.connected_devices().len(),
            "fleet started"
        );
    }

    /// Stop everything, in dependency order: cancel background work,
    /// join the pollers, stop the multicast listener, tear down every
    /// record, then close the bus last so teardown-window events still
    /// reach subscribers.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();

        let mut tasks = self.inner.poll_tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
        drop(tasks);

        if let Some(listener) = &self.inner.transports.multicast {
            listener.stop();
        }

        for record in self.inner.registry.drain() {
            record.cancel.cancel();
            if let Some(socket) = &record.socket {
                socket.close();
            }
        }
        self.inner.tracker.clear();

        self.inner.bus.close();
        debug!("fleet stopped");
    }

    // ── Device management ────────────────────────────────────────────

    /// Connect one more device at runtime. Idempotent: a name that
    /// already has a record is a no-op. The attempt runs in the
    /// background; observe its outcome through events or registry
    /// queries.
    pub fn add_device(&self, name: impl Into<String>, address: impl Into<String>) {
        let name = name.into();
        let address = address.into();

        if self.inner.registry.contains(&name) {
            debug!(device = %name, "device already connected, ignoring add");
            return;
        }

        let orchestrator = self.clone();
        tokio::spawn(async move {
            orchestrator.connect_device(name, address).await;
        });
    }

    /// Disconnect one device and drop its record. Unknown names are a
    /// safe no-op. Teardown happens outside the registry lock.
    pub fn remove_device(&self, name: &str) {
        let Some(record) = self.inner.registry.remove(name) else {
            debug!(device = %name, "remove for unknown device, ignoring");
            return;
        };

        record.cancel.cancel();
        if let Some(socket) = &record.socket {
            socket.close();
        }
        self.inner.tracker.forget_device(name);
        debug!(device = %name, "device removed");
    }

    /// Register the multicast key a device announces under. Broadcasts
    /// for `key` then count as push freshness for `name` and surface as
    /// [`Event::FullStatus`].
    pub fn register_coiot_device(&self, name: &str, key: &str) {
        self.inner.tracker.register(name, key);
        if !self.inner.registry.set_coiot_key(name, key) {
            debug!(device = %name, "multicast key registered before the device connected");
        }
    }

    // ── Registry queries ─────────────────────────────────────────────

    /// Whether a record exists for `name` (a connection still being
    /// established counts).
    pub fn is_connected(&self, name: &str) -> bool {
        self.inner.registry.contains(name)
    }

    /// Names with a live record, sorted.
    pub fn connected_devices(&self) -> Vec<String> {
        self.inner.registry.connected_devices()
    }

    pub fn connection_info(&self, name: &str) -> Option<ConnectionInfo> {
        self.inner.registry.connection_info(name)
    }

    pub fn all_connection_info(&self) -> HashMap<String, ConnectionInfo> {
        self.inner.registry.all_connection_info()
    }

    // ── Bus surface ──────────────────────────────────────────────────

    /// Subscribe to every event.
    pub fn subscribe(&self, handler: EventHandler) {
        self.inner.bus.subscribe(handler);
    }

    /// Subscribe to events matching `filter`.
    pub fn subscribe_filtered(&self, filter: EventFilter, handler: EventHandler) {
        self.inner.bus.subscribe_filtered(filter, handler);
    }

    /// Publish an event to all subscribers. No-op once stopped.
    pub fn publish(&self, event: Event) {
        self.inner.bus.publish(&event);
    }

    // ── Connection attempts ──────────────────────────────────────────

    async fn connect_device(&self, name: String, address: String) {
        if self.inner.cancel.is_cancelled() {
            return;
        }

        let generation = match self
            .inner
            .transports
            .resolver
            .resolve_generation(&address)
            .await
        {
            Ok(generation) => generation,
            Err(e) => {
                warn!(device = %name, error = %e, "generation resolution failed");
                self.publish(Event::DeviceOffline {
                    name,
                    reason: format!("unreachable: {e}"),
                });
                return;
            }
        };

        debug!(device = %name, generation = generation.number(), "device resolved");

        if generation.supports_push() {
            self.connect_push(name, address, generation).await;
        } else {
            self.connect_poll(name, address).await;
        }
    }

    /// Register a Gen1 device and spawn its poller.
    async fn connect_poll(&self, name: String, address: String) {
        let cancel = self.inner.cancel.child_token();
        let record = ConnectionRecord {
            name: name.clone(),
            address: address.clone(),
            generation: Generation::Gen1,
            transport: Transport::Poll,
            online: false,
            // A registration may predate the connect; pick it up.
            coiot_key: self.inner.tracker.key_for(&name),
            cancel: cancel.clone(),
            socket: None,
        };

        if !self.inner.registry.insert(record) {
            debug!(device = %name, "record already present, dropping duplicate attempt");
            return;
        }

        let ctx = PollContext {
            name,
            address,
            registry: Arc::clone(&self.inner.registry),
            tracker: Arc::clone(&self.inner.tracker),
            bus: Arc::clone(&self.inner.bus),
            fetcher: Arc::clone(&self.inner.transports.gen1),
            interval: self.inner.config.poll_interval,
            freshness_window: self.inner.config.freshness_window(),
        };

        let task = tokio::spawn(poll_device(ctx, cancel));
        self.inner.poll_tasks.lock().await.push(task);
    }

    /// Open, wire up, register, and connect a push socket.
    async fn connect_push(&self, name: String, address: String, generation: Generation) {
        let socket = match self.inner.transports.sockets.open(&name, &address) {
            Ok(socket) => socket,
            Err(e) => {
                warn!(device = %name, error = %e, "socket open failed");
                self.publish(Event::DeviceOffline {
                    name,
                    reason: format!("socket open failed: {e}"),
                });
                return;
            }
        };

        socket.on_state_change(self.state_handler(&name));
        socket.subscribe(self.notification_handler(&name));

        // Pre-register so the record is visible (and removable) while
        // the connect is still in flight.
        let record = ConnectionRecord {
            name: name.clone(),
            address: address.clone(),
            generation,
            transport: Transport::PushSocket,
            online: false,
            coiot_key: self.inner.tracker.key_for(&name),
            cancel: self.inner.cancel.child_token(),
            socket: Some(Arc::clone(&socket)),
        };

        if !self.inner.registry.insert(record) {
            debug!(device = %name, "record already present, dropping duplicate attempt");
            socket.close();
            return;
        }

        if let Err(e) = socket.connect().await {
            warn!(device = %name, error = %e, "socket connect failed");
            if let Some(record) = self.inner.registry.remove(&name) {
                record.cancel.cancel();
            }
            socket.close();
            self.publish(Event::DeviceOffline {
                name,
                reason: format!("connect failed: {e}"),
            });
            return;
        }

        // Prime subscribers with one full status. Losing it is
        // non-fatal; pushes will refresh shortly.
        match socket.call(RpcRequest::status()).await {
            Ok(payload) => {
                self.publish(Event::FullStatus {
                    name,
                    payload,
                    source: StatusSource::PushSocket,
                });
            }
            Err(e) => {
                warn!(device = %name, error = %e, "status prime failed");
            }
        }
    }

    // ── Socket callbacks ─────────────────────────────────────────────

    /// Translate socket state transitions into debounced events.
    fn state_handler(&self, name: &str) -> StateHandler {
        let orchestrator = self.clone();
        let name = name.to_string();
        Arc::new(move |state| match state {
            SocketState::Connected => {
                if let OnlineTransition::Changed { address } =
                    orchestrator.inner.registry.set_online(&name, true)
                {
                    orchestrator.publish(Event::DeviceOnline {
                        name: name.clone(),
                        address,
                    });
                }
            }
            SocketState::Disconnected { reason } => {
                if let OnlineTransition::Changed { .. } =
                    orchestrator.inner.registry.set_online(&name, false)
                {
                    orchestrator.publish(Event::DeviceOffline {
                        name: name.clone(),
                        reason,
                    });
                }
            }
            other => debug!(device = %name, state = ?other, "socket state"),
        })
    }

    /// Parse raw push frames and publish the resulting events.
    fn notification_handler(&self, name: &str) -> NotificationHandler {
        let orchestrator = self.clone();
        let name = name.to_string();
        Arc::new(move |raw: &str| {
            let parser = &orchestrator.inner.transports.parser;
            if !parser.is_notification(raw) {
                return;
            }
            match parser.parse(&name, raw) {
                Ok(events) => {
                    for event in events {
                        orchestrator.publish(event);
                    }
                }
                Err(e) => debug!(device = %name, error = %e, "dropping bad notification"),
            }
        })
    }

    // ── Multicast ingestion ──────────────────────────────────────────

    /// Install the ingestion callback and start the multicast listener.
    /// A listener that fails to start degrades the fleet to pure
    /// polling, with a warning.
    async fn start_multicast(&self) {
        if !self.inner.config.multicast_enabled {
            debug!("multicast assist disabled");
            return;
        }
        let Some(listener) = &self.inner.transports.multicast else {
            debug!("no multicast listener wired");
            return;
        };

        let orchestrator = self.clone();
        listener.on_status(Arc::new(move |status| {
            let CoiotStatus { source, payload } = status;
            orchestrator.ingest_broadcast(&source, payload);
        }));

        if let Err(e) = listener.start().await {
            warn!(error = %e, "multicast listener failed to start, polling only");
        }
    }

    /// One multicast broadcast: stamp freshness first, then publish for
    /// registered keys. Keys nobody registered are dropped; a broadcast
    /// is not proof the device belongs to this fleet.
    fn ingest_broadcast(&self, key: &str, payload: serde_json::Value) {
        self.inner.tracker.mark_seen(key);

        match self.inner.tracker.resolve(key) {
            Some(name) => {
                self.publish(Event::FullStatus {
                    name,
                    payload,
                    source: StatusSource::Local,
                });
            }
            None => trace!(key, "broadcast from unregistered key, dropping"),
        }
    }
}

// ── Validation ───────────────────────────────────────────────────────

fn validate(config: &FleetConfig) -> Result<(), CoreError> {
    if config.poll_interval.is_zero() {
        return Err(CoreError::Config {
            message: "poll_interval must be non-zero".into(),
        });
    }
    if config.coiot_period.is_zero() {
        return Err(CoreError::Config {
            message: "coiot_period must be non-zero".into(),
        });
    }

    let mut seen = HashSet::new();
    for device in &config.devices {
        if device.name.is_empty() {
            return Err(CoreError::Config {
                message: "device name must not be empty".into(),
            });
        }
        if device.address.is_empty() {
            return Err(CoreError::Config {
                message: format!("device {:?} has an empty address", device.name),
            });
        }
        if !seen.insert(device.name.as_str()) {
            return Err(CoreError::DuplicateDevice {
                name: device.name.clone(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use crate::model::Device;

    use super::*;

    fn config(devices: Vec<Device>) -> FleetConfig {
        FleetConfig {
            devices,
            ..FleetConfig::default()
        }
    }

    #[test]
    fn validation_accepts_a_sane_fleet() {
        let devices = vec![
            Device::new("kitchen", "10.0.0.5"),
            Device::new("garage", "10.0.0.6"),
        ];
        assert!(validate(&config(devices)).is_ok());
    }

    #[test]
    fn validation_rejects_duplicate_names() {
        let devices = vec![
            Device::new("kitchen", "10.0.0.5"),
            Device::new("kitchen", "10.0.0.6"),
        ];
        assert!(matches!(
            validate(&config(devices)),
            Err(CoreError::DuplicateDevice { name }) if name == "kitchen"
        ));
    }

    #[test]
    fn validation_rejects_empty_fields() {
        assert!(validate(&config(vec![Device::new("", "10.0.0.5")])).is_err());
        assert!(validate(&config(vec![Device::new("kitchen", "")])).is_err());
    }

    #[test]
    fn validation_rejects_zero_intervals() {
        let zero = FleetConfig {
            poll_interval: Duration::ZERO,
            ..FleetConfig::default()
        };
        assert!(matches!(validate(&zero), Err(CoreError::Config { .. })));
    }
}
