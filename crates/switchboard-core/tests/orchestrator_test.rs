#![allow(clippy::unwrap_used)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tokio::time::advance;

use switchboard_api::rpc::{NotificationHandler, RpcRequest, SocketState, StateHandler};
use switchboard_api::{CoiotStatus, Error, StatusCallback};
use switchboard_core::model::{
    Device, Event, EventFilter, EventKind, Generation, StatusSource, Transport,
};
use switchboard_core::transport::{
    CapabilityResolver, FrameParser, Gen1StatusFetch, PushSocket, PushSocketFactory,
    StatusListener, Transports,
};
use switchboard_core::{CoreError, DeviceOrchestrator, FleetConfig};

// ── Fakes ────────────────────────────────────────────────────────────

/// Maps addresses to probed generation numbers; unlisted addresses are
/// unreachable.
struct FakeResolver {
    generations: HashMap<String, u8>,
}

impl FakeResolver {
    fn new(entries: &[(&str, u8)]) -> Arc<Self> {
        Arc::new(Self {
            generations: entries
                .iter()
                .map(|(address, r#gen)| (address.to_string(), *r#gen))
                .collect(),
        })
    }
}

#[async_trait]
impl CapabilityResolver for FakeResolver {
    async fn resolve_generation(&self, address: &str) -> Result<Generation, Error> {
        self.generations
            .get(address)
            .map(|r#gen| Generation::from_probe(*r#gen))
            .ok_or(Error::Timeout { timeout_secs: 10 })
    }
}

/// Counts pulls and serves a canned payload, or fails while marked
/// unreachable.
struct FakeGen1 {
    pulls: AtomicUsize,
    reachable: RwLock<bool>,
}

impl FakeGen1 {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            pulls: AtomicUsize::new(0),
            reachable: RwLock::new(true),
        })
    }

    fn pull_count(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    fn set_reachable(&self, up: bool) {
        *self.reachable.write().unwrap() = up;
    }
}

#[async_trait]
impl Gen1StatusFetch for FakeGen1 {
    async fn fetch_status(&self, _address: &str) -> Result<Value, Error> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        if *self.reachable.read().unwrap() {
            Ok(json!({"relays": [{"ison": true}]}))
        } else {
            Err(Error::Timeout { timeout_secs: 10 })
        }
    }
}

/// Scripted push socket. Captures the installed handlers so tests can
/// drive state transitions and frames the way a live socket would.
struct FakeSocket {
    connect_result: Mutex<Option<Error>>,
    /// Whether a successful connect reports `Connected` immediately.
    announce: bool,
    state_handler: RwLock<Option<StateHandler>>,
    notification_handler: RwLock<Option<NotificationHandler>>,
    close_calls: AtomicUsize,
    status_payload: Value,
}

impl FakeSocket {
    fn healthy() -> Arc<Self> {
        Arc::new(Self {
            connect_result: Mutex::new(None),
            announce: true,
            state_handler: RwLock::new(None),
            notification_handler: RwLock::new(None),
            close_calls: AtomicUsize::new(0),
            status_payload: json!({"switch:0": {"output": false}}),
        })
    }

    /// Connects fine but stays silent until the test emits states.
    fn quiet() -> Arc<Self> {
        Arc::new(Self {
            connect_result: Mutex::new(None),
            announce: false,
            state_handler: RwLock::new(None),
            notification_handler: RwLock::new(None),
            close_calls: AtomicUsize::new(0),
            status_payload: json!({}),
        })
    }

    fn failing(error: Error) -> Arc<Self> {
        let socket = Self::healthy();
        *socket.connect_result.lock().unwrap() = Some(error);
        socket
    }

    /// Drive the captured state handler, as the socket's task would.
    fn emit_state(&self, state: SocketState) {
        if let Some(handler) = self.state_handler.read().unwrap().clone() {
            handler(state);
        }
    }

    /// Feed one raw frame through the captured notification handler.
    fn emit_frame(&self, raw: &str) {
        if let Some(handler) = self.notification_handler.read().unwrap().clone() {
            handler(raw);
        }
    }

    fn close_count(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PushSocket for FakeSocket {
    async fn connect(&self) -> Result<(), Error> {
        match self.connect_result.lock().unwrap().take() {
            Some(error) => Err(error),
            None => {
                if self.announce {
                    self.emit_state(SocketState::Connected);
                }
                Ok(())
            }
        }
    }

    fn subscribe(&self, handler: NotificationHandler) {
        *self.notification_handler.write().unwrap() = Some(handler);
    }

    async fn call(&self, _request: RpcRequest) -> Result<Value, Error> {
        Ok(self.status_payload.clone())
    }

    fn on_state_change(&self, handler: StateHandler) {
        *self.state_handler.write().unwrap() = Some(handler);
    }

    fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// Hands out pre-staged fake sockets by device name.
struct FakeSocketFactory {
    sockets: Mutex<HashMap<String, Arc<FakeSocket>>>,
}

impl FakeSocketFactory {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sockets: Mutex::new(HashMap::new()),
        })
    }

    fn stage(&self, name: &str, socket: Arc<FakeSocket>) {
        self.sockets.lock().unwrap().insert(name.to_string(), socket);
    }
}

impl PushSocketFactory for FakeSocketFactory {
    fn open(&self, name: &str, _address: &str) -> Result<Arc<dyn PushSocket>, Error> {
        let socket = self
            .sockets
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::SocketConnect(format!("no socket staged for {name}")))?;
        Ok(socket)
    }
}

/// Captures the ingestion callback so tests can inject broadcasts.
struct FakeListener {
    callback: RwLock<Option<StatusCallback>>,
    started: AtomicUsize,
    stopped: AtomicUsize,
}

impl FakeListener {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            callback: RwLock::new(None),
            started: AtomicUsize::new(0),
            stopped: AtomicUsize::new(0),
        })
    }

    /// Inject one broadcast, as the listener's read loop would.
    fn broadcast(&self, key: &str, payload: Value) {
        if let Some(callback) = self.callback.read().unwrap().clone() {
            callback(CoiotStatus {
                source: key.to_string(),
                payload,
            });
        }
    }
}

#[async_trait]
impl StatusListener for FakeListener {
    async fn start(&self) -> Result<(), Error> {
        self.started.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }

    fn on_status(&self, callback: StatusCallback) {
        *self.callback.write().unwrap() = Some(callback);
    }
}

// ── Fixture ──────────────────────────────────────────────────────────

struct Fixture {
    orchestrator: DeviceOrchestrator,
    gen1: Arc<FakeGen1>,
    factory: Arc<FakeSocketFactory>,
    listener: Arc<FakeListener>,
    events: Arc<Mutex<Vec<Event>>>,
}

impl Fixture {
    fn captured(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn captured_of(&self, kind: EventKind) -> Vec<Event> {
        self.captured()
            .into_iter()
            .filter(|event| event.kind() == kind)
            .collect()
    }
}

fn fixture(devices: Vec<Device>, resolver: Arc<FakeResolver>) -> Fixture {
    let gen1 = FakeGen1::new();
    let factory = FakeSocketFactory::new();
    let listener = FakeListener::new();

    let transports = Transports {
        resolver,
        gen1: gen1.clone(),
        sockets: factory.clone(),
        parser: Arc::new(FrameParser),
        multicast: Some(listener.clone()),
    };

    let config = FleetConfig {
        devices,
        ..FleetConfig::default()
    };
    let orchestrator = DeviceOrchestrator::new(config, transports).unwrap();

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    orchestrator.subscribe(Box::new(move |event| {
        sink.lock().unwrap().push(event.clone());
    }));

    Fixture {
        orchestrator,
        gen1,
        factory,
        listener,
        events,
    }
}

/// Let spawned connection attempts run to completion.
async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

// ── Lifecycle ────────────────────────────────────────────────────────

#[tokio::test]
async fn start_connects_mixed_generations() {
    let resolver = FakeResolver::new(&[("10.0.0.5", 1), ("10.0.0.6", 2)]);
    let fx = fixture(
        vec![
            Device::new("legacy", "10.0.0.5"),
            Device::new("modern", "10.0.0.6"),
        ],
        resolver,
    );
    fx.factory.stage("modern", FakeSocket::healthy());

    fx.orchestrator.start().await;

    assert_eq!(
        fx.orchestrator.connected_devices(),
        vec!["legacy".to_string(), "modern".to_string()]
    );

    let legacy = fx.orchestrator.connection_info("legacy").unwrap();
    assert_eq!(legacy.transport, Transport::Poll);
    assert_eq!(legacy.generation, Generation::Gen1);

    let modern = fx.orchestrator.connection_info("modern").unwrap();
    assert_eq!(modern.transport, Transport::PushSocket);
    assert_eq!(modern.generation, Generation::Gen2Plus(2));

    let all = fx.orchestrator.all_connection_info();
    assert_eq!(all.len(), 2);

    // The connect primed subscribers with one pushed full status.
    let pushed: Vec<Event> = fx
        .captured_of(EventKind::FullStatus)
        .into_iter()
        .filter(|event| {
            matches!(
                event,
                Event::FullStatus {
                    source: StatusSource::PushSocket,
                    ..
                }
            )
        })
        .collect();
    assert_eq!(pushed.len(), 1);

    fx.orchestrator.stop().await;
}

#[tokio::test]
async fn second_start_is_a_no_op() {
    let resolver = FakeResolver::new(&[("10.0.0.6", 2)]);
    let fx = fixture(vec![Device::new("modern", "10.0.0.6")], resolver);
    fx.factory.stage("modern", FakeSocket::healthy());

    fx.orchestrator.start().await;
    fx.orchestrator.start().await;

    assert_eq!(fx.orchestrator.connected_devices().len(), 1);
    assert_eq!(fx.listener.started.load(Ordering::SeqCst), 1);

    fx.orchestrator.stop().await;
}

#[tokio::test]
async fn stop_tears_everything_down() {
    let resolver = FakeResolver::new(&[("10.0.0.5", 1), ("10.0.0.6", 2)]);
    let fx = fixture(
        vec![
            Device::new("legacy", "10.0.0.5"),
            Device::new("modern", "10.0.0.6"),
        ],
        resolver,
    );
    let socket = FakeSocket::healthy();
    fx.factory.stage("modern", socket.clone());

    fx.orchestrator.start().await;
    fx.orchestrator.stop().await;

    assert!(fx.orchestrator.connected_devices().is_empty());
    assert!(!fx.orchestrator.is_connected("modern"));
    assert_eq!(socket.close_count(), 1);
    assert_eq!(fx.listener.stopped.load(Ordering::SeqCst), 1);

    // Publishing after stop is a silent no-op.
    let before = fx.captured().len();
    fx.orchestrator.publish(Event::DeviceOffline {
        name: "modern".to_string(),
        reason: "late".to_string(),
    });
    assert_eq!(fx.captured().len(), before);
}

#[tokio::test]
async fn duplicate_configured_names_fail_construction() {
    let transports = Transports {
        resolver: FakeResolver::new(&[]),
        gen1: FakeGen1::new(),
        sockets: FakeSocketFactory::new(),
        parser: Arc::new(FrameParser),
        multicast: None,
    };
    let config = FleetConfig {
        devices: vec![
            Device::new("twin", "10.0.0.5"),
            Device::new("twin", "10.0.0.6"),
        ],
        ..FleetConfig::default()
    };

    assert!(matches!(
        DeviceOrchestrator::new(config, transports),
        Err(CoreError::DuplicateDevice { name }) if name == "twin"
    ));
}

// ── Debounce ─────────────────────────────────────────────────────────

#[tokio::test]
async fn repeated_connected_reports_publish_one_online() {
    let resolver = FakeResolver::new(&[("10.0.0.6", 2)]);
    let fx = fixture(vec![Device::new("modern", "10.0.0.6")], resolver);
    let socket = FakeSocket::healthy();
    fx.factory.stage("modern", socket.clone());

    fx.orchestrator.start().await;
    socket.emit_state(SocketState::Connected);
    socket.emit_state(SocketState::Connected);

    assert_eq!(fx.captured_of(EventKind::DeviceOnline).len(), 1);

    fx.orchestrator.stop().await;
}

#[tokio::test]
async fn disconnect_before_any_online_stays_quiet() {
    let resolver = FakeResolver::new(&[("10.0.0.6", 2)]);
    let fx = fixture(vec![Device::new("modern", "10.0.0.6")], resolver);
    let socket = FakeSocket::quiet();
    fx.factory.stage("modern", socket.clone());

    fx.orchestrator.start().await;

    socket.emit_state(SocketState::Disconnected {
        reason: "handshake reset".to_string(),
    });
    assert!(fx.captured_of(EventKind::DeviceOffline).is_empty());

    // A real drop after a real connect publishes exactly one of each.
    socket.emit_state(SocketState::Connected);
    socket.emit_state(SocketState::Disconnected {
        reason: "connection reset".to_string(),
    });
    socket.emit_state(SocketState::Connected);

    assert_eq!(fx.captured_of(EventKind::DeviceOnline).len(), 2);
    assert_eq!(fx.captured_of(EventKind::DeviceOffline).len(), 1);

    fx.orchestrator.stop().await;
}

// ── Polling ──────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn fresh_broadcasts_suppress_pulls() {
    let resolver = FakeResolver::new(&[("10.0.0.5", 1)]);
    let fx = fixture(vec![Device::new("legacy", "10.0.0.5")], resolver);

    fx.orchestrator.register_coiot_device("legacy", "68C63A");
    fx.orchestrator.start().await;

    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(fx.gen1.pull_count(), 1); // immediate first pull

    advance(Duration::from_secs(5)).await;
    fx.listener
        .broadcast("68C63A", json!({"relays": [{"ison": true}]}));

    // Pulls due at 10s, 20s and 30s all fall inside the 30s freshness
    // window opened by the broadcast...
    advance(Duration::from_secs(25)).await;
    tokio::task::yield_now().await;
    assert_eq!(fx.gen1.pull_count(), 1);

    // ...and the pull due at 40s is past it.
    advance(Duration::from_secs(10)).await;
    tokio::task::yield_now().await;
    assert_eq!(fx.gen1.pull_count(), 2);

    // The broadcast itself surfaced as a locally sourced status.
    let statuses = fx.captured_of(EventKind::FullStatus);
    assert!(statuses.iter().any(|event| {
        matches!(
            event,
            Event::FullStatus {
                name,
                source: StatusSource::Local,
                ..
            } if name == "legacy"
        )
    }));

    fx.orchestrator.stop().await;
}

#[tokio::test(start_paused = true)]
async fn pull_failures_debounce_offline() {
    let resolver = FakeResolver::new(&[("10.0.0.5", 1)]);
    let fx = fixture(vec![Device::new("legacy", "10.0.0.5")], resolver);

    fx.orchestrator.start().await;
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(fx.captured_of(EventKind::DeviceOnline).len(), 1);

    fx.gen1.set_reachable(false);
    advance(Duration::from_secs(10)).await;
    tokio::task::yield_now().await;
    assert_eq!(fx.captured_of(EventKind::DeviceOffline).len(), 1);

    // Staying unreachable stays quiet.
    advance(Duration::from_secs(10)).await;
    tokio::task::yield_now().await;
    assert_eq!(fx.captured_of(EventKind::DeviceOffline).len(), 1);

    fx.gen1.set_reachable(true);
    advance(Duration::from_secs(10)).await;
    tokio::task::yield_now().await;
    assert_eq!(fx.captured_of(EventKind::DeviceOnline).len(), 2);
    assert_eq!(fx.gen1.pull_count(), 4);

    fx.orchestrator.stop().await;
}

// ── Multicast ingestion ──────────────────────────────────────────────

#[tokio::test]
async fn unregistered_broadcast_keys_are_dropped() {
    let resolver = FakeResolver::new(&[]);
    let fx = fixture(Vec::new(), resolver);
    fx.orchestrator.start().await;

    fx.listener
        .broadcast("E09806", json!({"relays": [{"ison": false}]}));
    assert!(fx.captured().is_empty());

    fx.orchestrator.register_coiot_device("plug", "E09806");
    fx.listener
        .broadcast("E09806", json!({"relays": [{"ison": false}]}));

    let statuses = fx.captured_of(EventKind::FullStatus);
    assert_eq!(statuses.len(), 1);
    match &statuses[0] {
        Event::FullStatus { name, source, .. } => {
            assert_eq!(name, "plug");
            assert_eq!(*source, StatusSource::Local);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    fx.orchestrator.stop().await;
}

// ── Failure isolation ────────────────────────────────────────────────

#[tokio::test]
async fn unreachable_device_does_not_block_siblings() {
    let resolver = FakeResolver::new(&[("10.0.0.6", 2)]);
    let fx = fixture(
        vec![
            Device::new("ghost", "10.0.0.9"),
            Device::new("modern", "10.0.0.6"),
        ],
        resolver,
    );
    fx.factory.stage("modern", FakeSocket::healthy());

    fx.orchestrator.start().await;

    assert_eq!(
        fx.orchestrator.connected_devices(),
        vec!["modern".to_string()]
    );

    let offline = fx.captured_of(EventKind::DeviceOffline);
    assert_eq!(offline.len(), 1);
    match &offline[0] {
        Event::DeviceOffline { name, reason } => {
            assert_eq!(name, "ghost");
            assert!(reason.starts_with("unreachable"));
        }
        other => panic!("unexpected event: {other:?}"),
    }

    fx.orchestrator.stop().await;
}

#[tokio::test]
async fn failed_socket_connect_leaves_no_record() {
    let resolver = FakeResolver::new(&[("10.0.0.6", 2)]);
    let fx = fixture(vec![Device::new("modern", "10.0.0.6")], resolver);
    let socket = FakeSocket::failing(Error::SocketConnect("connection refused".to_string()));
    fx.factory.stage("modern", socket.clone());

    fx.orchestrator.start().await;

    assert!(!fx.orchestrator.is_connected("modern"));
    assert_eq!(socket.close_count(), 1);

    let offline = fx.captured_of(EventKind::DeviceOffline);
    assert_eq!(offline.len(), 1);

    fx.orchestrator.stop().await;
}

// ── Runtime add and remove ───────────────────────────────────────────

#[tokio::test]
async fn add_device_connects_and_is_idempotent() {
    let resolver = FakeResolver::new(&[("10.0.0.7", 2)]);
    let fx = fixture(Vec::new(), resolver);
    let socket = FakeSocket::healthy();
    fx.factory.stage("late", socket.clone());

    fx.orchestrator.start().await;
    fx.orchestrator.add_device("late", "10.0.0.7");
    settle().await;

    assert!(fx.orchestrator.is_connected("late"));

    // Same name again: no second attempt, no second record.
    fx.orchestrator.add_device("late", "10.0.0.99");
    settle().await;
    assert_eq!(fx.orchestrator.connected_devices().len(), 1);
    assert_eq!(fx.captured_of(EventKind::DeviceOnline).len(), 1);

    fx.orchestrator.remove_device("late");
    assert!(!fx.orchestrator.is_connected("late"));
    assert_eq!(socket.close_count(), 1);

    // Removing an absent name is a safe no-op.
    fx.orchestrator.remove_device("late");
    assert_eq!(socket.close_count(), 1);

    fx.orchestrator.stop().await;
}

// ── Push notifications ───────────────────────────────────────────────

#[tokio::test]
async fn push_notifications_surface_as_status_events() {
    let resolver = FakeResolver::new(&[("10.0.0.6", 2)]);
    let fx = fixture(vec![Device::new("modern", "10.0.0.6")], resolver);
    let socket = FakeSocket::healthy();
    fx.factory.stage("modern", socket.clone());

    let modern_only = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&modern_only);
    fx.orchestrator.subscribe_filtered(
        EventFilter::ForDevice("modern".to_string()),
        Box::new(move |event| {
            sink.lock().unwrap().push(event.clone());
        }),
    );

    fx.orchestrator.start().await;

    socket.emit_frame(
        &json!({
            "src": "shellyplus1-a8032ab12345",
            "dst": "switchboard",
            "method": "NotifyStatus",
            "params": {"switch:0": {"apower": 12.3}}
        })
        .to_string(),
    );
    socket.emit_frame("{ not json");
    socket.emit_frame(&json!({"id": 7, "src": "dev", "result": {}}).to_string());

    // Prime plus one notification; the junk and the call response were
    // dropped.
    let statuses = fx.captured_of(EventKind::FullStatus);
    assert_eq!(statuses.len(), 2);
    assert!(statuses.iter().all(|event| event.device() == "modern"));

    assert!(!modern_only.lock().unwrap().is_empty());

    fx.orchestrator.stop().await;
}
