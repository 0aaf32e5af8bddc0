//! Transport seams between the orchestrator and the wire.
//!
//! The orchestrator drives these traits and nothing else, so tests can
//! substitute in-memory implementations and the wire clients stay
//! swappable. Production wiring lives in [`Transports::new`].

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use url::Url;

use switchboard_api::rpc::{NotificationHandler, RpcRequest, SocketConfig, StateHandler};
use switchboard_api::{
    CoiotConfig, CoiotListener, DeviceProbe, Error, Gen1Client, HttpConfig, RpcSocket,
    StatusCallback, notify,
};

use crate::model::{Event, Generation, StatusSource};

// ── Seams ────────────────────────────────────────────────────────────

/// Resolves which hardware generation a device runs.
#[async_trait]
pub trait CapabilityResolver: Send + Sync {
    /// Probe `address`. An error means the device is unreachable, not
    /// that resolution is unsupported.
    async fn resolve_generation(&self, address: &str) -> Result<Generation, Error>;
}

/// Pull-style status fetch for first-generation devices.
#[async_trait]
pub trait Gen1StatusFetch: Send + Sync {
    async fn fetch_status(&self, address: &str) -> Result<Value, Error>;
}

/// One device's push socket.
#[async_trait]
pub trait PushSocket: Send + Sync {
    /// Dial the device. Handlers must be installed first.
    async fn connect(&self) -> Result<(), Error>;

    /// Install the raw notification handler.
    fn subscribe(&self, handler: NotificationHandler);

    /// Issue an RPC call and await its response.
    async fn call(&self, request: RpcRequest) -> Result<Value, Error>;

    /// Install the connection state handler.
    fn on_state_change(&self, handler: StateHandler);

    /// Tear the socket down. Non-blocking and idempotent.
    fn close(&self);
}

/// Creates unconnected push sockets.
pub trait PushSocketFactory: Send + Sync {
    fn open(&self, name: &str, address: &str) -> Result<Arc<dyn PushSocket>, Error>;
}

/// Pure classification and parsing of raw push frames.
pub trait NotificationParser: Send + Sync {
    /// Whether `raw` is a notification rather than a call response.
    fn is_notification(&self, raw: &str) -> bool;

    /// Parse a notification frame into zero or more events.
    fn parse(&self, device: &str, raw: &str) -> Result<Vec<Event>, Error>;
}

/// The multicast status listener.
#[async_trait]
pub trait StatusListener: Send + Sync {
    async fn start(&self) -> Result<(), Error>;
    fn stop(&self);
    fn on_status(&self, callback: StatusCallback);
}

/// Bundle of transports the orchestrator drives.
#[derive(Clone)]
pub struct Transports {
    pub resolver: Arc<dyn CapabilityResolver>,
    pub gen1: Arc<dyn Gen1StatusFetch>,
    pub sockets: Arc<dyn PushSocketFactory>,
    pub parser: Arc<dyn NotificationParser>,
    /// `None` disables multicast assist entirely.
    pub multicast: Option<Arc<dyn StatusListener>>,
}

impl Transports {
    /// Production wiring: `/shelly` probe, Gen1 HTTP client, RPC
    /// sockets, frame parser, and the CoIoT listener.
    pub fn new(
        http: &HttpConfig,
        sockets: SocketConfig,
        coiot: CoiotConfig,
    ) -> Result<Self, Error> {
        Ok(Self {
            resolver: Arc::new(ProbeResolver::new(http)?),
            gen1: Arc::new(Gen1Fetcher::new(http)?),
            sockets: Arc::new(RpcSocketFactory::new(sockets)),
            parser: Arc::new(FrameParser),
            multicast: Some(Arc::new(CoiotListener::new(coiot))),
        })
    }
}

// ── Production implementations ───────────────────────────────────────

/// [`CapabilityResolver`] over the `/shelly` identity probe.
pub struct ProbeResolver {
    probe: DeviceProbe,
}

impl ProbeResolver {
    pub fn new(config: &HttpConfig) -> Result<Self, Error> {
        Ok(Self {
            probe: DeviceProbe::new(config)?,
        })
    }
}

#[async_trait]
impl CapabilityResolver for ProbeResolver {
    async fn resolve_generation(&self, address: &str) -> Result<Generation, Error> {
        let identity = self.probe.identify(address).await?;
        Ok(Generation::from_probe(identity.r#gen))
    }
}

/// [`Gen1StatusFetch`] over the Gen1 HTTP client.
pub struct Gen1Fetcher {
    client: Gen1Client,
}

impl Gen1Fetcher {
    pub fn new(config: &HttpConfig) -> Result<Self, Error> {
        Ok(Self {
            client: Gen1Client::new(config)?,
        })
    }
}

#[async_trait]
impl Gen1StatusFetch for Gen1Fetcher {
    async fn fetch_status(&self, address: &str) -> Result<Value, Error> {
        self.client.status(address).await
    }
}

#[async_trait]
impl PushSocket for RpcSocket {
    async fn connect(&self) -> Result<(), Error> {
        RpcSocket::connect(self).await
    }

    fn subscribe(&self, handler: NotificationHandler) {
        RpcSocket::subscribe(self, handler);
    }

    async fn call(&self, request: RpcRequest) -> Result<Value, Error> {
        RpcSocket::call(self, request).await
    }

    fn on_state_change(&self, handler: StateHandler) {
        RpcSocket::on_state_change(self, handler);
    }

    fn close(&self) {
        RpcSocket::close(self);
    }
}

/// [`PushSocketFactory`] dialing `ws://{address}/rpc`.
pub struct RpcSocketFactory {
    config: SocketConfig,
}

impl RpcSocketFactory {
    pub fn new(config: SocketConfig) -> Self {
        Self { config }
    }
}

impl PushSocketFactory for RpcSocketFactory {
    fn open(&self, name: &str, address: &str) -> Result<Arc<dyn PushSocket>, Error> {
        let url = Url::parse(&format!("ws://{address}/rpc"))?;
        let mut config = self.config.clone();
        // One client id per device keeps notification routing
        // unambiguous when several sockets share a process.
        config.client_id = format!("{}-{name}", self.config.client_id);
        Ok(Arc::new(RpcSocket::new(url, config)))
    }
}

/// [`NotificationParser`] over the push frame parser.
pub struct FrameParser;

impl NotificationParser for FrameParser {
    fn is_notification(&self, raw: &str) -> bool {
        notify::is_notification(raw)
    }

    fn parse(&self, device: &str, raw: &str) -> Result<Vec<Event>, Error> {
        let updates = notify::parse_frame(device, raw)?;
        Ok(updates
            .into_iter()
            .map(|update| Event::FullStatus {
                name: update.device,
                payload: update.payload,
                source: StatusSource::PushSocket,
            })
            .collect())
    }
}

#[async_trait]
impl StatusListener for CoiotListener {
    async fn start(&self) -> Result<(), Error> {
        CoiotListener::start(self).await
    }

    fn stop(&self) {
        CoiotListener::stop(self);
    }

    fn on_status(&self, callback: StatusCallback) {
        CoiotListener::on_status(self, callback);
    }
}
