// switchboard-core: fleet orchestration over switchboard-api transports
// (connection supervision, debounced events, filtered pub/sub)

pub mod bus;
pub mod config;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod transport;

mod coiot;
mod poller;
mod registry;

pub use error::CoreError;

// ── Primary re-exports ──────────────────────────────────────────────
pub use bus::{EventBus, EventHandler};
pub use config::FleetConfig;
pub use model::{
    ConnectionInfo, Device, Event, EventFilter, EventKind, Generation, StatusSource, Transport,
};
pub use orchestrator::DeviceOrchestrator;
pub use transport::Transports;
