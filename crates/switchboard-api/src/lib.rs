// switchboard-api: wire-level transports for smart relay fleets
// (capability probe, Gen1 HTTP, RPC push sockets, CoIoT multicast)

pub mod coiot;
pub mod error;
pub mod gen1;
pub mod notify;
pub mod probe;
pub mod rpc;
pub mod transport;

pub use error::Error;

// ── Primary re-exports ──────────────────────────────────────────────
pub use coiot::{CoiotConfig, CoiotListener, CoiotStatus, StatusCallback};
pub use gen1::Gen1Client;
pub use notify::StatusNotification;
pub use probe::{DeviceIdentity, DeviceProbe};
pub use rpc::{
    NotificationHandler, ReconnectConfig, RpcRequest, RpcSocket, SocketConfig, SocketState,
    StateHandler,
};
pub use transport::HttpConfig;
