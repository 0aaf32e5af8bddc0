// ── Fleet configuration ──────────────────────────────────────────────
//
// Describes what to supervise and on what cadence. Carries no
// credentials and never touches disk; the embedding application
// constructs a `FleetConfig` however it likes and hands it in.

use std::time::Duration;

use crate::model::Device;

/// Default pull interval for first-generation devices.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Default CoIoT announcement period (the devices' factory setting).
pub const DEFAULT_COIOT_PERIOD: Duration = Duration::from_secs(15);

/// Configuration for one device fleet.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    /// Devices to supervise.
    pub devices: Vec<Device>,
    /// Pull interval for polled devices.
    pub poll_interval: Duration,
    /// Period between CoIoT announcements on the local network.
    pub coiot_period: Duration,
    /// Whether to listen for CoIoT multicast broadcasts at all.
    pub multicast_enabled: bool,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            coiot_period: DEFAULT_COIOT_PERIOD,
            multicast_enabled: true,
        }
    }
}

impl FleetConfig {
    /// Window after a broadcast during which a pull is redundant.
    ///
    /// Twice the announcement period, so one lost broadcast is
    /// tolerated before polling resumes.
    pub fn freshness_window(&self) -> Duration {
        self.coiot_period * 2
    }
}
