// Shared transport configuration for building reqwest::Client instances.
//
// The probe and the Gen1 client share timeout settings through this
// module, avoiding duplicated builder logic. The devices speak plain
// HTTP on the local network, so there is no TLS configuration here.

use std::time::Duration;

use url::Url;

use crate::error::Error;

/// Shared transport configuration for building HTTP clients.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Per-request timeout. Relay controllers answer LAN requests in
    /// milliseconds; anything slower is effectively unreachable.
    pub timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
        }
    }
}

impl HttpConfig {
    /// Build a `reqwest::Client` from this config.
    pub fn build_client(&self) -> Result<reqwest::Client, Error> {
        reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent("switchboard/0.1.0")
            .build()
            .map_err(Error::Transport)
    }
}

/// Build an `http://{address}{path}` URL for a device endpoint.
///
/// `address` is a host or `host:port`; the scheme is always plain HTTP.
pub(crate) fn device_url(address: &str, path: &str) -> Result<Url, Error> {
    Url::parse(&format!("http://{address}{path}")).map_err(Error::InvalidUrl)
}
