// Capability probe
//
// Every relay generation answers `GET /shelly` unauthenticated, so one
// request is enough to classify a device. First-generation firmware
// predates the `gen` field; its absence means generation 1.

use serde::Deserialize;
use tracing::debug;

use crate::error::Error;
use crate::transport::{HttpConfig, device_url};

/// Identity block served at `GET /shelly`.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceIdentity {
    /// Hardware generation. First-generation firmware omits the field.
    #[serde(default = "default_generation")]
    pub r#gen: u8,

    /// Stable device id, e.g. `"shellyplus1-a8032ab12345"`. Gen2+ only.
    #[serde(default)]
    pub id: Option<String>,

    /// Model code. Gen2+ serves it as `model`, Gen1 as `type`.
    #[serde(default, alias = "type")]
    pub model: Option<String>,

    /// MAC address, present on every generation.
    #[serde(default)]
    pub mac: Option<String>,

    /// Whether requests require authentication (`auth_en` on Gen2+,
    /// `auth` on Gen1).
    #[serde(default, alias = "auth")]
    pub auth_en: bool,
}

fn default_generation() -> u8 {
    1
}

/// Probes devices for their hardware generation and identity.
pub struct DeviceProbe {
    http: reqwest::Client,
}

impl DeviceProbe {
    /// Create a probe from shared transport configuration.
    pub fn new(config: &HttpConfig) -> Result<Self, Error> {
        Ok(Self {
            http: config.build_client()?,
        })
    }

    /// Create a probe with a pre-built `reqwest::Client`.
    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// Fetch the identity block from `http://{address}/shelly`.
    pub async fn identify(&self, address: &str) -> Result<DeviceIdentity, Error> {
        let url = device_url(address, "/shelly")?;
        debug!(%url, "probing device");

        let resp = self.http.get(url).send().await.map_err(Error::Transport)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Status {
                status: status.as_u16(),
                body: body[..body.len().min(200)].to_string(),
            });
        }

        let body = resp.text().await.map_err(Error::Transport)?;
        let identity: DeviceIdentity = serde_json::from_str(&body).map_err(|e| {
            let preview = &body[..body.len().min(200)];
            Error::Deserialization {
                message: format!("{e} (body preview: {preview:?})"),
                body: body.clone(),
            }
        })?;

        debug!(
            address,
            gen = identity.r#gen,
            model = identity.model.as_deref().unwrap_or("unknown"),
            "device identified"
        );
        Ok(identity)
    }
}
