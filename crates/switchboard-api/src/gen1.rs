// First-generation HTTP client
//
// Gen1 relays expose their full state as plain JSON documents at
// `/status` and `/settings`. There is no envelope to unwrap -- the
// response body is the payload.

use serde_json::Value;
use tracing::debug;

use crate::error::Error;
use crate::transport::{HttpConfig, device_url};

/// HTTP client for first-generation relay endpoints.
pub struct Gen1Client {
    http: reqwest::Client,
}

impl Gen1Client {
    /// Create a client from shared transport configuration.
    pub fn new(config: &HttpConfig) -> Result<Self, Error> {
        Ok(Self {
            http: config.build_client()?,
        })
    }

    /// Create a client with a pre-built `reqwest::Client`.
    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// Fetch the live status document (`GET /status`).
    pub async fn status(&self, address: &str) -> Result<Value, Error> {
        self.get_json(address, "/status").await
    }

    /// Fetch the settings document (`GET /settings`).
    ///
    /// Settings carry the device name and the CoIoT announcement config,
    /// which status documents do not.
    pub async fn settings(&self, address: &str) -> Result<Value, Error> {
        self.get_json(address, "/settings").await
    }

    async fn get_json(&self, address: &str, path: &str) -> Result<Value, Error> {
        let url = device_url(address, path)?;
        debug!("GET {url}");

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
        serde_json::from_str(&body).map_err(|e| {
            let preview = &body[..body.len().min(200)];
            Error::Deserialization {
                message: format!("{e} (body preview: {preview:?})"),
                body: body.clone(),
            }
        })
    }
}
