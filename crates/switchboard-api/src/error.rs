use thiserror::Error;

/// Top-level error type for the `switchboard-api` crate.
///
/// Covers every failure mode across all transport surfaces: HTTP pulls,
/// the RPC push socket, and the multicast listener. `switchboard-core`
/// renders these into per-device offline reasons.
#[derive(Debug, Error)]
pub enum Error {
    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Device answered with a non-success HTTP status.
    #[error("Device returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// Request timed out.
    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    // ── Push socket ─────────────────────────────────────────────────
    /// Socket connection failed.
    #[error("Socket connection failed: {0}")]
    SocketConnect(String),

    /// Connection dropped while a call was in flight.
    #[error("Socket closed")]
    SocketClosed,

    /// Call issued against a socket that never connected.
    #[error("Socket not connected")]
    NotConnected,

    /// Structured error object in an RPC response.
    #[error("RPC error {code}: {message}")]
    Rpc { code: i32, message: String },

    // ── Data ────────────────────────────────────────────────────────
    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },

    /// Push notification frame that could not be parsed.
    #[error("Bad notification: {0}")]
    Notification(String),

    // ── Multicast ───────────────────────────────────────────────────
    /// Multicast listener setup or socket failure.
    #[error("Multicast error: {0}")]
    Multicast(String),
}

impl Error {
    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect(),
            Self::Timeout { .. } => true,
            Self::SocketConnect(_) | Self::SocketClosed => true,
            _ => false,
        }
    }
}
