// RPC frame types
//
// Wire shapes for the JSON-RPC 2.0 dialect modern relays speak over
// their websocket endpoint. Requests carry a numeric `id` and a `src`
// client identifier; the device echoes both back on the response.

use serde::Deserialize;
use serde_json::Value;

// ── Requests ─────────────────────────────────────────────────────────

/// An RPC request under construction: method plus optional params.
///
/// The socket assigns the frame id and `src` at send time, so the same
/// request value can be reused across calls and devices.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    pub method: String,
    pub params: Option<Value>,
}

impl RpcRequest {
    /// Build a request for an arbitrary method.
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }

    /// The full-status fetch (`Shelly.GetStatus`), also used to prime a
    /// fresh push subscription.
    pub fn status() -> Self {
        Self::new("Shelly.GetStatus", None)
    }

    /// Serialize into a wire frame with the given id and client identifier.
    pub(crate) fn to_wire(&self, id: u64, src: &str) -> String {
        let mut frame = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "src": src,
            "method": self.method,
        });
        if let Some(params) = &self.params {
            frame["params"] = params.clone();
        }
        frame.to_string()
    }
}

// ── Responses ────────────────────────────────────────────────────────

/// Incoming frame envelope. Responses carry `id` plus `result` or
/// `error`; notifications carry `method` and no `id`.
#[derive(Debug, Deserialize)]
pub(crate) struct RpcEnvelope {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcErrorBody>,
}

/// Error object inside a response frame.
#[derive(Debug, Deserialize)]
pub(crate) struct RpcErrorBody {
    pub code: i32,
    pub message: String,
}
