// Push notification classification and parsing.
//
// Notification frames share the socket with RPC responses; the only
// structural difference is that notifications carry a `method` field
// and no `id`. Parsing is pure so it can run on the socket task.

use serde::Deserialize;
use serde_json::Value;
use tracing::trace;

use crate::error::Error;

#[derive(Debug, Deserialize)]
struct NotificationFrame {
    method: String,
    #[serde(default)]
    params: Option<Value>,
}

/// A status update extracted from a push notification.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusNotification {
    /// Fleet name of the device the socket belongs to. Frames carry the
    /// device's own id in `src`, not the fleet name, so the caller
    /// supplies it.
    pub device: String,

    /// Status payload: a delta for `NotifyStatus`, the complete document
    /// for `NotifyFullStatus`.
    pub payload: Value,

    /// Whether the payload is a complete snapshot.
    pub full: bool,
}

/// Whether a raw socket frame is a push notification (as opposed to an
/// RPC response). Notifications carry a `method` field.
pub fn is_notification(raw: &str) -> bool {
    serde_json::from_str::<Value>(raw)
        .ok()
        .is_some_and(|value| value.get("method").is_some())
}

/// Parse one notification frame into status updates.
///
/// `NotifyStatus` and `NotifyFullStatus` yield exactly one update.
/// `NotifyEvent` frames carry button/input edges with no status payload
/// and yield none. Unknown methods and malformed frames are errors.
pub fn parse_frame(device: &str, raw: &str) -> Result<Vec<StatusNotification>, Error> {
    let frame: NotificationFrame = serde_json::from_str(raw)
        .map_err(|e| Error::Notification(format!("malformed frame: {e}")))?;

    match frame.method.as_str() {
        "NotifyStatus" | "NotifyFullStatus" => {
            let payload = frame
                .params
                .ok_or_else(|| Error::Notification(format!("{} without params", frame.method)))?;
            Ok(vec![StatusNotification {
                device: device.to_string(),
                payload,
                full: frame.method == "NotifyFullStatus",
            }])
        }
        "NotifyEvent" => {
            trace!(device, "event notification carries no status, skipping");
            Ok(Vec::new())
        }
        other => Err(Error::Notification(format!("unknown method {other:?}"))),
    }
}
