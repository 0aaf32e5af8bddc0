//! CoIoT multicast listener.
//!
//! First-generation relays broadcast status over CoIoT: CoAP-framed
//! datagrams on the `224.0.1.187:5683` multicast group. Each packet
//! carries the device identity in CoAP option 3332 and a JSON status
//! payload after the payload marker. Listening is far cheaper than
//! polling, so consumers use these broadcasts to suppress redundant
//! pulls.
//!
//! Only the fields this crate consumes are decoded; undecodable
//! datagrams are dropped with a trace log.

use std::net::Ipv4Addr;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::Error;

/// CoAP option carrying the device identity triplet
/// (`"{model}#{id}#{version}"`).
const OPTION_DEVICE_ID: u16 = 3332;

/// Separator between the CoAP option list and the payload.
const PAYLOAD_MARKER: u8 = 0xFF;

const DEFAULT_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 1, 187);
const DEFAULT_PORT: u16 = 5683;
const RECV_BUFFER_SIZE: usize = 8192;

// ── Configuration ────────────────────────────────────────────────────

/// Multicast group settings.
#[derive(Debug, Clone)]
pub struct CoiotConfig {
    /// Group the devices announce on. Default: `224.0.1.187`.
    pub group: Ipv4Addr,

    /// UDP port (the CoAP default). Default: `5683`.
    pub port: u16,
}

impl Default for CoiotConfig {
    fn default() -> Self {
        Self {
            group: DEFAULT_GROUP,
            port: DEFAULT_PORT,
        }
    }
}

// ── Status callback ──────────────────────────────────────────────────

/// A decoded status broadcast.
#[derive(Debug, Clone)]
pub struct CoiotStatus {
    /// Device identifier from the CoAP options. Falls back to the sender
    /// address when the announcement lacks one.
    pub source: String,

    /// Decoded JSON payload.
    pub payload: Value,
}

/// Callback invoked per decoded broadcast.
///
/// Runs on the listener's internal task and must not block.
pub type StatusCallback = Arc<dyn Fn(CoiotStatus) + Send + Sync>;

// ── CoiotListener ────────────────────────────────────────────────────

/// Listens for CoIoT status broadcasts on the multicast group.
///
/// Cheaply cloneable. Install a callback with
/// [`on_status`](Self::on_status), then [`start`](Self::start); the
/// socket is bound and joined inline so setup failures surface to the
/// caller, and a background task reads datagrams until
/// [`stop`](Self::stop).
#[derive(Clone)]
pub struct CoiotListener {
    inner: Arc<ListenerInner>,
}

struct ListenerInner {
    config: CoiotConfig,
    callback: RwLock<Option<StatusCallback>>,
    cancel: CancellationToken,
}

impl CoiotListener {
    pub fn new(config: CoiotConfig) -> Self {
        Self {
            inner: Arc::new(ListenerInner {
                config,
                callback: RwLock::new(None),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Install the status callback, replacing any previous one.
    pub fn on_status(&self, callback: StatusCallback) {
        *self.inner.callback.write().expect("callback lock poisoned") = Some(callback);
    }

    /// Bind the socket, join the multicast group, and spawn the read task.
    pub async fn start(&self) -> Result<(), Error> {
        let config = &self.inner.config;

        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, config.port))
            .await
            .map_err(|e| Error::Multicast(format!("bind on port {} failed: {e}", config.port)))?;
        socket
            .join_multicast_v4(config.group, Ipv4Addr::UNSPECIFIED)
            .map_err(|e| Error::Multicast(format!("joining {} failed: {e}", config.group)))?;

        debug!(group = %config.group, port = config.port, "multicast listener started");

        let listener = self.clone();
        tokio::spawn(async move {
            listener.read_loop(socket).await;
        });
        Ok(())
    }

    /// Stop the read task. Non-blocking and idempotent.
    pub fn stop(&self) {
        self.inner.cancel.cancel();
    }

    async fn read_loop(&self, socket: UdpSocket) {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];

        loop {
            tokio::select! {
                biased;
                _ = self.inner.cancel.cancelled() => break,
                received = socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, addr)) => match decode_datagram(&buf[..len]) {
                            Ok((device_id, payload)) => {
                                let source =
                                    device_id.unwrap_or_else(|| addr.ip().to_string());
                                trace!(source = %source, "status broadcast");
                                let callback = self
                                    .inner
                                    .callback
                                    .read()
                                    .expect("callback lock poisoned")
                                    .clone();
                                if let Some(callback) = callback {
                                    callback(CoiotStatus { source, payload });
                                }
                            }
                            Err(e) => {
                                trace!(error = %e, from = %addr, "dropping undecodable datagram");
                            }
                        },
                        Err(e) => {
                            // Usually a transient ICMP-induced error; keep listening.
                            warn!(error = %e, "multicast receive failed");
                        }
                    }
                }
            }
        }

        debug!("multicast listener stopped");
    }
}

// ── Datagram decoding ────────────────────────────────────────────────

/// Decode one CoIoT datagram into `(device id, payload)`.
///
/// Walks the CoAP option list for option 3332 and parses everything
/// after the payload marker as JSON. The CoAP code and message id are
/// irrelevant for status broadcasts and are skipped.
fn decode_datagram(datagram: &[u8]) -> Result<(Option<String>, Value), Error> {
    if datagram.len() < 4 {
        return Err(Error::Multicast("datagram shorter than CoAP header".into()));
    }

    let token_len = usize::from(datagram[0] & 0x0F);
    let mut pos = 4 + token_len;
    if pos > datagram.len() {
        return Err(Error::Multicast("token length exceeds datagram".into()));
    }

    let mut option_number: u16 = 0;
    let mut device_id = None;

    while pos < datagram.len() {
        let byte = datagram[pos];
        if byte == PAYLOAD_MARKER {
            pos += 1;
            break;
        }
        pos += 1;

        let delta = decode_option_nibble(u16::from(byte >> 4), datagram, &mut pos)?;
        let length = usize::from(decode_option_nibble(u16::from(byte & 0x0F), datagram, &mut pos)?);

        option_number = option_number.saturating_add(delta);

        let end = pos + length;
        if end > datagram.len() {
            return Err(Error::Multicast("option length exceeds datagram".into()));
        }
        if option_number == OPTION_DEVICE_ID {
            device_id = parse_device_id(&String::from_utf8_lossy(&datagram[pos..end]));
        }
        pos = end;
    }

    if pos >= datagram.len() {
        return Err(Error::Multicast("no payload after options".into()));
    }

    let payload = serde_json::from_slice(&datagram[pos..])
        .map_err(|e| Error::Multicast(format!("payload is not JSON: {e}")))?;

    Ok((device_id, payload))
}

/// Decode a CoAP option delta/length nibble, consuming extension bytes
/// for the 13/14 extended forms.
fn decode_option_nibble(nibble: u16, datagram: &[u8], pos: &mut usize) -> Result<u16, Error> {
    match nibble {
        13 => {
            let byte = *datagram
                .get(*pos)
                .ok_or_else(|| Error::Multicast("truncated extended option".into()))?;
            *pos += 1;
            Ok(u16::from(byte) + 13)
        }
        14 => {
            let bytes = datagram
                .get(*pos..*pos + 2)
                .ok_or_else(|| Error::Multicast("truncated extended option".into()))?;
            *pos += 2;
            Ok(((u16::from(bytes[0]) << 8) | u16::from(bytes[1])).saturating_add(269))
        }
        15 => Err(Error::Multicast("reserved option nibble 15".into())),
        n => Ok(n),
    }
}

/// Extract the stable id from the identity triplet
/// (`"{model}#{id}#{version}"`).
fn parse_device_id(value: &str) -> Option<String> {
    let mut parts = value.split('#');
    let _model = parts.next()?;
    let id = parts.next()?;
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

// ── Tests ────────────────────────────────────────────────────────────
