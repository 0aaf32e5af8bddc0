// ── Core error types ─────────────────────────────────────────────────
//
// Construction-time misuse is the only hard failure the orchestrator
// surfaces. Runtime transport failures are per-device conditions and
// reach consumers as `DeviceOffline` events on the bus, never as
// errors.

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The fleet configuration is unusable as given.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Two configured devices share a name.
    #[error("Duplicate device name: {name}")]
    DuplicateDevice { name: String },
}
