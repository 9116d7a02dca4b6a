use thiserror::Error;

/// Errors that can escape the core's public boundary.
///
/// Per-request failures (peer resets, malformed HTTP, timeouts, admission
/// refusals, allocation failures) never reach here -- they are absorbed by
/// the connection state machine and counted in [`crate::stats`]. Only
/// construction-time and configuration failures are returned as `Result`.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("address-space reservation failed: {0}")]
    Reservation(String),

    #[error("listener setup failed on {host}:{port}: {reason}")]
    Listen {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("protocol invariant violated: {0}")]
    ProtocolBreak(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
