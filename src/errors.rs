//! Typed error hierarchy for the gateway core.
//!
//! Synchronous operations (`connect`, `send_text`, `send_file`) return
//! [`GatewayError`] directly to their caller. Event-driven failures
//! (a bad upstream payload, a failed credential save) are never returned
//! anywhere — they are folded into [`crate::status::StatusSnapshot::last_error`]
//! using the same string vocabulary so logs and `status()` agree.

use std::fmt;

/// Errors surfaced synchronously by [`crate::runtime::GatewayRuntime`].
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The JID does not end in `@s.whatsapp.net` or `@lid`.
    #[error("invalid_jid")]
    InvalidJid,

    /// The file path for an outbound document could not be read.
    #[error("invalid_file_path")]
    InvalidFilePath,

    /// Outbound text was empty after normalization.
    #[error("empty_text")]
    EmptyText,

    /// No transport socket is currently installed.
    #[error("not_connected")]
    NotConnected,

    /// The transport driver rejected an operation.
    #[error("transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),

    /// An I/O failure occurred outside the transport boundary (e.g. reading
    /// a document to send, or repairing credentials).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Returned to a caller that joined an in-progress `Connect` which went
    /// on to fail; the original error was already recorded in `last_error`
    /// by the leader.
    #[error("joined connect attempt failed: {0}")]
    ConnectFailed(String),
}

/// The coarse failure category a [`GatewayError`] or a recorded `last_error`
/// belongs to, used by operators deciding whether an incident needs a human.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Recorded in `last_error`, retried or superseded by the next event.
    Transient,
    /// Surfaced synchronously; the caller passed something invalid.
    Configuration,
    /// Disconnect code 401: reconnect is suppressed until a human re-pairs.
    AuthFatal,
    /// QR generation limit reached: reconnect is suppressed until `Connect`.
    PairingExhausted,
}

impl GatewayError {
    /// Classify this error for operator-facing diagnostics.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidJid | Self::InvalidFilePath | Self::EmptyText => ErrorKind::Configuration,
            Self::NotConnected | Self::Transport(_) | Self::Io(_) | Self::ConnectFailed(_) => ErrorKind::Transient,
        }
    }
}

/// The fixed vocabulary of `last_error` strings recorded by the runtime for
/// event-driven failures that are never returned to a caller.
pub mod last_error {
    /// A registered `creds.update` save callback failed.
    pub const SAVE_CREDS_FAILED: &str = "save_creds_failed";
    /// QR generation count would exceed the configured limit.
    pub const QR_GENERATION_LIMIT_REACHED: &str = "qr_generation_limit_reached";
    /// A partial credential file was quarantined before reconnect.
    pub const PARTIAL_CREDS_RESET: &str = "partial_creds_reset";
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Transient => "transient",
            Self::Configuration => "configuration",
            Self::AuthFatal => "auth_fatal",
            Self::PairingExhausted => "pairing_exhausted",
        };
        f.write_str(s)
    }
}
