//! Error types for the gateway.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Gateway error kinds.
///
/// Propagation discipline: adapters never raise past the poller boundary
/// (transport and protocol failures degrade to bad-quality samples or a
/// disconnect-and-backoff), pollers never raise past the runtime, and
/// client handlers isolate per-connection errors.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Configuration file I/O, JSON parse, or validation failure.
    ///
    /// Surfaced to the caller; a failed load or update never leaves the
    /// server half-bound.
    #[error("config error: {0}")]
    Config(String),

    /// Connect, read, or write failure on an adapter transport.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed protocol-level response from a device.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Malformed line or JSON request from a TCP client.
    #[error("client request error: {0}")]
    ClientRequest(String),

    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Shorthand for a config error with a formatted message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Shorthand for a transport error with a formatted message.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = GatewayError::config("missing file");
        assert_eq!(e.to_string(), "config error: missing file");

        let e = GatewayError::Protocol("short frame".into());
        assert_eq!(e.to_string(), "protocol error: short frame");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let e: GatewayError = io.into();
        assert!(matches!(e, GatewayError::Io(_)));
    }
}
