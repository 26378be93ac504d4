//! Error handling for the realtime channel.
//!
//! Nothing in this subsystem is fatal to the process. Configuration errors are
//! recovered locally via fallback defaults, protocol errors keep the link
//! alive, transport closure triggers the automatic retry loop, and handler
//! panics are isolated per dispatch. `RealtimeError` exists so the failure
//! modes can still be logged, matched on, and surfaced in tests.

use std::time::Duration;

use thiserror::Error;

/// The unified error type for realtime channel operations.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// Configuration validation failed.
    ///
    /// Only surfaced by explicit validation; `Config::from_env` logs the
    /// failure and falls back to defaults instead of returning this.
    #[error("configuration error: {0}")]
    Config(#[from] validator::ValidationErrors),

    /// The WebSocket transport failed (DNS, TCP, TLS, or WebSocket-level).
    ///
    /// Treated as transport closure by the connection kernel: status moves to
    /// `Disconnected` and the fixed-delay retry loop takes over.
    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    /// The broker sent a frame the codec could not parse, or an ERROR frame.
    ///
    /// Logged by the kernel without changing connection status.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The connection closed, with the closure reason when known.
    #[error("connection closed: {0}")]
    Closed(String),

    /// The broker never completed the session handshake in time.
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RealtimeError::Protocol("missing destination header".into());
        assert_eq!(err.to_string(), "protocol error: missing destination header");

        let err = RealtimeError::Closed("broker went away".into());
        assert_eq!(err.to_string(), "connection closed: broker went away");
    }

    #[test]
    fn test_handshake_timeout_display() {
        let err = RealtimeError::HandshakeTimeout(Duration::from_secs(10));
        assert!(err.to_string().contains("10s"));
    }

    #[test]
    fn test_error_is_std_error() {
        let err: Box<dyn std::error::Error> = Box::new(RealtimeError::Protocol("x".into()));
        assert!(err.to_string().contains("x"));
    }
}
