//! Connection status tracking for the realtime channel.
//!
//! The status is published through a `tokio::sync::watch` channel by the
//! connection kernel, so any number of consumers (a status indicator in the
//! dashboard shell, log hooks, tests) can observe transitions reactively.

use std::fmt;

/// The current state of the broker connection.
///
/// The lifecycle flows through these states:
/// - `Connecting` -> `Connected` (handshake completed)
/// - `Connected` -> `Disconnected` (transport closed or network failure)
/// - `Disconnected` -> `Connecting` (fixed-delay retry fired)
///
/// Transitions are driven exclusively by the connection kernel. Protocol-level
/// errors (malformed frames, broker ERROR frames) are logged and do not change
/// the status; only full transport closure does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Actively attempting to establish a connection to the broker.
    Connecting,

    /// Connected with an active session; subscriptions are live.
    Connected,

    /// Connection lost or torn down. A retry is pending unless the
    /// multiplexer was stopped.
    Disconnected,
}

impl ConnectionStatus {
    /// Short static identifier for logging and UI display.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
        }
    }

    /// True only while subscriptions are actually attached broker-side.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
