//! Configuration for the realtime channel.
//!
//! The only environment-provided setting is the API base URL shared with the
//! REST client. The broker endpoint is derived from it by swapping the HTTP(S)
//! scheme for its WS(S) equivalent and appending the `/ws` path segment.
//! Absent or unparsable configuration falls back to a local default without
//! raising an error, so `RealtimeManager::start` can never fail on config.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;
use validator::Validate;

use crate::error::RealtimeError;

/// Environment variable holding the API base URL (e.g. `https://api.example.com`).
pub const ENV_API_BASE_URL: &str = "FLEETLINK_API_BASE_URL";

/// Broker endpoint used when configuration is absent or malformed.
pub const DEFAULT_ENDPOINT: &str = "ws://localhost:8080/ws";

/// Path segment appended to the derived broker URL.
const WS_PATH: &str = "/ws";

/// Settings for the realtime channel.
///
/// Deserializable so it can be embedded in a larger application config file,
/// and validated with the same constraints style as the rest of the stack.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    /// HTTP(S) base URL of the backend. The broker endpoint is derived from
    /// it; an empty or invalid value means [`DEFAULT_ENDPOINT`] is used.
    #[validate(length(max = 2048, message = "API base URL must not exceed 2048 characters"))]
    pub api_base_url: String,

    /// Fixed delay between reconnection attempts, in seconds.
    ///
    /// There is no backoff growth and no retry cap: this is an interactive
    /// dashboard channel expected to eventually recover.
    #[validate(range(min = 1, max = 60, message = "Retry delay must be between 1 and 60 seconds"))]
    pub retry_delay_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            api_base_url: "http://localhost:8080".to_string(),
            retry_delay_secs: 5,
        }
    }
}

impl Config {
    /// Builds a configuration from the environment.
    ///
    /// Reads [`ENV_API_BASE_URL`]; a missing variable or a value that fails
    /// validation falls back to defaults with a warning. Never fails.
    pub fn from_env() -> Self {
        let config = match std::env::var(ENV_API_BASE_URL) {
            Ok(value) => Config {
                api_base_url: value,
                ..Config::default()
            },
            Err(_) => Config::default(),
        };

        match config.validate() {
            Ok(()) => config,
            Err(e) => {
                warn!("Invalid realtime configuration, using defaults: {e}");
                Config::default()
            }
        }
    }

    /// Validates the configuration, consuming and returning it on success.
    ///
    /// For callers embedding the config in a larger file-driven setup that
    /// prefers failing fast over silent fallback.
    pub fn validated(self) -> Result<Self, RealtimeError> {
        self.validate()?;
        Ok(self)
    }

    /// Derives the broker WebSocket endpoint from the configured base URL.
    pub fn endpoint(&self) -> String {
        resolve_endpoint(&self.api_base_url)
    }

    /// The fixed delay between reconnection attempts.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

/// Derives the broker endpoint from an HTTP(S) base URL.
///
/// `http` maps to `ws`, `https` to `wss`; host and port are preserved and the
/// `/ws` path replaces whatever path the base URL carried. Already-websocket
/// schemes pass through. Anything else falls back to [`DEFAULT_ENDPOINT`]
/// with a warning.
pub fn resolve_endpoint(base: &str) -> String {
    let trimmed = base.trim();
    if trimmed.is_empty() {
        warn!("API base URL is empty, falling back to {DEFAULT_ENDPOINT}");
        return DEFAULT_ENDPOINT.to_string();
    }

    let parsed = match Url::parse(trimmed) {
        Ok(url) => url,
        Err(e) => {
            warn!("Invalid API base URL {trimmed:?} ({e}), falling back to {DEFAULT_ENDPOINT}");
            return DEFAULT_ENDPOINT.to_string();
        }
    };

    let scheme = match parsed.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            warn!("Unsupported API base URL scheme {other:?}, falling back to {DEFAULT_ENDPOINT}");
            return DEFAULT_ENDPOINT.to_string();
        }
    };

    let host = match parsed.host_str() {
        Some(host) => host,
        None => {
            warn!("API base URL {trimmed:?} has no host, falling back to {DEFAULT_ENDPOINT}");
            return DEFAULT_ENDPOINT.to_string();
        }
    };

    match parsed.port() {
        Some(port) => format!("{scheme}://{host}:{port}{WS_PATH}"),
        None => format!("{scheme}://{host}{WS_PATH}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_from_http() {
        assert_eq!(
            resolve_endpoint("http://localhost:8080"),
            "ws://localhost:8080/ws"
        );
    }

    #[test]
    fn test_endpoint_from_https() {
        assert_eq!(
            resolve_endpoint("https://api.example.com"),
            "wss://api.example.com/ws"
        );
    }

    #[test]
    fn test_endpoint_replaces_path() {
        assert_eq!(
            resolve_endpoint("https://api.example.com:8443/api/v1"),
            "wss://api.example.com:8443/ws"
        );
    }

    #[test]
    fn test_endpoint_passes_ws_through() {
        assert_eq!(
            resolve_endpoint("wss://broker.example.com"),
            "wss://broker.example.com/ws"
        );
    }

    #[test]
    fn test_endpoint_fallback_on_empty() {
        assert_eq!(resolve_endpoint(""), DEFAULT_ENDPOINT);
        assert_eq!(resolve_endpoint("   "), DEFAULT_ENDPOINT);
    }

    #[test]
    fn test_endpoint_fallback_on_garbage() {
        assert_eq!(resolve_endpoint("not a url"), DEFAULT_ENDPOINT);
        assert_eq!(resolve_endpoint("ftp://files.example.com"), DEFAULT_ENDPOINT);
    }

    #[test]
    fn test_default_config_endpoint() {
        let config = Config::default();
        assert_eq!(config.endpoint(), DEFAULT_ENDPOINT);
        assert_eq!(config.retry_delay(), Duration::from_secs(5));
    }

    #[test]
    fn test_validated_rejects_out_of_range_delay() {
        let config = Config {
            retry_delay_secs: 0,
            ..Config::default()
        };
        assert!(config.validated().is_err());
    }

    #[test]
    fn test_validated_accepts_default() {
        assert!(Config::default().validated().is_ok());
    }
}
