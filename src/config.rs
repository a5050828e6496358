//! Client configuration.
//!
//! An explicit configuration struct passed to the client at construction;
//! there is no global config singleton. Credentials are the service's
//! user id / auth token pair; everything else has workable defaults.

use std::time::Duration;

/// Configuration for a [`Client`](crate::Client).
#[derive(Clone, Debug)]
pub struct Config {
    /// The service user id to authenticate as.
    pub user_id: String,
    /// The authentication token associated with `user_id`.
    pub auth_token: String,
    /// Base URL for the HTTP API (fallback commands and chat host lookup).
    pub api_base: String,
    /// How long to wait for a command response before synthesizing a
    /// timeout failure.
    pub timeout: Duration,
    /// Whether to automatically reconnect when the connection is lost.
    pub reconnect: bool,
    /// Fixed wait between reconnection attempts.
    pub reconnect_wait: Duration,
    /// Interval between self-presence refreshes keeping the session alive.
    pub keepalive_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            user_id: String::new(),
            auth_token: String::new(),
            api_base: "https://turntable.fm/api".to_string(),
            timeout: Duration::from_secs(10),
            reconnect: false,
            reconnect_wait: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Convenience constructor from credentials, defaults elsewhere.
    #[must_use]
    pub fn new(user_id: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            auth_token: auth_token.into(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.timeout, Duration::from_secs(10));
        assert!(!config.reconnect);
        assert_eq!(config.reconnect_wait, Duration::from_secs(5));
        assert_eq!(config.keepalive_interval, Duration::from_secs(10));
        assert_eq!(config.api_base, "https://turntable.fm/api");
    }

    #[test]
    fn test_new_sets_credentials() {
        let config = Config::new("u123", "tok");
        assert_eq!(config.user_id, "u123");
        assert_eq!(config.auth_token, "tok");
    }
}
