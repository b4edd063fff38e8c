//! Relay session configuration
//!
//! Can be loaded from TOML/JSON via serde or constructed programmatically.
//! Everything except `source` and `target` has a default.

use std::time::Duration;

use reqwest::header::HeaderValue;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::backoff::Backoff;
use crate::error::{RelayError, Result};
use crate::forward::RelayTarget;

/// Relay session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// URL of the event-stream channel to read from
    pub source: String,

    /// URL of the local listener events are POSTed to
    pub target: String,

    /// Reconnect backoff settings
    #[serde(default)]
    pub backoff: BackoffConfig,

    /// Timeout for one forward request in milliseconds (default: 5s)
    #[serde(default = "default_forward_timeout")]
    pub forward_timeout_ms: u64,

    /// Timeout for the upstream connection and its response headers in milliseconds (default: 10s)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// How event data maps onto the forwarded request
    #[serde(default)]
    pub payload: PayloadMode,

    /// Content-Type of forwarded bodies in raw mode
    #[serde(default = "default_content_type")]
    pub content_type: String,

    /// Event types to forward; empty forwards everything
    #[serde(default)]
    pub events: Vec<String>,
}

/// Backoff configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackoffConfig {
    /// First reconnect delay in milliseconds (default: 1s)
    #[serde(default = "default_backoff_base")]
    pub base_ms: u64,

    /// Upper bound on the reconnect delay in milliseconds (default: 30s)
    #[serde(default = "default_backoff_cap")]
    pub cap_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: default_backoff_base(),
            cap_ms: default_backoff_cap(),
        }
    }
}

/// Payload handling mode
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PayloadMode {
    /// POST `data` verbatim
    #[default]
    Raw,
    /// `data` is a smee-style JSON envelope carrying body, query and headers
    Envelope,
}

fn default_forward_timeout() -> u64 {
    5_000
}

fn default_connect_timeout() -> u64 {
    10_000
}

fn default_backoff_base() -> u64 {
    1_000
}

fn default_backoff_cap() -> u64 {
    30_000
}

fn default_content_type() -> String {
    "application/json".to_string()
}

impl RelayConfig {
    /// Create a configuration with defaults for everything but the endpoints
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            backoff: BackoffConfig::default(),
            forward_timeout_ms: default_forward_timeout(),
            connect_timeout_ms: default_connect_timeout(),
            payload: PayloadMode::default(),
            content_type: default_content_type(),
            events: Vec::new(),
        }
    }

    /// Set the backoff base and cap
    pub fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.backoff = BackoffConfig {
            base_ms: base.as_millis() as u64,
            cap_ms: cap.as_millis() as u64,
        };
        self
    }

    /// Set the forward request timeout
    pub fn with_forward_timeout(mut self, timeout: Duration) -> Self {
        self.forward_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the upstream connect timeout, which also bounds waiting for headers
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the payload mode
    pub fn with_payload(mut self, payload: PayloadMode) -> Self {
        self.payload = payload;
        self
    }

    /// Restrict forwarding to the given event types
    pub fn with_events<I, S>(mut self, events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.events = events.into_iter().map(Into::into).collect();
        self
    }

    /// Validate and convert into the settings a session runs with
    pub(crate) fn resolve(&self) -> Result<Settings> {
        let source = parse_http_url(&self.source)?;
        let target = RelayTarget::new(parse_http_url(&self.target)?);

        if self.backoff.base_ms == 0 {
            return Err(RelayError::InvalidConfig(
                "backoff.base_ms must be greater than zero".into(),
            ));
        }
        if self.backoff.cap_ms < self.backoff.base_ms {
            return Err(RelayError::InvalidConfig(format!(
                "backoff.cap_ms ({}) is smaller than backoff.base_ms ({})",
                self.backoff.cap_ms, self.backoff.base_ms
            )));
        }
        if self.forward_timeout_ms == 0 {
            return Err(RelayError::InvalidConfig(
                "forward_timeout_ms must be greater than zero".into(),
            ));
        }
        if self.connect_timeout_ms == 0 {
            return Err(RelayError::InvalidConfig(
                "connect_timeout_ms must be greater than zero".into(),
            ));
        }

        let content_type = HeaderValue::from_str(&self.content_type).map_err(|e| {
            RelayError::InvalidConfig(format!(
                "content_type '{}' is not a valid header value: {}",
                self.content_type, e
            ))
        })?;

        Ok(Settings {
            source,
            target,
            backoff: Backoff::new(
                Duration::from_millis(self.backoff.base_ms),
                Duration::from_millis(self.backoff.cap_ms),
            ),
            forward_timeout: Duration::from_millis(self.forward_timeout_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            payload: self.payload,
            content_type,
            events: self.events.clone(),
        })
    }
}

fn parse_http_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw).map_err(|e| RelayError::invalid_url(raw, e))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(RelayError::InvalidConfig(format!(
            "unsupported scheme '{}' in {}",
            other, raw
        ))),
    }
}

/// Validated configuration shared by the session's tasks
#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub source: Url,
    pub target: RelayTarget,
    pub backoff: Backoff,
    pub forward_timeout: Duration,
    pub connect_timeout: Duration,
    pub payload: PayloadMode,
    pub content_type: HeaderValue,
    pub events: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_toml() {
        let config: RelayConfig = toml::from_str(
            r#"
            source = "https://smee.io/abc"
            target = "http://localhost:5000/events"
            "#,
        )
        .unwrap();

        assert_eq!(config.backoff, BackoffConfig::default());
        assert_eq!(config.forward_timeout_ms, 5_000);
        assert_eq!(config.payload, PayloadMode::Raw);
        assert_eq!(config.content_type, "application/json");
        assert!(config.events.is_empty());
    }

    #[test]
    fn test_full_toml() {
        let config: RelayConfig = toml::from_str(
            r#"
            source = "https://smee.io/abc"
            target = "http://localhost:5000/events"
            payload = "envelope"
            events = ["message"]

            [backoff]
            base_ms = 250
            cap_ms = 4000
            "#,
        )
        .unwrap();

        let settings = config.resolve().unwrap();
        assert_eq!(settings.backoff.base(), Duration::from_millis(250));
        assert_eq!(settings.backoff.cap(), Duration::from_secs(4));
        assert_eq!(settings.payload, PayloadMode::Envelope);
        assert_eq!(settings.events, vec!["message".to_string()]);
    }

    #[test]
    fn test_malformed_url_rejected() {
        let err = RelayConfig::new("smee.io/abc", "http://localhost:5000")
            .resolve()
            .unwrap_err();
        assert!(matches!(err, RelayError::InvalidUrl { .. }));
    }

    #[test]
    fn test_non_http_scheme_rejected() {
        let err = RelayConfig::new("https://smee.io/abc", "ftp://localhost/x")
            .resolve()
            .unwrap_err();
        assert!(matches!(err, RelayError::InvalidConfig(_)));
    }

    #[test]
    fn test_zero_backoff_rejected() {
        let config = RelayConfig::new("https://smee.io/abc", "http://localhost:5000")
            .with_backoff(Duration::ZERO, Duration::from_secs(1));
        assert!(matches!(
            config.resolve().unwrap_err(),
            RelayError::InvalidConfig(_)
        ));
    }

    #[test]
    fn test_zero_connect_timeout_rejected() {
        let config = RelayConfig::new("https://smee.io/abc", "http://localhost:5000")
            .with_connect_timeout(Duration::ZERO);
        let err = config.resolve().unwrap_err();
        assert!(err.to_string().contains("connect_timeout_ms"));
    }

    #[test]
    fn test_cap_below_base_rejected() {
        let config = RelayConfig::new("https://smee.io/abc", "http://localhost:5000")
            .with_backoff(Duration::from_secs(5), Duration::from_secs(1));
        assert!(config.resolve().is_err());
    }
}
