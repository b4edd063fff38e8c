//! Error types for hookrelay
//!
//! Only [`RelayError`] ever reaches the caller of the public API. The
//! upstream and delivery errors are handled inside the session and surface
//! as log lines.

use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

/// Result type alias for relay construction and control
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors returned synchronously to the caller
#[derive(Error, Debug)]
pub enum RelayError {
    /// Source or target URL could not be parsed
    #[error("Invalid URL '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    /// Configuration was parsed but is unusable
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// HTTP client could not be built
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),
}

impl RelayError {
    pub(crate) fn invalid_url(url: impl Into<String>, source: url::ParseError) -> Self {
        Self::InvalidUrl {
            url: url.into(),
            source,
        }
    }
}

/// Failures of a single upstream connection attempt
///
/// Every variant moves the session into backoff. None of them is fatal.
#[derive(Error, Debug)]
pub enum UpstreamError {
    /// Network, DNS or TLS failure while connecting
    #[error("connect failed: {0}")]
    Connect(#[source] reqwest::Error),

    /// Upstream accepted the connection but sent no response headers in time
    #[error("no response within {} ms", .0.as_millis())]
    Timeout(Duration),

    /// Upstream answered with a non-2xx status
    #[error("unexpected status {0}")]
    Status(StatusCode),

    /// Upstream answered 2xx but not with an event stream
    #[error("unexpected content type '{0}'")]
    ContentType(String),

    /// Reading the body failed mid-stream
    #[error("stream read failed: {0}")]
    Read(#[source] reqwest::Error),

    /// Upstream closed the stream
    #[error("stream closed by upstream")]
    Closed,
}

/// Failures to hand an event to the local target
///
/// The event is dropped and the failure is logged. Nothing is retried.
#[derive(Error, Debug)]
pub enum DeliveryError {
    /// Target did not answer within the forward timeout
    #[error("target timed out")]
    Timeout,

    /// Target could not be reached
    #[error("target unreachable: {0}")]
    Unreachable(#[source] reqwest::Error),

    /// Payload could not be unwrapped from its envelope
    #[error("malformed envelope: {0}")]
    Envelope(String),
}

impl From<reqwest::Error> for DeliveryError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Unreachable(err)
        }
    }
}

/// Errors while creating a new relay channel
#[derive(Error, Debug)]
pub enum ChannelError {
    /// Channel host could not be reached
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Host URL is malformed
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Host answered without a redirect to the new channel
    #[error("Channel host returned {status} without a Location header")]
    NoLocation { status: u16 },
}
