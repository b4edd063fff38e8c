//! Forwarder: re-issues decoded events as HTTP requests to the local target
//!
//! Delivery is best effort. Any HTTP response counts as delivered, and a
//! target that cannot be reached loses the event.

use std::time::Duration;

use reqwest::header::{HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Method, StatusCode};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{PayloadMode, Settings};
use crate::envelope::{Envelope, BOOKKEEPING_EVENTS};
use crate::error::{DeliveryError, Result};
use crate::logger::LogSink;
use crate::session::shutdown_requested;
use crate::sse::Frame;

/// Header carrying the frame's event type
pub const EVENT_TYPE_HEADER: &str = "x-event-type";
/// Header carrying the frame's id, when it has one
pub const EVENT_ID_HEADER: &str = "x-event-id";

/// Where forwarded events go
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayTarget {
    pub url: Url,
    /// Always POST
    pub method: Method,
}

impl RelayTarget {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            method: Method::POST,
        }
    }
}

/// Result of handing one frame to the forwarder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// Target answered, whatever the status
    Delivered { status: StatusCode },
    /// Event type is filtered out
    Skipped,
}

/// Issues one HTTP request per frame
#[derive(Debug, Clone)]
pub struct Forwarder {
    client: Client,
    target: RelayTarget,
    payload: PayloadMode,
    content_type: HeaderValue,
    events: Vec<String>,
}

impl Forwarder {
    /// Create a raw-mode forwarder for `target`
    pub fn new(target: RelayTarget, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            target,
            payload: PayloadMode::Raw,
            content_type: HeaderValue::from_static("application/json"),
            events: Vec::new(),
        })
    }

    pub(crate) fn from_settings(settings: &Settings) -> Result<Self> {
        let mut forwarder = Self::new(settings.target.clone(), settings.forward_timeout)?;
        forwarder.payload = settings.payload;
        forwarder.content_type = settings.content_type.clone();
        forwarder.events = settings.events.clone();
        Ok(forwarder)
    }

    pub fn target(&self) -> &RelayTarget {
        &self.target
    }

    /// Whether frames of this event type are forwarded at all
    pub fn accepts(&self, event_type: &str) -> bool {
        if self.payload == PayloadMode::Envelope && BOOKKEEPING_EVENTS.contains(&event_type) {
            return false;
        }
        self.events.is_empty() || self.events.iter().any(|e| e == event_type)
    }

    /// Forward one frame to the target
    pub async fn forward(
        &self,
        frame: &Frame,
    ) -> std::result::Result<ForwardOutcome, DeliveryError> {
        if !self.accepts(&frame.event_type) {
            return Ok(ForwardOutcome::Skipped);
        }

        let request = match self.payload {
            PayloadMode::Raw => self
                .client
                .request(self.target.method.clone(), self.target.url.clone())
                .header(CONTENT_TYPE, self.content_type.clone())
                .body(frame.data.clone()),
            PayloadMode::Envelope => {
                let envelope = Envelope::parse(&frame.data)?;
                let url = envelope.apply_query(&self.target.url);
                let needs_content_type =
                    !envelope.body.is_empty() && !envelope.headers.contains_key(CONTENT_TYPE);
                let mut request = self
                    .client
                    .request(self.target.method.clone(), url)
                    .headers(envelope.headers);
                if needs_content_type {
                    request = request.header(CONTENT_TYPE, "application/json");
                }
                request.body(envelope.body)
            }
        };

        let mut request = request.header(EVENT_TYPE_HEADER, frame.event_type.as_str());
        if let Some(id) = &frame.id {
            request = request.header(EVENT_ID_HEADER, id.as_str());
        }

        let response = request.send().await?;
        Ok(ForwardOutcome::Delivered {
            status: response.status(),
        })
    }

    /// Forward frames from `frames` one at a time until shutdown
    pub(crate) async fn run(
        self,
        mut frames: mpsc::Receiver<Frame>,
        mut shutdown: watch::Receiver<bool>,
        log: LogSink,
    ) {
        loop {
            let frame = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break,
                frame = frames.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => {
                    debug!(event_type = %frame.event_type, "Forward cancelled by shutdown");
                    break;
                }
                result = self.forward(&frame) => self.report(&frame, result, &log),
            }
        }
        debug!("Forwarder stopped");
    }

    fn report(
        &self,
        frame: &Frame,
        result: std::result::Result<ForwardOutcome, DeliveryError>,
        log: &LogSink,
    ) {
        let url = &self.target.url;
        match result {
            Ok(ForwardOutcome::Delivered { status }) if status.is_success() => {
                info!(event_type = %frame.event_type, %status, "Forwarded event");
                log.log(format!("POST {} - {}", url, status.as_u16()));
            }
            Ok(ForwardOutcome::Delivered { status }) => {
                warn!(event_type = %frame.event_type, %status, "Target rejected event");
                log.log(format!("POST {} - {} (not retried)", url, status.as_u16()));
            }
            Ok(ForwardOutcome::Skipped) => {
                debug!(event_type = %frame.event_type, "Skipping filtered event");
            }
            Err(e) => {
                warn!(event_type = %frame.event_type, error = %e, "Dropping event");
                log.log(format!(
                    "Failed to forward {} event to {}: {}",
                    frame.event_type, url, e
                ));
            }
        }
    }
}
