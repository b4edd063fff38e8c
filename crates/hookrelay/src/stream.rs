//! Reconnecting upstream stream client
//!
//! Keeps an SSE connection to the source open for the session's lifetime,
//! decoding frames and handing them to the forwarder. Every failure leads
//! to backoff and another attempt until the session is stopped.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use parking_lot::Mutex;
use reqwest::header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use reqwest::{Client, Response};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use url::Url;

use crate::backoff::Backoff;
use crate::error::{Result, UpstreamError};
use crate::logger::LogSink;
use crate::session::{shutdown_requested, SessionState, SessionStatus};
use crate::sse::{Frame, SseDecoder};

/// Header used to resume a stream after reconnecting
pub const LAST_EVENT_ID_HEADER: &str = "last-event-id";

const EVENT_STREAM_MIME: &str = "text/event-stream";

/// Client for one upstream event source
#[derive(Debug, Clone)]
pub struct StreamClient {
    http_client: Client,
    source: Url,
    backoff: Backoff,
    connect_timeout: Duration,
    /// Shared by every clone so a restarted run resumes where the last one stopped
    last_event_id: Arc<Mutex<Option<String>>>,
}

impl StreamClient {
    pub fn new(source: Url, backoff: Backoff, connect_timeout: Duration) -> Result<Self> {
        // No overall timeout, the stream is long-lived
        let http_client = Client::builder().connect_timeout(connect_timeout).build()?;

        Ok(Self {
            http_client,
            source,
            backoff,
            connect_timeout,
            last_event_id: Arc::new(Mutex::new(None)),
        })
    }

    pub fn source(&self) -> &Url {
        &self.source
    }

    /// Last event id seen on any connection so far
    pub fn last_event_id(&self) -> Option<String> {
        self.last_event_id.lock().clone()
    }

    /// Make one connection attempt
    ///
    /// Succeeds only on a 2xx response that declares an event stream. The
    /// connect timeout bounds everything up to the response headers.
    pub async fn connect(&self) -> std::result::Result<EventStream, UpstreamError> {
        debug!(url = %self.source, "Connecting to SSE stream");

        let mut request = self
            .http_client
            .get(self.source.clone())
            .header(ACCEPT, EVENT_STREAM_MIME)
            .header(CACHE_CONTROL, "no-cache");
        if let Some(id) = self.last_event_id() {
            request = request.header(LAST_EVENT_ID_HEADER, id);
        }

        let response = match tokio::time::timeout(self.connect_timeout, request.send()).await {
            Ok(result) => result.map_err(UpstreamError::Connect)?,
            Err(_) => return Err(UpstreamError::Timeout(self.connect_timeout)),
        };

        if !response.status().is_success() {
            return Err(UpstreamError::Status(response.status()));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !content_type
            .to_ascii_lowercase()
            .starts_with(EVENT_STREAM_MIME)
        {
            return Err(UpstreamError::ContentType(content_type.to_string()));
        }

        Ok(EventStream::new(response))
    }

    /// Drive the connect / stream / backoff cycle until shutdown
    ///
    /// This is the session's control loop and the only writer of `status`.
    pub(crate) async fn run(
        self,
        frames: mpsc::Sender<Frame>,
        status: Arc<watch::Sender<SessionStatus>>,
        mut shutdown: watch::Receiver<bool>,
        log: LogSink,
    ) {
        let mut retry_count: u32 = 0;

        loop {
            status.send_replace(SessionStatus::new(SessionState::Connecting, retry_count));

            let attempt = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break,
                attempt = self.connect() => attempt,
            };

            let error = match attempt {
                Ok(stream) => {
                    retry_count = 0;
                    status.send_replace(SessionStatus::new(SessionState::Streaming, 0));
                    info!(url = %self.source, "Connected to events endpoint");
                    log.log(format!("Connected {}", self.source));

                    let outcome = tokio::select! {
                        biased;
                        _ = shutdown_requested(&mut shutdown) => break,
                        outcome = self.pump(stream, &frames) => outcome,
                    };
                    match outcome {
                        Some(error) => error,
                        None => {
                            debug!("Forwarder gone, stopping stream");
                            break;
                        }
                    }
                }
                Err(error) => error,
            };

            retry_count = retry_count.saturating_add(1);
            let delay = self.backoff.delay(retry_count);
            status.send_replace(SessionStatus::new(SessionState::Backoff, retry_count));

            warn!(
                error = %error,
                retry_count,
                reconnect_in_ms = delay.as_millis() as u64,
                "SSE connection lost, will reconnect"
            );
            log.log(format!("Disconnected from {}: {}", self.source, error));
            log.log(format!(
                "Reconnecting in {} ms (attempt {})",
                delay.as_millis(),
                retry_count
            ));

            tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        status.send_replace(SessionStatus::new(SessionState::Stopped, retry_count));
        info!(url = %self.source, "Stream client stopped");
    }

    /// Read frames from an open stream into the forwarder channel
    ///
    /// Returns `None` when the forwarder has gone away, otherwise the
    /// error that ended the stream.
    async fn pump(
        &self,
        mut stream: EventStream,
        frames: &mpsc::Sender<Frame>,
    ) -> Option<UpstreamError> {
        let error = loop {
            match stream.next().await {
                Some(Ok(frame)) => {
                    self.remember(stream.last_event_id());
                    if frames.send(frame).await.is_err() {
                        return None;
                    }
                }
                Some(Err(error)) => break error,
                None => break UpstreamError::Closed,
            }
        };
        self.remember(stream.finish().as_deref());
        Some(error)
    }

    fn remember(&self, id: Option<&str>) {
        if let Some(id) = id {
            let mut last = self.last_event_id.lock();
            if last.as_deref() != Some(id) {
                *last = Some(id.to_string());
            }
        }
    }
}

/// An open upstream connection yielding decoded frames
pub struct EventStream {
    body: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    decoder: SseDecoder,
    pending: VecDeque<Frame>,
}

impl EventStream {
    fn new(response: Response) -> Self {
        Self {
            body: Box::pin(response.bytes_stream()),
            decoder: SseDecoder::new(),
            pending: VecDeque::new(),
        }
    }

    /// Next decoded frame
    ///
    /// Returns `None` once the upstream closes the body.
    pub async fn next(&mut self) -> Option<std::result::Result<Frame, UpstreamError>> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Some(Ok(frame));
            }
            match self.body.next().await {
                Some(Ok(bytes)) => self.pending.extend(self.decoder.feed(&bytes)),
                Some(Err(e)) => return Some(Err(UpstreamError::Read(e))),
                None => return None,
            }
        }
    }

    pub fn last_event_id(&self) -> Option<&str> {
        self.decoder.last_event_id()
    }

    /// Close the stream, dropping any partial frame
    pub fn finish(self) -> Option<String> {
        self.decoder.finish()
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}
