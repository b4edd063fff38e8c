//! Test utilities for hookrelay
//!
//! In-process servers standing in for the upstream channel and the local
//! target, plus a logger that records what the session reported.
//!
//! ```ignore
//! use hookrelay::testing::{CaptureTarget, ScriptedResponse, SseScript, TestServer};
//!
//! let script = SseScript::new(ScriptedResponse::hold(["data: hi\n\n"]));
//! let source = TestServer::start(script.router()).await?;
//! let target = CaptureTarget::new();
//! let sink = TestServer::start(target.router()).await?;
//!
//! let config = RelayConfig::new(source.url("/events"), sink.url("/hook"));
//! ```

use std::collections::VecDeque;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use parking_lot::Mutex;
use tokio::net::TcpListener;

use crate::logger::RelayLogger;
use crate::stream::LAST_EVENT_ID_HEADER;

/// A test server that automatically shuts down when dropped
pub struct TestServer {
    pub addr: SocketAddr,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl TestServer {
    /// Serve `router` on an ephemeral local port
    pub async fn start(router: Router) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        Ok(Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    /// Get the base URL of the test server
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Absolute URL for `path` on this server
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url(), path)
    }

    /// Stop accepting connections and drop open ones
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            // Held-open streams would block graceful shutdown forever
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// What the scripted source answers to one connection
#[derive(Debug, Clone)]
pub enum ScriptedResponse {
    /// Stream the chunks, then close the body
    Events(Vec<String>),
    /// Stream the chunks, then keep the connection open
    Hold(Vec<String>),
    /// Answer with this status and a plain-text body
    Status(u16),
    /// Answer 200 with a JSON content type
    WrongContentType,
}

impl ScriptedResponse {
    pub fn events<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Events(chunks.into_iter().map(Into::into).collect())
    }

    pub fn hold<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Hold(chunks.into_iter().map(Into::into).collect())
    }
}

/// One connection the scripted source accepted
#[derive(Debug, Clone)]
pub struct Connection {
    pub at: Instant,
    pub accept: Option<String>,
    pub last_event_id: Option<String>,
}

/// Scripted SSE source
///
/// Connections consume queued responses in order and then fall back to
/// a fixed response.
#[derive(Clone)]
pub struct SseScript {
    inner: Arc<ScriptInner>,
}

struct ScriptInner {
    queue: Mutex<VecDeque<ScriptedResponse>>,
    fallback: ScriptedResponse,
    connections: Mutex<Vec<Connection>>,
}

impl SseScript {
    pub fn new(fallback: ScriptedResponse) -> Self {
        Self {
            inner: Arc::new(ScriptInner {
                queue: Mutex::new(VecDeque::new()),
                fallback,
                connections: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Queue a response ahead of the fallback
    pub fn then(self, response: ScriptedResponse) -> Self {
        self.inner.queue.lock().push_back(response);
        self
    }

    /// Router serving the script at `/events`
    pub fn router(&self) -> Router {
        Router::new()
            .route("/events", get(serve_script))
            .with_state(self.clone())
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.inner.connections.lock().clone()
    }

    pub fn attempts(&self) -> usize {
        self.inner.connections.lock().len()
    }

    fn next_response(&self, headers: &HeaderMap) -> ScriptedResponse {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(String::from)
        };
        self.inner.connections.lock().push(Connection {
            at: Instant::now(),
            accept: header("accept"),
            last_event_id: header(LAST_EVENT_ID_HEADER),
        });

        self.inner
            .queue
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.inner.fallback.clone())
    }
}

async fn serve_script(State(script): State<SseScript>, headers: HeaderMap) -> Response {
    match script.next_response(&headers) {
        ScriptedResponse::Events(chunks) => event_stream(chunks, false),
        ScriptedResponse::Hold(chunks) => event_stream(chunks, true),
        ScriptedResponse::Status(code) => (
            StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            "scripted failure",
        )
            .into_response(),
        ScriptedResponse::WrongContentType => {
            ([(CONTENT_TYPE, "application/json")], "{}").into_response()
        }
    }
}

fn event_stream(chunks: Vec<String>, hold: bool) -> Response {
    let body = async_stream::stream! {
        for chunk in chunks {
            yield Ok::<_, Infallible>(Bytes::from(chunk));
        }
        if hold {
            std::future::pending::<()>().await;
        }
    };
    (
        [(CONTENT_TYPE, "text/event-stream")],
        Body::from_stream(body),
    )
        .into_response()
}

/// A request received by [`CaptureTarget`]
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl CapturedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn body_str(&self) -> &str {
        std::str::from_utf8(&self.body).unwrap_or_default()
    }
}

/// Local target that records every request and answers with a fixed status
#[derive(Clone)]
pub struct CaptureTarget {
    inner: Arc<CaptureInner>,
}

struct CaptureInner {
    requests: Mutex<Vec<CapturedRequest>>,
    status: StatusCode,
    delay: Duration,
}

impl CaptureTarget {
    pub fn new() -> Self {
        Self::with_response(StatusCode::OK, Duration::ZERO)
    }

    /// Answer every request with `status` after `delay`
    pub fn with_response(status: StatusCode, delay: Duration) -> Self {
        Self {
            inner: Arc::new(CaptureInner {
                requests: Mutex::new(Vec::new()),
                status,
                delay,
            }),
        }
    }

    /// Router accepting any path
    pub fn router(&self) -> Router {
        Router::new().fallback(capture).with_state(self.clone())
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.inner.requests.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.requests.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CaptureTarget {
    fn default() -> Self {
        Self::new()
    }
}

async fn capture(
    State(target): State<CaptureTarget>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    target.inner.requests.lock().push(CapturedRequest {
        method,
        uri,
        headers,
        body,
    });
    if !target.inner.delay.is_zero() {
        tokio::time::sleep(target.inner.delay).await;
    }
    target.inner.status
}

/// Logger that keeps every message for later assertions
#[derive(Debug, Default)]
pub struct RecordingLogger {
    messages: Mutex<Vec<String>>,
}

impl RecordingLogger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().clone()
    }

    /// Whether any message contains `needle`
    pub fn contains(&self, needle: &str) -> bool {
        self.messages.lock().iter().any(|m| m.contains(needle))
    }
}

impl RelayLogger for RecordingLogger {
    fn log(&self, message: &str) {
        self.messages.lock().push(message.to_string());
    }
}

/// Wait for a condition with timeout
pub async fn wait_for<F>(condition: F, timeout: Duration) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;

    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    condition()
}
