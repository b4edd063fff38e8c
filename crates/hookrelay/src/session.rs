//! Relay session: composes the stream client and the forwarder
//!
//! A session is created from a validated [`RelayConfig`]. `start()` spawns
//! two tasks. The stream task is the control loop and owns every state
//! transition. The forward task consumes frames from a bounded channel. The
//! returned [`RelayHandle`] can only observe the session and cancel it.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use url::Url;

use crate::config::RelayConfig;
use crate::error::Result;
use crate::forward::{Forwarder, RelayTarget};
use crate::logger::{LogSink, RelayLogger};
use crate::stream::StreamClient;

/// Frames buffered between the stream and forward tasks
const FRAME_BUFFER: usize = 1024;

/// How long `close()` waits for the tasks before aborting them
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, not started
    Idle,
    /// Connection attempt in flight
    Connecting,
    /// Connected and reading frames
    Streaming,
    /// Waiting before the next attempt
    Backoff,
    /// Terminal
    Stopped,
}

/// Snapshot of a session's state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    /// Consecutive failed attempts, reset when streaming starts
    pub retry_count: u32,
}

impl SessionStatus {
    pub fn new(state: SessionState, retry_count: u32) -> Self {
        Self { state, retry_count }
    }

    pub fn idle() -> Self {
        Self::new(SessionState::Idle, 0)
    }
}

/// Resolves once shutdown has been requested or the session is gone
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// A relay from one event source to one target
///
/// # Example
///
/// ```no_run
/// use hookrelay::{RelayConfig, RelaySession};
///
/// # async fn example() -> hookrelay::Result<()> {
/// let config = RelayConfig::new("https://smee.io/abc123", "http://localhost:5000/events");
/// let mut session = RelaySession::new(config)?;
///
/// let handle = session.start();
/// // ... later, on every exit path
/// handle.close().await;
/// # Ok(())
/// # }
/// ```
pub struct RelaySession {
    stream_client: StreamClient,
    forwarder: Forwarder,
    logger: LogSink,
    handle: Option<RelayHandle>,
}

impl RelaySession {
    /// Validate `config` and build the session
    ///
    /// Fails immediately on a malformed source or target URL.
    pub fn new(config: RelayConfig) -> Result<Self> {
        let settings = config.resolve()?;
        let stream_client = StreamClient::new(
            settings.source.clone(),
            settings.backoff,
            settings.connect_timeout,
        )?;
        let forwarder = Forwarder::from_settings(&settings)?;

        Ok(Self {
            stream_client,
            forwarder,
            logger: LogSink::default(),
            handle: None,
        })
    }

    /// Attach a logger that receives connect, disconnect and delivery messages
    pub fn with_logger(mut self, logger: Arc<dyn RelayLogger>) -> Self {
        self.logger = LogSink::new(Some(logger));
        self
    }

    pub fn source(&self) -> &Url {
        self.stream_client.source()
    }

    pub fn target(&self) -> &RelayTarget {
        self.forwarder.target()
    }

    /// Current status, `Idle` before the first start
    pub fn status(&self) -> SessionStatus {
        self.handle
            .as_ref()
            .map_or_else(SessionStatus::idle, RelayHandle::status)
    }

    pub fn state(&self) -> SessionState {
        self.status().state
    }

    /// Handle of the current run, if started
    pub fn handle(&self) -> Option<&RelayHandle> {
        self.handle.as_ref()
    }

    /// Start relaying
    ///
    /// While a run is active this returns its handle unchanged. After a stop
    /// it begins a fresh run that resumes from the last event id seen. Must
    /// be called within a tokio runtime.
    pub fn start(&mut self) -> RelayHandle {
        if let Some(handle) = &self.handle {
            if handle.state() != SessionState::Stopped {
                return handle.clone();
            }
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (status_tx, status_rx) =
            watch::channel(SessionStatus::new(SessionState::Connecting, 0));
        let status_tx = Arc::new(status_tx);
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_BUFFER);

        info!(
            source = %self.source(),
            target = %self.target().url,
            "Forwarding events"
        );
        self.logger.log(format!(
            "Forwarding {} to {}",
            self.source(),
            self.target().url
        ));

        let stream_task = tokio::spawn(self.stream_client.clone().run(
            frame_tx,
            status_tx.clone(),
            shutdown_rx.clone(),
            self.logger.clone(),
        ));
        let forward_task = tokio::spawn(self.forwarder.clone().run(
            frame_rx,
            shutdown_rx,
            self.logger.clone(),
        ));

        let handle = RelayHandle {
            inner: Arc::new(HandleInner {
                shutdown: shutdown_tx,
                status_tx,
                status: status_rx,
                tasks: Mutex::new(vec![stream_task, forward_task]),
                logger: self.logger.clone(),
            }),
        };
        self.handle = Some(handle.clone());
        handle
    }

    /// Stop relaying; a no-op before the first start
    pub async fn stop(&mut self) {
        if let Some(handle) = &self.handle {
            handle.close().await;
        }
    }
}

/// Control handle for a running session
///
/// Cloning is cheap. `close()` is idempotent and should be called on every
/// exit path. Dropping the last clone without closing aborts the tasks.
#[derive(Clone)]
pub struct RelayHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    shutdown: watch::Sender<bool>,
    status_tx: Arc<watch::Sender<SessionStatus>>,
    status: watch::Receiver<SessionStatus>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    logger: LogSink,
}

impl RelayHandle {
    pub fn status(&self) -> SessionStatus {
        *self.inner.status.borrow()
    }

    pub fn state(&self) -> SessionState {
        self.status().state
    }

    pub fn retry_count(&self) -> u32 {
        self.status().retry_count
    }

    /// Watch status transitions
    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.inner.status.clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// Stop forwarding and release the upstream connection
    ///
    /// Waits briefly for in-flight work to cancel, then aborts it.
    pub async fn close(&self) {
        let first = !self.inner.shutdown.send_replace(true);

        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for mut task in tasks {
            if tokio::time::timeout(STOP_GRACE, &mut task).await.is_err() {
                debug!("Relay task did not stop in time, aborting");
                task.abort();
            }
        }

        self.inner.status_tx.send_if_modified(|status| {
            if status.state == SessionState::Stopped {
                false
            } else {
                status.state = SessionState::Stopped;
                true
            }
        });

        if first {
            info!("Relay stopped");
            self.inner.logger.log("Stopped forwarding");
        }
    }
}

impl std::fmt::Debug for RelayHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayHandle")
            .field("status", &self.status())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}
