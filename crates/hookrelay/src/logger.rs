//! Logging collaborator injected into a relay session
//!
//! The session always emits `tracing` events. A [`RelayLogger`] additionally
//! receives a one-line message for connect, disconnect, reconnect and
//! delivery failures, which is what a console front end wants to show.

use std::sync::Arc;

/// Receives human-readable relay log lines
pub trait RelayLogger: Send + Sync {
    fn log(&self, message: &str);
}

/// Optional logger shared between the session's tasks
#[derive(Clone, Default)]
pub(crate) struct LogSink(Option<Arc<dyn RelayLogger>>);

impl LogSink {
    pub(crate) fn new(logger: Option<Arc<dyn RelayLogger>>) -> Self {
        Self(logger)
    }

    pub(crate) fn log(&self, message: impl AsRef<str>) {
        if let Some(logger) = &self.0 {
            logger.log(message.as_ref());
        }
    }
}

impl std::fmt::Debug for LogSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("LogSink").field(&self.0.is_some()).finish()
    }
}
