//! hookrelay
//!
//! Relays a server-sent-events channel (for example a smee.io channel
//! receiving GitHub webhooks) to a local HTTP listener.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use hookrelay::{RelayConfig, RelayLogger, RelaySession};
//!
//! struct Stdout;
//!
//! impl RelayLogger for Stdout {
//!     fn log(&self, message: &str) {
//!         println!("{}", message);
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = RelayConfig::new(
//!         "https://smee.io/LgDQ8xrhy0q2GeET",
//!         "http://localhost:5000/events",
//!     );
//!     let mut session = RelaySession::new(config)?.with_logger(Arc::new(Stdout));
//!
//!     let events = session.start();
//!     tokio::signal::ctrl_c().await?;
//!
//!     // Stop forwarding events
//!     events.close().await;
//!     Ok(())
//! }
//! ```
//!
//! # Delivery
//!
//! Frames are forwarded in stream order, one request at a time. A target
//! that answers with any status has received the event. A target that
//! cannot be reached loses it. The upstream channel is the system of
//! record, so nothing is queued or retried.
//!
//! # Testing
//!
//! The `testing` module provides in-process stand-ins for both ends:
//!
//! ```rust,ignore
//! use hookrelay::testing::{CaptureTarget, ScriptedResponse, SseScript, TestServer};
//!
//! let script = SseScript::new(ScriptedResponse::hold(["event: ping\ndata: hello\n\n"]));
//! let source = TestServer::start(script.router()).await?;
//! ```

pub mod backoff;
pub mod channel;
pub mod config;
pub mod envelope;
mod error;
pub mod forward;
mod logger;
pub mod session;
pub mod sse;
pub mod stream;
pub mod testing;

pub use backoff::Backoff;
pub use channel::{create_channel, DEFAULT_CHANNEL_HOST};
pub use config::{BackoffConfig, PayloadMode, RelayConfig};
pub use error::{ChannelError, DeliveryError, RelayError, Result, UpstreamError};
pub use forward::{ForwardOutcome, Forwarder, RelayTarget};
pub use logger::RelayLogger;
pub use session::{RelayHandle, RelaySession, SessionState, SessionStatus};
pub use sse::{Frame, SseDecoder};
pub use stream::{EventStream, StreamClient};
