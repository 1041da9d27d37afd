//! # Upstream Connection Adapter
//!
//! Wraps one streaming speech-recognition session. The relay only ever talks to the
//! backend through the two traits in this module:
//!
//! - **UpstreamConnector**: opens a new streaming session (`open`)
//! - **UpstreamConnection**: the handle for one open session (`send`, `finish`, `state`)
//!
//! Events coming back from the backend (open, transcript, metadata, error, close) are
//! delivered to an [`EventHandler`] on the adapter's own reader task, never on the caller's
//! task. Every delivery goes through [`dispatch_guarded`], so a panic inside one handler
//! call is logged and the next event is still delivered.
//!
//! ## Key Rust Concepts Used:
//! - **trait objects** (`Arc<dyn Trait>`): the lifecycle code does not know which backend it talks to
//! - **async-trait**: async methods on traits that can be used as trait objects
//! - **catch_unwind**: turns a panic into a value at a well-defined boundary

pub mod deepgram;

#[cfg(test)]
pub mod testing;

use crate::error::RelayError;
use async_trait::async_trait;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

pub use deepgram::DeepgramConnector;

/// Options sent to the backend when a session is opened.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamOptions {
    pub model: String,
    pub language: String,
    pub interim_results: bool,
    pub punctuate: bool,
    pub keepalive: bool,
    pub keepalive_interval: Duration,
    /// Longest stretch of client silence covered by keep-alive frames.
    pub keepalive_timeout: Duration,
}

/// Events reported by an open upstream session.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    Open,
    Transcript(String),
    Metadata(serde_json::Value),
    Error(String),
    Close,
}

impl UpstreamEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            UpstreamEvent::Open => "open",
            UpstreamEvent::Transcript(_) => "transcript",
            UpstreamEvent::Metadata(_) => "metadata",
            UpstreamEvent::Error(_) => "error",
            UpstreamEvent::Close => "close",
        }
    }
}

/// Callback armed at open time; receives every event of one upstream session.
pub type EventHandler = Arc<dyn Fn(UpstreamEvent) + Send + Sync>;

/// State of one upstream session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Opening = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Opening,
            1 => ConnectionState::Open,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// Lock-free holder for a [`ConnectionState`], shared between a handle and its tasks.
#[derive(Debug)]
pub struct AtomicConnectionState(AtomicU8);

impl AtomicConnectionState {
    pub fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub fn store(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    /// Move from `current` to `new` only if the state is still `current`.
    pub fn transition(&self, current: ConnectionState, new: ConnectionState) -> bool {
        self.0
            .compare_exchange(current as u8, new as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// Opens streaming sessions against a speech-recognition backend.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    /// Open a session and arm `handler` for its events.
    ///
    /// Must give up with `ConnectFailed` within a bounded time. No handle means no
    /// usable session, whatever the reason.
    async fn open(
        &self,
        session_id: &str,
        options: &UpstreamOptions,
        handler: EventHandler,
    ) -> Result<Arc<dyn UpstreamConnection>, RelayError>;
}

/// Handle for one open streaming session.
#[async_trait]
pub trait UpstreamConnection: Send + Sync {
    /// Queue one binary audio frame. Never blocks.
    fn send(&self, frame: Vec<u8>) -> Result<(), RelayError>;

    /// Request a graceful end of stream.
    ///
    /// Idempotent: a repeated call, or a call after the backend already closed the
    /// stream, is logged and returns `Ok`.
    async fn finish(&self) -> Result<(), RelayError>;

    fn state(&self) -> ConnectionState;
}

/// Deliver one event through the handler's fault boundary.
///
/// A panic inside the handler becomes a logged `HandlerFault`; the caller keeps going.
pub fn dispatch_guarded(session_id: &str, handler: &EventHandler, event: UpstreamEvent) {
    let kind = event.kind();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(event)));

    if let Err(payload) = outcome {
        let detail = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        let fault = RelayError::HandlerFault(format!("{} handler: {}", kind, detail));
        error!(session_id = %session_id, "{}", fault);
    }
}
