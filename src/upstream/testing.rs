//! In-memory upstream used by the lifecycle, relay and fan-out tests.

use super::{
    dispatch_guarded, AtomicConnectionState, ConnectionState, EventHandler, UpstreamConnection,
    UpstreamConnector, UpstreamEvent, UpstreamOptions,
};
use crate::error::RelayError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Records every open and hands out [`FakeConnection`]s.
#[derive(Default)]
pub struct FakeConnector {
    connections: Mutex<Vec<Arc<FakeConnection>>>,
    handlers: Mutex<Vec<(String, EventHandler)>>,
    options: Mutex<Vec<UpstreamOptions>>,
    fail_opens: AtomicBool,
    gate: Mutex<Option<Arc<Notify>>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_fail_opens(&self, fail: bool) {
        self.fail_opens.store(fail, Ordering::SeqCst);
    }

    /// Make every later `open` wait until the returned notify is signalled.
    pub fn hold_opens(&self) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(notify.clone());
        notify
    }

    pub fn open_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn connection(&self, index: usize) -> Arc<FakeConnection> {
        self.connections.lock().unwrap()[index].clone()
    }

    pub fn last_options(&self) -> Option<UpstreamOptions> {
        self.options.lock().unwrap().last().cloned()
    }

    /// Deliver an event through the handler armed for the `index`-th open.
    pub fn emit(&self, index: usize, event: UpstreamEvent) {
        let (session_id, handler) = self.handlers.lock().unwrap()[index].clone();
        if event == UpstreamEvent::Close {
            if let Some(conn) = self.connections.lock().unwrap().get(index) {
                conn.mark_closed();
            }
        }
        dispatch_guarded(&session_id, &handler, event);
    }
}

#[async_trait]
impl UpstreamConnector for FakeConnector {
    async fn open(
        &self,
        session_id: &str,
        options: &UpstreamOptions,
        handler: EventHandler,
    ) -> Result<Arc<dyn UpstreamConnection>, RelayError> {
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        self.options.lock().unwrap().push(options.clone());
        if self.fail_opens.load(Ordering::SeqCst) {
            return Err(RelayError::ConnectFailed("handshake rejected".to_string()));
        }

        let conn = Arc::new(FakeConnection::default());
        self.connections.lock().unwrap().push(conn.clone());
        self.handlers
            .lock()
            .unwrap()
            .push((session_id.to_string(), handler.clone()));
        dispatch_guarded(session_id, &handler, UpstreamEvent::Open);
        Ok(conn)
    }
}

/// Connection that stores frames and counts finish calls.
pub struct FakeConnection {
    pub sent: Mutex<Vec<Vec<u8>>>,
    pub finish_calls: AtomicUsize,
    fail_finish: AtomicBool,
    finish_gate: Mutex<Option<Arc<Notify>>>,
    state: AtomicConnectionState,
}

impl Default for FakeConnection {
    fn default() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            finish_calls: AtomicUsize::new(0),
            fail_finish: AtomicBool::new(false),
            finish_gate: Mutex::new(None),
            state: AtomicConnectionState::new(ConnectionState::Open),
        }
    }
}

impl FakeConnection {
    pub fn set_fail_finish(&self, fail: bool) {
        self.fail_finish.store(fail, Ordering::SeqCst);
    }

    /// Park later `finish` calls in the Closing state until the returned notify is signalled.
    pub fn hold_finish(&self) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        *self.finish_gate.lock().unwrap() = Some(notify.clone());
        notify
    }

    pub fn mark_closed(&self) {
        self.state.store(ConnectionState::Closed);
    }

    pub fn finish_count(&self) -> usize {
        self.finish_calls.load(Ordering::SeqCst)
    }

    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl UpstreamConnection for FakeConnection {
    fn send(&self, frame: Vec<u8>) -> Result<(), RelayError> {
        if self.state.load() != ConnectionState::Open {
            return Err(RelayError::SendFailed("stream is not open".to_string()));
        }
        self.sent.lock().unwrap().push(frame);
        Ok(())
    }

    async fn finish(&self) -> Result<(), RelayError> {
        self.finish_calls.fetch_add(1, Ordering::SeqCst);
        if !self.state.transition(ConnectionState::Open, ConnectionState::Closing) {
            return Ok(());
        }
        let gate = self.finish_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.state.store(ConnectionState::Closed);
        if self.fail_finish.load(Ordering::SeqCst) {
            return Err(RelayError::FinishFailed("socket reset".to_string()));
        }
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        self.state.load()
    }
}
