//! # Session Registry
//!
//! The authoritative map from client session id to [`Session`]. It is the only
//! cross-session shared mutable state in the relay.
//!
//! ## Locking Layout:
//! - **Map lock** (`RwLock<HashMap<..>>`): held only to insert, remove or look up a slot,
//!   so sessions never wait on each other's audio or lifecycle work
//! - **Session lock** (`Mutex<Session>`): guards one session's upstream handle and flags;
//!   never held across an `.await`
//! - **Control gate** (`tokio::sync::Mutex<()>`): serializes start/stop for one session
//!   while they await the network
//!
//! ## Handle Ownership:
//! Whoever *takes* the upstream handle out of a session is the one that finishes it.
//! Start, stop, disconnect and the upstream close callback all take the handle under the
//! session lock, so exactly one of them ever finishes a given stream.

use crate::protocol::ClientChannel;
use crate::upstream::UpstreamConnection;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::OwnedMutexGuard;

/// Lifecycle state of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No upstream stream
    Idle,
    /// Upstream stream being opened
    Starting,
    /// Upstream stream registered and receiving audio
    Active,
    /// Upstream stream being finished
    Stopping,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Active => "active",
            SessionState::Stopping => "stopping",
        }
    }
}

/// One client's logical conversation.
pub struct Session {
    channel: Arc<dyn ClientChannel>,
    upstream: Option<Arc<dyn UpstreamConnection>>,
    state: SessionState,
    /// Bumped for every upstream opened; callbacks carry the value they were armed with
    generation: u64,
    /// Highest generation whose upstream already reported closed
    closed_generation: u64,
    /// Set once the "audio without upstream" warning went out
    warned: bool,
    /// Set when the client disconnected; nothing may be installed afterwards
    detached: bool,
}

struct SessionSlot {
    session: Mutex<Session>,
    control: Arc<tokio::sync::Mutex<()>>,
}

impl SessionSlot {
    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn with<R>(&self, f: impl FnOnce(&mut Session) -> R) -> R {
        let mut session = self.lock();
        f(&mut session)
    }
}

/// Where an incoming audio frame should go.
pub enum AudioRoute {
    /// The session id is not registered (client already gone)
    Unknown,
    /// Forward to this upstream
    Upstream(Arc<dyn UpstreamConnection>),
    /// No active upstream; `first_drop` is true only for the first drop since the last start
    Dropped {
        first_drop: bool,
        channel: Arc<dyn ClientChannel>,
    },
}

/// Concurrency-safe `session_id → Session` map. Cheap to clone.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, Arc<SessionSlot>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, session_id: &str) -> Option<Arc<SessionSlot>> {
        let sessions = self.sessions.read().unwrap_or_else(|p| p.into_inner());
        sessions.get(session_id).cloned()
    }

    /// Create an idle session for a newly connected client.
    ///
    /// Returns `false` if the id is already registered.
    pub fn register(&self, session_id: &str, channel: Arc<dyn ClientChannel>) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(|p| p.into_inner());
        if sessions.contains_key(session_id) {
            return false;
        }

        let session = Session {
            channel,
            upstream: None,
            state: SessionState::Idle,
            generation: 0,
            closed_generation: 0,
            warned: false,
            detached: false,
        };
        sessions.insert(
            session_id.to_string(),
            Arc::new(SessionSlot {
                session: Mutex::new(session),
                control: Arc::new(tokio::sync::Mutex::new(())),
            }),
        );
        true
    }

    /// Remove the session entirely, handing back its upstream (if any) for finishing.
    ///
    /// The outer `None` means the id was not registered.
    pub fn remove(&self, session_id: &str) -> Option<Option<Arc<dyn UpstreamConnection>>> {
        let slot = {
            let mut sessions = self.sessions.write().unwrap_or_else(|p| p.into_inner());
            sessions.remove(session_id)?
        };

        let mut session = slot.lock();
        session.detached = true;
        session.state = SessionState::Idle;
        Some(session.upstream.take())
    }

    /// Wait for exclusive control of one session's lifecycle.
    pub async fn control_gate(&self, session_id: &str) -> Option<OwnedMutexGuard<()>> {
        let control = self.slot(session_id)?.control.clone();
        Some(control.lock_owned().await)
    }

    pub fn channel(&self, session_id: &str) -> Option<Arc<dyn ClientChannel>> {
        self.slot(session_id).map(|slot| slot.with(|s| s.channel.clone()))
    }

    /// Take the upstream out of the session and move it to `next_state`.
    ///
    /// With no upstream registered the state is left untouched.
    pub fn take_upstream(
        &self,
        session_id: &str,
        next_state: SessionState,
    ) -> Option<Arc<dyn UpstreamConnection>> {
        let slot = self.slot(session_id)?;
        let mut session = slot.lock();
        let upstream = session.upstream.take()?;
        session.state = next_state;
        Some(upstream)
    }

    /// Mark the session as opening a new upstream and return that upstream's generation.
    pub fn begin_start(&self, session_id: &str) -> Option<u64> {
        let slot = self.slot(session_id)?;
        let mut session = slot.lock();
        if session.detached {
            return None;
        }
        session.generation += 1;
        session.state = SessionState::Starting;
        Some(session.generation)
    }

    /// Register a freshly opened upstream.
    ///
    /// Refused (the handle is given back) when the client disconnected meanwhile, a newer
    /// start superseded this one, or the upstream already reported closed.
    pub fn install(
        &self,
        session_id: &str,
        generation: u64,
        upstream: Arc<dyn UpstreamConnection>,
    ) -> Result<(), Arc<dyn UpstreamConnection>> {
        let Some(slot) = self.slot(session_id) else {
            return Err(upstream);
        };
        let mut session = slot.lock();

        if session.detached
            || session.generation != generation
            || session.closed_generation >= generation
            || session.upstream.is_some()
        {
            return Err(upstream);
        }

        session.upstream = Some(upstream);
        session.state = SessionState::Active;
        session.warned = false;
        Ok(())
    }

    /// Return an idle session to `Idle` after a failed or abandoned start.
    pub fn abort_start(&self, session_id: &str, generation: u64) {
        if let Some(slot) = self.slot(session_id) {
            let mut session = slot.lock();
            if session.generation == generation && session.state == SessionState::Starting {
                session.state = SessionState::Idle;
            }
        }
    }

    pub fn set_state(&self, session_id: &str, state: SessionState) {
        if let Some(slot) = self.slot(session_id) {
            slot.with(|s| s.state = state);
        }
    }

    /// Record that the upstream of `generation` closed, clearing it if still registered.
    ///
    /// Returns the handle that was removed, if any.
    pub fn clear_if_current(
        &self,
        session_id: &str,
        generation: u64,
    ) -> Option<Arc<dyn UpstreamConnection>> {
        let slot = self.slot(session_id)?;
        let mut session = slot.lock();
        session.closed_generation = session.closed_generation.max(generation);

        if session.generation != generation || session.state != SessionState::Active {
            return None;
        }
        let upstream = session.upstream.take()?;
        session.state = SessionState::Idle;
        Some(upstream)
    }

    /// Decide where an audio frame for this session goes.
    ///
    /// The warned flag is checked and set under the session lock, so only one caller
    /// ever sees `first_drop == true` between two starts.
    pub fn route_audio(&self, session_id: &str) -> AudioRoute {
        let Some(slot) = self.slot(session_id) else {
            return AudioRoute::Unknown;
        };
        let mut session = slot.lock();

        if session.state == SessionState::Active {
            if let Some(upstream) = &session.upstream {
                return AudioRoute::Upstream(upstream.clone());
            }
        }

        let first_drop = !session.warned;
        session.warned = true;
        AudioRoute::Dropped {
            first_drop,
            channel: session.channel.clone(),
        }
    }

    pub fn state(&self, session_id: &str) -> Option<SessionState> {
        self.slot(session_id).map(|slot| slot.with(|s| s.state))
    }

    #[cfg(test)]
    pub fn has_upstream(&self, session_id: &str) -> bool {
        self.slot(session_id)
            .map(|slot| slot.with(|s| s.upstream.is_some()))
            .unwrap_or(false)
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.slot(session_id).is_some()
    }

    /// Number of connected clients.
    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    fn slots(&self) -> Vec<Arc<SessionSlot>> {
        let sessions = self.sessions.read().unwrap_or_else(|p| p.into_inner());
        sessions.values().cloned().collect()
    }

    /// Number of sessions with a registered upstream.
    pub fn active_upstreams(&self) -> usize {
        self.slots()
            .iter()
            .filter(|slot| slot.with(|s| s.upstream.is_some()))
            .count()
    }

    /// Session count per lifecycle state, keyed by state name.
    pub fn state_counts(&self) -> HashMap<&'static str, usize> {
        let mut counts = HashMap::new();
        for slot in self.slots() {
            let state = slot.with(|s| s.state);
            *counts.entry(state.as_str()).or_insert(0) += 1;
        }
        counts
    }
}
