//! # Audio Relay
//!
//! Forwards client audio chunks to the session's upstream stream.
//!
//! ## Delivery Rules:
//! 1. **No upstream**: the chunk is dropped. The first drop since the last successful start
//!    logs a warning and sends `connection_lost`; later drops are silent. Audio racing a
//!    stop or a start is normal, so this is never an error.
//! 2. **Base64 text**: decoded with the standard alphabet; a bad chunk is logged and dropped.
//! 3. **Binary**: forwarded untouched.
//! 4. **Send failure**: logged only. The upstream's own error/close events decide teardown.
//!
//! ## Performance:
//! Audio arrives many times a second per client, so per-frame diagnostics are sampled:
//! only one frame in `log_sample_every` is logged.

use crate::error::RelayError;
use crate::protocol::{AudioPayload, ServerMessage};
use crate::session::{AudioRoute, SessionRegistry};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// What happened to one audio chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// Handed to the upstream (byte count)
    Forwarded(usize),
    /// Session has no active upstream
    NoUpstream,
    /// Session id is not registered
    UnknownSession,
    /// Decode or send failed
    Rejected(RelayError),
}

/// Counters exposed on the health endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RelayStats {
    pub frames_relayed: u64,
    pub frames_dropped: u64,
}

pub struct AudioRelay {
    registry: SessionRegistry,
    log_sample_every: AtomicU64,
    frame_counter: AtomicU64,
    frames_relayed: AtomicU64,
    frames_dropped: AtomicU64,
}

impl AudioRelay {
    pub fn new(registry: SessionRegistry, log_sample_every: u64) -> Self {
        Self {
            registry,
            log_sample_every: AtomicU64::new(log_sample_every.max(1)),
            frame_counter: AtomicU64::new(0),
            frames_relayed: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
        }
    }

    pub fn set_log_sample_every(&self, every: u64) {
        self.log_sample_every.store(every.max(1), Ordering::Relaxed);
    }

    pub fn deliver(&self, session_id: &str, payload: AudioPayload) -> Delivery {
        let upstream = match self.registry.route_audio(session_id) {
            AudioRoute::Upstream(upstream) => upstream,
            AudioRoute::Dropped { first_drop, channel } => {
                self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                if first_drop {
                    warn!(session_id = %session_id, "Received audio but no active connection exists");
                    channel.emit(ServerMessage::ConnectionLost {
                        message: "No active Deepgram connection".to_string(),
                    });
                }
                return Delivery::NoUpstream;
            }
            AudioRoute::Unknown => {
                self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                debug!(session_id = %session_id, "Audio for unknown session dropped");
                return Delivery::UnknownSession;
            }
        };

        let frame_no = self.frame_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let sampled = frame_no % self.log_sample_every.load(Ordering::Relaxed) == 0;
        let was_text = matches!(payload, AudioPayload::Base64(_));

        let frame = match normalize(payload) {
            Ok(frame) => frame,
            Err(err) => {
                self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(session_id = %session_id, "{}", err);
                return Delivery::Rejected(err);
            }
        };

        if sampled {
            debug!(session_id = %session_id, bytes = frame.len(), base64 = was_text, frame_no, "Audio frame");
        }

        let len = frame.len();
        match upstream.send(frame) {
            Ok(()) => {
                self.frames_relayed.fetch_add(1, Ordering::Relaxed);
                Delivery::Forwarded(len)
            }
            Err(err) => {
                self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(session_id = %session_id, "{}", err);
                Delivery::Rejected(err)
            }
        }
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            frames_relayed: self.frames_relayed.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Turn a client chunk into the raw bytes the upstream expects.
pub fn normalize(payload: AudioPayload) -> Result<Vec<u8>, RelayError> {
    match payload {
        AudioPayload::Binary(bytes) => Ok(bytes),
        AudioPayload::Base64(text) => BASE64
            .decode(text.trim())
            .map_err(|e| RelayError::DecodeFailed(e.to_string())),
    }
}
