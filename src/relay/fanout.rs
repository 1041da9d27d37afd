//! # Event Fan-out
//!
//! Routes the events of one upstream stream back to the one client that owns it.
//! A fan-out is built when the upstream is opened and carries the session id and
//! generation it belongs to, so it never has to look the owner up again and never
//! delivers to anyone else.
//!
//! ## Event Mapping:
//! | Upstream event | Client message | Log |
//! |---|---|---|
//! | open | (none, `deepgram_ready` comes from the lifecycle controller) | info |
//! | transcript (non-empty) | `transcription_update` | info |
//! | transcript (empty) | (none) | none |
//! | metadata | (none) | debug |
//! | error | `connection_error` | error |
//! | close | (none, session returns to idle) | info |

use crate::protocol::{ClientChannel, ServerMessage};
use crate::session::SessionRegistry;
use crate::upstream::{EventHandler, UpstreamEvent};

use std::sync::Arc;
use tracing::{debug, error, info};

pub struct EventFanout {
    session_id: String,
    generation: u64,
    registry: SessionRegistry,
    channel: Arc<dyn ClientChannel>,
}

impl EventFanout {
    pub fn new(
        session_id: &str,
        generation: u64,
        registry: SessionRegistry,
        channel: Arc<dyn ClientChannel>,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            generation,
            registry,
            channel,
        }
    }

    /// Wrap into the callback handed to the upstream connector.
    pub fn into_handler(self) -> EventHandler {
        let fanout = Arc::new(self);
        Arc::new(move |event| fanout.handle(event))
    }

    pub fn handle(&self, event: UpstreamEvent) {
        match event {
            UpstreamEvent::Open => {
                info!(session_id = %self.session_id, generation = self.generation, "Deepgram connection opened");
            }
            UpstreamEvent::Transcript(text) => {
                if text.is_empty() {
                    return;
                }
                info!(session_id = %self.session_id, transcript = %text, "Transcript received");
                self.deliver(ServerMessage::TranscriptionUpdate { transcription: text });
            }
            UpstreamEvent::Metadata(_) => {
                debug!(session_id = %self.session_id, "Metadata received");
            }
            UpstreamEvent::Error(message) => {
                error!(session_id = %self.session_id, "Deepgram error: {}", message);
                self.deliver(ServerMessage::ConnectionError { message });
            }
            UpstreamEvent::Close => {
                if self
                    .registry
                    .clear_if_current(&self.session_id, self.generation)
                    .is_some()
                {
                    info!(session_id = %self.session_id, "Deepgram connection closed, session is idle");
                } else {
                    debug!(session_id = %self.session_id, generation = self.generation, "Deepgram connection closed after deregistration");
                }
            }
        }
    }

    /// Disconnected clients get nothing.
    fn deliver(&self, message: ServerMessage) {
        if self.registry.contains(&self.session_id) {
            self.channel.emit(message);
        }
    }
}
