//! # Session Lifecycle
//!
//! Drives a session between `Idle`, `Starting`, `Active` and `Stopping`.
//!
//! ## Transitions:
//! ```text
//! Idle     --start-->        Starting --opened-->  Active    (deepgram_ready)
//! Starting --open failed-->  Idle                            (connection_error)
//! Active   --start-->        Starting                        (old stream finished first)
//! Active   --stop-->         Stopping --finished--> Idle     (deepgram_stopped)
//! Active   --upstream close-->  Idle                         (no message)
//! any      --disconnect-->   removed                         (no message)
//! ```
//!
//! Start and stop for one session are serialized through the registry's control gate.
//! Disconnect never waits on the gate: it removes the session at once, and a start that
//! is still opening notices the removal when it tries to install its stream.

use super::registry::{SessionRegistry, SessionState};
use crate::error::RelayError;
use crate::protocol::{ClientChannel, ServerMessage, StopStatus};
use crate::relay::EventFanout;
use crate::upstream::{UpstreamConnector, UpstreamOptions};

use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Result of a start request.
#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    /// Stream registered and `deepgram_ready` sent
    Started,
    /// Handshake failed and `connection_error` sent
    Failed(RelayError),
    /// Stream opened but the session went away or the stream closed first
    Abandoned,
    /// Session id not registered
    UnknownSession,
}

/// Owns the lifecycle rules for every session. Cheap to clone.
#[derive(Clone)]
pub struct SessionController {
    registry: SessionRegistry,
    connector: Arc<dyn UpstreamConnector>,
}

impl SessionController {
    pub fn new(registry: SessionRegistry, connector: Arc<dyn UpstreamConnector>) -> Self {
        Self {
            registry,
            connector,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Register a newly connected client and acknowledge it.
    pub fn connect(&self, session_id: &str, channel: Arc<dyn ClientChannel>) -> bool {
        if !self.registry.register(session_id, channel.clone()) {
            warn!(session_id = %session_id, "Session id already registered");
            return false;
        }
        info!(session_id = %session_id, "Client connected");
        channel.emit(ServerMessage::connected(session_id));
        true
    }

    /// Open a new upstream stream, replacing any existing one.
    pub async fn start(&self, session_id: &str, options: &UpstreamOptions) -> StartOutcome {
        let Some(_gate) = self.registry.control_gate(session_id).await else {
            warn!(session_id = %session_id, "Start requested for unknown session");
            return StartOutcome::UnknownSession;
        };

        if let Some(previous) = self.registry.take_upstream(session_id, SessionState::Starting) {
            info!(session_id = %session_id, "Closing existing Deepgram connection before restart");
            if let Err(err) = previous.finish().await {
                error!(session_id = %session_id, "{}", err);
            }
        }

        let Some(generation) = self.registry.begin_start(session_id) else {
            return StartOutcome::UnknownSession;
        };
        let Some(channel) = self.registry.channel(session_id) else {
            return StartOutcome::UnknownSession;
        };

        info!(session_id = %session_id, model = %options.model, generation, "Opening Deepgram connection");
        let handler =
            EventFanout::new(session_id, generation, self.registry.clone(), channel.clone())
                .into_handler();

        let upstream = match self.connector.open(session_id, options, handler).await {
            Ok(upstream) => upstream,
            Err(err) => {
                error!(session_id = %session_id, "{}", err);
                self.registry.abort_start(session_id, generation);
                if self.registry.contains(session_id) {
                    channel.emit(ServerMessage::ConnectionError {
                        message: "Failed to connect to Deepgram".to_string(),
                    });
                }
                return StartOutcome::Failed(err);
            }
        };

        match self.registry.install(session_id, generation, upstream) {
            Ok(()) => {
                info!(session_id = %session_id, "Deepgram connection ready");
                channel.emit(ServerMessage::ready());
                StartOutcome::Started
            }
            Err(orphan) => {
                warn!(session_id = %session_id, "Deepgram connection opened for a session that moved on, closing it");
                if let Err(err) = orphan.finish().await {
                    debug!(session_id = %session_id, "{}", err);
                }
                self.registry.abort_start(session_id, generation);
                if self.registry.contains(session_id) {
                    channel.emit(ServerMessage::ConnectionError {
                        message: "Deepgram connection closed before it was ready".to_string(),
                    });
                }
                StartOutcome::Abandoned
            }
        }
    }

    /// Finish the session's upstream stream and report the outcome to the client.
    pub async fn stop(&self, session_id: &str) -> StopStatus {
        let Some(_gate) = self.registry.control_gate(session_id).await else {
            warn!(session_id = %session_id, "Stop requested for unknown session");
            return StopStatus::NoConnection;
        };
        let channel = self.registry.channel(session_id);
        let emit = |message: ServerMessage| {
            if let Some(channel) = &channel {
                channel.emit(message);
            }
        };

        let Some(upstream) = self.registry.take_upstream(session_id, SessionState::Stopping) else {
            warn!(session_id = %session_id, state = ?self.registry.state(session_id), "No active Deepgram connection to stop");
            emit(ServerMessage::stopped(StopStatus::NoConnection, None));
            return StopStatus::NoConnection;
        };

        info!(session_id = %session_id, upstream_state = ?upstream.state(), "Finishing Deepgram connection");
        let result = upstream.finish().await;
        self.registry.set_state(session_id, SessionState::Idle);

        match result {
            Ok(()) => {
                info!(session_id = %session_id, "Deepgram connection stopped");
                emit(ServerMessage::stopped(StopStatus::Stopped, None));
                StopStatus::Stopped
            }
            Err(err) => {
                error!(session_id = %session_id, "{}", err);
                emit(ServerMessage::stopped(StopStatus::Error, Some(err.to_string())));
                StopStatus::Error
            }
        }
    }

    /// Tear the session down after the client went away. Nothing is sent to the client.
    pub async fn disconnect(&self, session_id: &str) {
        match self.registry.remove(session_id) {
            None => debug!(session_id = %session_id, "Session already removed"),
            Some(None) => info!(session_id = %session_id, "Client disconnected"),
            Some(Some(upstream)) => {
                info!(session_id = %session_id, "Client disconnected, finishing Deepgram connection");
                if let Err(err) = upstream.finish().await {
                    error!(session_id = %session_id, "{}", err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testing::RecordingChannel;
    use crate::protocol::AudioPayload;
    use crate::relay::{AudioRelay, Delivery};
    use crate::upstream::testing::FakeConnector;
    use crate::upstream::UpstreamEvent;
    use std::time::Duration;

    fn options() -> UpstreamOptions {
        UpstreamOptions {
            model: "nova-3".to_string(),
            language: "en-US".to_string(),
            interim_results: false,
            punctuate: true,
            keepalive: true,
            keepalive_interval: Duration::from_secs(5),
            keepalive_timeout: Duration::from_secs(30),
        }
    }

    fn setup() -> (SessionController, Arc<FakeConnector>) {
        let connector = FakeConnector::new();
        let controller = SessionController::new(SessionRegistry::new(), connector.clone());
        (controller, connector)
    }

    fn connect(controller: &SessionController, id: &str) -> Arc<RecordingChannel> {
        let channel = RecordingChannel::new();
        assert!(controller.connect(id, channel.clone()));
        channel
    }

    fn count(channel: &RecordingChannel, pred: impl Fn(&ServerMessage) -> bool) -> usize {
        channel.count_where(pred)
    }

    #[tokio::test]
    async fn test_connect_acknowledges_with_session_id() {
        let (controller, _) = setup();
        let channel = connect(&controller, "s1");

        assert_eq!(channel.messages(), vec![ServerMessage::connected("s1")]);
        assert_eq!(controller.registry().state("s1"), Some(SessionState::Idle));
        assert!(!controller.connect("s1", RecordingChannel::new()));
    }

    #[tokio::test]
    async fn test_start_then_stop() {
        let (controller, connector) = setup();
        let channel = connect(&controller, "s1");

        assert_eq!(controller.start("s1", &options()).await, StartOutcome::Started);
        assert_eq!(controller.registry().state("s1"), Some(SessionState::Active));
        assert_eq!(connector.last_options(), Some(options()));

        assert_eq!(controller.stop("s1").await, StopStatus::Stopped);
        assert_eq!(controller.registry().state("s1"), Some(SessionState::Idle));
        assert_eq!(connector.connection(0).finish_count(), 1);
        assert_eq!(
            channel.messages(),
            vec![
                ServerMessage::connected("s1"),
                ServerMessage::ready(),
                ServerMessage::stopped(StopStatus::Stopped, None),
            ]
        );
    }

    #[tokio::test]
    async fn test_stop_without_upstream_reports_no_connection() {
        let (controller, _) = setup();
        let channel = connect(&controller, "s1");

        assert_eq!(controller.stop("s1").await, StopStatus::NoConnection);
        assert_eq!(
            channel.messages().last(),
            Some(&ServerMessage::stopped(StopStatus::NoConnection, None))
        );
        assert_eq!(controller.stop("ghost").await, StopStatus::NoConnection);
    }

    #[tokio::test]
    async fn test_finish_failure_still_deregisters() {
        let (controller, connector) = setup();
        let channel = connect(&controller, "s1");
        controller.start("s1", &options()).await;
        connector.connection(0).set_fail_finish(true);

        assert_eq!(controller.stop("s1").await, StopStatus::Error);
        assert!(!controller.registry().has_upstream("s1"));
        assert_eq!(controller.registry().state("s1"), Some(SessionState::Idle));
        assert!(matches!(
            channel.messages().last(),
            Some(ServerMessage::DeepgramStopped {
                status: StopStatus::Error,
                message: Some(_)
            })
        ));
    }

    #[tokio::test]
    async fn test_failed_open_reports_connection_error() {
        let (controller, connector) = setup();
        let channel = connect(&controller, "s1");
        connector.set_fail_opens(true);

        let outcome = controller.start("s1", &options()).await;
        assert!(matches!(outcome, StartOutcome::Failed(RelayError::ConnectFailed(_))));
        assert_eq!(controller.registry().state("s1"), Some(SessionState::Idle));
        assert_eq!(
            channel.messages().last(),
            Some(&ServerMessage::ConnectionError {
                message: "Failed to connect to Deepgram".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_restart_finishes_previous_stream_once() {
        let (controller, connector) = setup();
        let channel = connect(&controller, "s1");

        controller.start("s1", &options()).await;
        controller.start("s1", &options()).await;

        assert_eq!(connector.open_count(), 2);
        assert_eq!(connector.connection(0).finish_count(), 1);
        assert_eq!(connector.connection(1).finish_count(), 0);
        assert_eq!(controller.registry().active_upstreams(), 1);
        assert_eq!(count(&channel, |m| *m == ServerMessage::ready()), 2);

        // Late close from the replaced stream must not clear the new one
        connector.emit(0, UpstreamEvent::Close);
        assert!(controller.registry().has_upstream("s1"));
    }

    #[tokio::test]
    async fn test_upstream_close_returns_to_idle_without_message() {
        let (controller, connector) = setup();
        let channel = connect(&controller, "s1");
        controller.start("s1", &options()).await;

        connector.emit(0, UpstreamEvent::Close);

        assert_eq!(controller.registry().state("s1"), Some(SessionState::Idle));
        assert_eq!(channel.messages().len(), 2);

        // Stop after the close has nothing left to finish
        assert_eq!(controller.stop("s1").await, StopStatus::NoConnection);
        assert_eq!(connector.connection(0).finish_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_racing_close_finishes_at_most_once() {
        let (controller, connector) = setup();
        let channel = connect(&controller, "s1");
        controller.start("s1", &options()).await;
        let release = connector.connection(0).hold_finish();

        let stopper = controller.clone();
        let stop = tokio::spawn(async move { stopper.stop("s1").await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Stop has taken the handle and is parked inside finish
        assert!(!stop.is_finished());
        assert_eq!(controller.registry().state("s1"), Some(SessionState::Stopping));
        assert!(!controller.registry().has_upstream("s1"));

        connector.emit(0, UpstreamEvent::Close);
        release.notify_one();
        let status = stop.await.unwrap();

        assert_eq!(status, StopStatus::Stopped);
        assert_eq!(connector.connection(0).finish_count(), 1);
        assert!(!controller.registry().has_upstream("s1"));
        assert_eq!(controller.registry().state("s1"), Some(SessionState::Idle));
        assert_eq!(
            channel.messages().last(),
            Some(&ServerMessage::stopped(StopStatus::Stopped, None))
        );
    }

    #[tokio::test]
    async fn test_disconnect_finishes_upstream_silently() {
        let (controller, connector) = setup();
        let channel = connect(&controller, "s1");
        controller.start("s1", &options()).await;

        controller.disconnect("s1").await;

        assert!(!controller.registry().contains("s1"));
        assert_eq!(connector.connection(0).finish_count(), 1);
        assert_eq!(channel.messages().len(), 2);

        // Events from the finished stream go nowhere
        connector.emit(0, UpstreamEvent::Transcript("too late".to_string()));
        assert_eq!(channel.messages().len(), 2);
    }

    #[tokio::test]
    async fn test_disconnect_during_open_never_registers() {
        let (controller, connector) = setup();
        let channel = connect(&controller, "s1");
        let release = connector.hold_opens();

        let starter = controller.clone();
        let start = tokio::spawn(async move { starter.start("s1", &options()).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        controller.disconnect("s1").await;
        release.notify_one();

        assert_eq!(start.await.unwrap(), StartOutcome::Abandoned);
        assert!(!controller.registry().contains("s1"));
        assert_eq!(controller.registry().active_upstreams(), 0);
        assert_eq!(connector.connection(0).finish_count(), 1);
        assert_eq!(channel.messages(), vec![ServerMessage::connected("s1")]);
    }

    #[tokio::test]
    async fn test_stop_waits_for_pending_start() {
        let (controller, connector) = setup();
        let channel = connect(&controller, "s1");
        let release = connector.hold_opens();

        let starter = controller.clone();
        let start = tokio::spawn(async move { starter.start("s1", &options()).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let stopper = controller.clone();
        let stop = tokio::spawn(async move { stopper.stop("s1").await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!stop.is_finished());

        release.notify_one();
        assert_eq!(start.await.unwrap(), StartOutcome::Started);
        assert_eq!(stop.await.unwrap(), StopStatus::Stopped);
        assert_eq!(connector.connection(0).finish_count(), 1);
        assert_eq!(
            channel.messages()[1..].to_vec(),
            vec![
                ServerMessage::ready(),
                ServerMessage::stopped(StopStatus::Stopped, None)
            ]
        );
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let (controller, connector) = setup();
        let relay = AudioRelay::new(controller.registry().clone(), 20);
        let a = connect(&controller, "a");
        let b = connect(&controller, "b");

        controller.start("a", &options()).await;
        controller.start("b", &options()).await;

        relay.deliver("a", AudioPayload::Binary(vec![1]));
        relay.deliver("b", AudioPayload::Binary(vec![2]));
        assert_eq!(connector.connection(0).sent_frames(), vec![vec![1]]);
        assert_eq!(connector.connection(1).sent_frames(), vec![vec![2]]);

        connector.emit(0, UpstreamEvent::Transcript("alpha".to_string()));
        connector.emit(1, UpstreamEvent::Transcript("beta".to_string()));
        assert_eq!(
            a.messages().last(),
            Some(&ServerMessage::TranscriptionUpdate {
                transcription: "alpha".to_string()
            })
        );
        assert_eq!(
            b.messages().last(),
            Some(&ServerMessage::TranscriptionUpdate {
                transcription: "beta".to_string()
            })
        );

        controller.stop("a").await;
        assert!(controller.registry().has_upstream("b"));
        assert!(matches!(
            relay.deliver("b", AudioPayload::Binary(vec![3])),
            Delivery::Forwarded(1)
        ));
    }

    #[tokio::test]
    async fn test_metadata_is_logged_not_forwarded() {
        let (controller, connector) = setup();
        let channel = connect(&controller, "s1");
        controller.start("s1", &options()).await;

        connector.emit(0, UpstreamEvent::Metadata(serde_json::json!({"duration": 1.5})));
        connector.emit(0, UpstreamEvent::Transcript("still here".to_string()));

        assert_eq!(
            count(&channel, |m| matches!(m, ServerMessage::TranscriptionUpdate { .. })),
            1
        );
    }
}
