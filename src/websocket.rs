//! # WebSocket Relay Endpoint
//!
//! Browser clients connect to `/ws`, stream microphone audio and receive transcripts.
//! Each connection is one actor and one session.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: the server assigns a session id and replies `server_status`
//! 2. **Start**: `toggle_transcription {action: "start"}` opens the upstream stream
//! 3. **Audio Streaming**: binary frames, or `audio_stream` envelopes with base64 data
//! 4. **Transcripts**: `transcription_update` messages for this session only
//! 5. **Stop / Disconnect**: `toggle_transcription {action: "stop"}`, or closing the socket
//!
//! ## Actor Model:
//! Upstream events arrive on tokio tasks outside the actor. They reach the socket as
//! [`Outbound`] messages through the actor's address, so only the actor ever writes frames.

use crate::protocol::{AudioPayload, ClientChannel, ClientMessage, ServerMessage, ToggleAction};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// One server → client message waiting to be written to the socket.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Outbound(pub ServerMessage);

/// [`ClientChannel`] backed by a socket actor's address.
pub struct SocketChannel(Recipient<Outbound>);

impl ClientChannel for SocketChannel {
    fn emit(&self, message: ServerMessage) {
        self.0.do_send(Outbound(message));
    }
}

/// WebSocket actor for one relay connection.
pub struct RelaySocket {
    session_id: String,
    state: AppState,
    last_heartbeat: Instant,
}

impl RelaySocket {
    pub fn new(state: AppState) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            state,
            last_heartbeat: Instant::now(),
        }
    }

    /// Ping the client periodically and drop it once it stops answering.
    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(session_id = %act.session_id, "WebSocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn handle_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        match parse_client_message(text) {
            Some(ClientMessage::AudioStream(encoded)) => {
                self.forward_audio(AudioPayload::Base64(encoded));
            }
            Some(ClientMessage::ToggleTranscription { action }) => {
                self.handle_toggle(action, ctx);
            }
            None => {
                warn!(session_id = %self.session_id, "Ignoring malformed client message");
            }
        }
    }

    /// Run start/stop on the actor's context without blocking frame processing.
    ///
    /// The session's control gate keeps toggles in arrival order.
    fn handle_toggle(&mut self, action: ToggleAction, ctx: &mut ws::WebsocketContext<Self>) {
        let controller = self.state.controller.clone();
        let session_id = self.session_id.clone();
        info!(session_id = %session_id, ?action, "Toggle transcription");

        match action {
            ToggleAction::Start => {
                let options = self.state.upstream_options();
                ctx.spawn(
                    async move {
                        controller.start(&session_id, &options).await;
                    }
                    .into_actor(self),
                );
            }
            ToggleAction::Stop => {
                ctx.spawn(
                    async move {
                        controller.stop(&session_id).await;
                    }
                    .into_actor(self),
                );
            }
        }
    }

    fn forward_audio(&self, payload: AudioPayload) {
        self.state.relay.deliver(&self.session_id, payload);
    }
}

/// Decode one text frame; `None` for anything that is not a known client event.
pub fn parse_client_message(text: &str) -> Option<ClientMessage> {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => Some(message),
        Err(err) => {
            debug!("Client message rejected: {}", err);
            None
        }
    }
}

impl Actor for RelaySocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let channel: Arc<dyn ClientChannel> =
            Arc::new(SocketChannel(ctx.address().recipient()));
        if !self.state.controller.connect(&self.session_id, channel) {
            ctx.stop();
            return;
        }
        self.start_heartbeat(ctx);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(session_id = %self.session_id, "WebSocket connection stopped");

        let controller = self.state.controller.clone();
        let session_id = self.session_id.clone();
        tokio::spawn(async move {
            controller.disconnect(&session_id).await;
        });
    }
}

impl Handler<Outbound> for RelaySocket {
    type Result = ();

    fn handle(&mut self, msg: Outbound, ctx: &mut Self::Context) {
        match serde_json::to_string(&msg.0) {
            Ok(json) => ctx.text(json),
            Err(err) => error!(session_id = %self.session_id, "Failed to encode message: {}", err),
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RelaySocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                self.handle_text(&text, ctx);
            }
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                self.forward_audio(AudioPayload::Binary(data.to_vec()));
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(session_id = %self.session_id, "WebSocket closed: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(session_id = %self.session_id, "Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(session_id = %self.session_id, "WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// Upgrades the request and hands the connection to a new [`RelaySocket`] actor.
pub async fn relay_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!("New WebSocket connection request from: {:?}", req.connection_info().peer_addr());
    ws::start(RelaySocket::new(state.get_ref().clone()), &req, stream)
}
