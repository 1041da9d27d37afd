//! # Deepgram Live Transcription Client
//!
//! Concrete [`UpstreamConnector`] for Deepgram's streaming `listen` endpoint.
//!
//! ## Wire Protocol:
//! 1. **Handshake**: `wss://.../v1/listen?model=..&language=..&interim_results=..&punctuate=..`
//!    with an `Authorization: Token <key>` header
//! 2. **Audio**: binary WebSocket frames, forwarded exactly as received from the browser
//! 3. **Keep-alive**: `{"type":"KeepAlive"}` text frames while the client is silent
//! 4. **End of stream**: `{"type":"CloseStream"}`; the backend flushes final results and closes
//! 5. **Results**: JSON text frames typed `Results`, `Metadata`, `Error`, ...
//!
//! ## Task Layout:
//! Each open session runs two tokio tasks. The writer owns the sink half and drains the
//! bounded frame queue; a pending finish request always wins over queued audio. The reader
//! owns the stream half and is the only place events are delivered from.

use super::{
    dispatch_guarded, AtomicConnectionState, ConnectionState, EventHandler, UpstreamConnection,
    UpstreamConnector, UpstreamEvent, UpstreamOptions,
};
use crate::config::AppConfig;
use crate::error::RelayError;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type DeepgramStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type FinishReply = oneshot::Sender<Result<(), RelayError>>;

const KEEPALIVE_MESSAGE: &str = r#"{"type":"KeepAlive"}"#;
const CLOSE_STREAM_MESSAGE: &str = r#"{"type":"CloseStream"}"#;

/// Opens Deepgram live transcription sessions.
pub struct DeepgramConnector {
    api_key: String,
    url: String,
    connect_timeout: Duration,
    finish_timeout: Duration,
    frame_queue_capacity: usize,
}

impl DeepgramConnector {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            api_key: config.deepgram.api_key.clone(),
            url: config.deepgram.url.clone(),
            connect_timeout: config.deepgram.connect_timeout(),
            finish_timeout: config.deepgram.finish_timeout(),
            frame_queue_capacity: config.relay.frame_queue_capacity,
        }
    }
}

#[async_trait]
impl UpstreamConnector for DeepgramConnector {
    async fn open(
        &self,
        session_id: &str,
        options: &UpstreamOptions,
        handler: EventHandler,
    ) -> Result<Arc<dyn UpstreamConnection>, RelayError> {
        let url = build_listen_url(&self.url, options);
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| RelayError::ConnectFailed(format!("invalid listen URL: {}", e)))?;
        let token = HeaderValue::from_str(&format!("Token {}", self.api_key))
            .map_err(|e| RelayError::ConnectFailed(format!("invalid API key header: {}", e)))?;
        request.headers_mut().insert(AUTHORIZATION, token);

        debug!(session_id = %session_id, model = %options.model, language = %options.language, "Opening Deepgram stream");

        let (stream, response) = match time::timeout(self.connect_timeout, connect_async(request)).await {
            Ok(Ok(pair)) => pair,
            Ok(Err(err)) => return Err(RelayError::ConnectFailed(err.to_string())),
            Err(_) => {
                return Err(RelayError::ConnectFailed(format!(
                    "no handshake within {}s",
                    self.connect_timeout.as_secs()
                )))
            }
        };
        debug!(session_id = %session_id, status = %response.status(), "Deepgram handshake complete");

        let (sink, source) = stream.split();
        let state = Arc::new(AtomicConnectionState::new(ConnectionState::Open));
        let (frame_tx, frame_rx) = mpsc::channel(self.frame_queue_capacity);
        let (finish_tx, finish_rx) = mpsc::channel(1);

        tokio::spawn(pump_outbound(
            session_id.to_string(),
            sink,
            frame_rx,
            finish_rx,
            options.clone(),
        ));
        tokio::spawn(pump_inbound(
            session_id.to_string(),
            source,
            handler,
            state.clone(),
        ));

        Ok(Arc::new(DeepgramConnection {
            session_id: session_id.to_string(),
            frames: frame_tx,
            finish: finish_tx,
            state,
            finish_timeout: self.finish_timeout,
        }))
    }
}

/// Handle for one open Deepgram stream.
///
/// Dropping the last handle closes the frame queue, which makes the writer send
/// CloseStream on its own.
pub struct DeepgramConnection {
    session_id: String,
    frames: mpsc::Sender<Vec<u8>>,
    finish: mpsc::Sender<FinishReply>,
    state: Arc<AtomicConnectionState>,
    finish_timeout: Duration,
}

#[async_trait]
impl UpstreamConnection for DeepgramConnection {
    fn send(&self, frame: Vec<u8>) -> Result<(), RelayError> {
        let state = self.state.load();
        if state != ConnectionState::Open {
            return Err(RelayError::SendFailed(format!("stream is {:?}", state)));
        }

        self.frames.try_send(frame).map_err(|err| match err {
            TrySendError::Full(_) => RelayError::SendFailed("outbound queue full".to_string()),
            TrySendError::Closed(_) => RelayError::SendFailed("upstream writer stopped".to_string()),
        })
    }

    async fn finish(&self) -> Result<(), RelayError> {
        if !self.state.transition(ConnectionState::Open, ConnectionState::Closing) {
            debug!(session_id = %self.session_id, state = ?self.state.load(), "Finish ignored, stream already closing");
            return Ok(());
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        if self.finish.try_send(reply_tx).is_err() {
            debug!(session_id = %self.session_id, "Finish ignored, writer already gone");
            return Ok(());
        }

        match time::timeout(self.finish_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                debug!(session_id = %self.session_id, "Writer exited before confirming CloseStream");
                Ok(())
            }
            Err(_) => Err(RelayError::FinishFailed(format!(
                "CloseStream not written within {}s",
                self.finish_timeout.as_secs()
            ))),
        }
    }

    fn state(&self) -> ConnectionState {
        self.state.load()
    }
}

/// Build the listen URL with the per-session options as query parameters.
fn build_listen_url(base: &str, options: &UpstreamOptions) -> String {
    format!(
        "{}?model={}&language={}&interim_results={}&punctuate={}",
        base,
        urlencoding::encode(&options.model),
        urlencoding::encode(&options.language),
        options.interim_results,
        options.punctuate,
    )
}

/// Writer task: audio frames, keep-alives and the final CloseStream.
async fn pump_outbound(
    session_id: String,
    mut sink: SplitSink<DeepgramStream, Message>,
    mut frames: mpsc::Receiver<Vec<u8>>,
    mut finish: mpsc::Receiver<FinishReply>,
    options: UpstreamOptions,
) {
    let mut keepalive = options.keepalive.then(|| {
        let mut interval = time::interval_at(
            Instant::now() + options.keepalive_interval,
            options.keepalive_interval,
        );
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });
    let mut last_audio = Instant::now();

    loop {
        tokio::select! {
            biased;

            reply = finish.recv() => {
                let result = close_stream(&mut sink).await;
                if let Err(err) = &result {
                    warn!(session_id = %session_id, "{}", err);
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
                break;
            }

            frame = frames.recv() => match frame {
                Some(frame) => {
                    if let Err(err) = sink.send(Message::Binary(frame)).await {
                        warn!(session_id = %session_id, "Audio frame write failed: {}", err);
                        break;
                    }
                    last_audio = Instant::now();
                }
                None => {
                    // Every handle was dropped without an explicit finish
                    let _ = close_stream(&mut sink).await;
                    break;
                }
            },

            _ = next_tick(&mut keepalive) => {
                let idle = last_audio.elapsed();
                if should_send_keepalive(idle, &options) {
                    if let Err(err) = sink.send(Message::Text(KEEPALIVE_MESSAGE.to_string())).await {
                        warn!(session_id = %session_id, "KeepAlive write failed: {}", err);
                        break;
                    }
                    debug!(session_id = %session_id, idle_secs = idle.as_secs(), "Sent KeepAlive");
                }
            }
        }
    }
}

async fn close_stream(sink: &mut SplitSink<DeepgramStream, Message>) -> Result<(), RelayError> {
    sink.send(Message::Text(CLOSE_STREAM_MESSAGE.to_string()))
        .await
        .map_err(|e| RelayError::FinishFailed(e.to_string()))
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Keep-alives only cover silence up to the configured timeout.
fn should_send_keepalive(idle: Duration, options: &UpstreamOptions) -> bool {
    options.keepalive && idle >= options.keepalive_interval && idle <= options.keepalive_timeout
}

/// Reader task: turns backend frames into events, then reports the close.
async fn pump_inbound(
    session_id: String,
    mut source: SplitStream<DeepgramStream>,
    handler: EventHandler,
    state: Arc<AtomicConnectionState>,
) {
    dispatch_guarded(&session_id, &handler, UpstreamEvent::Open);

    while let Some(message) = source.next().await {
        match message {
            Ok(Message::Text(text)) => match parse_message(&text) {
                Ok(Some(event)) => dispatch_guarded(&session_id, &handler, event),
                Ok(None) => {}
                Err(err) => warn!(session_id = %session_id, "Unparseable Deepgram message: {}", err),
            },
            Ok(Message::Close(frame)) => {
                if let Some(frame) = frame {
                    if frame.code != CloseCode::Normal {
                        let reason = format!(
                            "stream closed by upstream ({}): {}",
                            u16::from(frame.code),
                            frame.reason
                        );
                        dispatch_guarded(&session_id, &handler, UpstreamEvent::Error(reason));
                    }
                }
                break;
            }
            Ok(_) => {}
            Err(err) => {
                dispatch_guarded(&session_id, &handler, UpstreamEvent::Error(err.to_string()));
                break;
            }
        }
    }

    state.store(ConnectionState::Closed);
    info!(session_id = %session_id, "Deepgram stream closed");
    dispatch_guarded(&session_id, &handler, UpstreamEvent::Close);
}

#[derive(Debug, Deserialize)]
struct ResultsMessage {
    channel: ResultsChannel,
}

#[derive(Debug, Deserialize)]
struct ResultsChannel {
    #[serde(default)]
    alternatives: Vec<Alternative>,
}

#[derive(Debug, Deserialize)]
struct Alternative {
    #[serde(default)]
    transcript: String,
}

/// Map one backend text frame to an event. Frame types the relay does not use map to `None`.
fn parse_message(text: &str) -> Result<Option<UpstreamEvent>, serde_json::Error> {
    let value: Value = serde_json::from_str(text)?;

    let event = match value.get("type").and_then(Value::as_str) {
        Some("Results") => {
            let results: ResultsMessage = serde_json::from_value(value)?;
            let transcript = results
                .channel
                .alternatives
                .into_iter()
                .next()
                .map(|alt| alt.transcript)
                .unwrap_or_default();
            Some(UpstreamEvent::Transcript(transcript))
        }
        Some("Metadata") => Some(UpstreamEvent::Metadata(value)),
        Some("Error") => {
            let description = value
                .get("description")
                .or_else(|| value.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("unknown upstream error")
                .to_string();
            Some(UpstreamEvent::Error(description))
        }
        other => {
            debug!("Ignoring Deepgram message type {:?}", other);
            None
        }
    };

    Ok(event)
}
