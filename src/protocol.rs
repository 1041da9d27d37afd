//! # Client Message Protocol
//!
//! Messages exchanged with browser clients over the `/ws` WebSocket.
//!
//! ## Message Format:
//! - **Text frames**: JSON envelopes `{"event": "<name>", "data": <payload>}`
//! - **Binary frames**: raw `audio_stream` chunks (no envelope)
//!
//! ## Client → Server:
//! - `audio_stream`: base64 audio as the envelope's string data
//! - `toggle_transcription`: `{"action": "start" | "stop"}`
//!
//! ## Server → Client:
//! - `server_status`, `deepgram_ready`, `connection_error`, `connection_lost`,
//!   `deepgram_stopped`, `transcription_update`

use serde::{Deserialize, Serialize};

/// Messages the client sends as JSON text frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    /// One base64-encoded audio chunk
    AudioStream(String),

    /// Start or stop the upstream transcription stream
    ToggleTranscription { action: ToggleAction },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToggleAction {
    Start,
    Stop,
}

/// Outcome reported in `deepgram_stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopStatus {
    Stopped,
    Error,
    NoConnection,
}

/// Messages the server sends to one client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Connection acknowledged
    ServerStatus { status: String, session_id: String },

    /// Upstream transcription stream is open
    DeepgramReady { status: String },

    /// Upstream could not be opened, or reported an error
    ConnectionError { message: String },

    /// Audio arrived while no upstream stream was active
    ConnectionLost { message: String },

    /// Result of a stop request
    DeepgramStopped {
        status: StopStatus,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        message: Option<String>,
    },

    /// Recognized text
    TranscriptionUpdate { transcription: String },
}

impl ServerMessage {
    pub fn connected(session_id: &str) -> Self {
        ServerMessage::ServerStatus {
            status: "connected".to_string(),
            session_id: session_id.to_string(),
        }
    }

    pub fn ready() -> Self {
        ServerMessage::DeepgramReady {
            status: "connected".to_string(),
        }
    }

    pub fn stopped(status: StopStatus, message: Option<String>) -> Self {
        ServerMessage::DeepgramStopped { status, message }
    }
}

/// One audio chunk as it arrived from the client.
#[derive(Debug, Clone, PartialEq)]
pub enum AudioPayload {
    Binary(Vec<u8>),
    Base64(String),
}

/// Outbound sink for one client connection.
///
/// Implementations must not block: they are called from upstream reader tasks.
pub trait ClientChannel: Send + Sync {
    fn emit(&self, message: ServerMessage);
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_toggle_message_parsing() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"event": "toggle_transcription", "data": {"action": "start"}}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::ToggleTranscription {
                action: ToggleAction::Start
            }
        );
    }

    #[test]
    fn test_base64_audio_message_parsing() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"event": "audio_stream", "data": "AAEC"}"#).unwrap();
        assert_eq!(msg, ClientMessage::AudioStream("AAEC".to_string()));
    }

    #[test]
    fn test_unknown_action_rejected() {
        let result = serde_json::from_str::<ClientMessage>(
            r#"{"event": "toggle_transcription", "data": {"action": "pause"}}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_server_message_wire_format() {
        let value = serde_json::to_value(ServerMessage::TranscriptionUpdate {
            transcription: "hello there".to_string(),
        })
        .unwrap();
        assert_eq!(
            value,
            json!({"event": "transcription_update", "data": {"transcription": "hello there"}})
        );

        let value = serde_json::to_value(ServerMessage::ready()).unwrap();
        assert_eq!(value, json!({"event": "deepgram_ready", "data": {"status": "connected"}}));
    }

    #[test]
    fn test_stopped_message_omits_missing_message() {
        let value = serde_json::to_value(ServerMessage::stopped(StopStatus::NoConnection, None)).unwrap();
        assert_eq!(
            value,
            json!({"event": "deepgram_stopped", "data": {"status": "no_connection"}})
        );

        let value = serde_json::to_value(ServerMessage::stopped(
            StopStatus::Error,
            Some("socket reset".to_string()),
        ))
        .unwrap();
        assert_eq!(value["data"]["status"], "error");
        assert_eq!(value["data"]["message"], "socket reset");
    }
}
