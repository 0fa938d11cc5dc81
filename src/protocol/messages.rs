//! Typed payloads for each message type.

use super::{Envelope, MessageType};
use crate::error::ProtocolError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Which of the two reply paths a message belongs to. Single-path messages
/// (`llm_response`, `tts_start`, `tts_result`) collapse onto `Immediate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponsePath {
    Immediate,
    Final,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioChunkData {
    /// Base64-encoded audio bytes; empty on a bare end-of-utterance marker.
    pub audio_data: String,
    pub is_last: bool,
    pub format: String,
    pub sample_rate: u32,
}

/// Messages the client sends.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    AudioChunk(AudioChunkData),
    Interrupt,
    StartConversation,
    EndConversation,
    Heartbeat { timestamp: i64 },
}

impl ClientMessage {
    pub fn kind(&self) -> MessageType {
        match self {
            ClientMessage::AudioChunk(_) => MessageType::AudioChunk,
            ClientMessage::Interrupt => MessageType::Interrupt,
            ClientMessage::StartConversation => MessageType::StartConversation,
            ClientMessage::EndConversation => MessageType::EndConversation,
            ClientMessage::Heartbeat { .. } => MessageType::Heartbeat,
        }
    }

    pub fn data(&self) -> Value {
        match self {
            ClientMessage::AudioChunk(chunk) => {
                serde_json::to_value(chunk).unwrap_or_else(|_| json!({}))
            }
            ClientMessage::Heartbeat { timestamp } => json!({ "timestamp": timestamp }),
            _ => Value::Object(Map::new()),
        }
    }
}

/// Opaque tool invocation reported alongside a final reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct ConnectionEstablished {
    #[serde(default, alias = "clientId")]
    pub client_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SttResult {
    pub text: String,
    /// `"partial"` or `"final"`.
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default, alias = "is_final")]
    pub is_final: Option<bool>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

impl SttResult {
    pub fn is_final(&self) -> bool {
        self.is_final.unwrap_or(false) || self.kind.as_deref() == Some("final")
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmText {
    pub text: String,
    #[serde(default, alias = "tool_calls")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PatienceUpdate {
    #[serde(alias = "text")]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TtsAudio {
    pub audio_data: String,
    #[serde(default = "default_tts_format")]
    pub format: String,
    #[serde(default)]
    pub is_last: Option<bool>,
}

fn default_tts_format() -> String {
    "mp3".into()
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct Notice {
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServerError {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub retryable: bool,
}

/// Messages the server sends, one variant per type with a fixed schema.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    ConnectionEstablished(ConnectionEstablished),
    SttStart,
    SttResult(SttResult),
    LlmStart,
    LlmResponse(LlmText),
    LlmImmediateResponse(LlmText),
    LlmFinalResponse(LlmText),
    LlmPatienceUpdate(PatienceUpdate),
    TtsStart(ResponsePath),
    TtsResult(ResponsePath, TtsAudio),
    TtsUnavailable(Notice),
    HeartbeatAck,
    Error(ServerError),
    InterruptAcknowledged,
    ConversationStarted,
    ConversationEnded,
    /// A type this client does not know, or a client-bound type echoed back.
    Unknown(String),
}

impl ServerMessage {
    /// Validate `data` against the schema for the envelope's type.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, ProtocolError> {
        let data = &envelope.data;
        let kind = &envelope.kind;
        let msg = match kind {
            MessageType::ConnectionEstablished => {
                ServerMessage::ConnectionEstablished(payload(kind, data)?)
            }
            MessageType::SttStart => ServerMessage::SttStart,
            MessageType::SttResult => ServerMessage::SttResult(payload(kind, data)?),
            MessageType::LlmStart => ServerMessage::LlmStart,
            MessageType::LlmResponse => ServerMessage::LlmResponse(payload(kind, data)?),
            MessageType::LlmImmediateResponse => {
                ServerMessage::LlmImmediateResponse(payload(kind, data)?)
            }
            MessageType::LlmFinalResponse => ServerMessage::LlmFinalResponse(payload(kind, data)?),
            MessageType::LlmPatienceUpdate => {
                ServerMessage::LlmPatienceUpdate(payload(kind, data)?)
            }
            MessageType::TtsStart | MessageType::TtsImmediateStart => {
                ServerMessage::TtsStart(ResponsePath::Immediate)
            }
            MessageType::TtsFinalStart => ServerMessage::TtsStart(ResponsePath::Final),
            MessageType::TtsResult | MessageType::TtsImmediateResult => {
                ServerMessage::TtsResult(ResponsePath::Immediate, payload(kind, data)?)
            }
            MessageType::TtsFinalResult => {
                ServerMessage::TtsResult(ResponsePath::Final, payload(kind, data)?)
            }
            MessageType::TtsUnavailable => ServerMessage::TtsUnavailable(payload(kind, data)?),
            MessageType::HeartbeatAck => ServerMessage::HeartbeatAck,
            MessageType::Error => ServerMessage::Error(payload(kind, data)?),
            MessageType::InterruptAcknowledged => ServerMessage::InterruptAcknowledged,
            MessageType::ConversationStarted => ServerMessage::ConversationStarted,
            MessageType::ConversationEnded => ServerMessage::ConversationEnded,
            other => ServerMessage::Unknown(other.as_str().to_string()),
        };
        Ok(msg)
    }
}

fn payload<T: DeserializeOwned>(kind: &MessageType, data: &Value) -> Result<T, ProtocolError> {
    serde_json::from_value(data.clone()).map_err(|e| ProtocolError::InvalidPayload {
        kind: kind.as_str().to_string(),
        reason: e.to_string(),
    })
}
