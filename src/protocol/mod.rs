//! Wire envelope and codec shared by both directions of the connection.
//!
//! Every frame is a JSON object `{type, data, timestamp, id?}`. Binary audio is
//! always base64 inside `data`, never a binary frame.

pub mod messages;

pub use messages::{
    AudioChunkData, ClientMessage, ConnectionEstablished, LlmText, Notice, PatienceUpdate,
    ResponsePath, ServerError, ServerMessage, SttResult, ToolCall, TtsAudio,
};

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};

static ENVELOPE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Closed set of message types, plus a forward-compatible catch-all for types a
/// newer server may add.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    // client -> server
    AudioChunk,
    Interrupt,
    StartConversation,
    EndConversation,
    Heartbeat,
    // server -> client
    ConnectionEstablished,
    SttStart,
    SttResult,
    LlmStart,
    LlmResponse,
    LlmImmediateResponse,
    LlmFinalResponse,
    LlmPatienceUpdate,
    TtsStart,
    TtsResult,
    TtsImmediateStart,
    TtsImmediateResult,
    TtsFinalStart,
    TtsFinalResult,
    TtsUnavailable,
    HeartbeatAck,
    Error,
    InterruptAcknowledged,
    ConversationStarted,
    ConversationEnded,
    Unknown(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::AudioChunk => "audio_chunk",
            Self::Interrupt => "interrupt",
            Self::StartConversation => "start_conversation",
            Self::EndConversation => "end_conversation",
            Self::Heartbeat => "heartbeat",
            Self::ConnectionEstablished => "connection_established",
            Self::SttStart => "stt_start",
            Self::SttResult => "stt_result",
            Self::LlmStart => "llm_start",
            Self::LlmResponse => "llm_response",
            Self::LlmImmediateResponse => "llm_immediate_response",
            Self::LlmFinalResponse => "llm_final_response",
            Self::LlmPatienceUpdate => "llm_patience_update",
            Self::TtsStart => "tts_start",
            Self::TtsResult => "tts_result",
            Self::TtsImmediateStart => "tts_immediate_start",
            Self::TtsImmediateResult => "tts_immediate_result",
            Self::TtsFinalStart => "tts_final_start",
            Self::TtsFinalResult => "tts_final_result",
            Self::TtsUnavailable => "tts_unavailable",
            Self::HeartbeatAck => "heartbeat_ack",
            Self::Error => "error",
            Self::InterruptAcknowledged => "interrupt_acknowledged",
            Self::ConversationStarted => "conversation_started",
            Self::ConversationEnded => "conversation_ended",
            Self::Unknown(raw) => raw,
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "audio_chunk" => Self::AudioChunk,
            "interrupt" => Self::Interrupt,
            "start_conversation" => Self::StartConversation,
            "end_conversation" => Self::EndConversation,
            "heartbeat" => Self::Heartbeat,
            "connection_established" => Self::ConnectionEstablished,
            "stt_start" => Self::SttStart,
            "stt_result" => Self::SttResult,
            "llm_start" => Self::LlmStart,
            "llm_response" => Self::LlmResponse,
            "llm_immediate_response" => Self::LlmImmediateResponse,
            "llm_final_response" => Self::LlmFinalResponse,
            "llm_patience_update" => Self::LlmPatienceUpdate,
            "tts_start" => Self::TtsStart,
            "tts_result" => Self::TtsResult,
            "tts_immediate_start" => Self::TtsImmediateStart,
            "tts_immediate_result" => Self::TtsImmediateResult,
            "tts_final_start" => Self::TtsFinalStart,
            "tts_final_result" => Self::TtsFinalResult,
            "tts_unavailable" => Self::TtsUnavailable,
            "heartbeat_ack" => Self::HeartbeatAck,
            "error" => Self::Error,
            "interrupt_acknowledged" => Self::InterruptAcknowledged,
            "conversation_started" => Self::ConversationStarted,
            "conversation_ended" => Self::ConversationEnded,
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl From<String> for MessageType {
    fn from(raw: String) -> Self {
        MessageType::parse(&raw)
    }
}

impl From<MessageType> for String {
    fn from(kind: MessageType) -> Self {
        kind.as_str().to_string()
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl Envelope {
    /// Stamp a new outbound envelope with the current time and a fresh id.
    pub fn new(kind: MessageType, data: Value) -> Self {
        let timestamp = now_ms();
        Self {
            kind,
            data,
            timestamp,
            id: Some(next_id(timestamp)),
        }
    }
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// `<ms>-<seq>`; the sequence is process-wide so ids never repeat even when
/// two envelopes share a millisecond.
fn next_id(timestamp: i64) -> String {
    let seq = ENVELOPE_SEQ.fetch_add(1, Ordering::SeqCst) + 1;
    format!("{}-{}", timestamp, seq)
}

pub fn encode(message: &ClientMessage) -> Envelope {
    Envelope::new(message.kind(), message.data())
}

pub fn encode_text(envelope: &Envelope) -> Result<String, ProtocolError> {
    serde_json::to_string(envelope).map_err(|e| ProtocolError::Encode(e.to_string()))
}

/// Strict parse of one text frame. Unknown `type` strings survive as
/// `MessageType::Unknown`.
pub fn decode(raw: &str) -> Result<Envelope, ProtocolError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    if !value.is_object() {
        return Err(ProtocolError::Malformed("envelope is not an object".into()));
    }
    match value.get("type") {
        Some(Value::String(_)) => {}
        Some(_) => return Err(ProtocolError::Malformed("`type` is not a string".into())),
        None => return Err(ProtocolError::Malformed("missing `type`".into())),
    }
    let mut envelope: Envelope =
        serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    if envelope.data.is_null() {
        envelope.data = Value::Object(serde_json::Map::new());
    }
    Ok(envelope)
}
