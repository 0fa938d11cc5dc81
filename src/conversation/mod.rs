//! Client-side conversation model: lifecycle, transcript, the two response
//! paths and the turn history.

pub mod state;

pub use state::{ConversationState, Effect, Event, QueuedAudio};

use crate::error::ActiveError;
use crate::protocol::ToolCall;
use crate::transport::ConnectionStatus;
use serde::{Deserialize, Serialize};

/// Coarse conversation phase. Exactly one at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Idle,
    Listening,
    Thinking,
    Speaking,
    Error,
    Connecting,
    Disconnected,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Listening => "listening",
            LifecycleState::Thinking => "thinking",
            LifecycleState::Speaking => "speaking",
            LifecycleState::Error => "error",
            LifecycleState::Connecting => "connecting",
            LifecycleState::Disconnected => "disconnected",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Transcript {
    /// Overwritten by every interim result.
    pub partial: String,
    /// Set once per utterance.
    pub final_text: Option<String>,
}

/// The immediate (fast, provisional) and final (tool-augmented) replies for
/// the current exchange.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResponsePaths {
    pub immediate: Option<String>,
    pub final_text: Option<String>,
    pub final_received: bool,
    /// "Still working on it" note sent while the final path is pending.
    pub patience_note: Option<String>,
}

impl ResponsePaths {
    /// What the UI shows: final when present, otherwise immediate.
    pub fn display_text(&self) -> Option<&str> {
        self.final_text.as_deref().or(self.immediate.as_deref())
    }

    pub fn has_final_response(&self) -> bool {
        self.final_received
    }

    pub fn is_empty(&self) -> bool {
        self.immediate.is_none() && self.final_text.is_none() && !self.final_received
    }

    pub fn clear(&mut self) {
        *self = ResponsePaths::default();
    }
}

/// One completed user-input / assistant-response exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Turn {
    pub id: String,
    pub user_input: String,
    pub ai_response: String,
    /// Epoch ms when the user's utterance was finalised.
    pub timestamp: i64,
    pub duration_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

/// Read-only view published to the UI after every reduction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub session_seq: u64,
    pub lifecycle: LifecycleState,
    pub connection: ConnectionStatus,
    pub transcript: Transcript,
    pub response: ResponsePaths,
    pub response_text: Option<String>,
    pub has_final_response: bool,
    pub active_error: Option<ActiveError>,
    pub history: Vec<Turn>,
    pub is_recording: bool,
    pub is_playing: bool,
    pub last_activity_at: i64,
}
