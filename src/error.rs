//! Error types for the conversation client.

use serde::{Deserialize, Serialize};

/// Failures opening or keeping the server connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    /// No open acknowledgment within the connect timeout.
    #[error("connection timed out after {0} ms")]
    Timeout(u64),

    /// The transport rejected the connection outright.
    #[error("connection refused: {0}")]
    Refused(String),

    /// The server rejected our credentials; retrying will not help.
    #[error("connection unauthorized: {0}")]
    Unauthorized(String),

    /// An established connection dropped.
    #[error("connection lost: {0}")]
    Lost(String),

    /// The configured endpoint could not be turned into a request.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

impl ConnectionError {
    /// Permanent failures are not worth a reconnect attempt.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ConnectionError::Unauthorized(_) | ConnectionError::InvalidEndpoint(_)
        )
    }
}

/// Failures acquiring or running the audio input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("input device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("capture stream error: {0}")]
    Stream(String),
}

impl CaptureError {
    /// Whether the UI should offer a retry affordance.
    pub fn retryable(&self) -> bool {
        !matches!(self, CaptureError::PermissionDenied(_))
    }
}

/// Failures decoding or playing synthesized audio.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlaybackError {
    #[error("audio decode failed: {0}")]
    Decode(String),

    #[error("output device error: {0}")]
    Device(String),
}

/// Wire-level envelope problems.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// Not JSON, or not an envelope object.
    #[error("malformed envelope: {0}")]
    Malformed(String),

    /// Envelope is fine but `data` does not match the schema for its type.
    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload { kind: String, reason: String },

    #[error("failed to encode envelope: {0}")]
    Encode(String),
}

/// Error codes surfaced to the UI through `ActiveError`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ErrorCode {
    ConnectionFailed,
    RecordingFailed,
    PlaybackFailed,
    AudioProcessingFailed,
    TtsUnavailable,
    /// Server-signalled code we have no dedicated variant for.
    Server(String),
}

impl ErrorCode {
    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ErrorCode::RecordingFailed => "RECORDING_FAILED",
            ErrorCode::PlaybackFailed => "PLAYBACK_FAILED",
            ErrorCode::AudioProcessingFailed => "AUDIO_PROCESSING_FAILED",
            ErrorCode::TtsUnavailable => "TTS_UNAVAILABLE",
            ErrorCode::Server(code) => code,
        }
    }
}

impl From<String> for ErrorCode {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "CONNECTION_FAILED" => ErrorCode::ConnectionFailed,
            "RECORDING_FAILED" => ErrorCode::RecordingFailed,
            "PLAYBACK_FAILED" => ErrorCode::PlaybackFailed,
            "AUDIO_PROCESSING_FAILED" => ErrorCode::AudioProcessingFailed,
            "TTS_UNAVAILABLE" => ErrorCode::TtsUnavailable,
            _ => ErrorCode::Server(raw),
        }
    }
}

impl From<ErrorCode> for String {
    fn from(code: ErrorCode) -> Self {
        code.as_str().to_string()
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The error currently shown to the user. The core never retries on these;
/// `retryable` only drives whether a retry affordance is offered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveError {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
}

impl ActiveError {
    pub fn new(code: ErrorCode, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            code,
            message: message.into(),
            retryable,
        }
    }
}

impl From<&CaptureError> for ActiveError {
    fn from(err: &CaptureError) -> Self {
        ActiveError::new(ErrorCode::RecordingFailed, err.to_string(), err.retryable())
    }
}

impl From<&PlaybackError> for ActiveError {
    fn from(err: &PlaybackError) -> Self {
        match err {
            // The payload itself is bad; replaying it will not help.
            PlaybackError::Decode(_) => {
                ActiveError::new(ErrorCode::AudioProcessingFailed, err.to_string(), false)
            }
            PlaybackError::Device(_) => {
                ActiveError::new(ErrorCode::PlaybackFailed, err.to_string(), true)
            }
        }
    }
}

impl From<&ConnectionError> for ActiveError {
    fn from(err: &ConnectionError) -> Self {
        ActiveError::new(ErrorCode::ConnectionFailed, err.to_string(), !err.is_permanent())
    }
}
