//! The conversation reducer.
//!
//! `ConversationState::apply` takes one event and returns the side effects the
//! session should run. It never awaits and never touches I/O, so every
//! transition can be driven directly from tests.

use super::{LifecycleState, ResponsePaths, SessionSnapshot, Transcript, Turn};
use crate::error::{ActiveError, CaptureError, ConnectionError, ErrorCode, PlaybackError};
use crate::protocol::{ClientMessage, ResponsePath, ServerMessage, ToolCall, TtsAudio};
use crate::transport::ConnectionStatus;
use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    ConnectionChanged(ConnectionStatus),
    /// A connect attempt failed and no reconnect is pending.
    ConnectionFailed(ConnectionError),
    Server(ServerMessage),
    ListenRequested,
    StopListeningRequested,
    RecordingStarted,
    RecordingStopped,
    RecordingFailed(CaptureError),
    PlaybackStarted(ResponsePath),
    PlaybackEnded,
    PlaybackFailed(PlaybackError),
    InterruptRequested,
    ConversationStartRequested,
    ConversationStopRequested,
    InactivityTimeout,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Send(ClientMessage),
    StartCapture,
    StopCapture,
    Play { path: ResponsePath, audio: TtsAudio },
    StopPlayback,
    SpeakGoodbye,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedAudio {
    pub path: ResponsePath,
    pub audio: TtsAudio,
}

/// The user turn currently being answered.
#[derive(Debug, Clone)]
struct Exchange {
    user_input: String,
    started_at: i64,
    /// Set once a Turn has been recorded; later recordings replace it.
    turn_id: Option<String>,
    final_audio_seen: bool,
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Clone)]
pub struct ConversationState {
    lifecycle: LifecycleState,
    connection: ConnectionStatus,
    transcript: Transcript,
    response: ResponsePaths,
    active_error: Option<ActiveError>,
    history: Vec<Turn>,
    last_activity_at: i64,
    session_seq: u64,
    recording: bool,
    playback: Option<ResponsePath>,
    audio_queue: VecDeque<QueuedAudio>,
    exchange: Option<Exchange>,
}

impl Default for ConversationState {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationState {
    pub fn new() -> Self {
        Self {
            lifecycle: LifecycleState::Disconnected,
            connection: ConnectionStatus::Disconnected,
            transcript: Transcript::default(),
            response: ResponsePaths::default(),
            active_error: None,
            history: Vec::new(),
            last_activity_at: 0,
            session_seq: 0,
            recording: false,
            playback: None,
            audio_queue: VecDeque::new(),
            exchange: None,
        }
    }

    pub fn lifecycle(&self) -> LifecycleState {
        self.lifecycle
    }

    pub fn connection(&self) -> ConnectionStatus {
        self.connection
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn response(&self) -> &ResponsePaths {
        &self.response
    }

    pub fn active_error(&self) -> Option<&ActiveError> {
        self.active_error.as_ref()
    }

    pub fn history(&self) -> &[Turn] {
        &self.history
    }

    pub fn session_seq(&self) -> u64 {
        self.session_seq
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    pub fn is_playing(&self) -> bool {
        self.playback.is_some()
    }

    pub fn queued_audio(&self) -> usize {
        self.audio_queue.len()
    }

    pub fn last_activity_at(&self) -> i64 {
        self.last_activity_at
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_seq: self.session_seq,
            lifecycle: self.lifecycle,
            connection: self.connection,
            transcript: self.transcript.clone(),
            response: self.response.clone(),
            response_text: self.response.display_text().map(str::to_string),
            has_final_response: self.response.has_final_response(),
            active_error: self.active_error.clone(),
            history: self.history.clone(),
            is_recording: self.recording,
            is_playing: self.playback.is_some(),
            last_activity_at: self.last_activity_at,
        }
    }

    /// Reduce one event. `now_ms` stamps activity and recorded turns.
    pub fn apply(&mut self, event: Event, now_ms: i64) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.last_activity_at = now_ms;

        match event {
            Event::ConnectionChanged(status) => self.on_connection(status, &mut effects),
            Event::ConnectionFailed(err) => {
                log::warn!("[conversation] connection failed: {}", err);
                if self.connection != ConnectionStatus::Connected {
                    self.active_error = Some(ActiveError::from(&err));
                }
            }
            Event::Server(message) => self.on_server(message, now_ms, &mut effects),

            Event::ListenRequested => {
                if self.connection != ConnectionStatus::Connected {
                    log::warn!("[conversation] cannot listen while {}", self.connection.as_str());
                } else if self.recording {
                    log::debug!("[conversation] already recording");
                } else if matches!(self.lifecycle, LifecycleState::Idle | LifecycleState::Error) {
                    effects.push(Effect::StartCapture);
                } else if self.lifecycle == LifecycleState::Thinking {
                    // A reply that never gets audio leaves us here; keep what
                    // arrived as a text-only turn and let the user go on.
                    self.record_turn(now_ms);
                    self.stop_playback(&mut effects);
                    self.clear_exchange();
                    self.lifecycle = LifecycleState::Idle;
                    effects.push(Effect::StartCapture);
                } else {
                    log::debug!("[conversation] listen ignored in {}", self.lifecycle);
                }
            }
            Event::StopListeningRequested => self.stop_capture(&mut effects),

            Event::RecordingStarted => {
                if self.connection != ConnectionStatus::Connected {
                    // Capture came up after the link dropped.
                    effects.push(Effect::StopCapture);
                } else {
                    self.recording = true;
                    if matches!(self.lifecycle, LifecycleState::Idle | LifecycleState::Error) {
                        // A new user turn; whatever was still pending is stale.
                        self.lifecycle = LifecycleState::Listening;
                        self.transcript.partial.clear();
                        self.active_error = None;
                        self.clear_exchange();
                    }
                }
            }
            Event::RecordingStopped => self.recording = false,
            Event::RecordingFailed(err) => {
                log::warn!("[conversation] recording failed: {}", err);
                self.recording = false;
                self.fail(ActiveError::from(&err), &mut effects);
            }

            Event::PlaybackStarted(path) => {
                log::debug!("[conversation] playback started ({:?})", path);
            }
            Event::PlaybackEnded => self.on_playback_ended(now_ms, &mut effects),
            Event::PlaybackFailed(err) => {
                log::warn!("[conversation] playback failed: {}", err);
                // The collaborator already stopped itself.
                self.playback = None;
                self.fail(ActiveError::from(&err), &mut effects);
            }

            Event::InterruptRequested => {
                if self.lifecycle != LifecycleState::Speaking {
                    log::debug!("[conversation] interrupt ignored in {}", self.lifecycle);
                } else {
                    effects.push(Effect::Send(ClientMessage::Interrupt));
                    self.stop_playback(&mut effects);
                    self.response.clear();
                    self.audio_queue.clear();
                    self.exchange = None;
                    self.transcript = Transcript::default();
                    self.lifecycle = LifecycleState::Listening;
                    if !self.recording {
                        effects.push(Effect::StartCapture);
                    }
                }
            }

            Event::ConversationStartRequested => {
                if self.connection == ConnectionStatus::Connected {
                    effects.push(Effect::Send(ClientMessage::StartConversation));
                } else {
                    log::warn!("[conversation] cannot start a conversation while disconnected");
                }
            }
            Event::ConversationStopRequested => {
                if self.connection == ConnectionStatus::Connected {
                    effects.push(Effect::Send(ClientMessage::EndConversation));
                    self.lifecycle = LifecycleState::Idle;
                }
                self.stop_capture(&mut effects);
                self.stop_playback(&mut effects);
                self.clear_exchange();
                self.transcript = Transcript::default();
                self.active_error = None;
            }

            Event::InactivityTimeout => {
                self.stop_capture(&mut effects);
                self.stop_playback(&mut effects);
                self.audio_queue.clear();
                self.exchange = None;
                effects.push(Effect::SpeakGoodbye);
            }
        }

        // Connection state dominates lifecycle.
        match self.connection {
            ConnectionStatus::Disconnected => self.lifecycle = LifecycleState::Disconnected,
            ConnectionStatus::Connecting => self.lifecycle = LifecycleState::Connecting,
            ConnectionStatus::Connected => {}
        }
        effects
    }

    fn on_connection(&mut self, status: ConnectionStatus, effects: &mut Vec<Effect>) {
        let previous = self.connection;
        self.connection = status;
        match status {
            ConnectionStatus::Disconnected | ConnectionStatus::Connecting => {
                self.stop_capture(effects);
                self.stop_playback(effects);
                self.clear_exchange();
                self.lifecycle = if status == ConnectionStatus::Connecting {
                    LifecycleState::Connecting
                } else {
                    LifecycleState::Disconnected
                };
            }
            ConnectionStatus::Connected => {
                if previous != ConnectionStatus::Connected {
                    self.begin_session();
                }
            }
        }
    }

    /// Fresh per-connection state; history carries over.
    fn begin_session(&mut self) {
        self.session_seq += 1;
        self.lifecycle = LifecycleState::Idle;
        self.transcript = Transcript::default();
        self.active_error = None;
        self.recording = false;
        self.playback = None;
        self.clear_exchange();
        log::info!(
            "[conversation] session {} started ({} turns in history)",
            self.session_seq,
            self.history.len()
        );
    }

    fn on_server(&mut self, message: ServerMessage, now_ms: i64, effects: &mut Vec<Effect>) {
        match message {
            ServerMessage::ConnectionEstablished(info) => {
                log::info!(
                    "[conversation] server acknowledged connection (client_id={})",
                    info.client_id.as_deref().unwrap_or("-")
                );
                if matches!(
                    self.lifecycle,
                    LifecycleState::Disconnected | LifecycleState::Connecting
                ) {
                    self.connection = ConnectionStatus::Connected;
                    self.begin_session();
                }
            }

            ServerMessage::SttStart => {
                self.transcript = Transcript::default();
                self.clear_exchange();
            }
            ServerMessage::SttResult(result) => {
                if !result.is_final() {
                    self.transcript.partial = result.text;
                } else if matches!(
                    self.lifecycle,
                    LifecycleState::Listening | LifecycleState::Idle
                ) {
                    self.stop_capture(effects);
                    self.transcript.partial.clear();
                    self.transcript.final_text = Some(result.text.clone());
                    self.response.clear();
                    self.audio_queue.clear();
                    self.exchange = Some(Exchange {
                        user_input: result.text,
                        started_at: now_ms,
                        turn_id: None,
                        final_audio_seen: false,
                        tool_calls: None,
                    });
                    self.lifecycle = LifecycleState::Thinking;
                } else {
                    log::debug!("[conversation] final transcript ignored in {}", self.lifecycle);
                }
            }

            ServerMessage::LlmStart => {
                if self.exchange.is_some() {
                    self.response.clear();
                }
            }
            ServerMessage::LlmResponse(text) | ServerMessage::LlmImmediateResponse(text) => {
                if !self.has_exchange("immediate response") {
                    return;
                }
                if self.response.final_received {
                    log::debug!("[conversation] immediate response after final; ignored");
                } else {
                    self.response.immediate = Some(text.text);
                }
            }
            ServerMessage::LlmFinalResponse(text) => {
                if !self.has_exchange("final response") {
                    return;
                }
                self.response.final_text = Some(text.text);
                self.response.final_received = true;
                let recorded = match self.exchange.as_mut() {
                    Some(exchange) => {
                        exchange.tool_calls = text.tool_calls;
                        exchange.turn_id.is_some()
                    }
                    None => false,
                };
                if recorded {
                    self.record_turn(now_ms);
                }
            }
            ServerMessage::LlmPatienceUpdate(update) => {
                if self.has_exchange("patience update") {
                    self.response.patience_note = Some(update.message);
                }
            }

            ServerMessage::TtsStart(path) => {
                if !self.has_exchange("tts start") {
                    return;
                }
                if matches!(
                    self.lifecycle,
                    LifecycleState::Thinking | LifecycleState::Listening | LifecycleState::Idle
                ) {
                    log::debug!("[conversation] speech starting ({:?})", path);
                    self.lifecycle = LifecycleState::Speaking;
                }
            }
            ServerMessage::TtsResult(path, audio) => self.on_tts_audio(path, audio, effects),
            ServerMessage::TtsUnavailable(notice) => {
                if !self.has_exchange("tts unavailable") {
                    return;
                }
                let message = notice
                    .message
                    .unwrap_or_else(|| "Speech synthesis unavailable".to_string());
                log::warn!("[conversation] {}", message);
                self.active_error = Some(ActiveError::new(ErrorCode::TtsUnavailable, message, false));
                self.record_turn(now_ms);
                if self.playback.is_none() && self.audio_queue.is_empty() {
                    self.lifecycle = LifecycleState::Idle;
                }
            }

            ServerMessage::Error(err) => {
                log::warn!("[conversation] server error {}: {}", err.code, err.message);
                let active = ActiveError::new(ErrorCode::from(err.code), err.message, err.retryable);
                self.fail(active, effects);
            }

            ServerMessage::HeartbeatAck => {}
            ServerMessage::InterruptAcknowledged => {
                log::debug!("[conversation] interrupt acknowledged");
            }
            ServerMessage::ConversationStarted => log::info!("[conversation] conversation started"),
            ServerMessage::ConversationEnded => log::info!("[conversation] conversation ended"),
            ServerMessage::Unknown(kind) => {
                log::debug!("[conversation] ignoring message type {}", kind);
            }
        }
    }

    fn on_tts_audio(&mut self, path: ResponsePath, audio: TtsAudio, effects: &mut Vec<Effect>) {
        let final_seen = match self.exchange.as_mut() {
            Some(exchange) => {
                let seen = exchange.final_audio_seen;
                if path == ResponsePath::Final {
                    exchange.final_audio_seen = true;
                }
                seen
            }
            None => {
                log::debug!("[conversation] stale tts audio dropped");
                return;
            }
        };

        match path {
            ResponsePath::Immediate if final_seen => {
                log::debug!("[conversation] immediate audio after final audio; dropped");
                return;
            }
            ResponsePath::Final => {
                self.audio_queue.retain(|q| q.path == ResponsePath::Final);
            }
            ResponsePath::Immediate => {}
        }

        self.lifecycle = LifecycleState::Speaking;
        if self.playback.is_none() {
            self.playback = Some(path);
            effects.push(Effect::Play { path, audio });
        } else {
            self.audio_queue.push_back(QueuedAudio { path, audio });
        }
    }

    fn on_playback_ended(&mut self, now_ms: i64, effects: &mut Vec<Effect>) {
        if self.playback.take().is_none() {
            return;
        }
        self.record_turn(now_ms);

        if let Some(next) = self.audio_queue.pop_front() {
            self.playback = Some(next.path);
            effects.push(Effect::Play {
                path: next.path,
                audio: next.audio,
            });
        } else if self.lifecycle == LifecycleState::Speaking {
            self.lifecycle = LifecycleState::Idle;
        }
    }

    fn has_exchange(&self, what: &str) -> bool {
        if self.exchange.is_none() {
            log::debug!("[conversation] stale {} dropped", what);
            return false;
        }
        true
    }

    /// Record the open exchange as a Turn, replacing the one already recorded
    /// for it, if any.
    fn record_turn(&mut self, now_ms: i64) {
        let text = match self.response.display_text() {
            Some(text) => text.to_string(),
            None => return,
        };
        let exchange = match self.exchange.as_mut() {
            Some(exchange) => exchange,
            None => return,
        };
        let mut turn = Turn {
            id: String::new(),
            user_input: exchange.user_input.clone(),
            ai_response: text,
            timestamp: exchange.started_at,
            duration_ms: (now_ms - exchange.started_at).max(0),
            tool_calls: exchange.tool_calls.clone(),
        };

        let existing = exchange
            .turn_id
            .as_ref()
            .and_then(|id| self.history.iter().position(|t| &t.id == id));
        match existing {
            Some(index) => {
                turn.id = self.history[index].id.clone();
                self.history[index] = turn;
            }
            None => {
                turn.id = uuid::Uuid::new_v4().to_string();
                exchange.turn_id = Some(turn.id.clone());
                self.history.push(turn);
            }
        }
    }

    fn fail(&mut self, error: ActiveError, effects: &mut Vec<Effect>) {
        self.stop_capture(effects);
        self.stop_playback(effects);
        self.audio_queue.clear();
        self.exchange = None;
        self.active_error = Some(error);
        self.lifecycle = LifecycleState::Error;
    }

    fn stop_capture(&mut self, effects: &mut Vec<Effect>) {
        if self.recording {
            self.recording = false;
            effects.push(Effect::StopCapture);
        }
    }

    fn stop_playback(&mut self, effects: &mut Vec<Effect>) {
        if self.playback.take().is_some() {
            effects.push(Effect::StopPlayback);
        }
    }

    fn clear_exchange(&mut self) {
        self.response.clear();
        self.audio_queue.clear();
        self.exchange = None;
    }
}
