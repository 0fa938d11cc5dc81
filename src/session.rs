//! The session task: single owner of the conversation state.
//!
//! Inbound envelopes, connection changes, audio callbacks and user commands
//! all funnel into one task that reduces them in arrival order, runs the
//! resulting effects and publishes a [`SessionSnapshot`] after each step.

use crate::audio::{AudioCapture, AudioPlayback, LocalSpeech, MicCapture, SpeakerPlayback, SystemSpeech};
use crate::conversation::{ConversationState, Effect, Event, LifecycleState, SessionSnapshot};
use crate::coordinator::{AudioEvent, Coordinator, EndpointPolicy, ManualEndpoint, SilenceTimeout};
use crate::error::ConnectionError;
use crate::protocol::{self, Envelope, MessageType, ServerMessage};
use crate::settings::Settings;
use crate::transport::bus::HandlerError;
use crate::transport::{ConnectionStatus, Subscription, Transport};
use crate::usage::{self, SessionUsage};
use crate::watchdog::{Watchdog, WatchdogAction, DEFAULT_GOODBYE_GRACE, DEFAULT_INACTIVITY_TIMEOUT};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    StartConversation,
    StopConversation,
    Listen,
    StopListening,
    Interrupt,
    SetVolume(f32),
    Disconnect,
    Shutdown,
}

#[derive(Debug)]
enum SessionEvent {
    Status(ConnectionStatus),
    ConnectionFailed(ConnectionError),
    Inbound(Envelope),
    Command(Command),
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub inactivity_timeout: Duration,
    pub goodbye_grace: Duration,
    pub goodbye_notice: String,
    /// Where to append this session's usage line; `None` disables it.
    pub usage_log: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
            goodbye_grace: DEFAULT_GOODBYE_GRACE,
            goodbye_notice: Settings::default().goodbye_notice,
            usage_log: None,
        }
    }
}

impl SessionConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        let usage_log = if settings.usage_logging {
            match usage::session_usage_path() {
                Ok(path) => Some(path),
                Err(e) => {
                    log::warn!("[session] usage log disabled: {}", e);
                    None
                }
            }
        } else {
            None
        };
        Self {
            inactivity_timeout: settings.inactivity_timeout(),
            goodbye_grace: DEFAULT_GOODBYE_GRACE,
            goodbye_notice: settings.goodbye_notice.clone(),
            usage_log,
        }
    }
}

/// The audio side of a session.
pub struct Collaborators {
    pub capture: Box<dyn AudioCapture>,
    pub playback: Box<dyn AudioPlayback>,
    pub speech: Box<dyn LocalSpeech>,
    pub endpoint: Box<dyn EndpointPolicy>,
    pub mic_device: Option<String>,
    pub volume: f32,
}

impl Collaborators {
    /// System microphone, speakers and speech command, configured from
    /// `settings`.
    pub fn system(settings: &Settings) -> Self {
        let endpoint: Box<dyn EndpointPolicy> = if settings.manual_endpointing {
            Box::new(ManualEndpoint)
        } else {
            Box::new(SilenceTimeout::new(settings.end_of_utterance_silence_ms))
        };
        Self {
            capture: Box::new(MicCapture::new(
                settings.sample_rate,
                settings.chunk_ms,
                settings.vad_mode,
            )),
            playback: Box::new(SpeakerPlayback::new(
                settings.speaker_device().map(str::to_string),
                settings.volume,
            )),
            speech: Box::new(SystemSpeech::new()),
            endpoint,
            mic_device: settings.mic_device().map(str::to_string),
            volume: settings.volume,
        }
    }
}

/// Control surface for a running session. Commands are queued to the session
/// task and never block.
pub struct SessionHandle {
    transport: Transport,
    events: mpsc::UnboundedSender<SessionEvent>,
    snapshots: watch::Receiver<SessionSnapshot>,
    task: Option<JoinHandle<SessionUsage>>,
}

impl SessionHandle {
    /// Start the session task on the current tokio runtime.
    pub fn spawn(transport: Transport, collaborators: Collaborators, config: SessionConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (audio_tx, audio_rx) = mpsc::unbounded_channel();

        let outbound = Arc::new(transport.clone());
        let mut coordinator = Coordinator::new(
            collaborators.capture,
            collaborators.playback,
            collaborators.speech,
            outbound,
            audio_tx,
        )
        .with_device(collaborators.mic_device)
        .with_endpoint_policy(collaborators.endpoint);
        coordinator.set_volume(collaborators.volume);

        // Subscribe before anything can connect so no transition is missed.
        let subscriptions = vec![
            {
                let tx = events_tx.clone();
                transport.on_connection_change(move |status| {
                    tx.send(SessionEvent::Status(*status))
                        .map_err(|_| HandlerError::from("session closed"))
                })
            },
            {
                let tx = events_tx.clone();
                transport.on_connection_failed(move |err| {
                    tx.send(SessionEvent::ConnectionFailed(err.clone()))
                        .map_err(|_| HandlerError::from("session closed"))
                })
            },
            {
                let tx = events_tx.clone();
                transport.on_any_message(move |envelope| {
                    tx.send(SessionEvent::Inbound(envelope.clone()))
                        .map_err(|_| HandlerError::from("session closed"))
                })
            },
        ];
        let initial = transport.status();
        if initial != ConnectionStatus::Disconnected {
            let _ = events_tx.send(SessionEvent::Status(initial));
        }

        let state = ConversationState::new();
        let (snapshot_tx, snapshot_rx) = watch::channel(state.snapshot());
        let usage = SessionUsage {
            client_id: transport.client_id().to_string(),
            server_url: transport.endpoint(),
            started_ms: protocol::now_ms(),
            ..Default::default()
        };

        let session = Session {
            watchdog: Watchdog::new(config.inactivity_timeout, config.goodbye_grace),
            config,
            transport: transport.clone(),
            state,
            coordinator,
            snapshots: snapshot_tx,
            _subscriptions: subscriptions,
            audio_activity: (false, false),
            seen_connected: false,
            had_error: false,
            usage,
        };
        let task = tokio::spawn(session.run(events_rx, audio_rx));

        Self {
            transport,
            events: events_tx,
            snapshots: snapshot_rx,
            task: Some(task),
        }
    }

    pub fn client_id(&self) -> &str {
        self.transport.client_id()
    }

    pub async fn connect(&self) -> Result<(), ConnectionError> {
        self.transport.connect().await
    }

    pub fn start_conversation(&self) {
        self.command(Command::StartConversation);
    }

    pub fn stop_conversation(&self) {
        self.command(Command::StopConversation);
    }

    pub fn start_listening(&self) {
        self.command(Command::Listen);
    }

    pub fn stop_listening(&self) {
        self.command(Command::StopListening);
    }

    /// Barge in on the current reply. A no-op unless speaking.
    pub fn interrupt(&self) {
        self.command(Command::Interrupt);
    }

    pub fn set_volume(&self, volume: f32) {
        self.command(Command::SetVolume(volume));
    }

    /// Close the connection for good. Idempotent; `connect()` starts over.
    pub fn disconnect(&self) {
        self.command(Command::Disconnect);
    }

    pub fn command(&self, command: Command) {
        if self.events.send(SessionEvent::Command(command)).is_err() {
            log::warn!("[session] session task has exited");
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    /// Stop the session task and return its usage counters.
    pub async fn shutdown(mut self) -> Option<SessionUsage> {
        self.command(Command::Shutdown);
        match self.task.take() {
            Some(task) => task.await.ok(),
            None => None,
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if self.task.is_some() {
            let _ = self.events.send(SessionEvent::Command(Command::Shutdown));
        }
    }
}

struct Session {
    config: SessionConfig,
    transport: Transport,
    state: ConversationState,
    coordinator: Coordinator,
    watchdog: Watchdog,
    snapshots: watch::Sender<SessionSnapshot>,
    _subscriptions: Vec<Subscription>,
    /// (recording, playing) after the last reduction.
    audio_activity: (bool, bool),
    seen_connected: bool,
    had_error: bool,
    usage: SessionUsage,
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Session {
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
        mut audio: mpsc::UnboundedReceiver<AudioEvent>,
    ) -> SessionUsage {
        log::info!("[session] started (client_id={})", self.transport.client_id());

        loop {
            let deadline = self.watchdog.deadline();
            tokio::select! {
                event = events.recv() => match event {
                    Some(SessionEvent::Command(Command::Shutdown)) | None => break,
                    Some(SessionEvent::Status(status)) => self.on_status(status),
                    Some(SessionEvent::ConnectionFailed(err)) => {
                        self.dispatch(Event::ConnectionFailed(err))
                    }
                    Some(SessionEvent::Inbound(envelope)) => self.on_inbound(envelope),
                    Some(SessionEvent::Command(command)) => self.on_command(command),
                },
                Some(event) = audio.recv() => self.on_audio(event),
                _ = wait_until(deadline) => self.on_watchdog(),
            }
        }

        self.finish()
    }

    fn on_status(&mut self, status: ConnectionStatus) {
        if status == ConnectionStatus::Connected
            && self.state.connection() != ConnectionStatus::Connected
        {
            if self.seen_connected {
                self.usage.reconnects += 1;
            }
            self.seen_connected = true;
        }
        self.dispatch(Event::ConnectionChanged(status));
    }

    fn on_inbound(&mut self, envelope: Envelope) {
        // Acks are link liveness, not conversation activity.
        if envelope.kind != MessageType::HeartbeatAck {
            self.watchdog.touch(Instant::now());
        }
        match ServerMessage::from_envelope(&envelope) {
            Ok(message) => self.dispatch(Event::Server(message)),
            Err(e) => log::warn!("[session] dropping {}: {}", envelope.kind, e),
        }
    }

    fn on_command(&mut self, command: Command) {
        log::debug!("[session] command {:?}", command);
        match command {
            Command::StartConversation => self.dispatch(Event::ConversationStartRequested),
            Command::StopConversation => {
                self.watchdog.disarm();
                self.dispatch(Event::ConversationStopRequested);
            }
            Command::Listen => self.dispatch(Event::ListenRequested),
            Command::StopListening => self.dispatch(Event::StopListeningRequested),
            Command::Interrupt => {
                if self.state.lifecycle() == LifecycleState::Speaking {
                    self.usage.interrupts += 1;
                }
                self.dispatch(Event::InterruptRequested);
            }
            Command::SetVolume(volume) => self.coordinator.set_volume(volume),
            Command::Disconnect => self.disconnect(),
            Command::Shutdown => {}
        }
    }

    fn on_audio(&mut self, event: AudioEvent) {
        match event {
            AudioEvent::Chunk(chunk) => {
                if !self.coordinator.is_capturing() {
                    return;
                }
                self.watchdog.touch(Instant::now());
                if self.coordinator.handle_chunk(chunk) {
                    log::info!("[session] end of utterance detected");
                    self.dispatch(Event::StopListeningRequested);
                }
            }
            AudioEvent::PlaybackFinished { generation, result } => {
                match self.coordinator.playback_finished(generation, result) {
                    Some(Ok(())) => self.dispatch(Event::PlaybackEnded),
                    Some(Err(e)) => self.dispatch(Event::PlaybackFailed(e)),
                    None => {}
                }
            }
            AudioEvent::SpeechFinished { ok } => {
                if !ok {
                    log::warn!("[session] goodbye notice could not be spoken");
                }
                if self.watchdog.goodbye_finished() {
                    self.disconnect();
                }
            }
        }
    }

    fn on_watchdog(&mut self) {
        match self.watchdog.poll(Instant::now()) {
            Some(WatchdogAction::Goodbye) => {
                log::info!("[session] inactivity timeout; saying goodbye");
                self.dispatch(Event::InactivityTimeout);
            }
            Some(WatchdogAction::Disconnect) => {
                log::warn!("[session] goodbye notice timed out; disconnecting");
                self.disconnect();
            }
            None => {}
        }
    }

    fn disconnect(&mut self) {
        self.watchdog.disarm();
        self.transport.disconnect();
    }

    /// Reduce `event` and everything its effects feed back, then publish.
    fn dispatch(&mut self, event: Event) {
        let mut pending = VecDeque::from([event]);
        while let Some(event) = pending.pop_front() {
            let effects = self.state.apply(event, protocol::now_ms());
            for effect in effects {
                self.run_effect(effect, &mut pending);
            }
        }
        self.after_dispatch();
    }

    fn run_effect(&mut self, effect: Effect, pending: &mut VecDeque<Event>) {
        match effect {
            Effect::Send(message) => self.transport.send_message(message),
            Effect::StartCapture => match self.coordinator.start_capture() {
                Ok(()) => pending.push_back(Event::RecordingStarted),
                Err(e) => pending.push_back(Event::RecordingFailed(e)),
            },
            Effect::StopCapture => {
                self.coordinator.stop_capture();
                pending.push_back(Event::RecordingStopped);
            }
            Effect::Play { path, audio } => match self.coordinator.play(&audio) {
                Ok(()) => pending.push_back(Event::PlaybackStarted(path)),
                Err(e) => pending.push_back(Event::PlaybackFailed(e)),
            },
            Effect::StopPlayback => {
                if self.coordinator.stop_playback() {
                    // Reported synchronously; the reducer has already let go of
                    // the clip, so this never records a turn.
                    pending.push_back(Event::PlaybackEnded);
                }
            }
            Effect::SpeakGoodbye => {
                let notice = self.config.goodbye_notice.clone();
                self.coordinator.speak_notice(&notice);
            }
        }
    }

    fn after_dispatch(&mut self) {
        let now = Instant::now();
        let activity = (self.state.is_recording(), self.state.is_playing());
        let active = self.state.connection() == ConnectionStatus::Connected
            && (activity.0 || activity.1);
        self.watchdog.set_active(active, now);
        if activity != self.audio_activity {
            self.audio_activity = activity;
            self.watchdog.touch(now);
        }

        let has_error = self.state.active_error().is_some();
        if has_error && !self.had_error {
            self.usage.errors += 1;
        }
        self.had_error = has_error;
        self.usage.turns = self.state.history().len() as u64;

        let next = self.state.snapshot();
        self.snapshots.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    fn finish(mut self) -> SessionUsage {
        self.watchdog.disarm();
        self.coordinator.shutdown();
        self.transport.disconnect();

        let stats = self.coordinator.stats();
        self.usage.bytes_sent = stats.bytes_sent;
        self.usage.ms_sent = stats.audio_ms_sent;
        self.usage.chunks_sent = stats.chunks_sent;
        self.usage.utterances = stats.utterances;
        self.usage.turns = self.state.history().len() as u64;
        self.usage.ended_ms = protocol::now_ms();

        if let Some(path) = &self.config.usage_log {
            if let Err(e) = usage::append_usage_line(path, &self.usage) {
                log::warn!("[session] {}", e);
            }
        }
        log::info!(
            "[session] ended: turns={} utterances={} chunks={} interrupts={} reconnects={}",
            self.usage.turns,
            self.usage.utterances,
            self.usage.chunks_sent,
            self.usage.interrupts,
            self.usage.reconnects
        );
        self.usage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::fakes::{FakeCapture, FakePlayback, FakeSpeech, Log};
    use crate::transport::testing::{MockConnector, Plan, ServerEnd};
    use crate::error::ErrorCode;
    use crate::transport::{Frame, TransportConfig};

    struct Harness {
        handle: SessionHandle,
        log: Arc<Log>,
        server: ServerEnd,
        snapshots: watch::Receiver<SessionSnapshot>,
    }

    fn config() -> SessionConfig {
        SessionConfig {
            inactivity_timeout: Duration::from_secs(30),
            goodbye_grace: Duration::from_secs(10),
            goodbye_notice: "still there?".into(),
            usage_log: None,
        }
    }

    fn spawn_session(connector: Arc<MockConnector>, config: SessionConfig) -> (SessionHandle, Arc<Log>) {
        let mut transport_config = TransportConfig::new("ws://test/ws");
        transport_config.client_id = "client-1".into();
        let transport = Transport::new(transport_config, connector);

        let log = Arc::new(Log::default());
        let collaborators = Collaborators {
            capture: Box::new(FakeCapture(log.clone())),
            playback: Box::new(FakePlayback(log.clone())),
            speech: Box::new(FakeSpeech(log.clone())),
            endpoint: Box::new(SilenceTimeout::new(400)),
            mic_device: None,
            volume: 1.0,
        };
        (SessionHandle::spawn(transport, collaborators, config), log)
    }

    async fn connected(config: SessionConfig) -> Harness {
        let connector = MockConnector::with_plans(vec![Plan::Accept]);
        let (handle, log) = spawn_session(connector.clone(), config);
        let mut snapshots = handle.subscribe();
        handle.connect().await.unwrap();
        let server = connector.take_server();
        wait_for(&mut snapshots, |s| s.lifecycle == LifecycleState::Idle).await;
        Harness {
            handle,
            log,
            server,
            snapshots,
        }
    }

    async fn wait_for<F>(rx: &mut watch::Receiver<SessionSnapshot>, pred: F) -> SessionSnapshot
    where
        F: FnMut(&SessionSnapshot) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(300), rx.wait_for(pred))
            .await
            .expect("timed out waiting for snapshot")
            .expect("session ended")
            .clone()
    }

    /// Next non-heartbeat envelope from the client.
    async fn next_client_message(server: &mut ServerEnd) -> Envelope {
        loop {
            let envelope = tokio::time::timeout(Duration::from_secs(5), server.next_envelope())
                .await
                .expect("timed out waiting for client message")
                .expect("link closed");
            if envelope.kind != MessageType::Heartbeat {
                return envelope;
            }
        }
    }

    async fn listening(h: &mut Harness) {
        h.handle.start_listening();
        wait_for(&mut h.snapshots, |s| s.lifecycle == LifecycleState::Listening).await;
    }

    async fn speaking(h: &mut Harness) {
        listening(h).await;
        h.server
            .send_text(r#"{"type":"stt_result","data":{"text":"weather?","type":"final"}}"#);
        h.server
            .send_text(r#"{"type":"llm_immediate_response","data":{"text":"Let me check"}}"#);
        h.server.send_text(
            r#"{"type":"tts_immediate_result","data":{"audioData":"AAAA","format":"mp3"}}"#,
        );
        wait_for(&mut h.snapshots, |s| s.is_playing).await;
    }

    #[tokio::test(start_paused = true)]
    async fn final_transcript_moves_to_thinking() {
        let mut h = connected(config()).await;
        h.handle.start_conversation();
        let sent = next_client_message(&mut h.server).await;
        assert_eq!(sent.kind, MessageType::StartConversation);

        h.server
            .send_text(r#"{"type":"stt_result","data":{"type":"final","text":"hello"}}"#);
        let snap = wait_for(&mut h.snapshots, |s| s.lifecycle == LifecycleState::Thinking).await;
        assert_eq!(snap.transcript.final_text.as_deref(), Some("hello"));
    }

    #[tokio::test(start_paused = true)]
    async fn final_response_supersedes_immediate_in_the_snapshot() {
        let mut h = connected(config()).await;
        h.server
            .send_text(r#"{"type":"stt_result","data":{"type":"final","text":"weather?"}}"#);
        h.server
            .send_text(r#"{"type":"llm_immediate_response","data":{"text":"Let me check"}}"#);
        let snap = wait_for(&mut h.snapshots, |s| s.response_text.is_some()).await;
        assert_eq!(snap.response_text.as_deref(), Some("Let me check"));
        assert!(!snap.has_final_response);

        h.server
            .send_text(r#"{"type":"llm_final_response","data":{"text":"It's 72°F"}}"#);
        let snap = wait_for(&mut h.snapshots, |s| s.has_final_response).await;
        assert_eq!(snap.response_text.as_deref(), Some("It's 72°F"));
    }

    #[tokio::test(start_paused = true)]
    async fn captured_audio_streams_and_final_transcript_ends_the_utterance() {
        let mut h = connected(config()).await;
        listening(&mut h).await;
        h.log.emit_chunk(true);

        let chunk = next_client_message(&mut h.server).await;
        assert_eq!(chunk.kind, MessageType::AudioChunk);
        assert_eq!(chunk.data["isLast"], false);
        assert_eq!(chunk.data["audioData"], "AQIDBA==");

        h.server
            .send_text(r#"{"type":"stt_result","data":{"type":"final","text":"hi"}}"#);
        let last = next_client_message(&mut h.server).await;
        assert_eq!(last.kind, MessageType::AudioChunk);
        assert_eq!(last.data["isLast"], true);
        let snap = wait_for(&mut h.snapshots, |s| s.lifecycle == LifecycleState::Thinking).await;
        assert!(!snap.is_recording);
    }

    #[tokio::test(start_paused = true)]
    async fn trailing_silence_ends_the_utterance() {
        let mut h = connected(config()).await;
        listening(&mut h).await;
        h.log.emit_chunk(true);
        h.log.emit_chunk(false);
        h.log.emit_chunk(false);

        let snap = wait_for(&mut h.snapshots, |s| !s.is_recording).await;
        assert_eq!(snap.lifecycle, LifecycleState::Listening);
        let mut chunks = Vec::new();
        while chunks.len() < 4 {
            chunks.push(next_client_message(&mut h.server).await);
        }
        assert!(chunks[..3].iter().all(|c| c.data["isLast"] == false));
        assert_eq!(chunks[3].data["isLast"], true);
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_stops_playback_and_resumes_capture() {
        let mut h = connected(config()).await;
        speaking(&mut h).await;
        assert!(h.log.calls().contains(&"playback.play mp3 3".to_string()));

        h.handle.interrupt();
        h.handle.interrupt();
        let snap = wait_for(&mut h.snapshots, |s| s.lifecycle == LifecycleState::Listening).await;
        assert!(snap.response.is_empty());
        assert!(!snap.is_playing);
        assert!(snap.history.is_empty());

        let calls = h.log.calls();
        assert_eq!(calls.iter().filter(|c| *c == "playback.stop").count(), 1);
        assert_eq!(calls.iter().filter(|c| *c == "capture.start").count(), 2);

        // The final isLast chunk from the first utterance, then the interrupt.
        let mut kinds = Vec::new();
        while !kinds.contains(&MessageType::Interrupt) {
            kinds.push(next_client_message(&mut h.server).await.kind);
        }
        assert_eq!(kinds.iter().filter(|k| **k == MessageType::Interrupt).count(), 1);
        wait_for(&mut h.snapshots, |s| s.is_recording).await;
    }

    #[tokio::test(start_paused = true)]
    async fn playback_completion_records_a_turn() {
        let mut h = connected(config()).await;
        speaking(&mut h).await;
        h.log.finish_playback();
        let snap = wait_for(&mut h.snapshots, |s| s.lifecycle == LifecycleState::Idle).await;
        assert_eq!(snap.history.len(), 1);
        assert_eq!(snap.history[0].user_input, "weather?");
        assert_eq!(snap.history[0].ai_response, "Let me check");
    }

    #[tokio::test(start_paused = true)]
    async fn inactivity_says_goodbye_once_then_disconnects() {
        let mut h = connected(config()).await;
        listening(&mut h).await;

        // Nothing arrives; paused time runs up to the watchdog deadline.
        let snap = wait_for(&mut h.snapshots, |s| !s.is_recording).await;
        assert_eq!(snap.connection, ConnectionStatus::Connected);
        let spoken = |log: &Log| {
            log.calls()
                .iter()
                .filter(|c| c.starts_with("speech.speak"))
                .count()
        };
        assert_eq!(spoken(&h.log), 1);
        assert!(h.log.calls().contains(&"speech.speak still there?".to_string()));

        h.log.finish_speech(true);
        let snap = wait_for(&mut h.snapshots, |s| s.connection == ConnectionStatus::Disconnected).await;
        assert_eq!(snap.lifecycle, LifecycleState::Disconnected);

        loop {
            match h.server.from_client.recv().await {
                Some(Frame::Close { code, .. }) => {
                    assert_eq!(code, crate::transport::CLOSE_NORMAL);
                    break;
                }
                Some(_) => continue,
                None => panic!("link closed without a close frame"),
            }
        }

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(spoken(&h.log), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_goodbye_disconnects_after_grace() {
        let mut h = connected(config()).await;
        listening(&mut h).await;
        let start = Instant::now();
        wait_for(&mut h.snapshots, |s| s.connection == ConnectionStatus::Disconnected).await;
        assert!(Instant::now() - start >= Duration::from_secs(40));
    }

    #[tokio::test(start_paused = true)]
    async fn activity_keeps_the_session_alive() {
        let mut h = connected(config()).await;
        listening(&mut h).await;
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_secs(20)).await;
            h.log.emit_chunk(true);
        }
        let snap = h.handle.snapshot();
        assert!(snap.is_recording);
        assert_eq!(snap.connection, ConnectionStatus::Connected);
        assert!(!h.log.calls().iter().any(|c| c.starts_with("speech.speak")));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_session_does_not_time_out() {
        let h = connected(config()).await;
        tokio::time::sleep(Duration::from_secs(45)).await;
        assert_eq!(h.handle.snapshot().lifecycle, LifecycleState::Idle);
        assert!(!h.log.calls().iter().any(|c| c.starts_with("speech.speak")));
    }

    #[tokio::test(start_paused = true)]
    async fn server_error_surfaces_and_recording_restarts_from_error() {
        let mut h = connected(config()).await;
        listening(&mut h).await;
        h.server.send_text(
            r#"{"type":"error","data":{"code":"STT_NO_RESULT","message":"nothing heard","retryable":true}}"#,
        );
        let snap = wait_for(&mut h.snapshots, |s| s.lifecycle == LifecycleState::Error).await;
        let error = snap.active_error.unwrap();
        assert_eq!(error.code.as_str(), "STT_NO_RESULT");
        assert!(error.retryable);
        assert!(!snap.is_recording);

        h.handle.start_listening();
        let snap = wait_for(&mut h.snapshots, |s| s.lifecycle == LifecycleState::Listening).await;
        assert!(snap.active_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn undecodable_reply_audio_is_an_audio_processing_failure() {
        let mut h = connected(config()).await;
        h.server
            .send_text(r#"{"type":"stt_result","data":{"type":"final","text":"hello"}}"#);
        h.server
            .send_text(r#"{"type":"tts_result","data":{"audioData":"***not base64***"}}"#);
        let snap = wait_for(&mut h.snapshots, |s| s.lifecycle == LifecycleState::Error).await;
        let error = snap.active_error.unwrap();
        assert_eq!(error.code, ErrorCode::AudioProcessingFailed);
        assert!(!snap.is_playing);
        assert!(!h.log.calls().iter().any(|c| c.starts_with("playback.play")));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connect_surfaces_connection_failed() {
        let connector = MockConnector::with_plans(vec![Plan::Refuse]);
        let (handle, _log) = spawn_session(connector, config());
        let mut snapshots = handle.subscribe();
        assert!(handle.connect().await.is_err());

        let snap = wait_for(&mut snapshots, |s| s.active_error.is_some()).await;
        let error = snap.active_error.unwrap();
        assert_eq!(error.code, ErrorCode::ConnectionFailed);
        assert!(error.retryable);
        assert_eq!(snap.lifecycle, LifecycleState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn giving_up_on_reconnect_surfaces_connection_failed() {
        let mut h = connected(config()).await;
        // Every retry is refused once the scripted accept is used up.
        drop(h.server);
        let snap = wait_for(&mut h.snapshots, |s| s.active_error.is_some()).await;
        assert_eq!(snap.active_error.unwrap().code, ErrorCode::ConnectionFailed);
        assert_eq!(snap.connection, ConnectionStatus::Disconnected);

        let usage = h.handle.shutdown().await.unwrap();
        assert_eq!(usage.errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_ack_updates_activity_but_not_the_watchdog() {
        let mut h = connected(config()).await;
        let before = h.handle.snapshot().last_activity_at;
        // Activity stamps are wall-clock; let it move.
        std::thread::sleep(std::time::Duration::from_millis(20));
        h.server
            .send_text(r#"{"type":"heartbeat_ack","data":{"timestamp":1}}"#);
        let snap = wait_for(&mut h.snapshots, |s| s.last_activity_at > before).await;
        assert_eq!(snap.lifecycle, LifecycleState::Idle);

        // Acks alone do not hold off the inactivity goodbye.
        listening(&mut h).await;
        for _ in 0..2 {
            tokio::time::sleep(Duration::from_secs(20)).await;
            h.server
                .send_text(r#"{"type":"heartbeat_ack","data":{"timestamp":1}}"#);
        }
        assert!(h.log.calls().contains(&"speech.speak still there?".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_messages_are_dropped() {
        let mut h = connected(config()).await;
        h.server.send_text(r#"{"type":"stt_result","data":{"confidence":1}}"#);
        h.server.send_text("not json");
        h.server
            .send_text(r#"{"type":"stt_result","data":{"type":"partial","text":"hel"}}"#);
        let snap = wait_for(&mut h.snapshots, |s| !s.transcript.partial.is_empty()).await;
        assert_eq!(snap.transcript.partial, "hel");
        assert_eq!(snap.lifecycle, LifecycleState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_conversation_sends_end_and_goes_idle() {
        let mut h = connected(config()).await;
        speaking(&mut h).await;
        h.handle.stop_conversation();
        let snap = wait_for(&mut h.snapshots, |s| s.lifecycle == LifecycleState::Idle).await;
        assert!(!snap.is_playing);
        let mut kinds = Vec::new();
        while !kinds.contains(&MessageType::EndConversation) {
            kinds.push(next_client_message(&mut h.server).await.kind);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_writes_usage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage-session.jsonl");
        let mut cfg = config();
        cfg.usage_log = Some(path.clone());
        let mut h = connected(cfg).await;
        speaking(&mut h).await;
        h.handle.interrupt();
        wait_for(&mut h.snapshots, |s| s.lifecycle == LifecycleState::Listening).await;

        let usage = h.handle.shutdown().await.unwrap();
        assert_eq!(usage.client_id, "client-1");
        assert_eq!(usage.interrupts, 1);
        // The interrupted reply reopened capture; shutdown closes it.
        assert_eq!(usage.utterances, 2);
        assert!(usage.ended_ms >= usage.started_ms);
        let logged = usage::load_recent_sessions(&path, 5);
        assert_eq!(logged, vec![usage]);
    }
}
