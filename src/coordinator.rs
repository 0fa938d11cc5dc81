//! Bridges reducer effects to the audio collaborators and turns their
//! callbacks back into events for the session task.

use crate::audio::{AudioCapture, AudioPlayback, CapturedChunk, ChunkSink, LocalSpeech};
use crate::error::{CaptureError, PlaybackError};
use crate::protocol::{AudioChunkData, ClientMessage, TtsAudio};
use crate::transport::Transport;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::sync::Arc;
use tokio::sync::mpsc;

pub const DEFAULT_END_OF_UTTERANCE_SILENCE_MS: u32 = 1_500;

/// Where outbound messages go. Implemented by [`Transport`].
pub trait Outbound: Send + Sync {
    fn send_message(&self, message: ClientMessage);
}

impl Outbound for Transport {
    fn send_message(&self, message: ClientMessage) {
        Transport::send_message(self, message);
    }
}

/// Collaborator callbacks, delivered to the session task.
#[derive(Debug)]
pub enum AudioEvent {
    Chunk(CapturedChunk),
    PlaybackFinished {
        generation: u64,
        result: Result<(), PlaybackError>,
    },
    SpeechFinished {
        ok: bool,
    },
}

/// Decides when the user has finished speaking. The wire contract does not
/// depend on which policy is in use: the end is always signalled by a final
/// chunk with `isLast`.
pub trait EndpointPolicy: Send {
    fn reset(&mut self);

    /// Returns true once the utterance should end.
    fn observe(&mut self, chunk: &CapturedChunk) -> bool;
}

/// Ends the utterance after a stretch of unvoiced audio that follows speech.
#[derive(Debug, Clone)]
pub struct SilenceTimeout {
    silence_ms: u32,
    heard_voice: bool,
    silent_for: u32,
}

impl SilenceTimeout {
    pub fn new(silence_ms: u32) -> Self {
        Self {
            silence_ms,
            heard_voice: false,
            silent_for: 0,
        }
    }
}

impl EndpointPolicy for SilenceTimeout {
    fn reset(&mut self) {
        self.heard_voice = false;
        self.silent_for = 0;
    }

    fn observe(&mut self, chunk: &CapturedChunk) -> bool {
        if chunk.voiced {
            self.heard_voice = true;
            self.silent_for = 0;
            return false;
        }
        if !self.heard_voice {
            return false;
        }
        self.silent_for = self.silent_for.saturating_add(chunk.duration_ms);
        self.silent_for >= self.silence_ms
    }
}

/// Push-to-talk: only an explicit stop ends the utterance.
#[derive(Debug, Clone, Default)]
pub struct ManualEndpoint;

impl EndpointPolicy for ManualEndpoint {
    fn reset(&mut self) {}

    fn observe(&mut self, _chunk: &CapturedChunk) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub chunks_sent: u64,
    pub bytes_sent: u64,
    pub audio_ms_sent: u64,
    pub utterances: u64,
}

pub struct Coordinator {
    capture: Box<dyn AudioCapture>,
    playback: Box<dyn AudioPlayback>,
    speech: Box<dyn LocalSpeech>,
    outbound: Arc<dyn Outbound>,
    events: mpsc::UnboundedSender<AudioEvent>,
    endpoint: Box<dyn EndpointPolicy>,
    device: Option<String>,
    initialized: bool,
    capturing: bool,
    playing: bool,
    playback_generation: u64,
    stats: CaptureStats,
}

impl Coordinator {
    pub fn new(
        capture: Box<dyn AudioCapture>,
        playback: Box<dyn AudioPlayback>,
        speech: Box<dyn LocalSpeech>,
        outbound: Arc<dyn Outbound>,
        events: mpsc::UnboundedSender<AudioEvent>,
    ) -> Self {
        Self {
            capture,
            playback,
            speech,
            outbound,
            events,
            endpoint: Box::new(SilenceTimeout::new(DEFAULT_END_OF_UTTERANCE_SILENCE_MS)),
            device: None,
            initialized: false,
            capturing: false,
            playing: false,
            playback_generation: 0,
            stats: CaptureStats::default(),
        }
    }

    pub fn with_device(mut self, device: Option<String>) -> Self {
        self.device = device;
        self
    }

    pub fn with_endpoint_policy(mut self, policy: Box<dyn EndpointPolicy>) -> Self {
        self.endpoint = policy;
        self
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn stats(&self) -> CaptureStats {
        self.stats
    }

    pub fn start_capture(&mut self) -> Result<(), CaptureError> {
        if self.capturing {
            return Ok(());
        }
        if !self.initialized {
            self.capture.initialize(self.device.as_deref())?;
            self.initialized = true;
        }
        let events = self.events.clone();
        let sink: ChunkSink = Arc::new(move |chunk| {
            let _ = events.send(AudioEvent::Chunk(chunk));
        });
        self.capture.start(sink)?;
        self.endpoint.reset();
        self.capturing = true;
        log::info!("[coordinator] capture started");
        Ok(())
    }

    /// Forward one captured chunk. Returns true when the endpoint policy says
    /// the utterance is over; the caller then stops capture.
    pub fn handle_chunk(&mut self, chunk: CapturedChunk) -> bool {
        if !self.capturing {
            log::debug!("[coordinator] chunk after capture stopped; dropped");
            return false;
        }
        self.send_chunk(&chunk.bytes, false);
        self.stats.audio_ms_sent += chunk.duration_ms as u64;
        self.endpoint.observe(&chunk)
    }

    /// Stop capture and send the final `isLast` chunk, even when nothing was
    /// left buffered.
    pub fn stop_capture(&mut self) {
        if !self.capturing {
            return;
        }
        self.capturing = false;
        let rest = self.capture.stop();
        self.send_chunk(&rest, true);
        self.stats.utterances += 1;
        log::info!("[coordinator] capture stopped; end of utterance sent");
    }

    fn send_chunk(&mut self, bytes: &[u8], is_last: bool) {
        let data = AudioChunkData {
            audio_data: BASE64.encode(bytes),
            is_last,
            format: self.capture.format().to_string(),
            sample_rate: self.capture.sample_rate(),
        };
        self.outbound.send_message(ClientMessage::AudioChunk(data));
        self.stats.chunks_sent += 1;
        self.stats.bytes_sent += bytes.len() as u64;
    }

    /// Start one clip. Only one clip plays at a time; a clip already playing
    /// is cut off.
    pub fn play(&mut self, audio: &TtsAudio) -> Result<(), PlaybackError> {
        let bytes = BASE64
            .decode(audio.audio_data.as_bytes())
            .map_err(|e| PlaybackError::Decode(format!("invalid base64 audio: {}", e)))?;
        self.stop_playback();

        self.playback_generation += 1;
        let generation = self.playback_generation;
        let events = self.events.clone();
        self.playback.play(
            bytes,
            &audio.format,
            Box::new(move |result| {
                let _ = events.send(AudioEvent::PlaybackFinished { generation, result });
            }),
        )?;
        self.playing = true;
        Ok(())
    }

    /// Match a completion against the clip currently playing. Returns `None`
    /// for completions of clips that were stopped or replaced.
    pub fn playback_finished(
        &mut self,
        generation: u64,
        result: Result<(), PlaybackError>,
    ) -> Option<Result<(), PlaybackError>> {
        if !self.playing || generation != self.playback_generation {
            log::debug!("[coordinator] stale playback completion ({})", generation);
            return None;
        }
        self.playing = false;
        Some(result)
    }

    /// Returns true if a clip was cut off.
    pub fn stop_playback(&mut self) -> bool {
        if !self.playing {
            return false;
        }
        self.playback.stop();
        self.playing = false;
        // Invalidate the stopped clip's pending completion.
        self.playback_generation += 1;
        true
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.playback.set_volume(volume.clamp(0.0, 1.0));
    }

    pub fn speak_notice(&mut self, text: &str) {
        let events = self.events.clone();
        self.speech.speak(
            text,
            Box::new(move |ok| {
                let _ = events.send(AudioEvent::SpeechFinished { ok });
            }),
        );
    }

    /// Release the devices.
    pub fn shutdown(&mut self) {
        self.stop_capture();
        self.stop_playback();
    }
}

#[cfg(test)]
pub(crate) mod fakes {
    //! Recording fakes for the audio collaborators.

    use super::*;
    use crate::audio::{PlaybackDone, SpeechDone};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct Log {
        pub sent: Mutex<Vec<ClientMessage>>,
        pub calls: Mutex<Vec<String>>,
        pub sink: Mutex<Option<ChunkSink>>,
        pub playback_done: Mutex<Vec<PlaybackDone>>,
        pub speech_done: Mutex<Vec<SpeechDone>>,
        pub capture_error: Mutex<Option<CaptureError>>,
        pub leftover: Mutex<Vec<u8>>,
    }

    impl Log {
        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        pub fn sent(&self) -> Vec<ClientMessage> {
            self.sent.lock().unwrap().clone()
        }

        fn call(&self, name: &str) {
            self.calls.lock().unwrap().push(name.to_string());
        }

        /// Deliver a chunk as if the microphone produced it.
        pub fn emit_chunk(&self, voiced: bool) {
            let sink = self.sink.lock().unwrap().clone();
            if let Some(sink) = sink {
                sink(CapturedChunk {
                    bytes: vec![1, 2, 3, 4],
                    voiced,
                    duration_ms: 200,
                });
            }
        }

        /// Complete the oldest pending clip.
        pub fn finish_playback(&self) {
            let done = {
                let mut pending = self.playback_done.lock().unwrap();
                if pending.is_empty() {
                    None
                } else {
                    Some(pending.remove(0))
                }
            };
            if let Some(done) = done {
                done(Ok(()));
            }
        }

        pub fn finish_speech(&self, ok: bool) {
            let done = self.speech_done.lock().unwrap().pop();
            if let Some(done) = done {
                done(ok);
            }
        }
    }

    impl Outbound for Log {
        fn send_message(&self, message: ClientMessage) {
            self.sent.lock().unwrap().push(message);
        }
    }

    pub struct FakeCapture(pub Arc<Log>);
    pub struct FakePlayback(pub Arc<Log>);
    pub struct FakeSpeech(pub Arc<Log>);

    impl AudioCapture for FakeCapture {
        fn initialize(&mut self, _device: Option<&str>) -> Result<(), CaptureError> {
            self.0.call("capture.initialize");
            match self.0.capture_error.lock().unwrap().clone() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }

        fn start(&mut self, sink: ChunkSink) -> Result<(), CaptureError> {
            self.0.call("capture.start");
            *self.0.sink.lock().unwrap() = Some(sink);
            Ok(())
        }

        fn stop(&mut self) -> Vec<u8> {
            self.0.call("capture.stop");
            *self.0.sink.lock().unwrap() = None;
            std::mem::take(&mut *self.0.leftover.lock().unwrap())
        }

        fn format(&self) -> &str {
            "pcm16"
        }

        fn sample_rate(&self) -> u32 {
            16_000
        }
    }

    impl AudioPlayback for FakePlayback {
        fn play(&mut self, audio: Vec<u8>, format: &str, done: PlaybackDone) -> Result<(), PlaybackError> {
            self.0.call(&format!("playback.play {} {}", format, audio.len()));
            self.0.playback_done.lock().unwrap().push(done);
            Ok(())
        }

        fn stop(&mut self) {
            self.0.call("playback.stop");
        }

        fn set_volume(&mut self, volume: f32) {
            self.0.call(&format!("playback.volume {:.2}", volume));
        }
    }

    impl LocalSpeech for FakeSpeech {
        fn speak(&mut self, text: &str, done: SpeechDone) {
            self.0.call(&format!("speech.speak {}", text));
            self.0.speech_done.lock().unwrap().push(done);
        }
    }

    pub fn coordinator(log: &Arc<Log>) -> (Coordinator, mpsc::UnboundedReceiver<AudioEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let coordinator = Coordinator::new(
            Box::new(FakeCapture(log.clone())),
            Box::new(FakePlayback(log.clone())),
            Box::new(FakeSpeech(log.clone())),
            log.clone(),
            tx,
        );
        (coordinator, rx)
    }
}

#[cfg(test)]
mod tests {
    use super::fakes::{coordinator, Log};
    use super::*;

    fn chunk(voiced: bool) -> CapturedChunk {
        CapturedChunk {
            bytes: vec![0; 6400],
            voiced,
            duration_ms: 200,
        }
    }

    fn audio_chunks(log: &Log) -> Vec<AudioChunkData> {
        log.sent()
            .into_iter()
            .filter_map(|m| match m {
                ClientMessage::AudioChunk(data) => Some(data),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn captured_chunks_are_base64_encoded_and_forwarded() {
        let log = Arc::new(Log::default());
        let (mut coordinator, mut events) = coordinator(&log);
        coordinator.start_capture().unwrap();
        assert_eq!(log.calls(), vec!["capture.initialize", "capture.start"]);

        log.emit_chunk(true);
        let Ok(AudioEvent::Chunk(chunk)) = events.try_recv() else {
            panic!("expected a chunk event");
        };
        assert!(!coordinator.handle_chunk(chunk));

        let sent = audio_chunks(&log);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].audio_data, "AQIDBA==");
        assert!(!sent[0].is_last);
        assert_eq!(sent[0].format, "pcm16");
        assert_eq!(sent[0].sample_rate, 16_000);
    }

    #[test]
    fn stop_always_sends_a_final_chunk() {
        let log = Arc::new(Log::default());
        let (mut coordinator, _events) = coordinator(&log);
        coordinator.start_capture().unwrap();
        coordinator.stop_capture();
        coordinator.stop_capture();

        let sent = audio_chunks(&log);
        assert_eq!(sent.len(), 1);
        assert!(sent[0].is_last);
        assert_eq!(sent[0].audio_data, "");
        assert_eq!(coordinator.stats().utterances, 1);

        // Leftover bytes ride along with the final marker.
        *log.leftover.lock().unwrap() = vec![9, 9];
        coordinator.start_capture().unwrap();
        coordinator.stop_capture();
        let last = audio_chunks(&log).pop().unwrap();
        assert!(last.is_last);
        assert_eq!(last.audio_data, "CQk=");
        // Initialised once only.
        assert_eq!(
            log.calls().iter().filter(|c| *c == "capture.initialize").count(),
            1
        );
    }

    #[test]
    fn permission_failure_surfaces_from_start() {
        let log = Arc::new(Log::default());
        *log.capture_error.lock().unwrap() = Some(CaptureError::PermissionDenied("nope".into()));
        let (mut coordinator, _events) = coordinator(&log);
        assert_eq!(
            coordinator.start_capture(),
            Err(CaptureError::PermissionDenied("nope".into()))
        );
        assert!(!coordinator.is_capturing());
    }

    #[test]
    fn silence_after_speech_ends_the_utterance() {
        let mut policy = SilenceTimeout::new(600);
        assert!(!policy.observe(&chunk(false)), "leading silence never ends it");
        assert!(!policy.observe(&chunk(false)));
        assert!(!policy.observe(&chunk(false)));
        assert!(!policy.observe(&chunk(true)));
        assert!(!policy.observe(&chunk(false)));
        assert!(!policy.observe(&chunk(false)));
        assert!(policy.observe(&chunk(false)));

        policy.reset();
        assert!(!policy.observe(&chunk(false)));
        assert!(!ManualEndpoint.observe(&chunk(false)));
    }

    #[test]
    fn stale_playback_completions_are_ignored() {
        let log = Arc::new(Log::default());
        let (mut coordinator, mut events) = coordinator(&log);
        let clip = TtsAudio {
            audio_data: "AAAA".into(),
            format: "mp3".into(),
            is_last: None,
        };
        coordinator.play(&clip).unwrap();
        assert!(coordinator.stop_playback());
        assert!(!coordinator.stop_playback());
        coordinator.play(&clip).unwrap();

        // The first clip's completion arrives late.
        log.finish_playback();
        let Ok(AudioEvent::PlaybackFinished { generation, result }) = events.try_recv() else {
            panic!("expected completion");
        };
        assert!(coordinator.playback_finished(generation, result).is_none());
        assert!(coordinator.is_playing());

        log.finish_playback();
        let Ok(AudioEvent::PlaybackFinished { generation, result }) = events.try_recv() else {
            panic!("expected completion");
        };
        assert_eq!(coordinator.playback_finished(generation, result), Some(Ok(())));
        assert!(!coordinator.is_playing());
    }

    #[test]
    fn undecodable_base64_is_a_decode_error() {
        let log = Arc::new(Log::default());
        let (mut coordinator, _events) = coordinator(&log);
        let clip = TtsAudio {
            audio_data: "***".into(),
            format: "mp3".into(),
            is_last: None,
        };
        assert!(matches!(coordinator.play(&clip), Err(PlaybackError::Decode(_))));
        assert!(!coordinator.is_playing());
    }

    #[test]
    fn volume_is_clamped() {
        let log = Arc::new(Log::default());
        let (mut coordinator, _events) = coordinator(&log);
        coordinator.set_volume(3.0);
        coordinator.set_volume(-1.0);
        assert_eq!(
            log.calls(),
            vec!["playback.volume 1.00", "playback.volume 0.00"]
        );
    }
}
