//! Audio collaborators consumed by the coordinator.
//!
//! The conversation core only sees these traits. The default implementations
//! drive the system microphone and speakers through cpal and speak local
//! notices through the platform's speech command.

pub mod capture;
pub mod playback;
pub mod speech;

pub use capture::MicCapture;
pub use playback::SpeakerPlayback;
pub use speech::SystemSpeech;

use crate::error::{CaptureError, PlaybackError};
use std::sync::Arc;

/// One slice of captured audio, already in the wire format.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedChunk {
    pub bytes: Vec<u8>,
    /// Whether the voice activity detector heard speech in this slice.
    pub voiced: bool,
    pub duration_ms: u32,
}

pub type ChunkSink = Arc<dyn Fn(CapturedChunk) + Send + Sync>;

/// Run device or decode work that blocks. On a multi-threaded runtime the
/// worker is handed off first so the session loop's other tasks keep running;
/// elsewhere (plain threads, current-thread runtimes) it runs inline.
pub(crate) fn run_blocking<R>(work: impl FnOnce() -> R) -> R {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == tokio::runtime::RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(work)
        }
        _ => work(),
    }
}
pub type PlaybackDone = Box<dyn FnOnce(Result<(), PlaybackError>) + Send>;
pub type SpeechDone = Box<dyn FnOnce(bool) + Send>;

pub trait AudioCapture: Send {
    /// Acquire the input device. Called once before the first `start`.
    fn initialize(&mut self, device: Option<&str>) -> Result<(), CaptureError>;

    /// Begin delivering chunks to `sink` from a background thread.
    fn start(&mut self, sink: ChunkSink) -> Result<(), CaptureError>;

    /// Stop capturing and return whatever was buffered but not yet delivered.
    fn stop(&mut self) -> Vec<u8>;

    /// Wire name of the encoding, e.g. `pcm16`.
    fn format(&self) -> &str;

    fn sample_rate(&self) -> u32;
}

pub trait AudioPlayback: Send {
    /// Start playing `audio` (encoded as `format`). `done` fires once when the
    /// clip finishes, fails, or is stopped.
    fn play(&mut self, audio: Vec<u8>, format: &str, done: PlaybackDone) -> Result<(), PlaybackError>;

    fn stop(&mut self);

    /// 0.0 ..= 1.0
    fn set_volume(&mut self, volume: f32);
}

/// Local (offline) speech for short notices.
pub trait LocalSpeech: Send {
    /// `done(true)` on success, `done(false)` when synthesis failed.
    fn speak(&mut self, text: &str, done: SpeechDone);
}

#[derive(Default)]
pub(crate) struct ResamplerState {
    t: f64,
    last_sample: f32,
    has_last: bool,
}

/// Streaming linear resampler; `state` carries the fractional position and
/// last sample across calls so chunk boundaries do not click.
pub(crate) fn resample_linear(
    samples: &[f32],
    input_rate: u32,
    target_rate: u32,
    state: &mut ResamplerState,
) -> Vec<f32> {
    if samples.is_empty() || input_rate == target_rate {
        return samples.to_vec();
    }
    let step = input_rate as f64 / target_rate as f64;
    let mut out = Vec::with_capacity(((samples.len() as f64 / step) + 2.0) as usize);

    let mut buf = Vec::with_capacity(samples.len() + 1);
    if state.has_last {
        buf.push(state.last_sample);
    }
    buf.extend_from_slice(samples);

    let mut i: usize = 0;
    let mut t = state.t;
    while i + 1 < buf.len() {
        let s0 = buf[i];
        let s1 = buf[i + 1];
        out.push(s0 + (s1 - s0) * t as f32);
        t += step;
        while t >= 1.0 {
            t -= 1.0;
            i += 1;
            if i + 1 >= buf.len() {
                break;
            }
        }
    }

    state.t = t;
    if let Some(last) = buf.last() {
        state.last_sample = *last;
        state.has_last = true;
    }
    out
}

pub(crate) fn f32_to_i16(sample: f32) -> i16 {
    (sample * 32767.0).clamp(-32768.0, 32767.0) as i16
}

pub(crate) fn pcm16_le_bytes(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&s| f32_to_i16(s).to_le_bytes())
        .collect()
}

pub(crate) fn pcm16_le_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
        .collect()
}

/// Input device names, for settings and the CLI.
pub fn list_input_devices() -> Vec<String> {
    use cpal::traits::{DeviceTrait, HostTrait};
    let host = cpal::default_host();
    match host.input_devices() {
        Ok(devices) => devices.filter_map(|d| d.name().ok()).collect(),
        Err(_) => Vec::new(),
    }
}
