use super::{pcm16_le_bytes, resample_linear, run_blocking, AudioCapture, CapturedChunk, ChunkSink, ResamplerState};
use crate::error::CaptureError;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use webrtc_vad::{SampleRate as VadSampleRate, Vad, VadMode};

pub const DEFAULT_SAMPLE_RATE: u32 = 16_000;
pub const DEFAULT_CHUNK_MS: u32 = 200;
const VAD_SAMPLE_RATE: u32 = 16_000;
const VAD_FRAME_MS: usize = 20;

/// Microphone capture: mono 16-bit little-endian PCM, delivered in fixed
/// slices with a per-slice voice flag from WebRTC VAD.
pub struct MicCapture {
    device_name: Option<String>,
    initialized: bool,
    sample_rate: u32,
    chunk_ms: u32,
    vad_mode: u8,
    running: Option<Running>,
}

struct Running {
    stop_tx: mpsc::Sender<()>,
    stream_thread: JoinHandle<()>,
    processor: JoinHandle<()>,
    leftover: Arc<Mutex<Vec<u8>>>,
}

impl MicCapture {
    /// `vad_mode` is the webrtc-vad aggressiveness, see [`vad_mode`].
    pub fn new(sample_rate: u32, chunk_ms: u32, vad_mode: u8) -> Self {
        Self {
            device_name: None,
            initialized: false,
            sample_rate: if sample_rate == 0 { DEFAULT_SAMPLE_RATE } else { sample_rate },
            chunk_ms: chunk_ms.max(20),
            vad_mode: vad_mode.min(3),
            running: None,
        }
    }
}

/// 0 quality, 1 low bitrate, 2 aggressive, 3 very aggressive. Higher values
/// are treated as 3.
pub fn vad_mode(level: u8) -> VadMode {
    match level {
        0 => VadMode::Quality,
        1 => VadMode::LowBitrate,
        2 => VadMode::Aggressive,
        _ => VadMode::VeryAggressive,
    }
}

fn find_device(name: Option<&str>) -> Result<cpal::Device, CaptureError> {
    let host = cpal::default_host();
    match name {
        Some(name) => host
            .input_devices()
            .map_err(|e| CaptureError::DeviceUnavailable(format!("failed to list devices: {}", e)))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| CaptureError::DeviceUnavailable(format!("device '{}' not found", name))),
        None => host
            .default_input_device()
            .ok_or_else(|| CaptureError::DeviceUnavailable("no default input device".into())),
    }
}

impl Default for MicCapture {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_RATE, DEFAULT_CHUNK_MS, 0)
    }
}

impl AudioCapture for MicCapture {
    fn initialize(&mut self, device: Option<&str>) -> Result<(), CaptureError> {
        self.device_name = device.map(str::to_string);
        let device = find_device(self.device_name.as_deref())?;
        log::info!(
            "[audio] using input device: {}",
            device.name().unwrap_or_else(|_| "unknown".into())
        );
        self.initialized = true;
        Ok(())
    }

    fn start(&mut self, sink: ChunkSink) -> Result<(), CaptureError> {
        if self.running.is_some() {
            return Ok(());
        }
        if !self.initialized {
            self.initialize(None)?;
        }

        let target_rate = self.sample_rate;
        let device_name = self.device_name.clone();
        let (raw_tx, raw_rx) = mpsc::sync_channel::<Vec<f32>>(128);
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<u32, CaptureError>>(1);

        // cpal streams are not Send; the stream lives and dies on this thread.
        let stream_thread = std::thread::spawn(move || {
            run_stream(device_name, target_rate, raw_tx, ready_tx, stop_rx);
        });

        let effective_rate = match run_blocking(|| ready_rx.recv()) {
            Ok(Ok(rate)) => rate,
            Ok(Err(e)) => {
                let _ = run_blocking(|| stream_thread.join());
                return Err(e);
            }
            Err(_) => {
                let _ = run_blocking(|| stream_thread.join());
                return Err(CaptureError::Stream("capture thread exited".into()));
            }
        };

        let leftover = Arc::new(Mutex::new(Vec::new()));
        let processor_leftover = leftover.clone();
        let chunk_ms = self.chunk_ms;
        let vad_mode = self.vad_mode;
        let processor = std::thread::spawn(move || {
            process_audio(
                raw_rx,
                sink,
                processor_leftover,
                effective_rate,
                target_rate,
                chunk_ms,
                vad_mode,
            );
        });

        self.running = Some(Running {
            stop_tx,
            stream_thread,
            processor,
            leftover,
        });
        Ok(())
    }

    fn stop(&mut self) -> Vec<u8> {
        let Some(running) = self.running.take() else {
            return Vec::new();
        };
        let _ = running.stop_tx.send(());
        // Joining the stream thread drops the stream and the raw sender, which
        // lets the processor drain and exit.
        let Running {
            stream_thread,
            processor,
            leftover,
            ..
        } = running;
        run_blocking(|| {
            let _ = stream_thread.join();
            let _ = processor.join();
        });
        let leftover = leftover
            .lock()
            .map(|mut l| std::mem::take(&mut *l))
            .unwrap_or_default();
        log::info!("[audio] capture stopped ({} bytes unsent)", leftover.len());
        leftover
    }

    fn format(&self) -> &str {
        "pcm16"
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl Drop for MicCapture {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn pick_config(device: &cpal::Device, target_rate: u32) -> Result<(StreamConfig, u32), CaptureError> {
    if let Some(cfg) = try_config(device, target_rate) {
        return Ok((cfg, 1));
    }
    if let Some(cfg) = try_config(device, 48_000) {
        let d = (cfg.sample_rate.0 / target_rate.max(1)).max(1);
        log::info!(
            "[audio] {}Hz unavailable, using {}Hz with {}:1 decimation",
            target_rate,
            cfg.sample_rate.0,
            d
        );
        return Ok((cfg, d));
    }
    let default = device
        .default_input_config()
        .map_err(|e| CaptureError::DeviceUnavailable(format!("no input config: {}", e)))?;
    let rate = default.sample_rate().0;
    log::info!(
        "[audio] using default config: {}Hz {}ch",
        rate,
        default.channels()
    );
    Ok((
        StreamConfig {
            channels: default.channels(),
            sample_rate: default.sample_rate(),
            buffer_size: cpal::BufferSize::Default,
        },
        (rate / target_rate.max(1)).max(1),
    ))
}

fn try_config(device: &cpal::Device, rate: u32) -> Option<StreamConfig> {
    let supported: Vec<_> = device.supported_input_configs().ok()?.collect();
    let in_range = |r: &cpal::SupportedStreamConfigRange| {
        r.min_sample_rate().0 <= rate && r.max_sample_rate().0 >= rate
    };
    // Prefer mono; otherwise take any channel count and downmix.
    let range = supported
        .iter()
        .find(|r| r.channels() == 1 && in_range(r))
        .or_else(|| supported.iter().find(|r| in_range(r)))?;
    Some(StreamConfig {
        channels: range.channels(),
        sample_rate: SampleRate(rate),
        buffer_size: cpal::BufferSize::Default,
    })
}

fn classify_build_error(err: cpal::BuildStreamError) -> CaptureError {
    let text = err.to_string();
    let lower = text.to_lowercase();
    match err {
        cpal::BuildStreamError::DeviceNotAvailable => CaptureError::DeviceUnavailable(text),
        _ if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized") => {
            CaptureError::PermissionDenied(text)
        }
        _ => CaptureError::Stream(text),
    }
}

fn run_stream(
    device_name: Option<String>,
    target_rate: u32,
    raw_tx: SyncSender<Vec<f32>>,
    ready_tx: SyncSender<Result<u32, CaptureError>>,
    stop_rx: Receiver<()>,
) {
    let picked = find_device(device_name.as_deref())
        .and_then(|device| pick_config(&device, target_rate).map(|(cfg, d)| (device, cfg, d)));
    let (device, config, decimate) = match picked {
        Ok(picked) => picked,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };
    let effective_rate = config.sample_rate.0 / decimate;
    log::info!(
        "[audio] stream config: {}Hz, {}ch, decimate={}, effective={}Hz",
        config.sample_rate.0,
        config.channels,
        decimate,
        effective_rate
    );

    let channels = config.channels as usize;
    let stream = device.build_input_stream(
        &config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            let mono: Vec<f32> = if channels > 1 {
                data.chunks(channels)
                    .map(|frame| frame.iter().sum::<f32>() / channels as f32)
                    .collect()
            } else {
                data.to_vec()
            };
            let samples: Vec<f32> = if decimate > 1 {
                mono.iter().step_by(decimate as usize).copied().collect()
            } else {
                mono
            };
            let _ = raw_tx.try_send(samples);
        },
        |err| log::error!("[audio] stream error: {}", err),
        None,
    );

    let stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready_tx.send(Err(classify_build_error(e)));
            return;
        }
    };
    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(CaptureError::Stream(format!("failed to start stream: {}", e))));
        return;
    }
    let _ = ready_tx.send(Ok(effective_rate));

    // Park until stop() (or the owner going away).
    let _ = stop_rx.recv();
    drop(stream);
}

/// Cuts resampled audio into fixed slices and tags each with a voice flag.
pub(crate) struct Slicer {
    slice_samples: usize,
    sample_rate: u32,
    pending: Vec<u8>,
    pending_samples: usize,
    voiced: bool,
}

impl Slicer {
    pub(crate) fn new(sample_rate: u32, chunk_ms: u32) -> Self {
        Self {
            slice_samples: (sample_rate as usize * chunk_ms as usize / 1000).max(1),
            sample_rate,
            pending: Vec::new(),
            pending_samples: 0,
            voiced: false,
        }
    }

    /// Append PCM samples; returns every slice completed by them.
    pub(crate) fn push(&mut self, pcm: &[u8], voiced: bool) -> Vec<CapturedChunk> {
        let mut out = Vec::new();
        for sample in pcm.chunks_exact(2) {
            self.voiced |= voiced;
            self.pending.extend_from_slice(sample);
            self.pending_samples += 1;
            if self.pending_samples == self.slice_samples {
                out.push(CapturedChunk {
                    bytes: std::mem::take(&mut self.pending),
                    voiced: self.voiced,
                    duration_ms: (self.slice_samples as u64 * 1000 / self.sample_rate as u64) as u32,
                });
                self.pending_samples = 0;
                self.voiced = false;
            }
        }
        out
    }

    pub(crate) fn take_pending(&mut self) -> Vec<u8> {
        self.pending_samples = 0;
        self.voiced = false;
        std::mem::take(&mut self.pending)
    }
}

fn process_audio(
    raw_rx: Receiver<Vec<f32>>,
    sink: ChunkSink,
    leftover: Arc<Mutex<Vec<u8>>>,
    input_rate: u32,
    target_rate: u32,
    chunk_ms: u32,
    vad_mode: u8,
) {
    let mut resampler = ResamplerState::default();
    let mut vad_resampler = ResamplerState::default();
    let mut vad = Vad::new_with_rate_and_mode(VadSampleRate::Rate16kHz, self::vad_mode(vad_mode));
    let vad_frame_samples = (VAD_SAMPLE_RATE as usize * VAD_FRAME_MS) / 1000;
    let mut vad_frame_buf: Vec<i16> = Vec::with_capacity(vad_frame_samples * 3);
    let mut slicer = Slicer::new(target_rate, chunk_ms);

    while let Ok(samples) = raw_rx.recv() {
        let send_samples = resample_linear(&samples, input_rate, target_rate, &mut resampler);
        let pcm = pcm16_le_bytes(&send_samples);

        let vad_samples = resample_linear(&samples, input_rate, VAD_SAMPLE_RATE, &mut vad_resampler);
        vad_frame_buf.extend(vad_samples.iter().map(|&s| super::f32_to_i16(s)));
        let mut voiced = false;
        while vad_frame_buf.len() >= vad_frame_samples {
            if vad
                .is_voice_segment(&vad_frame_buf[..vad_frame_samples])
                .unwrap_or(false)
            {
                voiced = true;
            }
            vad_frame_buf.drain(..vad_frame_samples);
        }

        for chunk in slicer.push(&pcm, voiced) {
            sink(chunk);
        }
    }

    if let Ok(mut slot) = leftover.lock() {
        *slot = slicer.take_pending();
    }
    log::debug!("[audio] processing thread stopped");
}
