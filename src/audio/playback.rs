use super::{pcm16_le_to_f32, resample_linear, AudioPlayback, PlaybackDone, ResamplerState};
use crate::error::PlaybackError;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Sample rate assumed for raw `pcm`/`pcm16` clips.
pub const DEFAULT_PCM_RATE: u32 = 24_000;

/// Speaker output. Each clip is decoded and played on its own worker thread;
/// `stop()` cuts the current clip short.
pub struct SpeakerPlayback {
    device_name: Option<String>,
    pcm_rate: u32,
    volume: Arc<AtomicU32>,
    current: Option<Arc<AtomicBool>>,
}

impl SpeakerPlayback {
    pub fn new(device_name: Option<String>, volume: f32) -> Self {
        Self {
            device_name,
            pcm_rate: DEFAULT_PCM_RATE,
            volume: Arc::new(AtomicU32::new(volume.clamp(0.0, 1.0).to_bits())),
            current: None,
        }
    }
}

impl Default for SpeakerPlayback {
    fn default() -> Self {
        Self::new(None, 1.0)
    }
}

impl AudioPlayback for SpeakerPlayback {
    fn play(&mut self, audio: Vec<u8>, format: &str, done: PlaybackDone) -> Result<(), PlaybackError> {
        self.stop();
        let pcm_rate = self.pcm_rate;
        let (samples, rate) = super::run_blocking(|| decode_clip(&audio, format, pcm_rate))?;
        let stop = Arc::new(AtomicBool::new(false));
        self.current = Some(stop.clone());

        let device_name = self.device_name.clone();
        let volume = self.volume.clone();
        std::thread::spawn(move || {
            let result = play_blocking(device_name.as_deref(), samples, rate, volume, stop);
            if let Err(e) = &result {
                log::warn!("[audio] playback failed: {}", e);
            }
            done(result);
        });
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(stop) = self.current.take() {
            stop.store(true, Ordering::SeqCst);
        }
    }

    fn set_volume(&mut self, volume: f32) {
        self.volume
            .store(volume.clamp(0.0, 1.0).to_bits(), Ordering::SeqCst);
    }
}

impl Drop for SpeakerPlayback {
    fn drop(&mut self) {
        self.stop();
    }
}

struct PlaybackBuffer {
    samples: Vec<f32>,
    position: usize,
    finished: bool,
}

fn output_device(name: Option<&str>) -> Result<cpal::Device, PlaybackError> {
    let host = cpal::default_host();
    match name {
        Some(name) => host
            .output_devices()
            .map_err(|e| PlaybackError::Device(format!("cannot enumerate devices: {}", e)))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| PlaybackError::Device(format!("output device '{}' not found", name))),
        None => host
            .default_output_device()
            .ok_or_else(|| PlaybackError::Device("no default output device".into())),
    }
}

/// Plays mono `samples` at `rate` until done or `stop` is raised.
fn play_blocking(
    device_name: Option<&str>,
    samples: Vec<f32>,
    rate: u32,
    volume: Arc<AtomicU32>,
    stop: Arc<AtomicBool>,
) -> Result<(), PlaybackError> {
    let device = output_device(device_name)?;
    let config = device
        .default_output_config()
        .map_err(|e| PlaybackError::Device(format!("no output config: {}", e)))?
        .config();
    let out_rate = config.sample_rate.0;
    let channels = config.channels as usize;

    let mut resampler = ResamplerState::default();
    let samples = resample_linear(&samples, rate, out_rate, &mut resampler);

    let buffer = Arc::new(Mutex::new(PlaybackBuffer {
        samples,
        position: 0,
        finished: false,
    }));
    let buffer_cb = buffer.clone();
    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let gain = f32::from_bits(volume.load(Ordering::Relaxed));
                let mut buf = match buffer_cb.lock() {
                    Ok(b) => b,
                    Err(_) => return,
                };
                for frame in data.chunks_mut(channels.max(1)) {
                    let value = if buf.position < buf.samples.len() {
                        let v = buf.samples[buf.position] * gain;
                        buf.position += 1;
                        v
                    } else {
                        buf.finished = true;
                        0.0
                    };
                    for sample in frame.iter_mut() {
                        *sample = value;
                    }
                }
            },
            |err| log::error!("[audio] output stream error: {}", err),
            None,
        )
        .map_err(|e| PlaybackError::Device(format!("failed to build output stream: {}", e)))?;
    stream
        .play()
        .map_err(|e| PlaybackError::Device(format!("failed to start output stream: {}", e)))?;

    loop {
        std::thread::sleep(Duration::from_millis(10));
        if stop.load(Ordering::SeqCst) {
            log::debug!("[audio] playback stopped early");
            break;
        }
        let finished = buffer.lock().map(|b| b.finished).unwrap_or(true);
        if finished {
            break;
        }
    }
    drop(stream);
    Ok(())
}

/// Decode one clip to mono f32. Raw `pcm`/`pcm16` is 16-bit little-endian at
/// `pcm_rate`; anything else goes through symphonia.
pub(crate) fn decode_clip(audio: &[u8], format: &str, pcm_rate: u32) -> Result<(Vec<f32>, u32), PlaybackError> {
    if audio.is_empty() {
        return Err(PlaybackError::Decode("empty audio clip".into()));
    }
    match format.to_ascii_lowercase().as_str() {
        "pcm" | "pcm16" | "s16le" => Ok((pcm16_le_to_f32(audio), pcm_rate)),
        other => decode_container(audio, other),
    }
}

fn decode_container(audio: &[u8], extension: &str) -> Result<(Vec<f32>, u32), PlaybackError> {
    use symphonia::core::audio::SampleBuffer;
    use symphonia::core::codecs::DecoderOptions;
    use symphonia::core::errors::Error as SymphError;
    use symphonia::core::formats::FormatOptions;
    use symphonia::core::io::MediaSourceStream;
    use symphonia::core::meta::MetadataOptions;
    use symphonia::core::probe::Hint;

    let cursor = std::io::Cursor::new(audio.to_vec());
    let mss = MediaSourceStream::new(Box::new(cursor), Default::default());
    let mut hint = Hint::new();
    hint.with_extension(extension);

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| PlaybackError::Decode(format!("failed to probe audio: {}", e)))?;
    let mut reader = probed.format;
    let track = reader
        .default_track()
        .ok_or_else(|| PlaybackError::Decode("no default audio track".into()))?;
    let track_id = track.id;
    let codec_params = track.codec_params.clone();
    let mut sample_rate = codec_params.sample_rate.unwrap_or(0);

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|e| PlaybackError::Decode(format!("failed to create decoder: {}", e)))?;

    let mut out: Vec<f32> = Vec::new();
    let mut sample_buf: Option<SampleBuffer<f32>> = None;
    loop {
        let packet = match reader.next_packet() {
            Ok(p) => p,
            Err(SymphError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(PlaybackError::Decode(format!("audio read error: {}", e))),
        };
        if packet.track_id() != track_id {
            continue;
        }
        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(SymphError::DecodeError(_)) => continue,
            Err(e) => return Err(PlaybackError::Decode(format!("audio decode error: {}", e))),
        };

        let spec = *decoded.spec();
        if sample_rate == 0 {
            sample_rate = spec.rate;
        }
        let channels = spec.channels.count();
        let frames = decoded.frames() as u64;
        let required = (frames as usize).saturating_mul(channels);
        let needs_new = sample_buf
            .as_ref()
            .map(|b| b.capacity() < required)
            .unwrap_or(true);
        if needs_new {
            sample_buf = Some(SampleBuffer::<f32>::new(frames, spec));
        } else if let Some(b) = sample_buf.as_mut() {
            b.clear();
        }
        let Some(buf) = sample_buf.as_mut() else {
            continue;
        };
        buf.copy_interleaved_ref(decoded);
        let data = buf.samples();
        if channels <= 1 {
            out.extend_from_slice(data);
        } else {
            out.extend(
                data.chunks_exact(channels)
                    .map(|frame| frame.iter().sum::<f32>() / channels as f32),
            );
        }
    }

    if sample_rate == 0 {
        return Err(PlaybackError::Decode("unknown sample rate".into()));
    }
    Ok((out, sample_rate))
}
