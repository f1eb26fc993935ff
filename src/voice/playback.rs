//! Clip decoding and device playback

use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use rubato::{FftFixedIn, Resampler};

use super::capture::to_mono;
use crate::{Error, Result};

/// Resampler chunk size in frames
const RESAMPLE_CHUNK: usize = 1024;

/// Container format detected from a clip's leading bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipFormat {
    Wav,
    Mp3,
    Unknown,
}

/// An encoded audio clip
///
/// Cheap to clone; the bytes are shared.
#[derive(Clone, PartialEq, Eq)]
pub struct AudioClip {
    bytes: Arc<[u8]>,
}

impl AudioClip {
    /// Wrap encoded audio bytes
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    /// Raw encoded bytes
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Encoded length in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the clip holds no bytes
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Sniff the container format
    #[must_use]
    pub fn format(&self) -> ClipFormat {
        let b = &self.bytes;
        if b.len() >= 12 && &b[..4] == b"RIFF" && &b[8..12] == b"WAVE" {
            ClipFormat::Wav
        } else if b.starts_with(b"ID3") || (b.len() >= 2 && b[0] == 0xFF && b[1] & 0xE0 == 0xE0) {
            ClipFormat::Mp3
        } else {
            ClipFormat::Unknown
        }
    }

    /// Decode to mono f32 samples
    ///
    /// # Errors
    ///
    /// Returns `Error::Decode` if the clip is not valid WAV or MP3
    pub fn decode(&self) -> Result<DecodedAudio> {
        match self.format() {
            ClipFormat::Wav => decode_wav(&self.bytes),
            // anything unrecognised is treated as bare MP3 frames
            ClipFormat::Mp3 | ClipFormat::Unknown => decode_mp3(&self.bytes),
        }
    }
}

impl std::fmt::Debug for AudioClip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioClip")
            .field("len", &self.bytes.len())
            .field("format", &self.format())
            .finish()
    }
}

impl From<Vec<u8>> for AudioClip {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

/// Decoded mono PCM
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl DecodedAudio {
    /// Playback length
    #[must_use]
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        #[allow(clippy::cast_precision_loss)]
        let secs = self.samples.len() as f64 / f64::from(self.sample_rate);
        Duration::from_secs_f64(secs)
    }
}

/// Anything that can play a clip to completion
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Play `clip`, returning once it has finished
    ///
    /// # Errors
    ///
    /// Returns error if the clip cannot be decoded or the device fails
    async fn play(&self, clip: &AudioClip) -> Result<()>;
}

/// Speaker output through cpal
#[derive(Debug, Clone, Default)]
pub struct DevicePlayback {
    device_name: Option<String>,
}

impl DevicePlayback {
    /// Use the named output device, or the system default
    #[must_use]
    pub const fn new(device_name: Option<String>) -> Self {
        Self { device_name }
    }
}

#[async_trait]
impl AudioSink for DevicePlayback {
    async fn play(&self, clip: &AudioClip) -> Result<()> {
        let clip = clip.clone();
        let device_name = self.device_name.clone();
        tokio::task::spawn_blocking(move || {
            let audio = clip.decode()?;
            play_blocking(device_name.as_deref(), audio)
        })
        .await
        .map_err(|e| Error::DeviceUnavailable(format!("playback task failed: {e}")))?
    }
}

fn output_device(name: Option<&str>) -> Result<cpal::Device> {
    let host = cpal::default_host();
    match name {
        Some(name) => host
            .output_devices()
            .map_err(|e| Error::DeviceUnavailable(e.to_string()))?
            .find(|d| d.name().is_ok_and(|n| n == name))
            .ok_or_else(|| Error::DeviceUnavailable(format!("output device not found: {name}"))),
        None => host
            .default_output_device()
            .ok_or_else(|| Error::DeviceUnavailable("no output device available".to_string())),
    }
}

/// Play decoded audio on the output device, blocking until done
fn play_blocking(device_name: Option<&str>, audio: DecodedAudio) -> Result<()> {
    if audio.samples.is_empty() {
        return Ok(());
    }

    let device = output_device(device_name)?;
    let supported = device
        .default_output_config()
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;
    let format = supported.sample_format();
    let config: cpal::StreamConfig = supported.config();
    let channels = usize::from(config.channels);
    let device_rate = config.sample_rate.0;

    let samples = Arc::new(resample(&audio.samples, audio.sample_rate, device_rate)?);
    let position = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicBool::new(false));

    let next_sample = {
        let samples = Arc::clone(&samples);
        let position = Arc::clone(&position);
        let finished = Arc::clone(&finished);
        move || {
            let pos = position.load(Ordering::Relaxed);
            if let Some(&s) = samples.get(pos) {
                position.store(pos + 1, Ordering::Relaxed);
                s
            } else {
                finished.store(true, Ordering::Release);
                0.0
            }
        }
    };
    let on_error = |err: cpal::StreamError| {
        tracing::error!(error = %err, "audio playback error");
    };

    let stream = match format {
        cpal::SampleFormat::F32 => device.build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                for frame in data.chunks_mut(channels) {
                    frame.fill(next_sample());
                }
            },
            on_error,
            None,
        ),
        cpal::SampleFormat::I16 => device.build_output_stream(
            &config,
            move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                for frame in data.chunks_mut(channels) {
                    #[allow(clippy::cast_possible_truncation)]
                    let s = (next_sample() * 32767.0).clamp(-32768.0, 32767.0) as i16;
                    frame.fill(s);
                }
            },
            on_error,
            None,
        ),
        other => {
            return Err(Error::DeviceUnavailable(format!(
                "unsupported output sample format: {other:?}"
            )));
        }
    }
    .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;

    stream
        .play()
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;

    #[allow(clippy::cast_precision_loss)]
    let length = Duration::from_secs_f64(samples.len() as f64 / f64::from(device_rate.max(1)));
    let deadline = Instant::now() + length + Duration::from_millis(500);

    while !finished.load(Ordering::Acquire) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }

    // let the device drain its last buffer
    std::thread::sleep(Duration::from_millis(100));
    drop(stream);

    tracing::debug!(samples = samples.len(), "playback complete");
    Ok(())
}

/// Resample mono audio between rates
///
/// # Errors
///
/// Returns `Error::Decode` if the resampler rejects the rates
pub fn resample(input: &[f32], from: u32, to: u32) -> Result<Vec<f32>> {
    if from == to || input.is_empty() {
        return Ok(input.to_vec());
    }

    let mut resampler = FftFixedIn::<f32>::new(from as usize, to as usize, RESAMPLE_CHUNK, 2, 1)
        .map_err(|e| Error::Decode(format!("resampler setup failed: {e}")))?;

    let mut out = Vec::with_capacity(input.len() * to as usize / from as usize + RESAMPLE_CHUNK);
    let mut pos = 0;
    loop {
        let need = resampler.input_frames_next();
        if pos + need > input.len() {
            break;
        }
        let chunk = vec![&input[pos..pos + need]];
        let frames = resampler
            .process(&chunk, None)
            .map_err(|e| Error::Decode(format!("resample failed: {e}")))?;
        out.extend_from_slice(&frames[0]);
        pos += need;
    }
    if pos < input.len() {
        let chunk = vec![&input[pos..]];
        let frames = resampler
            .process_partial(Some(&chunk), None)
            .map_err(|e| Error::Decode(format!("resample failed: {e}")))?;
        out.extend_from_slice(&frames[0]);
    }

    Ok(out)
}

fn decode_wav(bytes: &[u8]) -> Result<DecodedAudio> {
    let reader =
        hound::WavReader::new(Cursor::new(bytes)).map_err(|e| Error::Decode(e.to_string()))?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels);

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::Decode(e.to_string()))?,
        hound::SampleFormat::Int => {
            let scale = 2f32.powi(i32::from(spec.bits_per_sample) - 1);
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| {
                    #[allow(clippy::cast_precision_loss)]
                    let v = v as f32;
                    v / scale
                }))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| Error::Decode(e.to_string()))?
        }
    };

    Ok(DecodedAudio {
        samples: to_mono(&interleaved, channels),
        sample_rate: spec.sample_rate,
    })
}

fn decode_mp3(bytes: &[u8]) -> Result<DecodedAudio> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(bytes));
    let mut samples = Vec::new();
    let mut sample_rate = 0;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                sample_rate = u32::try_from(frame.sample_rate).unwrap_or(0);
                let pcm: Vec<f32> = frame.data.iter().map(|&s| f32::from(s) / 32768.0).collect();
                samples.extend(to_mono(&pcm, frame.channels));
            }
            Err(minimp3::Error::Eof) => break,
            Err(minimp3::Error::SkippedData) => {}
            Err(e) => return Err(Error::Decode(format!("MP3 decode error: {e}"))),
        }
    }

    if samples.is_empty() || sample_rate == 0 {
        return Err(Error::Decode("no audio frames in clip".to_string()));
    }

    Ok(DecodedAudio {
        samples,
        sample_rate,
    })
}
