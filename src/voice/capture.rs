//! Microphone capture sessions
//!
//! A session buffers raw audio from an [`AudioInput`], samples the volume every
//! 100 ms, and closes the utterance on silence or at the hard limit. The input
//! device is released exactly once when the session task ends, whichever way
//! it ends.

use std::sync::mpsc as std_mpsc;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::meter::VolumeMeter;
use super::segmenter::{Segmenter, StopReason};
use crate::config::Settings;
use crate::{Error, Result};

/// Volume sampling cadence
pub const SAMPLE_PERIOD: Duration = Duration::from_millis(100);

/// Preferred capture rate for speech
pub const SAMPLE_RATE: u32 = 16000;

/// An open input stream: mono chunks plus whatever keeps the device alive
pub struct InputStream {
    sample_rate: u32,
    chunks: mpsc::UnboundedReceiver<Vec<f32>>,
    _guard: Box<dyn Send>,
}

impl InputStream {
    /// Wrap a chunk receiver; dropping the stream drops `guard`
    pub fn new(
        sample_rate: u32,
        chunks: mpsc::UnboundedReceiver<Vec<f32>>,
        guard: impl Send + 'static,
    ) -> Self {
        Self {
            sample_rate,
            chunks,
            _guard: Box::new(guard),
        }
    }

    /// Sample rate of the delivered chunks
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// A capture device
pub trait AudioInput: Send + Sync {
    /// Acquire the device and start streaming
    ///
    /// # Errors
    ///
    /// Returns `Error::DeviceUnavailable` if the device cannot be acquired
    fn open(&self) -> Result<InputStream>;
}

/// Capture session parameters
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Volume below which a sample counts as silence
    pub silence_volume_threshold: f32,
    /// Hard limit on the utterance length
    pub max_recording: Duration,
    /// Analyser smoothing constant
    pub smoothing: f32,
}

impl From<&Settings> for CaptureConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            silence_volume_threshold: settings.silence_volume_threshold,
            max_recording: settings.max_recording(),
            smoothing: settings.smoothing_time_constant,
        }
    }
}

/// A finished utterance
#[derive(Debug, Clone)]
pub struct Utterance {
    /// WAV-encoded mono audio
    pub audio: Vec<u8>,
    /// Highest volume sample seen while recording
    pub peak_volume: f32,
    /// What closed the utterance
    pub reason: StopReason,
}

impl Utterance {
    /// Whether the utterance peaked above the send threshold
    #[must_use]
    pub fn is_loud_enough(&self, send_volume_threshold: f32) -> bool {
        self.peak_volume > send_volume_threshold
    }
}

enum Control {
    Finish,
    Cancel,
}

/// Handle to a running capture session
///
/// Dropping the handle cancels the session without delivering an utterance.
pub struct CaptureHandle {
    volume: watch::Receiver<f32>,
    control: Option<oneshot::Sender<Control>>,
    task: JoinHandle<()>,
}

impl CaptureHandle {
    /// Live volume observable, updated every sample period
    #[must_use]
    pub fn volume(&self) -> watch::Receiver<f32> {
        self.volume.clone()
    }

    /// Whether the session is still recording
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }

    /// Close the utterance now and deliver what was recorded
    pub fn finish(&mut self) {
        if let Some(tx) = self.control.take() {
            let _ = tx.send(Control::Finish);
        }
    }

    /// Stop without delivering an utterance
    pub fn cancel(&mut self) {
        if let Some(tx) = self.control.take() {
            let _ = tx.send(Control::Cancel);
        }
    }

    /// Wait until the session has ended and released the device
    pub async fn finished(self) {
        let Self { task, control, .. } = self;
        let _ = task.await;
        drop(control);
    }
}

/// Start a capture session
///
/// `on_utterance` is called at most once, when silence or the hard limit
/// closes the utterance (or on [`CaptureHandle::finish`]).
///
/// # Errors
///
/// Returns `Error::DeviceUnavailable` if the input cannot be opened
pub fn start_capture<F>(
    input: &dyn AudioInput,
    config: CaptureConfig,
    on_utterance: F,
) -> Result<CaptureHandle>
where
    F: FnOnce(Utterance) + Send + 'static,
{
    let stream = input.open()?;
    let (volume_tx, volume_rx) = watch::channel(0.0_f32);
    let (control_tx, control_rx) = oneshot::channel();

    tracing::debug!(
        sample_rate = stream.sample_rate(),
        threshold = config.silence_volume_threshold,
        max_ms = u64::try_from(config.max_recording.as_millis()).unwrap_or(u64::MAX),
        "capture started"
    );

    let task = tokio::spawn(run_session(stream, config, volume_tx, control_rx, on_utterance));

    Ok(CaptureHandle {
        volume: volume_rx,
        control: Some(control_tx),
        task,
    })
}

async fn run_session<F>(
    mut stream: InputStream,
    config: CaptureConfig,
    volume_tx: watch::Sender<f32>,
    mut control: oneshot::Receiver<Control>,
    on_utterance: F,
) where
    F: FnOnce(Utterance) + Send + 'static,
{
    let started = Instant::now();
    let mut ticker = tokio::time::interval_at(started + SAMPLE_PERIOD, SAMPLE_PERIOD);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut meter = VolumeMeter::new(config.smoothing);
    let mut segmenter = Segmenter::new(config.silence_volume_threshold, config.max_recording);
    let mut recorded: Vec<f32> = Vec::new();

    let reason = loop {
        tokio::select! {
            msg = &mut control => match msg {
                Ok(Control::Finish) => break Some(StopReason::Requested),
                Ok(Control::Cancel) | Err(_) => break None,
            },
            _ = ticker.tick() => {}
        }

        while let Ok(chunk) = stream.chunks.try_recv() {
            meter.push_samples(&chunk);
            recorded.extend_from_slice(&chunk);
        }

        let volume = meter.sample();
        volume_tx.send_replace(volume);

        if let Some(reason) = segmenter.observe(volume, started.elapsed()) {
            break Some(reason);
        }
    };

    // pick up anything that arrived after the last tick
    while let Ok(chunk) = stream.chunks.try_recv() {
        recorded.extend_from_slice(&chunk);
    }
    let sample_rate = stream.sample_rate();
    drop(stream);
    tracing::debug!(?reason, samples = recorded.len(), "capture stopped");

    let Some(reason) = reason else {
        return;
    };

    match samples_to_wav(&recorded, sample_rate) {
        Ok(audio) => on_utterance(Utterance {
            audio,
            peak_volume: segmenter.peak(),
            reason,
        }),
        Err(e) => tracing::error!(error = %e, "failed to encode utterance"),
    }
}

// -- cpal device --

/// Microphone input through cpal
///
/// cpal streams are not `Send`, so each opened stream lives on its own thread
/// until the returned [`InputStream`] is dropped.
#[derive(Debug, Clone, Default)]
pub struct CpalInput {
    device_name: Option<String>,
}

impl CpalInput {
    /// Use the named input device, or the system default
    #[must_use]
    pub const fn new(device_name: Option<String>) -> Self {
        Self { device_name }
    }
}

impl AudioInput for CpalInput {
    fn open(&self) -> Result<InputStream> {
        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<u32>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let device_name = self.device_name.clone();

        std::thread::Builder::new()
            .name("seer-capture".to_string())
            .spawn(move || {
                let stream = match open_cpal_stream(device_name.as_deref(), chunk_tx) {
                    Ok((stream, rate)) => {
                        let _ = ready_tx.send(Ok(rate));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // blocks until the InputStream (and with it stop_tx) is dropped
                let _ = stop_rx.recv();
                drop(stream);
                tracing::debug!("capture device released");
            })?;

        let sample_rate = ready_rx
            .recv()
            .map_err(|_| Error::DeviceUnavailable("capture thread exited".to_string()))??;

        Ok(InputStream::new(sample_rate, chunk_rx, stop_tx))
    }
}

fn open_cpal_stream(
    device_name: Option<&str>,
    chunk_tx: mpsc::UnboundedSender<Vec<f32>>,
) -> Result<(cpal::Stream, u32)> {
    let host = cpal::default_host();

    let device = match device_name {
        Some(name) => host
            .input_devices()
            .map_err(|e| Error::DeviceUnavailable(e.to_string()))?
            .find(|d| d.name().is_ok_and(|n| n == name))
            .ok_or_else(|| Error::DeviceUnavailable(format!("input device not found: {name}")))?,
        None => host
            .default_input_device()
            .ok_or_else(|| Error::DeviceUnavailable("no input device available".to_string()))?,
    };

    let supported = device
        .default_input_config()
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;
    let format = supported.sample_format();
    let config: cpal::StreamConfig = supported.config();
    let channels = usize::from(config.channels);
    let sample_rate = config.sample_rate.0;

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate,
        channels,
        ?format,
        "audio capture initialized"
    );

    let on_error = |err: cpal::StreamError| {
        tracing::error!(error = %err, "audio capture error");
    };

    let stream = match format {
        cpal::SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let _ = chunk_tx.send(to_mono(data, channels));
            },
            on_error,
            None,
        ),
        cpal::SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                let samples: Vec<f32> = data.iter().map(|&s| f32::from(s) / 32768.0).collect();
                let _ = chunk_tx.send(to_mono(&samples, channels));
            },
            on_error,
            None,
        ),
        other => {
            return Err(Error::DeviceUnavailable(format!(
                "unsupported input sample format: {other:?}"
            )));
        }
    }
    .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;

    stream
        .play()
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;

    Ok((stream, sample_rate))
}

/// Average interleaved frames down to one channel
#[must_use]
pub fn to_mono(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    #[allow(clippy::cast_precision_loss)]
    let n = channels as f32;
    data.chunks(channels).map(|frame| frame.iter().sum::<f32>() / n).collect()
}

/// Encode mono f32 samples as 16-bit PCM WAV
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Decode(e.to_string()))?;

        for &sample in samples {
            #[allow(clippy::cast_possible_truncation)]
            let pcm = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer
                .write_sample(pcm)
                .map_err(|e| Error::Decode(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Decode(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}
