//! Voice I/O
//!
//! Microphone capture with silence segmentation, clip decoding, device
//! playback and the ordered playback queue.

mod capture;
mod meter;
mod playback;
mod queue;
mod segmenter;

pub use capture::{
    AudioInput, CaptureConfig, CaptureHandle, CpalInput, InputStream, SAMPLE_PERIOD, SAMPLE_RATE,
    Utterance, samples_to_wav, start_capture, to_mono,
};
pub use meter::{BIN_COUNT, FFT_SIZE, VolumeMeter};
pub use playback::{AudioClip, AudioSink, ClipFormat, DecodedAudio, DevicePlayback, resample};
pub use queue::{PlaybackQueue, PlaybackQueueBuilder};
pub use segmenter::{SILENCE_WINDOW, Segmenter, StopReason};
