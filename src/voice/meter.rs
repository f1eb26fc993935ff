//! Volume metering over a fixed-size frequency analysis
//!
//! Produces the 0-255 Volume Sample the segmenter and the live gauge consume.
//! The analysis follows the usual analyser-node recipe: a Blackman-windowed
//! FFT over the most recent samples, per-bin exponential smoothing, magnitudes
//! converted to decibels and mapped from `[MIN_DB, MAX_DB]` onto a byte.

use std::collections::VecDeque;
use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

/// Time-domain window length
pub const FFT_SIZE: usize = 256;

/// Number of frequency bins averaged into one volume sample
pub const BIN_COUNT: usize = FFT_SIZE / 2;

/// Decibel value mapped to 0
const MIN_DB: f32 = -100.0;

/// Decibel value mapped to 255
const MAX_DB: f32 = -30.0;

/// Rolling volume meter
pub struct VolumeMeter {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    recent: VecDeque<f32>,
    smoothed: Vec<f32>,
    smoothing: f32,
    scratch: Vec<Complex<f32>>,
}

impl VolumeMeter {
    /// Create a meter with the given smoothing time constant (clamped to 0..=1)
    #[must_use]
    pub fn new(smoothing: f32) -> Self {
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(FFT_SIZE);

        Self {
            fft,
            window: blackman(FFT_SIZE),
            recent: VecDeque::from(vec![0.0; FFT_SIZE]),
            smoothed: vec![0.0; BIN_COUNT],
            smoothing: smoothing.clamp(0.0, 1.0),
            scratch: vec![Complex::new(0.0, 0.0); FFT_SIZE],
        }
    }

    /// Feed captured mono samples; only the most recent `FFT_SIZE` are analysed
    pub fn push_samples(&mut self, samples: &[f32]) {
        let skip = samples.len().saturating_sub(FFT_SIZE);
        for &s in &samples[skip..] {
            if self.recent.len() == FFT_SIZE {
                self.recent.pop_front();
            }
            self.recent.push_back(s);
        }
    }

    /// Byte-scaled frequency data for the current window
    pub fn frequency_data(&mut self) -> [u8; BIN_COUNT] {
        for (slot, (&s, &w)) in self
            .scratch
            .iter_mut()
            .zip(self.recent.iter().zip(self.window.iter()))
        {
            *slot = Complex::new(s * w, 0.0);
        }
        self.fft.process(&mut self.scratch);

        #[allow(clippy::cast_precision_loss)]
        let scale = 1.0 / FFT_SIZE as f32;
        let mut out = [0u8; BIN_COUNT];
        for (i, byte) in out.iter_mut().enumerate() {
            let magnitude = self.scratch[i].norm() * scale;
            let smoothed =
                self.smoothing.mul_add(self.smoothed[i], (1.0 - self.smoothing) * magnitude);
            self.smoothed[i] = smoothed;
            *byte = to_byte(smoothed);
        }
        out
    }

    /// Volume sample: mean of the byte-scaled bins
    pub fn sample(&mut self) -> f32 {
        let data = self.frequency_data();
        let sum: u32 = data.iter().map(|&b| u32::from(b)).sum();
        #[allow(clippy::cast_precision_loss)]
        let mean = sum as f32 / BIN_COUNT as f32;
        mean
    }
}

impl std::fmt::Debug for VolumeMeter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeMeter")
            .field("smoothing", &self.smoothing)
            .finish_non_exhaustive()
    }
}

fn to_byte(magnitude: f32) -> u8 {
    if magnitude <= 0.0 || !magnitude.is_finite() {
        return 0;
    }
    let db = 20.0 * magnitude.log10();
    let scaled = (255.0 / (MAX_DB - MIN_DB)) * (db - MIN_DB);
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let byte = scaled.clamp(0.0, 255.0) as u8;
    byte
}

fn blackman(len: usize) -> Vec<f32> {
    const A0: f32 = 0.42;
    const A1: f32 = 0.5;
    const A2: f32 = 0.08;

    #[allow(clippy::cast_precision_loss)]
    let n = len as f32;
    (0..len)
        .map(|i| {
            #[allow(clippy::cast_precision_loss)]
            let x = i as f32 / n;
            let phase = std::f32::consts::TAU * x;
            A2.mul_add((2.0 * phase).cos(), A1.mul_add(-phase.cos(), A0))
        })
        .collect()
}
