//! Utterance segmentation policy
//!
//! Decides, one volume sample at a time, when an utterance is over: either a
//! quiet stretch outlasts the silence window or the hard recording limit is hit.

use std::time::Duration;

/// How long volume must stay below the threshold before the utterance closes
pub const SILENCE_WINDOW: Duration = Duration::from_millis(500);

/// Why a capture session stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Quiet for longer than the silence window
    Silence,
    /// Hard recording limit reached
    MaxDuration,
    /// Caller asked for the utterance to be finalized
    Requested,
}

/// Silence and hard-limit state machine
#[derive(Debug, Clone)]
pub struct Segmenter {
    silence_threshold: f32,
    max_recording: Duration,
    silence_since: Option<Duration>,
    peak: f32,
}

impl Segmenter {
    /// Create a segmenter
    #[must_use]
    pub const fn new(silence_threshold: f32, max_recording: Duration) -> Self {
        Self {
            silence_threshold,
            max_recording,
            silence_since: None,
            peak: 0.0,
        }
    }

    /// Record one volume sample taken `elapsed` after capture started
    ///
    /// Returns the stop reason once the utterance is over.
    pub fn observe(&mut self, volume: f32, elapsed: Duration) -> Option<StopReason> {
        self.peak = self.peak.max(volume);

        if elapsed >= self.max_recording {
            return Some(StopReason::MaxDuration);
        }

        if volume < self.silence_threshold {
            let since = *self.silence_since.get_or_insert(elapsed);
            if elapsed.saturating_sub(since) >= SILENCE_WINDOW {
                return Some(StopReason::Silence);
            }
        } else {
            self.silence_since = None;
        }

        None
    }

    /// Highest volume observed so far
    #[must_use]
    pub const fn peak(&self) -> f32 {
        self.peak
    }

    /// Whether a silence countdown is pending
    #[must_use]
    pub const fn is_counting_down(&self) -> bool {
        self.silence_since.is_some()
    }
}
