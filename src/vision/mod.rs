//! Visual recognition polling
//!
//! A camera still is submitted to the recognition backend on a timer while
//! watch mode is on. [`ReadingPoller`] walks the full reading stage machine;
//! [`CardSpotter`] only waits for a verified hand. Both run inside the same
//! single-flight [`Watcher`] loop.

mod camera;
mod filler;
mod reading;
mod spotter;
mod watcher;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use camera::{Camera, CommandCamera, DEFAULT_DEVICE, DEVICE_PLACEHOLDER, default_camera_command};
pub use filler::FillerClips;
pub use reading::{ReadingPoller, ReadingState};
pub use spotter::CardSpotter;
pub use watcher::{Poller, Step, Watcher};

use crate::Result;

/// Recognition task stage
///
/// Serialized with the names the recognition server uses; the descriptive
/// names are accepted as aliases.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    /// Nothing recognized yet
    #[default]
    #[serde(rename = "no_cards", alias = "no_target")]
    NoTarget,
    /// Target seen, waiting for a stable confirmation
    #[serde(rename = "verifying_cards", alias = "verifying_target")]
    VerifyingTarget,
    /// Reading being generated
    #[serde(rename = "requesting_reading", alias = "reading_requested")]
    ReadingRequested,
    /// Reading being synthesized
    #[serde(rename = "reading_tts_requested", alias = "tts_requested")]
    TtsRequested,
    /// Synthesized reading available
    #[serde(rename = "reading_tts_complete", alias = "tts_complete")]
    TtsComplete,
    #[serde(rename = "error")]
    Error,
}

impl Stage {
    /// Stages that submit camera stills
    #[must_use]
    pub const fn is_searching(self) -> bool {
        matches!(self, Self::NoTarget | Self::VerifyingTarget)
    }

    /// Stages that poll task status
    #[must_use]
    pub const fn is_waiting_on_task(self) -> bool {
        matches!(self, Self::ReadingRequested | Self::TtsRequested)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::NoTarget => "no_cards",
            Self::VerifyingTarget => "verifying_cards",
            Self::ReadingRequested => "requesting_reading",
            Self::TtsRequested => "reading_tts_requested",
            Self::TtsComplete => "reading_tts_complete",
            Self::Error => "error",
        })
    }
}

/// Stage reported by the backend for an image submission or status check
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageReport {
    pub stage: Stage,
    /// Task identifier, issued once verification begins
    pub task_id: Option<String>,
    /// Base64-encoded synthesized reading
    pub audio: Option<String>,
}

/// A detected hand of cards
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Hand {
    #[serde(default)]
    pub cards: Vec<serde_json::Value>,
}

/// Card spotting result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpotResult {
    #[serde(default)]
    pub hand: Option<Hand>,
    #[serde(default)]
    pub hand_verified: bool,
}

impl SpotResult {
    /// Whether a non-empty hand was detected
    #[must_use]
    pub fn has_hand(&self) -> bool {
        self.hand.as_ref().is_some_and(|h| !h.cards.is_empty())
    }
}

/// The recognition server as seen by the pollers
#[async_trait]
pub trait RecognitionBackend: Send + Sync {
    /// Submit a still, along with the current task identifier if any
    async fn upload_image(&self, image: Vec<u8>, task_id: Option<&str>) -> Result<StageReport>;

    /// Check the stage of a task
    async fn task_status(&self, task_id: &str) -> Result<StageReport>;

    /// Submit a still for card spotting
    async fn spot_cards(&self, image: Vec<u8>) -> Result<SpotResult>;
}
