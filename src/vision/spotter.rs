//! Card spotter
//!
//! Polls until the server verifies a hand, then reports it and stops. While a
//! hand is visible but not yet verified a filler clip is queued each round to
//! cover the wait.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use super::{Camera, FillerClips, Hand, Poller, RecognitionBackend, SpotResult, Step};
use crate::config::Settings;
use crate::voice::PlaybackQueue;
use crate::Result;

type SpottedCallback = Box<dyn Fn(Hand) + Send + Sync>;

/// Verify-then-finish poller
pub struct CardSpotter {
    backend: Arc<dyn RecognitionBackend>,
    camera: Arc<dyn Camera>,
    queue: PlaybackQueue,
    filler: FillerClips,
    settings: watch::Receiver<Settings>,
    on_spotted: SpottedCallback,
    last: SpotResult,
}

impl CardSpotter {
    /// Create a spotter; `on_spotted` receives the verified hand
    pub fn new(
        backend: Arc<dyn RecognitionBackend>,
        camera: Arc<dyn Camera>,
        queue: PlaybackQueue,
        filler: FillerClips,
        settings: watch::Receiver<Settings>,
        on_spotted: impl Fn(Hand) + Send + Sync + 'static,
    ) -> Self {
        Self {
            backend,
            camera,
            queue,
            filler,
            settings,
            on_spotted: Box::new(on_spotted),
            last: SpotResult::default(),
        }
    }

    fn settings(&self) -> Settings {
        self.settings.borrow().clone()
    }
}

#[async_trait]
impl Poller for CardSpotter {
    type Status = SpotResult;

    async fn step(&mut self) -> Result<Step> {
        let settings = self.settings();
        let wait = if self.last.has_hand() {
            settings.verify_interval()
        } else {
            settings.image_interval()
        };
        tokio::time::sleep(wait).await;

        let image = self.camera.capture_still(settings.camera_id()).await?;
        let result = self.backend.spot_cards(image).await?;
        self.last = result.clone();

        if result.hand_verified {
            let hand = result.hand.unwrap_or_default();
            tracing::info!(cards = hand.cards.len(), "hand verified");
            (self.on_spotted)(hand);
            return Ok(Step::Done);
        }

        if result.has_hand() {
            match self.filler.pick() {
                Some(clip) => self.queue.push(clip),
                None => tracing::debug!("hand unverified, no filler clips loaded"),
            }
        }

        Ok(Step::Continue)
    }

    fn status(&self) -> SpotResult {
        self.last.clone()
    }

    fn error_backoff(&self) -> Duration {
        self.settings.borrow().error_backoff()
    }
}
