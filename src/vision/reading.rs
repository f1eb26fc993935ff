//! Reading recognizer
//!
//! Searches for a hand with camera stills, follows the reading task through
//! generation and synthesis, plays the synthesized reading, then starts over.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::sync::watch;

use super::{Camera, Poller, RecognitionBackend, Stage, StageReport, Step};
use crate::config::Settings;
use crate::voice::{AudioClip, PlaybackQueue};
use crate::{Error, Result};

/// Stage plus the task being followed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadingState {
    pub stage: Stage,
    pub task_id: Option<String>,
}

/// Reading stage machine
pub struct ReadingPoller {
    backend: Arc<dyn RecognitionBackend>,
    camera: Arc<dyn Camera>,
    queue: PlaybackQueue,
    settings: watch::Receiver<Settings>,
    state: ReadingState,
}

impl ReadingPoller {
    /// Create a poller at `no_target`
    pub fn new(
        backend: Arc<dyn RecognitionBackend>,
        camera: Arc<dyn Camera>,
        queue: PlaybackQueue,
        settings: watch::Receiver<Settings>,
    ) -> Self {
        Self {
            backend,
            camera,
            queue,
            settings,
            state: ReadingState::default(),
        }
    }

    fn settings(&self) -> Settings {
        self.settings.borrow().clone()
    }

    fn adopt(&mut self, report: &StageReport) {
        if report.stage != self.state.stage {
            tracing::info!(from = %self.state.stage, to = %report.stage, "reading stage changed");
        }
        self.state.stage = report.stage;
        if report.stage == Stage::VerifyingTarget {
            self.state.task_id.clone_from(&report.task_id);
        }
    }

    async fn submit_image(&mut self, settings: &Settings) -> Result<()> {
        let wait = if self.state.stage == Stage::VerifyingTarget {
            settings.verify_interval()
        } else {
            settings.image_interval()
        };
        tokio::time::sleep(wait).await;

        let image = self.camera.capture_still(settings.camera_id()).await?;
        let report = self
            .backend
            .upload_image(image, self.state.task_id.as_deref())
            .await?;
        self.adopt(&report);

        if report.stage == Stage::TtsComplete {
            self.complete(report.audio.as_deref(), settings.image_interval())
                .await?;
        }
        Ok(())
    }

    async fn check_status(&mut self, settings: &Settings) -> Result<()> {
        tokio::time::sleep(settings.status_interval()).await;

        let task_id = self
            .state
            .task_id
            .clone()
            .ok_or_else(|| Error::Protocol("no task id to check".to_string()))?;
        let report = self.backend.task_status(&task_id).await?;
        self.adopt(&report);

        if report.stage == Stage::TtsComplete {
            self.complete(report.audio.as_deref(), settings.image_interval())
                .await?;
        }
        Ok(())
    }

    /// Play the reading if present, wait one search interval, start over
    async fn complete(&mut self, audio: Option<&str>, linger: Duration) -> Result<()> {
        if let Some(audio) = audio.filter(|a| !a.is_empty()) {
            let bytes = BASE64
                .decode(audio)
                .map_err(|e| Error::Decode(format!("reading audio: {e}")))?;
            tracing::info!(bytes = bytes.len(), "reading ready");
            self.queue.push(AudioClip::from(bytes));
        } else {
            tracing::warn!("reading complete without audio");
        }

        tokio::time::sleep(linger).await;
        self.state = ReadingState::default();
        Ok(())
    }
}

#[async_trait]
impl Poller for ReadingPoller {
    type Status = ReadingState;

    async fn step(&mut self) -> Result<Step> {
        let settings = self.settings();
        tracing::debug!(stage = %self.state.stage, task_id = ?self.state.task_id, "reading step");

        match self.state.stage {
            Stage::NoTarget | Stage::VerifyingTarget => self.submit_image(&settings).await?,
            Stage::ReadingRequested | Stage::TtsRequested => self.check_status(&settings).await?,
            Stage::TtsComplete => self.complete(None, settings.image_interval()).await?,
            Stage::Error => {
                tokio::time::sleep(settings.error_backoff()).await;
                self.state.stage = Stage::NoTarget;
            }
        }

        Ok(Step::Continue)
    }

    fn status(&self) -> ReadingState {
        self.state.clone()
    }

    fn on_start(&mut self) {
        self.state = ReadingState::default();
    }

    fn on_error(&mut self, _error: &Error) {
        self.state.stage = Stage::Error;
    }

    fn error_backoff(&self) -> Duration {
        self.settings.borrow().error_backoff()
    }

    fn recover(&mut self) {
        // the failed task is abandoned; the next still starts a new one
        self.state = ReadingState::default();
    }
}
