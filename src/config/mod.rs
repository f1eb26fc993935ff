//! Configuration management for the Seer voice front end

pub mod file;

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default backend server URL
const DEFAULT_API_URL: &str = "http://localhost:8000";

/// Default `ElevenLabs` voice (Seer Morgana)
const DEFAULT_VOICE_ID: &str = "7NsaqHdLuKNFvEfjpUno";

/// Default `ElevenLabs` streaming model
const DEFAULT_TTS_MODEL: &str = "eleven_turbo_v2_5";

/// Conversation and recognition settings handed over by the UI layer
///
/// Serialized in camelCase so a settings object produced by a web front end
/// can be merged directly; missing fields keep their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Prompt sent alongside each utterance
    pub prompt: String,

    /// Sampling temperature for the reply
    pub temperature: f32,

    /// Maximum reply tokens
    pub max_tokens: u32,

    /// System message used when resetting the conversation
    pub system_message: String,

    /// Minimum peak volume (0-255) for an utterance to be uploaded
    pub send_volume_threshold: f32,

    /// Volume (0-255) below which a sample counts as silence
    pub silence_volume_threshold: f32,

    /// Analyser smoothing time constant (0..1)
    pub smoothing_time_constant: f32,

    /// Hard limit on a single utterance, in seconds
    pub max_recording_time: f32,

    /// Wait between image submissions while searching, in seconds
    pub image_send_interval: f32,

    /// Wait between image submissions while verifying, in seconds
    pub verify_image_send_interval: f32,

    /// Wait between task status checks, in seconds
    pub reading_status_check_interval: f32,

    /// Back-off after a failed poll, in seconds
    pub error_interval: f32,

    /// Selected camera identifier (`"default"` for the system default)
    pub webcam_id: String,

    /// Server-side VAD activation threshold (0..1)
    pub ort_threshold: f32,

    /// Server-side VAD prefix padding
    pub ort_prefix_padding_ms: u32,

    /// Server-side VAD silence duration
    pub ort_silence_duration_ms: u32,
}

/// Camera identifier meaning "use the system default camera"
pub const DEFAULT_WEBCAM_ID: &str = "default";

impl Default for Settings {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            temperature: 0.7,
            max_tokens: 100,
            system_message: String::new(),
            send_volume_threshold: 10.0,
            silence_volume_threshold: 5.0,
            smoothing_time_constant: 0.3,
            max_recording_time: 20.0,
            image_send_interval: 2.0,
            verify_image_send_interval: 1.0,
            reading_status_check_interval: 1.0,
            error_interval: 5.0,
            webcam_id: DEFAULT_WEBCAM_ID.to_string(),
            ort_threshold: 0.5,
            ort_prefix_padding_ms: 300,
            ort_silence_duration_ms: 500,
        }
    }
}

impl Settings {
    /// Merge a partial JSON settings object over the defaults
    ///
    /// # Errors
    ///
    /// Returns error if the JSON is malformed or a field has the wrong type
    pub fn from_json(json: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns error naming the first out-of-range field
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.smoothing_time_constant) {
            return Err(Error::Config(format!(
                "smoothingTimeConstant must be within 0..1, got {}",
                self.smoothing_time_constant
            )));
        }
        if self.max_recording_time <= 0.0 {
            return Err(Error::Config("maxRecordingTime must be positive".to_string()));
        }
        let intervals = [
            ("imageSendInterval", self.image_send_interval),
            ("verifyImageSendInterval", self.verify_image_send_interval),
            ("readingStatusCheckInterval", self.reading_status_check_interval),
            ("errorInterval", self.error_interval),
        ];
        for (name, value) in intervals {
            if !value.is_finite() || value < 0.0 {
                return Err(Error::Config(format!("{name} must be non-negative, got {value}")));
            }
        }
        Ok(())
    }

    /// Hard recording limit as a duration
    #[must_use]
    pub fn max_recording(&self) -> Duration {
        secs(self.max_recording_time)
    }

    /// Search-phase image interval
    #[must_use]
    pub fn image_interval(&self) -> Duration {
        secs(self.image_send_interval)
    }

    /// Verify-phase image interval
    #[must_use]
    pub fn verify_interval(&self) -> Duration {
        secs(self.verify_image_send_interval)
    }

    /// Task status check interval
    #[must_use]
    pub fn status_interval(&self) -> Duration {
        secs(self.reading_status_check_interval)
    }

    /// Error back-off interval
    #[must_use]
    pub fn error_backoff(&self) -> Duration {
        secs(self.error_interval)
    }

    /// Camera identifier, `None` when the default camera is selected
    #[must_use]
    pub fn camera_id(&self) -> Option<&str> {
        (self.webcam_id != DEFAULT_WEBCAM_ID && !self.webcam_id.is_empty())
            .then_some(self.webcam_id.as_str())
    }
}

fn secs(value: f32) -> Duration {
    Duration::try_from_secs_f32(value).unwrap_or(Duration::ZERO)
}

/// Streaming TTS configuration
#[derive(Debug, Clone)]
pub struct TtsConfig {
    /// `ElevenLabs` API key
    pub api_key: Option<String>,

    /// Voice identifier
    pub voice_id: String,

    /// Model identifier
    pub model_id: String,

    /// Voice stability (0..1)
    pub stability: f32,

    /// Voice similarity boost (0..1)
    pub similarity_boost: f32,

    /// WebSocket base URL (override for testing or proxies)
    pub base_url: String,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            voice_id: DEFAULT_VOICE_ID.to_string(),
            model_id: DEFAULT_TTS_MODEL.to_string(),
            stability: 0.5,
            similarity_boost: 0.8,
            base_url: "wss://api.elevenlabs.io".to_string(),
        }
    }
}

/// Seer runtime configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Conversation and recognition settings
    pub settings: Settings,

    /// Backend server base URL
    pub api_url: String,

    /// Streaming TTS configuration
    pub tts: TtsConfig,

    /// Command used to grab a still frame; `{device}` is replaced by the camera id
    pub camera_command: Vec<String>,

    /// Directory holding filler/exclamation clips
    pub filler_dir: Option<PathBuf>,

    /// Input device name (`None` = system default)
    pub input_device: Option<String>,
}

impl Config {
    /// Load configuration (env > toml > default)
    ///
    /// # Errors
    ///
    /// Returns error if a settings file is given but cannot be read or parsed,
    /// or if the resulting settings are out of range
    pub fn load() -> Result<Self> {
        let fc = file::load_config_file();

        let mut settings = fc.settings.unwrap_or_default();
        if let Ok(path) = std::env::var("SEER_SETTINGS_FILE") {
            let content = std::fs::read_to_string(&path)?;
            settings = Settings::from_json(&content)?;
            tracing::info!(path, "loaded settings override");
        }
        if let Ok(id) = std::env::var("SEER_WEBCAM_ID") {
            settings.webcam_id = id;
        }
        settings.validate()?;

        let api_url = std::env::var("SEER_API_URL")
            .ok()
            .or(fc.server.api_url)
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());
        check_url("api url", &api_url, &["http", "https"])?;

        let default_tts = TtsConfig::default();
        let tts = TtsConfig {
            api_key: std::env::var("ELEVENLABS_API_KEY").ok().or(fc.tts.api_key),
            voice_id: std::env::var("SEER_VOICE_ID")
                .ok()
                .or(fc.tts.voice_id)
                .unwrap_or(default_tts.voice_id),
            model_id: std::env::var("SEER_TTS_MODEL")
                .ok()
                .or(fc.tts.model_id)
                .unwrap_or(default_tts.model_id),
            stability: fc.tts.stability.unwrap_or(default_tts.stability),
            similarity_boost: fc
                .tts
                .similarity_boost
                .unwrap_or(default_tts.similarity_boost),
            base_url: std::env::var("SEER_TTS_URL")
                .ok()
                .or(fc.tts.base_url)
                .unwrap_or(default_tts.base_url),
        };
        check_url("tts url", &tts.base_url, &["ws", "wss"])?;

        let camera_command = std::env::var("SEER_CAMERA_COMMAND")
            .ok()
            .map(|s| s.split_whitespace().map(ToString::to_string).collect())
            .or(fc.camera.command)
            .unwrap_or_else(crate::vision::default_camera_command);

        let filler_dir = std::env::var("SEER_FILLER_DIR")
            .ok()
            .map(PathBuf::from)
            .or_else(|| fc.camera.filler_dir.map(PathBuf::from));

        let input_device = std::env::var("SEER_INPUT_DEVICE")
            .ok()
            .or(fc.audio.input_device);

        Ok(Self {
            settings,
            api_url,
            tts,
            camera_command,
            filler_dir,
            input_device,
        })
    }
}

/// Reject URLs that do not parse or use an unexpected scheme
fn check_url(name: &str, value: &str, schemes: &[&str]) -> Result<()> {
    let url = url::Url::parse(value).map_err(|e| Error::Config(format!("invalid {name} {value:?}: {e}")))?;
    if !schemes.contains(&url.scheme()) {
        return Err(Error::Config(format!(
            "{name} must use one of {schemes:?}, got {}",
            url.scheme()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_settings_merge_over_defaults() {
        let settings = Settings::from_json(r#"{"temperature": 0.2, "webcamId": "cam-1"}"#).unwrap();
        assert!((settings.temperature - 0.2).abs() < f32::EPSILON);
        assert_eq!(settings.webcam_id, "cam-1");
        assert_eq!(settings.max_tokens, 100);
        assert!((settings.silence_volume_threshold - 5.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_settings_reject_bad_smoothing() {
        let err = Settings::from_json(r#"{"smoothingTimeConstant": 1.5}"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_settings_durations() {
        let settings = Settings {
            image_send_interval: 2.0,
            verify_image_send_interval: 0.5,
            ..Settings::default()
        };
        assert_eq!(settings.image_interval(), Duration::from_secs(2));
        assert_eq!(settings.verify_interval(), Duration::from_millis(500));
        assert_eq!(settings.max_recording(), Duration::from_secs(20));
    }

    #[test]
    fn test_default_camera_id() {
        let mut settings = Settings::default();
        assert_eq!(settings.camera_id(), None);
        settings.webcam_id = "/dev/video2".to_string();
        assert_eq!(settings.camera_id(), Some("/dev/video2"));
    }

    #[test]
    fn test_url_checks() {
        assert!(check_url("api url", DEFAULT_API_URL, &["http", "https"]).is_ok());
        assert!(check_url("tts url", "wss://api.elevenlabs.io", &["ws", "wss"]).is_ok());
        assert!(matches!(
            check_url("api url", "ws://localhost", &["http", "https"]),
            Err(Error::Config(_))
        ));
        assert!(check_url("api url", "not a url", &["http"]).is_err());
    }
}
