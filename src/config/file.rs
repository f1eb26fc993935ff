//! TOML configuration file loading
//!
//! Supports `~/.config/seer/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::Settings;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct SeerConfigFile {
    /// Conversation and recognition settings
    #[serde(default)]
    pub settings: Option<Settings>,

    /// Backend server configuration
    #[serde(default)]
    pub server: ServerFileConfig,

    /// Streaming TTS configuration
    #[serde(default)]
    pub tts: TtsFileConfig,

    /// Camera and filler clip configuration
    #[serde(default)]
    pub camera: CameraFileConfig,

    /// Audio device configuration
    #[serde(default)]
    pub audio: AudioFileConfig,
}

/// Backend server configuration
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    /// Backend base URL
    pub api_url: Option<String>,
}

/// Streaming TTS configuration
#[derive(Debug, Default, Deserialize)]
pub struct TtsFileConfig {
    pub api_key: Option<String>,
    pub voice_id: Option<String>,
    pub model_id: Option<String>,
    pub stability: Option<f32>,
    pub similarity_boost: Option<f32>,
    pub base_url: Option<String>,
}

/// Camera configuration
#[derive(Debug, Default, Deserialize)]
pub struct CameraFileConfig {
    /// Frame grab command, `{device}` is replaced with the camera id
    pub command: Option<Vec<String>>,

    /// Directory of filler/exclamation clips
    pub filler_dir: Option<String>,
}

/// Audio device configuration
#[derive(Debug, Default, Deserialize)]
pub struct AudioFileConfig {
    /// Input device name
    pub input_device: Option<String>,
}

/// Overlay from the standard path
///
/// A missing file is the empty overlay; one that cannot be read or parsed is
/// logged and ignored.
pub fn load_config_file() -> SeerConfigFile {
    let Some(path) = config_file_path() else {
        return SeerConfigFile::default();
    };

    match read_config(&path) {
        Ok(Some(config)) => {
            tracing::info!(path = %path.display(), "loaded config file");
            config
        }
        Ok(None) => SeerConfigFile::default(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring config file");
            SeerConfigFile::default()
        }
    }
}

/// Read an overlay file; `None` when there is no file at `path`
///
/// # Errors
///
/// Returns error if the file exists but cannot be read or parsed
pub fn read_config(path: &Path) -> crate::Result<Option<SeerConfigFile>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    parse_config(&content).map(Some)
}

/// Parse config file contents
///
/// # Errors
///
/// Returns error if the TOML is malformed
pub fn parse_config(content: &str) -> crate::Result<SeerConfigFile> {
    Ok(toml::from_str(content)?)
}

/// Return the config file path: `~/.config/seer/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("seer").join("config.toml"))
}
