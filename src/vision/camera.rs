//! Still-image capture

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::{Error, Result};

/// Placeholder replaced by the camera identifier in a capture command
pub const DEVICE_PLACEHOLDER: &str = "{device}";

/// Device used when no camera is selected
pub const DEFAULT_DEVICE: &str = "/dev/video0";

/// Grabs single JPEG frames from a camera
#[async_trait]
pub trait Camera: Send + Sync {
    /// Capture one JPEG still; `None` selects the default camera
    ///
    /// # Errors
    ///
    /// Returns `Error::DeviceUnavailable` if the camera cannot be opened or
    /// produced no image
    async fn capture_still(&self, camera_id: Option<&str>) -> Result<Vec<u8>>;
}

/// Frame grab command used when none is configured
#[must_use]
pub fn default_camera_command() -> Vec<String> {
    [
        "ffmpeg",
        "-loglevel",
        "error",
        "-f",
        "v4l2",
        "-i",
        DEVICE_PLACEHOLDER,
        "-frames:v",
        "1",
        "-f",
        "image2pipe",
        "-vcodec",
        "mjpeg",
        "-",
    ]
    .iter()
    .map(ToString::to_string)
    .collect()
}

/// Camera driven by an external command that writes a JPEG to stdout
///
/// The camera is opened for the single frame and released when the command
/// exits, so nothing is held between captures.
#[derive(Debug, Clone)]
pub struct CommandCamera {
    command: Vec<String>,
}

impl CommandCamera {
    /// Create from a command line (program followed by arguments)
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the command is empty
    pub fn new(command: Vec<String>) -> Result<Self> {
        if command.is_empty() {
            return Err(Error::Config("camera command is empty".to_string()));
        }
        Ok(Self { command })
    }

    /// Command line for a given camera
    #[must_use]
    pub fn command_for(&self, camera_id: Option<&str>) -> Vec<String> {
        let device = camera_id.unwrap_or(DEFAULT_DEVICE);
        self.command
            .iter()
            .map(|arg| arg.replace(DEVICE_PLACEHOLDER, device))
            .collect()
    }
}

#[async_trait]
impl Camera for CommandCamera {
    async fn capture_still(&self, camera_id: Option<&str>) -> Result<Vec<u8>> {
        let argv = self.command_for(camera_id);
        let Some((program, args)) = argv.split_first() else {
            return Err(Error::Config("camera command is empty".to_string()));
        };

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::DeviceUnavailable(format!("failed to run {program}: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::DeviceUnavailable(format!(
                "{program} exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        if output.stdout.is_empty() {
            return Err(Error::DeviceUnavailable(
                "camera produced no image".to_string(),
            ));
        }

        tracing::debug!(bytes = output.stdout.len(), camera = ?camera_id, "captured still");
        Ok(output.stdout)
    }
}
