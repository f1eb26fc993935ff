//! Error types for the Seer voice front end

use thiserror::Error;

/// Result type alias for Seer operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the Seer voice front end
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Capture, playback or camera device cannot be acquired or failed mid-use
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Submission, status check or connection attempt failed or timed out
    #[error("network error: {0}")]
    Network(String),

    /// Unexpected or malformed server payload
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Audio, image or base64 payload could not be decoded
    #[error("decode error: {0}")]
    Decode(String),

    /// Socket client misuse (e.g. closing a socket that is not open)
    #[error("socket error: {0}")]
    Socket(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Base64 decoding error
    #[error("base64 error: {0}")]
    Base64(#[from] base64::DecodeError),
}

impl Error {
    /// Whether this error belongs to the network-failure class
    ///
    /// HTTP transport errors and explicit network errors both count.
    #[must_use]
    pub const fn is_network(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Http(_))
    }

    /// Whether this error means a device could not be used
    #[must_use]
    pub const fn is_device(&self) -> bool {
        matches!(self, Self::DeviceUnavailable(_))
    }
}
