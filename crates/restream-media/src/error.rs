//! Error types for media operations.

use thiserror::Error;

/// Result type for media operations.
pub type MediaResult<T> = Result<T, MediaError>;

/// Errors that can occur during process supervision and frame handling.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("FFmpeg not found in PATH")]
    FfmpegNotFound,

    #[error("Failed to spawn process: {message}")]
    SpawnFailed { message: String },

    #[error("Invalid command line: {0}")]
    InvalidCommand(String),

    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    #[error("Overlay paint failed: {0}")]
    OverlayFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

impl MediaError {
    /// Create a spawn failure error.
    pub fn spawn_failed(message: impl Into<String>) -> Self {
        Self::SpawnFailed {
            message: message.into(),
        }
    }

    /// Create an overlay failure error.
    pub fn overlay_failed(message: impl Into<String>) -> Self {
        Self::OverlayFailed(message.into())
    }
}
