//! Relay error types.

use thiserror::Error;

use restream_media::MediaError;
use restream_models::{AccountId, VideoId};

pub type RelayResult<T> = Result<T, RelayError>;

#[derive(Debug, Error)]
pub enum RelayError {
    /// The account lease is held by another video. Synchronous,
    /// user-visible failure naming the conflicting owner.
    #[error("Account {account_id} is already relaying [{owner}]")]
    AccountBusy { account_id: AccountId, owner: String },

    #[error("Video {0} already has a relay task")]
    RelayAlreadyBound(VideoId),

    #[error("A proxy task for {0} is already registered")]
    ProxyAlreadyRegistered(VideoId),

    #[error("No destination service matches platform '{0}'")]
    NoDestinationService(String),

    #[error("Source resolution failed: {0}")]
    ResolveFailed(String),

    #[error("Destination platform call failed: {0}")]
    PlatformFailed(String),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    pub fn resolve_failed(msg: impl Into<String>) -> Self {
        Self::ResolveFailed(msg.into())
    }

    pub fn platform_failed(msg: impl Into<String>) -> Self {
        Self::PlatformFailed(msg.into())
    }
}
