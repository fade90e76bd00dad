//! Shared data models for the restream relay backend.
//!
//! This crate provides Serde-serializable types for:
//! - Video and account identifiers
//! - Destination account and channel configuration
//! - Overlay placement and censorship modes
//! - Resolved video descriptors

pub mod account;
pub mod ids;
pub mod overlay;
pub mod video;

// Re-export common types
pub use account::{AccountConfig, ChannelConfig};
pub use ids::{AccountId, VideoId};
pub use overlay::{OverlayMode, OverlayPlacement};
pub use video::VideoDescriptor;
