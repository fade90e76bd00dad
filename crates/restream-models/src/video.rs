//! Resolved video descriptors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::account::ChannelConfig;
use crate::ids::VideoId;
use crate::overlay::OverlayMode;

/// A source video resolved to a playable stream.
///
/// Produced by the source resolver; the relay crate wraps this in a runtime
/// `Video` entity that carries the mutable binding state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoDescriptor {
    /// Video identity
    pub video_id: VideoId,
    /// Display title, pushed to the destination room when auto-title is set
    pub title: String,
    /// Original source identifier
    pub source_url: Url,
    /// Resolved playable stream URL
    pub playback_url: Url,
    /// Owning channel; `None` for manually relayed or shadow videos
    #[serde(default)]
    pub channel: Option<ChannelConfig>,
    /// Initial censorship mode
    #[serde(default)]
    pub overlay_mode: OverlayMode,
    /// Whether the audio track is dropped on egress
    #[serde(default)]
    pub audio_muted: bool,
    /// When the source was resolved
    #[serde(default = "Utc::now")]
    pub resolved_at: DateTime<Utc>,
}

impl VideoDescriptor {
    pub fn new(video_id: impl Into<VideoId>, title: impl Into<String>, source_url: Url, playback_url: Url) -> Self {
        Self {
            video_id: video_id.into(),
            title: title.into(),
            source_url,
            playback_url,
            channel: None,
            overlay_mode: OverlayMode::None,
            audio_muted: false,
            resolved_at: Utc::now(),
        }
    }

    /// Attach a channel association.
    pub fn with_channel(mut self, channel: ChannelConfig) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Re-key this descriptor as the shadow of `parent`.
    pub fn into_shadow_of(mut self, parent: &VideoId) -> Self {
        self.video_id = parent.shadow();
        self.channel = None;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> VideoDescriptor {
        VideoDescriptor::new(
            "v1",
            "Some Stream",
            Url::parse("https://live.example.com/v1").unwrap(),
            Url::parse("https://cdn.example.com/v1.m3u8").unwrap(),
        )
    }

    #[test]
    fn test_shadow_descriptor_drops_channel() {
        let desc = descriptor().with_channel(ChannelConfig {
            channel_name: "ch".into(),
            default_account_id: None,
            auto_balance: true,
        });
        let shadow = desc.into_shadow_of(&VideoId::from("v1"));
        assert_eq!(shadow.video_id.as_str(), "v1_low");
        assert!(shadow.channel.is_none());
    }
}
