//! Relay configuration.

use std::time::Duration;

/// Relay orchestration configuration.
///
/// All timing knobs live here so tests can shrink them.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Base URL proxy tasks re-serve sources under
    pub serve_base_url: String,
    /// Quality hint used when resolving shadow low-resolution sources
    pub shadow_quality: String,
    /// Backoff when no destination account is available
    pub account_retry_backoff: Duration,
    /// Backoff between relay loop iterations (bounds restart storms)
    pub loop_backoff: Duration,
    /// Egress process liveness poll resolution
    pub liveness_poll: Duration,
    /// Restart backoff for a failed ingest process
    pub ingest_restart_backoff: Duration,
    /// Wait before attaching the overlay renderer to a fresh egress process
    pub encoder_warmup: Duration,
    /// Delay before the deferred best-effort stop-broadcast call
    pub stop_broadcast_delay: Duration,
    /// How long a cached key frame stays fresh
    pub key_frame_cache_ttl: Duration,
    /// Wall-clock cap on one key-frame extraction subprocess
    pub key_frame_timeout: Duration,
    /// Overlay renderer target frame rate
    pub renderer_fps: u32,
    /// Overlay canvas size (egress input resolution)
    pub canvas_width: u32,
    pub canvas_height: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            serve_base_url: "http://127.0.0.1:18550/live".to_string(),
            shadow_quality: "720".to_string(),
            account_retry_backoff: Duration::from_secs(5),
            loop_backoff: Duration::from_secs(1),
            liveness_poll: Duration::from_secs(1),
            ingest_restart_backoff: Duration::from_secs(1),
            encoder_warmup: Duration::from_secs(2),
            stop_broadcast_delay: Duration::from_secs(120),
            key_frame_cache_ttl: Duration::from_secs(5),
            key_frame_timeout: Duration::from_secs(10),
            renderer_fps: 5,
            canvas_width: 1280,
            canvas_height: 720,
        }
    }
}

fn env_secs(name: &str, default: u64) -> Duration {
    Duration::from_secs(
        std::env::var(name)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(default),
    )
}

impl RelayConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            serve_base_url: std::env::var("RELAY_SERVE_BASE_URL").unwrap_or(defaults.serve_base_url),
            shadow_quality: std::env::var("RELAY_SHADOW_QUALITY").unwrap_or(defaults.shadow_quality),
            account_retry_backoff: env_secs("RELAY_ACCOUNT_RETRY_SECS", 5),
            loop_backoff: env_secs("RELAY_LOOP_BACKOFF_SECS", 1),
            liveness_poll: env_secs("RELAY_LIVENESS_POLL_SECS", 1),
            ingest_restart_backoff: env_secs("RELAY_INGEST_RESTART_SECS", 1),
            encoder_warmup: env_secs("RELAY_ENCODER_WARMUP_SECS", 2),
            stop_broadcast_delay: env_secs("RELAY_STOP_BROADCAST_DELAY_SECS", 120),
            key_frame_cache_ttl: env_secs("RELAY_KEY_FRAME_CACHE_SECS", 5),
            key_frame_timeout: env_secs("RELAY_KEY_FRAME_TIMEOUT_SECS", 10),
            renderer_fps: std::env::var("RELAY_RENDERER_FPS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.renderer_fps),
            canvas_width: std::env::var("RELAY_CANVAS_WIDTH")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.canvas_width),
            canvas_height: std::env::var("RELAY_CANVAS_HEIGHT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.canvas_height),
        }
    }

    /// Served URL a proxy task re-serves `video_id` under.
    pub fn served_url(&self, video_id: &restream_models::VideoId) -> String {
        format!("{}/{}.flv", self.serve_base_url.trim_end_matches('/'), video_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use restream_models::VideoId;

    #[test]
    fn test_served_url_strips_trailing_slash() {
        let config = RelayConfig {
            serve_base_url: "http://127.0.0.1:18550/live/".to_string(),
            ..RelayConfig::default()
        };
        assert_eq!(
            config.served_url(&VideoId::from("v1")),
            "http://127.0.0.1:18550/live/v1.flv"
        );
    }
}
