//! Key-frame extraction.
//!
//! A one-shot FFmpeg run dumps a single still from a served stream; the
//! frame rate is recovered from the `, N fps` token in the stream banner.

use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use image::DynamicImage;
use regex::Regex;
use tracing::debug;

use crate::command::build_key_frame_cmdline;
use crate::error::{MediaError, MediaResult};
use crate::supervisor::ProcessSupervisor;

/// A single decoded still frame sampled from a live stream.
///
/// Immutable once produced; refreshes replace the whole value.
#[derive(Debug, Clone)]
pub struct KeyFrame {
    /// Frame rate parsed from capture diagnostics, if present
    pub fps: Option<u32>,
    pub width: u32,
    pub height: u32,
    pub image: DynamicImage,
}

impl KeyFrame {
    pub fn new(fps: Option<u32>, image: DynamicImage) -> Self {
        Self {
            fps,
            width: image.width(),
            height: image.height(),
            image,
        }
    }
}

fn fps_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r", (\d+) fps").expect("fps pattern is valid"))
}

/// Parse the frame rate from FFmpeg diagnostic output.
pub fn parse_fps(log: &str) -> Option<u32> {
    fps_pattern()
        .captures(log)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Capture one key frame from `input_url`.
///
/// The capture process is hard-capped at `timeout`; on expiry it is killed
/// and `MediaError::Timeout` is returned. The scratch image file is removed
/// on every exit path.
pub async fn extract_key_frame(
    supervisor: &dyn ProcessSupervisor,
    input_url: &str,
    tag: &str,
    timeout: Duration,
) -> MediaResult<KeyFrame> {
    // Deleted on drop, which covers every exit path below.
    let scratch = tempfile::Builder::new()
        .prefix("restream-kf-")
        .suffix(".png")
        .tempfile()?;
    capture(supervisor, input_url, tag, scratch.path(), timeout).await
}

async fn capture(
    supervisor: &dyn ProcessSupervisor,
    input_url: &str,
    tag: &str,
    out_file: &Path,
    timeout: Duration,
) -> MediaResult<KeyFrame> {
    let cmdline = build_key_frame_cmdline(input_url, out_file);
    let pid = supervisor.spawn(&cmdline, tag).await?;

    if !supervisor.wait(pid, timeout).await {
        supervisor.kill(pid).await;
        return Err(MediaError::Timeout(timeout.as_secs()));
    }

    let log = supervisor.log_output(pid).await;
    supervisor.kill(pid).await;

    let fps = parse_fps(&log);
    debug!(tag = tag, fps = ?fps, "Key frame captured");

    let image = image::open(out_file)?;
    Ok(KeyFrame::new(fps, image))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fps() {
        let log = "Stream #0:0: Video: h264 (High), yuv420p, 1920x1080, 30 fps, 30 tbr";
        assert_eq!(parse_fps(log), Some(30));
    }

    #[test]
    fn test_parse_fps_missing() {
        assert_eq!(parse_fps("Stream #0:1: Audio: aac, 44100 Hz"), None);
    }

    #[test]
    fn test_parse_fps_first_match_wins() {
        let log = ", 25 fps, something, 60 fps";
        assert_eq!(parse_fps(log), Some(25));
    }

    #[test]
    fn test_key_frame_dimensions() {
        let image = DynamicImage::new_rgba8(640, 360);
        let frame = KeyFrame::new(Some(30), image);
        assert_eq!(frame.width, 640);
        assert_eq!(frame.height, 360);
        assert_eq!(frame.fps, Some(30));
    }
}
