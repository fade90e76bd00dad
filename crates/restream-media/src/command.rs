//! FFmpeg command-line builders.
//!
//! The relay core never assembles argv itself; everything a relay or proxy
//! task runs is built here.

use std::path::{Path, PathBuf};

use crate::error::{MediaError, MediaResult};

/// Frame rate of the overlay pipe fed into the egress process.
pub const OVERLAY_PIPE_FPS: u32 = 5;

/// What the egress process streams and how.
#[derive(Debug, Clone)]
pub struct EgressSpec {
    /// Stream the egress process reads from (usually a served proxy URL)
    pub input_url: String,
    /// Drop the audio track entirely
    pub audio_muted: bool,
    /// Composite an overlay image stream read from stdin
    pub overlay_pipe: bool,
}

impl EgressSpec {
    pub fn new(input_url: impl Into<String>) -> Self {
        Self {
            input_url: input_url.into(),
            audio_muted: false,
            overlay_pipe: false,
        }
    }

    pub fn with_audio_muted(mut self, muted: bool) -> Self {
        self.audio_muted = muted;
        self
    }

    pub fn with_overlay_pipe(mut self, overlay_pipe: bool) -> Self {
        self.overlay_pipe = overlay_pipe;
        self
    }
}

/// Build the egress command line relaying `spec` to `address`.
///
/// Without an overlay pipe the stream is copied through untouched. With one,
/// PNG frames read from stdin are composited over the video, which forces a
/// re-encode.
pub fn build_egress_cmdline(spec: &EgressSpec, address: &str) -> Vec<String> {
    let mut args = vec![
        "ffmpeg".to_string(),
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "warning".to_string(),
        "-i".to_string(),
        spec.input_url.clone(),
    ];

    if spec.overlay_pipe {
        args.extend(["-f", "image2pipe", "-framerate"].iter().map(|s| s.to_string()));
        args.push(OVERLAY_PIPE_FPS.to_string());
        args.extend(
            [
                "-i",
                "pipe:0",
                "-filter_complex",
                "[0:v][1:v]overlay=0:0:format=auto[out]",
                "-map",
                "[out]",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
        if !spec.audio_muted {
            args.push("-map".to_string());
            args.push("0:a?".to_string());
        }
        args.extend(
            ["-c:v", "libx264", "-preset", "veryfast", "-tune", "zerolatency"]
                .iter()
                .map(|s| s.to_string()),
        );
    } else {
        args.push("-c:v".to_string());
        args.push("copy".to_string());
    }

    if spec.audio_muted {
        args.push("-an".to_string());
    } else if !spec.overlay_pipe {
        args.push("-c:a".to_string());
        args.push("copy".to_string());
    } else {
        args.push("-c:a".to_string());
        args.push("aac".to_string());
    }

    args.push("-f".to_string());
    args.push("flv".to_string());
    args.push(address.to_string());
    args
}

/// Build the ingest command line re-serving `source_url` at `served_url`.
pub fn build_ingest_cmdline(source_url: &str, served_url: &str) -> Vec<String> {
    [
        "ffmpeg",
        "-hide_banner",
        "-loglevel",
        "warning",
        "-i",
        source_url,
        "-c",
        "copy",
        "-f",
        "flv",
        served_url,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Build the one-shot key-frame capture command line.
///
/// Log level stays at `info` so the stream banner (which carries the
/// `, N fps` token) lands in the diagnostic output.
pub fn build_key_frame_cmdline(input_url: &str, out_file: &Path) -> Vec<String> {
    [
        "ffmpeg",
        "-y",
        "-loglevel",
        "info",
        "-i",
        input_url,
        "-vframes",
        "1",
        &out_file.to_string_lossy(),
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Check that FFmpeg is available.
pub fn check_ffmpeg() -> MediaResult<PathBuf> {
    which::which("ffmpeg").map_err(|_| MediaError::FfmpegNotFound)
}
