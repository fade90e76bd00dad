//! FFmpeg process supervision and frame compositing.
//!
//! This crate provides:
//! - A process supervisor over `tokio::process` (spawn/wait/kill by pid)
//! - Command-line builders for ingest, egress, and key-frame capture
//! - Key-frame extraction with fps parsing from FFmpeg diagnostics
//! - Overlay painting on an RGBA canvas and lossless PNG frame encoding

pub mod command;
pub mod error;
pub mod keyframe;
pub mod overlay;
pub mod supervisor;

pub use command::{build_egress_cmdline, build_ingest_cmdline, build_key_frame_cmdline, check_ffmpeg, EgressSpec};
pub use error::{MediaError, MediaResult};
pub use keyframe::{extract_key_frame, KeyFrame};
pub use overlay::{clear_canvas, encode_frame, Canvas, CoverOverlay, ImageSegmentOverlay, Overlay, OverlaySet, RegionBlurOverlay};
pub use supervisor::{FfmpegSupervisor, Pid, ProcessSupervisor};
