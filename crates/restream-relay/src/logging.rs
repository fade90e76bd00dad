//! Structured task logging utilities.

use tracing::{error, info, warn};

use restream_models::VideoId;

/// Logger for long-running task lifecycle events with consistent fields.
#[derive(Debug, Clone)]
pub struct TaskLogger {
    video_id: String,
    operation: String,
}

impl TaskLogger {
    /// Create a logger for one task.
    ///
    /// `operation` names the task kind (e.g. "relay", "source_proxy").
    pub fn new(video_id: &VideoId, operation: &str) -> Self {
        Self {
            video_id: video_id.to_string(),
            operation: operation.to_string(),
        }
    }

    pub fn log_start(&self, message: &str) {
        info!(
            video_id = %self.video_id,
            operation = %self.operation,
            "Task started: {}", message
        );
    }

    pub fn log_progress(&self, message: &str) {
        info!(
            video_id = %self.video_id,
            operation = %self.operation,
            "{}", message
        );
    }

    pub fn log_warning(&self, message: &str) {
        warn!(
            video_id = %self.video_id,
            operation = %self.operation,
            "{}", message
        );
    }

    pub fn log_error(&self, message: &str) {
        error!(
            video_id = %self.video_id,
            operation = %self.operation,
            "{}", message
        );
    }

    pub fn log_completion(&self, message: &str) {
        info!(
            video_id = %self.video_id,
            operation = %self.operation,
            "Task finished: {}", message
        );
    }
}
