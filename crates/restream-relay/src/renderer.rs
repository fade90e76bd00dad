//! Overlay frame renderer.
//!
//! Paints the overlay collection onto an RGBA canvas at a fixed rate and
//! pipes encoded PNG frames into the egress process stdin. Encoding is
//! skipped while the collection is unchanged; the last encoded frame is
//! resent instead.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use restream_media::{clear_canvas, encode_frame, Canvas, OverlaySet, Pid, ProcessSupervisor};
use restream_models::VideoId;

pub struct OverlayRenderer {
    supervisor: Arc<dyn ProcessSupervisor>,
    pid: Pid,
    overlays: Arc<OverlaySet>,
    video_id: VideoId,
    width: u32,
    height: u32,
    fps: u32,
}

impl OverlayRenderer {
    pub fn new(
        supervisor: Arc<dyn ProcessSupervisor>,
        pid: Pid,
        overlays: Arc<OverlaySet>,
        video_id: VideoId,
        width: u32,
        height: u32,
        fps: u32,
    ) -> Self {
        Self {
            supervisor,
            pid,
            overlays,
            video_id,
            width,
            height,
            fps,
        }
    }

    /// Run the render loop on a dedicated task until the egress process
    /// exits.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let Some(mut stdin) = self.supervisor.stdin_writer(self.pid).await else {
            warn!(video_id = %self.video_id, "Egress stdin unavailable, renderer not started");
            return;
        };

        debug!(video_id = %self.video_id, fps = self.fps, "Overlay renderer started");
        let mut canvas: Canvas = Canvas::new(self.width, self.height);
        let tick = Duration::from_millis(1000 / u64::from(self.fps.max(1)));

        while self.supervisor.is_alive(self.pid).await {
            let started = Instant::now();

            let frame = match self.current_frame(&mut canvas) {
                Some(frame) => frame,
                None => {
                    // Encoding failure is transient; keep the cadence.
                    tokio::time::sleep(tick).await;
                    continue;
                }
            };

            // Write failures are transient while the process is alive;
            // only process exit stops the loop.
            if let Err(e) = stdin.write_all(&frame).await {
                warn!(video_id = %self.video_id, "Overlay frame write failed: {}", e);
            } else if let Err(e) = stdin.flush().await {
                warn!(video_id = %self.video_id, "Overlay frame flush failed: {}", e);
            }

            let elapsed = started.elapsed();
            if elapsed < tick {
                tokio::time::sleep(tick - elapsed).await;
            }
        }

        debug!(video_id = %self.video_id, "Overlay renderer stopped");
    }

    /// Current frame bytes, re-encoded only when the overlay collection has
    /// changed since the last tick.
    fn current_frame(&self, canvas: &mut Canvas) -> Option<Arc<Vec<u8>>> {
        let epoch = self.overlays.epoch();
        if let Some(cached) = self.overlays.cached_frame(epoch) {
            return Some(cached);
        }

        clear_canvas(canvas);
        self.overlays.paint_all(canvas);
        match encode_frame(canvas) {
            Ok(bytes) => {
                let frame = Arc::new(bytes);
                self.overlays.store_frame(epoch, Arc::clone(&frame));
                Some(frame)
            }
            Err(e) => {
                warn!(video_id = %self.video_id, "Frame encode failed: {}", e);
                None
            }
        }
    }
}
