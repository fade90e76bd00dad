//! Source proxy tasks.
//!
//! A proxy task owns one ingest pipeline that re-serves a source stream
//! under an internal URL, restarting the ingest process until terminated.
//! It also answers throttled key-frame requests against the served URL.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{error, warn};

use restream_media::{build_ingest_cmdline, extract_key_frame, KeyFrame, MediaError, Pid, ProcessSupervisor};
use restream_models::VideoId;

use crate::config::RelayConfig;
use crate::error::{RelayError, RelayResult};
use crate::logging::TaskLogger;
use crate::registry::TaskRegistry;
use crate::resources::Video;

struct KeyFrameCache {
    frame: Option<Arc<KeyFrame>>,
    refreshed_at: Option<Instant>,
}

/// Ingest pipeline re-serving one source stream.
pub struct SourceProxyTask {
    video: Arc<Video>,
    served_url: String,
    supervisor: Arc<dyn ProcessSupervisor>,
    registry: Arc<TaskRegistry>,
    config: RelayConfig,
    logger: TaskLogger,
    terminate: AtomicBool,
    terminated: AtomicBool,
    ingest_pid: Mutex<Option<Pid>>,
    key_frame: tokio::sync::Mutex<KeyFrameCache>,
}

impl SourceProxyTask {
    pub fn new(
        video: Arc<Video>,
        supervisor: Arc<dyn ProcessSupervisor>,
        registry: Arc<TaskRegistry>,
        config: RelayConfig,
    ) -> Arc<Self> {
        let served_url = config.served_url(video.id());
        let logger = TaskLogger::new(video.id(), "source_proxy");
        Arc::new(Self {
            video,
            served_url,
            supervisor,
            registry,
            config,
            logger,
            terminate: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            ingest_pid: Mutex::new(None),
            key_frame: tokio::sync::Mutex::new(KeyFrameCache {
                frame: None,
                refreshed_at: None,
            }),
        })
    }

    pub fn video(&self) -> &Arc<Video> {
        &self.video
    }

    pub fn video_id(&self) -> &VideoId {
        self.video.id()
    }

    /// URL this proxy re-serves the source under.
    pub fn served_url(&self) -> &str {
        &self.served_url
    }

    /// Register with the active-task registry and begin continuous capture
    /// on a dedicated task.
    pub fn start(self: Arc<Self>) -> RelayResult<()> {
        if !self.registry.register(Arc::clone(&self)) {
            return Err(RelayError::ProxyAlreadyRegistered(self.video.id().clone()));
        }
        tokio::spawn(self.run());
        Ok(())
    }

    async fn run(self: Arc<Self>) {
        self.registry.fire_start(&self);
        self.logger.log_start(&format!("serving {}", self.served_url));

        while !self.terminate.load(Ordering::SeqCst) {
            if let Err(e) = self.ingest_once().await {
                error!(video_id = %self.video.id(), "Ingest cycle failed: {}", e);
            }
            if !self.terminate.load(Ordering::SeqCst) {
                tokio::time::sleep(self.config.ingest_restart_backoff).await;
            }
        }

        // Cleanup runs regardless of how the loop exited.
        if let Some(pid) = self.take_pid() {
            self.supervisor.kill(pid).await;
        }
        self.terminated.store(true, Ordering::SeqCst);
        self.registry.unregister(self.video.id());
        self.registry.fire_stop(&self);
        self.logger.log_completion("proxy task terminated");
    }

    async fn ingest_once(&self) -> RelayResult<()> {
        let cmdline = build_ingest_cmdline(self.video.playback_url().as_str(), &self.served_url);
        let pid = self
            .supervisor
            .spawn(&cmdline, &format!("ingest:{}", self.video.id()))
            .await?;
        self.set_pid(Some(pid));

        // Block until the ingest process exits or terminate is requested.
        while !self.terminate.load(Ordering::SeqCst) {
            if self.supervisor.wait(pid, self.config.liveness_poll).await {
                break;
            }
        }

        self.supervisor.kill(pid).await;
        self.set_pid(None);
        Ok(())
    }

    /// Request cooperative shutdown. The current ingest process is killed so
    /// the run loop observes the flag promptly.
    pub async fn terminate(&self) {
        self.terminate.store(true, Ordering::SeqCst);
        if let Some(pid) = self.current_pid() {
            self.supervisor.kill(pid).await;
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Wait until the run loop has fully finished (unregistered, stop event
    /// fired).
    pub async fn wait_terminated(&self) {
        while !self.is_terminated() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Last captured key frame.
    ///
    /// Returns the cached frame unchanged while it is younger than the cache
    /// TTL; otherwise runs one capped extraction subprocess. A timed-out
    /// extraction falls back to the previous cached value; any other failure
    /// yields `None`.
    pub async fn key_frame(&self) -> Option<Arc<KeyFrame>> {
        let mut cache = self.key_frame.lock().await;

        if let (Some(frame), Some(at)) = (&cache.frame, cache.refreshed_at) {
            if at.elapsed() < self.config.key_frame_cache_ttl {
                return Some(Arc::clone(frame));
            }
        }

        let tag = format!("keyframe:{}", self.video.id());
        match extract_key_frame(
            self.supervisor.as_ref(),
            &self.served_url,
            &tag,
            self.config.key_frame_timeout,
        )
        .await
        {
            Ok(frame) => {
                let frame = Arc::new(frame);
                cache.frame = Some(Arc::clone(&frame));
                cache.refreshed_at = Some(Instant::now());
                Some(frame)
            }
            Err(MediaError::Timeout(secs)) => {
                error!(video_id = %self.video.id(), "Key frame extraction timed out after {}s", secs);
                cache.frame.clone()
            }
            Err(e) => {
                warn!(video_id = %self.video.id(), "Key frame unavailable: {}", e);
                None
            }
        }
    }

    fn set_pid(&self, pid: Option<Pid>) {
        *self.ingest_pid.lock().unwrap_or_else(|e| e.into_inner()) = pid;
    }

    fn current_pid(&self) -> Option<Pid> {
        *self.ingest_pid.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_pid(&self) -> Option<Pid> {
        self.ingest_pid
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use restream_models::VideoDescriptor;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::AsyncWrite;
    use url::Url;

    /// Scripted supervisor: completes key-frame captures instantly by
    /// writing the requested still, or simulates a hung process.
    struct FakeSupervisor {
        spawned: AtomicUsize,
        hang: AtomicBool,
    }

    impl FakeSupervisor {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                spawned: AtomicUsize::new(0),
                hang: AtomicBool::new(false),
            })
        }

        fn spawn_count(&self) -> usize {
            self.spawned.load(Ordering::SeqCst)
        }

        fn set_hang(&self, hang: bool) {
            self.hang.store(hang, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ProcessSupervisor for FakeSupervisor {
        async fn spawn(&self, cmdline: &[String], _tag: &str) -> restream_media::MediaResult<Pid> {
            let n = self.spawned.fetch_add(1, Ordering::SeqCst);
            if !self.hang.load(Ordering::SeqCst) {
                // Key-frame command lines end with the output still path.
                if let Some(out) = cmdline.last() {
                    let canvas = image::RgbaImage::new(4, 4);
                    let _ = canvas.save(out);
                }
            }
            Ok(Pid(n as u64 + 1))
        }

        async fn wait(&self, _pid: Pid, timeout: Duration) -> bool {
            if self.hang.load(Ordering::SeqCst) {
                tokio::time::sleep(timeout).await;
                false
            } else {
                true
            }
        }

        async fn kill(&self, _pid: Pid) {}

        async fn is_alive(&self, _pid: Pid) -> bool {
            false
        }

        async fn stdin_writer(&self, _pid: Pid) -> Option<Box<dyn AsyncWrite + Send + Unpin>> {
            None
        }

        async fn log_output(&self, _pid: Pid) -> String {
            "Stream #0:0: Video: h264, yuv420p, 1280x720, 30 fps, 30 tbr".to_string()
        }
    }

    fn proxy_with(supervisor: Arc<FakeSupervisor>, cache_ttl: Duration) -> Arc<SourceProxyTask> {
        let video = Video::new(VideoDescriptor::new(
            "v1",
            "video",
            Url::parse("https://live.example.com/v1").unwrap(),
            Url::parse("https://cdn.example.com/v1.m3u8").unwrap(),
        ));
        let config = RelayConfig {
            key_frame_cache_ttl: cache_ttl,
            key_frame_timeout: Duration::from_millis(50),
            ..RelayConfig::default()
        };
        SourceProxyTask::new(video, supervisor, TaskRegistry::new(), config)
    }

    #[tokio::test]
    async fn test_key_frame_cached_within_ttl() {
        let supervisor = FakeSupervisor::new();
        let proxy = proxy_with(Arc::clone(&supervisor), Duration::from_secs(5));

        let first = proxy.key_frame().await.expect("first capture");
        let second = proxy.key_frame().await.expect("cached capture");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(supervisor.spawn_count(), 1);
        assert_eq!(first.fps, Some(30));
    }

    #[tokio::test]
    async fn test_key_frame_refreshed_after_ttl() {
        let supervisor = FakeSupervisor::new();
        let proxy = proxy_with(Arc::clone(&supervisor), Duration::from_millis(30));

        let first = proxy.key_frame().await.expect("first capture");
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = proxy.key_frame().await.expect("fresh capture");

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(supervisor.spawn_count(), 2);
    }

    #[tokio::test]
    async fn test_key_frame_timeout_returns_previous() {
        let supervisor = FakeSupervisor::new();
        let proxy = proxy_with(Arc::clone(&supervisor), Duration::from_millis(10));

        let first = proxy.key_frame().await.expect("first capture");

        tokio::time::sleep(Duration::from_millis(20)).await;
        supervisor.set_hang(true);
        let second = proxy.key_frame().await.expect("previous cached value");

        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_key_frame_timeout_without_cache_is_none() {
        let supervisor = FakeSupervisor::new();
        supervisor.set_hang(true);
        let proxy = proxy_with(Arc::clone(&supervisor), Duration::from_secs(5));

        assert!(proxy.key_frame().await.is_none());
    }
}
