//! Relay tasks.
//!
//! A relay task owns one video's egress lifecycle: it acquires a destination
//! account, keeps an egress process running against the account's publish
//! address, manages the shadow low-resolution source for region overlay
//! modes, and attaches the overlay renderer when compositing is needed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use image::DynamicImage;
use tracing::{debug, info, warn};

use restream_media::{build_egress_cmdline, EgressSpec, ImageSegmentOverlay, Pid, ProcessSupervisor};
use restream_models::OverlayPlacement;

use crate::config::RelayConfig;
use crate::error::{RelayError, RelayResult};
use crate::logging::TaskLogger;
use crate::platform::{DestinationService, SettingsStore, SourceResolver};
use crate::proxy::SourceProxyTask;
use crate::registry::TaskRegistry;
use crate::renderer::OverlayRenderer;
use crate::resources::{Account, Video};

/// Paint index reserved for image-segment overlays so they composite above
/// manually placed covers and blurs.
const IMAGE_SEGMENT_INDEX: i32 = 10;

/// Shared collaborators every relay task runs against.
pub struct RelayContext {
    pub registry: Arc<TaskRegistry>,
    pub settings: Arc<dyn SettingsStore>,
    pub resolver: Arc<dyn SourceResolver>,
    pub destinations: Vec<Arc<dyn DestinationService>>,
    pub supervisor: Arc<dyn ProcessSupervisor>,
    pub config: RelayConfig,
}

impl RelayContext {
    /// First destination service claiming `platform`.
    pub fn destination_for(&self, platform: &str) -> RelayResult<Arc<dyn DestinationService>> {
        self.destinations
            .iter()
            .find(|d| d.is_match(platform))
            .cloned()
            .ok_or_else(|| RelayError::NoDestinationService(platform.to_string()))
    }
}

/// One video's egress lifecycle.
pub struct RelayTask {
    ctx: Arc<RelayContext>,
    video: Arc<Video>,
    account: Mutex<Option<Arc<Account>>>,
    egress_pid: Mutex<Option<Pid>>,
    terminate: AtomicBool,
    single_task: bool,
    logger: TaskLogger,
}

impl std::fmt::Debug for RelayTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayTask")
            .field("video_id", &self.video.id())
            .field("single_task", &self.single_task)
            .finish_non_exhaustive()
    }
}

impl RelayTask {
    /// Relay that selects accounts from the channel pool and fails over.
    pub fn auto(ctx: Arc<RelayContext>, video: Arc<Video>) -> Arc<Self> {
        Self::build(ctx, video, None, false)
    }

    /// Relay pinned to one operator-chosen account. The caller must already
    /// hold the account's lease for this video.
    pub fn manual(ctx: Arc<RelayContext>, video: Arc<Video>, account: Arc<Account>) -> Arc<Self> {
        Self::build(ctx, video, Some(account), true)
    }

    fn build(
        ctx: Arc<RelayContext>,
        video: Arc<Video>,
        account: Option<Arc<Account>>,
        single_task: bool,
    ) -> Arc<Self> {
        let logger = TaskLogger::new(video.id(), "relay");
        Arc::new(Self {
            ctx,
            video,
            account: Mutex::new(account),
            egress_pid: Mutex::new(None),
            terminate: AtomicBool::new(false),
            single_task,
            logger,
        })
    }

    pub fn video(&self) -> &Arc<Video> {
        &self.video
    }

    pub fn is_single_task(&self) -> bool {
        self.single_task
    }

    pub fn current_account(&self) -> Option<Arc<Account>> {
        self.account.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_account(&self, account: Option<Arc<Account>>) {
        *self.account.lock().unwrap_or_else(|e| e.into_inner()) = account;
    }

    fn current_pid(&self) -> Option<Pid> {
        *self.egress_pid.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_pid(&self, pid: Option<Pid>) {
        *self.egress_pid.lock().unwrap_or_else(|e| e.into_inner()) = pid;
    }

    fn should_run(&self) -> bool {
        !self.terminate.load(Ordering::SeqCst) && self.ctx.registry.contains(self.video.id())
    }

    /// Main relay loop. Runs until the source proxy disappears or the task
    /// is terminated, retrying through account selection and egress restarts.
    pub async fn run(self: Arc<Self>) {
        self.logger.log_start(&format!("relaying '{}'", self.video.title()));

        if !self.single_task {
            self.reenable_default_account();
        }

        while self.should_run() {
            if let Err(e) = self.cycle().await {
                self.logger.log_error(&format!("Relay cycle failed: {e}"));
            }
            if self.should_run() {
                tokio::time::sleep(self.ctx.config.loop_backoff).await;
            }
        }

        if !self.video.clear_relay(&self) {
            self.logger
                .log_warning("Relay binding was not held at loop exit");
        }
        self.logger.log_completion("relay task finished");
    }

    /// One account tenure: select (or reuse) an account, stream until the
    /// lease is lost or the task stops, then tear down.
    async fn cycle(&self) -> RelayResult<()> {
        let account = match self.current_account() {
            Some(account) => account,
            None if self.single_task => {
                // The pinned account was released; nothing left to do.
                self.terminate.store(true, Ordering::SeqCst);
                return Ok(());
            }
            None => match select_account(self.ctx.settings.as_ref(), &self.video) {
                Some(account) => {
                    self.set_account(Some(Arc::clone(&account)));
                    account
                }
                None => {
                    debug!(video_id = %self.video.id(), "No destination account available");
                    tokio::time::sleep(self.ctx.config.account_retry_backoff).await;
                    return Ok(());
                }
            },
        };

        if !self.single_task {
            self.post_announcement_once(&account).await;
        }

        while account.is_leased_to(&self.video)
            && !account.is_disabled()
            && self.should_run()
        {
            if let Err(e) = self.stream_once(&account).await {
                self.logger
                    .log_error(&format!("Egress attempt on {} failed: {e}", account.id()));
            }
            if self.should_run() {
                tokio::time::sleep(self.ctx.config.loop_backoff).await;
            }
        }

        self.teardown_shadow().await;

        self.set_account(None);
        if account.release(&self.video) {
            info!(video_id = %self.video.id(), account_id = %account.id(), "Account lease released");
        } else {
            debug!(video_id = %self.video.id(), account_id = %account.id(), "Lease already released elsewhere");
        }

        if account.is_disabled() && self.single_task {
            self.logger
                .log_warning(&format!("Pinned account {} disabled, stopping", account.id()));
            self.terminate.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Run one egress process to completion.
    async fn stream_once(&self, account: &Arc<Account>) -> RelayResult<()> {
        let destination = self.ctx.destination_for(account.platform())?;
        let address = destination.egress_address(account).await?;

        if account.auto_title() {
            if let Err(e) = destination.set_broadcast_setting(account, self.video.title()).await {
                self.logger
                    .log_warning(&format!("Title push to {} failed: {e}", account.id()));
            }
        }

        let mode = self.video.overlay_mode();
        let egress_video = if mode.needs_shadow() {
            self.ensure_shadow_proxy().await?
        } else {
            self.teardown_shadow().await;
            Arc::clone(&self.video)
        };

        let input_url = match self.ctx.registry.get(egress_video.id()) {
            Some(proxy) => proxy.served_url().to_string(),
            None => egress_video.playback_url().to_string(),
        };

        let spec = EgressSpec::new(input_url)
            .with_audio_muted(egress_video.audio_muted())
            .with_overlay_pipe(mode.needs_renderer());
        let cmdline = build_egress_cmdline(&spec, &address);

        let pid = self
            .ctx
            .supervisor
            .spawn(&cmdline, &format!("egress:{}", self.video.id()))
            .await?;
        self.set_pid(Some(pid));
        self.logger
            .log_progress(&format!("Egress started toward {} via {}", account.id(), address));
        metrics::counter!("relay_egress_started_total").increment(1);

        if mode.needs_renderer() {
            // Let the encoder settle before frames start arriving on stdin.
            tokio::time::sleep(self.ctx.config.encoder_warmup).await;
            if self.ctx.supervisor.is_alive(pid).await {
                OverlayRenderer::new(
                    Arc::clone(&self.ctx.supervisor),
                    pid,
                    self.video.overlays(),
                    self.video.id().clone(),
                    self.ctx.config.canvas_width,
                    self.ctx.config.canvas_height,
                    self.ctx.config.renderer_fps,
                )
                .spawn();
            }
        }

        loop {
            if account.current_video().is_none() {
                debug!(video_id = %self.video.id(), "Lease gone, stopping egress");
                break;
            }
            if self.ctx.supervisor.wait(pid, self.ctx.config.liveness_poll).await {
                debug!(video_id = %self.video.id(), "Egress process exited");
                break;
            }
        }

        self.ctx.supervisor.kill(pid).await;
        self.set_pid(None);
        if mode.needs_shadow() {
            self.ctx.resolver.release_server(egress_video.id()).await;
        }
        Ok(())
    }

    /// Resolve and start the low-resolution shadow source this relay egresses
    /// from in region overlay modes. Idempotent across restarts.
    async fn ensure_shadow_proxy(&self) -> RelayResult<Arc<Video>> {
        let shadow_id = self.video.id().shadow();
        if let Some(existing) = self.ctx.registry.get(&shadow_id) {
            return Ok(Arc::clone(existing.video()));
        }

        let descriptor = self
            .ctx
            .resolver
            .resolve(self.video.source_url(), Some(&self.ctx.config.shadow_quality))
            .await?
            .into_shadow_of(self.video.id());
        // The shadow paints from the parent's overlay collection.
        let shadow = Video::with_overlays(descriptor, self.video.overlays());
        shadow.set_audio_muted(self.video.audio_muted());

        let proxy = SourceProxyTask::new(
            Arc::clone(&shadow),
            Arc::clone(&self.ctx.supervisor),
            Arc::clone(&self.ctx.registry),
            self.ctx.config.clone(),
        );
        match proxy.start() {
            Ok(()) => {
                info!(video_id = %self.video.id(), shadow_id = %shadow_id, "Shadow proxy started");
                Ok(shadow)
            }
            // Another relay attempt won the registration race.
            Err(RelayError::ProxyAlreadyRegistered(_)) => {
                match self.ctx.registry.get(&shadow_id) {
                    Some(existing) => Ok(Arc::clone(existing.video())),
                    None => Err(RelayError::resolve_failed("shadow proxy vanished mid-start")),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Stop and await the shadow proxy if one is running.
    async fn teardown_shadow(&self) {
        let shadow_id = self.video.id().shadow();
        if let Some(proxy) = self.ctx.registry.get(&shadow_id) {
            info!(video_id = %self.video.id(), shadow_id = %shadow_id, "Stopping shadow proxy");
            proxy.terminate().await;
            proxy.wait_terminated().await;
            self.ctx.resolver.release_server(&shadow_id).await;
        }
    }

    async fn post_announcement_once(&self, account: &Arc<Account>) {
        if self.video.announcement_posted() {
            return;
        }
        let Ok(destination) = self.ctx.destination_for(account.platform()) else {
            return;
        };
        match destination.post_announcement(account).await {
            Ok(()) => self.video.mark_announcement_posted(),
            Err(e) => {
                self.logger
                    .log_warning(&format!("Announcement post failed: {e}"));
            }
        }
    }

    /// On first acquisition of a channel's pool, the configured default
    /// account comes back into rotation even if a previous run disabled it.
    fn reenable_default_account(&self) {
        let Some(channel) = self.video.channel() else {
            return;
        };
        let Some(default_id) = channel.default_account_id.as_ref() else {
            return;
        };
        if let Some(account) = self.ctx.settings.find_account(default_id) {
            account.set_disabled(false);
        }
    }

    /// Stop this relay immediately and schedule the deferred best-effort
    /// destination stop. Safe to call while the run loop is mid-cycle.
    pub async fn force_terminate(self: Arc<Self>) {
        self.logger.log_progress("Force terminate requested");

        if let Some(account) = self.current_account() {
            self.schedule_stop_broadcast(account.clone());
            self.set_account(None);
            if account.release(&self.video) {
                info!(video_id = %self.video.id(), account_id = %account.id(), "Lease released on terminate");
            } else {
                self.logger
                    .log_warning(&format!("Lease on {} was not held at terminate", account.id()));
            }
        }

        self.terminate.store(true, Ordering::SeqCst);
        if !self.video.clear_relay(&self) {
            debug!(video_id = %self.video.id(), "Relay binding already cleared");
        }
        if let Some(pid) = self.current_pid() {
            self.ctx.supervisor.kill(pid).await;
        }
    }

    /// Ask the destination to stop the broadcast after a grace period, but
    /// only if the account is still idle then. A new relay picking up the
    /// account within the window cancels the stop.
    fn schedule_stop_broadcast(&self, account: Arc<Account>) {
        let ctx = Arc::clone(&self.ctx);
        let delay = self.ctx.config.stop_broadcast_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if account.current_video().is_some() {
                return;
            }
            let Ok(destination) = ctx.destination_for(account.platform()) else {
                return;
            };
            if let Err(e) = destination.stop_broadcast(&account, true).await {
                warn!(account_id = %account.id(), "Deferred stop-broadcast failed: {}", e);
            }
        });
    }

    /// Ingest an external image-segmentation result as the top overlay.
    ///
    /// The segment image is produced against the source resolution; it is
    /// rescaled so its height matches the egress canvas.
    pub fn accept_image_segment(&self, image: DynamicImage, source_width: u32, source_height: u32) {
        if source_width == 0 || source_height == 0 {
            warn!(video_id = %self.video.id(), "Ignoring degenerate image segment");
            return;
        }
        let height = self.ctx.config.canvas_height;
        let width = (u64::from(source_width) * u64::from(height) / u64::from(source_height)) as u32;
        let placement = OverlayPlacement::new(IMAGE_SEGMENT_INDEX, 0, 0, width, height);

        let overlays = self.video.overlays();
        overlays.remove_image_segments();
        overlays.add(Arc::new(ImageSegmentOverlay::new(placement, image)));
    }
}

/// Pick a destination account for `video`: the channel's default account if
/// it is free, then any enabled member of the auto-balance pool.
pub fn select_account(settings: &dyn SettingsStore, video: &Arc<Video>) -> Option<Arc<Account>> {
    let channel = video.channel()?;

    if let Some(default_id) = channel.default_account_id.as_ref() {
        if let Some(account) = settings.find_account(default_id) {
            if !account.is_disabled() && account.try_acquire(video) {
                info!(video_id = %video.id(), account_id = %account.id(), "Acquired default account");
                return Some(account);
            }
        }
    }

    if channel.auto_balance {
        for account in settings.accounts() {
            if account.join_auto_balance() && !account.is_disabled() && account.try_acquire(video) {
                info!(video_id = %video.id(), account_id = %account.id(), "Acquired auto-balance account");
                return Some(account);
            }
        }
    }

    debug!(video_id = %video.id(), "All candidate accounts busy or disabled");
    None
}
