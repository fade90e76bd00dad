//! Relay lifecycle management.
//!
//! Binds relay tasks to source proxy lifecycles: a proxy start event spawns
//! an auto relay for channel videos, a stop event force-terminates whatever
//! relay is bound. Manual relays are created through an explicit call with
//! an operator-chosen account.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{RelayError, RelayResult};
use crate::proxy::SourceProxyTask;
use crate::registry::{ProxyEvent, ProxyEventListener};
use crate::relay::{RelayContext, RelayTask};
use crate::resources::{Account, Video};

pub struct RelayManager {
    ctx: Arc<RelayContext>,
}

impl RelayManager {
    pub fn new(ctx: Arc<RelayContext>) -> Arc<Self> {
        Arc::new(Self { ctx })
    }

    pub fn context(&self) -> &Arc<RelayContext> {
        &self.ctx
    }

    /// Attach to the registry's proxy lifecycle events.
    pub fn subscribe(&self) {
        let listener = RelayEventListener {
            ctx: Arc::clone(&self.ctx),
        };
        self.ctx.registry.add_listener(Arc::new(listener));
    }

    /// Start a proxy task (and through the event bus, a relay) for `video`.
    pub fn start_proxy(&self, video: Arc<Video>) -> RelayResult<Arc<SourceProxyTask>> {
        let proxy = SourceProxyTask::new(
            video,
            Arc::clone(&self.ctx.supervisor),
            Arc::clone(&self.ctx.registry),
            self.ctx.config.clone(),
        );
        Arc::clone(&proxy).start()?;
        Ok(proxy)
    }

    /// Create a relay pinned to `account`.
    ///
    /// Fails synchronously if the account is already relaying another video
    /// or the video already has a relay, leaving no partial state behind.
    pub fn create_manual_relay(
        &self,
        video: Arc<Video>,
        account: Arc<Account>,
    ) -> RelayResult<Arc<RelayTask>> {
        if !account.try_acquire(&video) {
            let owner = account
                .current_video()
                .map(|v| v.title().to_string())
                .unwrap_or_else(|| "unknown".to_string());
            return Err(RelayError::AccountBusy {
                account_id: account.id().clone(),
                owner,
            });
        }

        match self.bind_and_start(Arc::clone(&video), Arc::clone(&account)) {
            Ok(task) => Ok(task),
            Err(e) => {
                if !account.release(&video) {
                    warn!(account_id = %account.id(), "Lease moved during failed manual relay setup");
                }
                Err(e)
            }
        }
    }

    fn bind_and_start(&self, video: Arc<Video>, account: Arc<Account>) -> RelayResult<Arc<RelayTask>> {
        let task = RelayTask::manual(Arc::clone(&self.ctx), Arc::clone(&video), account);
        if !video.try_set_relay(&task) {
            return Err(RelayError::RelayAlreadyBound(video.id().clone()));
        }

        // A manual relay may target a source with no proxy running yet.
        if !self.ctx.registry.contains(video.id()) {
            let proxy = SourceProxyTask::new(
                Arc::clone(&video),
                Arc::clone(&self.ctx.supervisor),
                Arc::clone(&self.ctx.registry),
                self.ctx.config.clone(),
            );
            if let Err(e) = proxy.start() {
                if !video.clear_relay(&task) {
                    warn!(video_id = %video.id(), "Relay binding moved during failed proxy start");
                }
                return Err(e);
            }
        }

        info!(video_id = %video.id(), "Manual relay started");
        tokio::spawn(Arc::clone(&task).run());
        Ok(task)
    }
}

/// Registry listener turning proxy lifecycle into relay lifecycle.
struct RelayEventListener {
    ctx: Arc<RelayContext>,
}

impl ProxyEventListener for RelayEventListener {
    fn on_proxy_start(&self, event: &ProxyEvent) {
        let video = Arc::clone(event.task.video());

        // Shadow proxies belong to a parent relay; manual videos have no
        // channel and get their relay through create_manual_relay.
        if video.id().is_shadow() || video.channel().is_none() {
            return;
        }

        let task = RelayTask::auto(Arc::clone(&self.ctx), Arc::clone(&video));
        if !video.try_set_relay(&task) {
            // A binding surviving the previous proxy lifecycle is stale.
            warn!(video_id = %video.id(), "Unexpected relay binding at proxy start, preempting");
            if let Some(existing) = video.current_relay() {
                tokio::spawn(async move { existing.force_terminate().await });
            }
            return;
        }

        info!(video_id = %video.id(), "Auto relay started");
        tokio::spawn(task.run());
    }

    fn on_proxy_stop(&self, event: &ProxyEvent) {
        let video = event.task.video();
        if video.id().is_shadow() {
            return;
        }
        if let Some(relay) = video.current_relay() {
            info!(video_id = %video.id(), "Source proxy stopped, terminating relay");
            tokio::spawn(async move { relay.force_terminate().await });
        }
    }
}
