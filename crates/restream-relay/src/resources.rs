//! Runtime video and account entities with CAS-protected bindings.
//!
//! The two exclusive relations — `Video ↔ RelayTask` and `Account ↔ Video` —
//! are mutated only through check-and-set methods that read and swap under a
//! single lock guard. Callers treat a failed swap as a recoverable
//! precondition failure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use url::Url;

use restream_media::OverlaySet;
use restream_models::{AccountConfig, AccountId, ChannelConfig, OverlayMode, VideoDescriptor, VideoId};

use crate::relay::RelayTask;

/// A live video known to the relay core.
///
/// Identity and resolution data are immutable; binding state, overlay
/// configuration and flags mutate for the lifetime of the entity.
pub struct Video {
    descriptor: VideoDescriptor,
    overlays: Arc<OverlaySet>,
    overlay_mode: Mutex<OverlayMode>,
    audio_muted: AtomicBool,
    announcement_posted: AtomicBool,
    relay: Mutex<Option<Arc<RelayTask>>>,
}

impl Video {
    pub fn new(descriptor: VideoDescriptor) -> Arc<Self> {
        Self::with_overlays(descriptor, Arc::new(OverlaySet::new()))
    }

    /// Create a video sharing an existing overlay collection.
    ///
    /// Used for shadow videos so overlay mutations on the parent are seen by
    /// the shadow's renderer without copying.
    pub fn with_overlays(descriptor: VideoDescriptor, overlays: Arc<OverlaySet>) -> Arc<Self> {
        let overlay_mode = descriptor.overlay_mode;
        let audio_muted = descriptor.audio_muted;
        Arc::new(Self {
            descriptor,
            overlays,
            overlay_mode: Mutex::new(overlay_mode),
            audio_muted: AtomicBool::new(audio_muted),
            announcement_posted: AtomicBool::new(false),
            relay: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &VideoId {
        &self.descriptor.video_id
    }

    pub fn title(&self) -> &str {
        &self.descriptor.title
    }

    pub fn source_url(&self) -> &Url {
        &self.descriptor.source_url
    }

    pub fn playback_url(&self) -> &Url {
        &self.descriptor.playback_url
    }

    pub fn channel(&self) -> Option<&ChannelConfig> {
        self.descriptor.channel.as_ref()
    }

    pub fn overlays(&self) -> Arc<OverlaySet> {
        Arc::clone(&self.overlays)
    }

    pub fn overlay_mode(&self) -> OverlayMode {
        *self.overlay_mode.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_overlay_mode(&self, mode: OverlayMode) {
        *self.overlay_mode.lock().unwrap_or_else(|e| e.into_inner()) = mode;
    }

    pub fn audio_muted(&self) -> bool {
        self.audio_muted.load(Ordering::SeqCst)
    }

    pub fn set_audio_muted(&self, muted: bool) {
        self.audio_muted.store(muted, Ordering::SeqCst);
    }

    pub fn announcement_posted(&self) -> bool {
        self.announcement_posted.load(Ordering::SeqCst)
    }

    pub fn mark_announcement_posted(&self) {
        self.announcement_posted.store(true, Ordering::SeqCst);
    }

    /// Bind `task` as this video's relay. Fails if a relay is already bound;
    /// the caller reads back the existing binding and decides whether to
    /// preempt it.
    pub fn try_set_relay(&self, task: &Arc<RelayTask>) -> bool {
        let mut relay = self.relay.lock().unwrap_or_else(|e| e.into_inner());
        if relay.is_some() {
            return false;
        }
        *relay = Some(Arc::clone(task));
        true
    }

    pub fn current_relay(&self) -> Option<Arc<RelayTask>> {
        self.relay.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Unbind `task`. Fails if the bound relay is not `task`.
    pub fn clear_relay(&self, task: &Arc<RelayTask>) -> bool {
        let mut relay = self.relay.lock().unwrap_or_else(|e| e.into_inner());
        match relay.as_ref() {
            Some(current) if Arc::ptr_eq(current, task) => {
                *relay = None;
                true
            }
            _ => false,
        }
    }
}

/// A destination account with an exclusive video lease.
pub struct Account {
    config: AccountConfig,
    disabled: AtomicBool,
    lease: Mutex<Option<Arc<Video>>>,
}

impl Account {
    pub fn new(config: AccountConfig) -> Arc<Self> {
        let disabled = config.disabled;
        Arc::new(Self {
            config,
            disabled: AtomicBool::new(disabled),
            lease: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &AccountId {
        &self.config.account_id
    }

    pub fn platform(&self) -> &str {
        &self.config.platform
    }

    pub fn room_id(&self) -> &str {
        &self.config.room_id
    }

    pub fn auto_title(&self) -> bool {
        self.config.auto_title
    }

    pub fn join_auto_balance(&self) -> bool {
        self.config.join_auto_balance
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    pub fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::SeqCst);
    }

    /// Acquire the lease for `video`. All-or-nothing: fails if any lease is
    /// currently held.
    pub fn try_acquire(&self, video: &Arc<Video>) -> bool {
        let mut lease = self.lease.lock().unwrap_or_else(|e| e.into_inner());
        if lease.is_some() {
            return false;
        }
        *lease = Some(Arc::clone(video));
        true
    }

    pub fn current_video(&self) -> Option<Arc<Video>> {
        self.lease.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Release the lease held for `video`. Fails if the lease moved under
    /// the caller.
    pub fn release(&self, video: &Arc<Video>) -> bool {
        let mut lease = self.lease.lock().unwrap_or_else(|e| e.into_inner());
        match lease.as_ref() {
            Some(current) if Arc::ptr_eq(current, video) => {
                *lease = None;
                true
            }
            _ => false,
        }
    }

    /// Whether the lease currently points at `video`.
    pub fn is_leased_to(&self, video: &Arc<Video>) -> bool {
        self.lease
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map_or(false, |current| Arc::ptr_eq(current, video))
    }
}
