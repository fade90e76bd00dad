//! Collaborator contracts consumed by the relay core.
//!
//! Platform-specific behavior lives behind these traits; the core is pure
//! orchestration over them.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::debug;
use url::Url;
use uuid::Uuid;

use restream_models::{AccountId, VideoDescriptor, VideoId};

use crate::error::{RelayError, RelayResult};
use crate::resources::Account;

/// Resolves a source identifier to a playable stream.
#[async_trait]
pub trait SourceResolver: Send + Sync {
    /// Resolve `source_url`, optionally capped at `quality_hint` (vertical
    /// resolution, e.g. "720").
    async fn resolve(&self, source_url: &Url, quality_hint: Option<&str>) -> RelayResult<VideoDescriptor>;

    /// Release any server resource held for `video_id`. Best effort.
    async fn release_server(&self, video_id: &VideoId);
}

/// Destination platform operations needed by the relay loop.
#[async_trait]
pub trait DestinationService: Send + Sync {
    /// Whether this service handles `platform`.
    fn is_match(&self, platform: &str) -> bool;

    /// Egress target address for the bound account.
    async fn egress_address(&self, account: &Account) -> RelayResult<String>;

    /// Push room settings (title) to the destination.
    async fn set_broadcast_setting(&self, account: &Account, title: &str) -> RelayResult<()>;

    /// Stop the broadcast on the destination side.
    async fn stop_broadcast(&self, account: &Account, force: bool) -> RelayResult<()>;

    /// Post a social announcement for the account's room.
    async fn post_announcement(&self, account: &Account) -> RelayResult<()>;
}

/// Read access to the configured account pool.
pub trait SettingsStore: Send + Sync {
    fn find_account(&self, id: &AccountId) -> Option<Arc<Account>>;
    fn accounts(&self) -> Vec<Arc<Account>>;
}

/// Account pool held in memory; the persistence layer behind it is out of
/// the core's scope.
pub struct InMemorySettings {
    accounts: Mutex<Vec<Arc<Account>>>,
}

impl InMemorySettings {
    pub fn new(accounts: Vec<Arc<Account>>) -> Arc<Self> {
        Arc::new(Self {
            accounts: Mutex::new(accounts),
        })
    }

    pub fn add_account(&self, account: Arc<Account>) {
        self.accounts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(account);
    }
}

impl SettingsStore for InMemorySettings {
    fn find_account(&self, id: &AccountId) -> Option<Arc<Account>> {
        self.accounts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|a| a.id() == id)
            .cloned()
    }

    fn accounts(&self) -> Vec<Arc<Account>> {
        self.accounts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Resolver for sources that are already directly playable.
pub struct DirectResolver;

#[async_trait]
impl SourceResolver for DirectResolver {
    async fn resolve(&self, source_url: &Url, quality_hint: Option<&str>) -> RelayResult<VideoDescriptor> {
        debug!(source = %source_url, quality = ?quality_hint, "Resolving source directly");
        let title = source_url
            .path_segments()
            .and_then(|mut s| s.next_back())
            .unwrap_or("stream")
            .to_string();
        Ok(VideoDescriptor::new(
            Uuid::new_v4().to_string(),
            title,
            source_url.clone(),
            source_url.clone(),
        ))
    }

    async fn release_server(&self, _video_id: &VideoId) {}
}

/// Generic RTMP destination: the account's room id is a full RTMP publish
/// URL and there is no management API behind it.
pub struct RtmpDestination;

#[async_trait]
impl DestinationService for RtmpDestination {
    fn is_match(&self, platform: &str) -> bool {
        platform.eq_ignore_ascii_case("rtmp")
    }

    async fn egress_address(&self, account: &Account) -> RelayResult<String> {
        if account.room_id().is_empty() {
            return Err(RelayError::platform_failed(format!(
                "account {} has no RTMP publish URL",
                account.id()
            )));
        }
        Ok(account.room_id().to_string())
    }

    async fn set_broadcast_setting(&self, _account: &Account, _title: &str) -> RelayResult<()> {
        // Plain RTMP has no settings API.
        Ok(())
    }

    async fn stop_broadcast(&self, _account: &Account, _force: bool) -> RelayResult<()> {
        Ok(())
    }

    async fn post_announcement(&self, _account: &Account) -> RelayResult<()> {
        Ok(())
    }
}
