//! End-to-end relay loop tests against scripted collaborators.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWrite;
use url::Url;

use restream_media::{CoverOverlay, MediaResult, Overlay, Pid, ProcessSupervisor};
use restream_models::{AccountConfig, ChannelConfig, OverlayMode, OverlayPlacement, VideoDescriptor, VideoId};
use restream_relay::{
    Account, DestinationService, InMemorySettings, RelayConfig, RelayContext, RelayError,
    RelayManager, RelayResult, SourceResolver, TaskRegistry, Video,
};

/// Supervisor that never runs anything: spawned pids stay alive until
/// killed or finished by the test.
struct FakeSupervisor {
    alive: Mutex<HashSet<u64>>,
    spawned: Mutex<Vec<(String, Vec<String>)>>,
}

impl FakeSupervisor {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            alive: Mutex::new(HashSet::new()),
            spawned: Mutex::new(Vec::new()),
        })
    }

    fn spawned(&self) -> Vec<(String, Vec<String>)> {
        self.spawned.lock().unwrap().clone()
    }

    /// Pids of still-alive processes whose tag starts with `prefix`.
    fn alive_pids_tagged(&self, prefix: &str) -> Vec<Pid> {
        let spawned = self.spawned.lock().unwrap();
        let alive = self.alive.lock().unwrap();
        spawned
            .iter()
            .enumerate()
            .filter(|(i, (tag, _))| tag.starts_with(prefix) && alive.contains(&(*i as u64 + 1)))
            .map(|(i, _)| Pid(i as u64 + 1))
            .collect()
    }

    /// Simulate a process exiting on its own.
    fn finish(&self, pid: Pid) {
        self.alive.lock().unwrap().remove(&pid.0);
    }
}

#[async_trait]
impl ProcessSupervisor for FakeSupervisor {
    async fn spawn(&self, cmdline: &[String], tag: &str) -> MediaResult<Pid> {
        // Pid assignment and the spawn log share one lock so index i maps
        // to pid i + 1.
        let mut spawned = self.spawned.lock().unwrap();
        let pid = spawned.len() as u64 + 1;
        self.alive.lock().unwrap().insert(pid);
        spawned.push((tag.to_string(), cmdline.to_vec()));
        Ok(Pid(pid))
    }

    async fn wait(&self, pid: Pid, timeout: Duration) -> bool {
        if self.alive.lock().unwrap().contains(&pid.0) {
            tokio::time::sleep(timeout).await;
            !self.alive.lock().unwrap().contains(&pid.0)
        } else {
            true
        }
    }

    async fn kill(&self, pid: Pid) {
        self.alive.lock().unwrap().remove(&pid.0);
    }

    async fn is_alive(&self, pid: Pid) -> bool {
        self.alive.lock().unwrap().contains(&pid.0)
    }

    async fn stdin_writer(&self, _pid: Pid) -> Option<Box<dyn AsyncWrite + Send + Unpin>> {
        None
    }

    async fn log_output(&self, _pid: Pid) -> String {
        String::new()
    }
}

#[derive(Default)]
struct FakeDestination {
    stop_calls: Mutex<Vec<(String, bool)>>,
    title_calls: Mutex<Vec<(String, String)>>,
    announcements: Mutex<Vec<String>>,
}

impl FakeDestination {
    fn stop_calls(&self) -> Vec<(String, bool)> {
        self.stop_calls.lock().unwrap().clone()
    }

    fn title_calls(&self) -> Vec<(String, String)> {
        self.title_calls.lock().unwrap().clone()
    }

    fn announcements(&self) -> Vec<String> {
        self.announcements.lock().unwrap().clone()
    }
}

#[async_trait]
impl DestinationService for FakeDestination {
    fn is_match(&self, platform: &str) -> bool {
        platform == "test"
    }

    async fn egress_address(&self, account: &Account) -> RelayResult<String> {
        Ok(format!("fake://{}", account.room_id()))
    }

    async fn set_broadcast_setting(&self, account: &Account, title: &str) -> RelayResult<()> {
        self.title_calls
            .lock()
            .unwrap()
            .push((account.id().to_string(), title.to_string()));
        Ok(())
    }

    async fn stop_broadcast(&self, account: &Account, force: bool) -> RelayResult<()> {
        self.stop_calls
            .lock()
            .unwrap()
            .push((account.id().to_string(), force));
        Ok(())
    }

    async fn post_announcement(&self, account: &Account) -> RelayResult<()> {
        self.announcements
            .lock()
            .unwrap()
            .push(account.id().to_string());
        Ok(())
    }
}

#[derive(Default)]
struct FakeResolver {
    released: Mutex<Vec<VideoId>>,
}

impl FakeResolver {
    fn released(&self) -> Vec<VideoId> {
        self.released.lock().unwrap().clone()
    }
}

#[async_trait]
impl SourceResolver for FakeResolver {
    async fn resolve(&self, source_url: &Url, quality_hint: Option<&str>) -> RelayResult<VideoDescriptor> {
        let quality = quality_hint.unwrap_or("source");
        let playback = Url::parse(&format!("https://cdn.example.com/{quality}.m3u8"))
            .map_err(|e| RelayError::resolve_failed(e.to_string()))?;
        Ok(VideoDescriptor::new(
            "resolved",
            "resolved stream",
            source_url.clone(),
            playback,
        ))
    }

    async fn release_server(&self, video_id: &VideoId) {
        self.released.lock().unwrap().push(video_id.clone());
    }
}

fn fast_config() -> RelayConfig {
    RelayConfig {
        account_retry_backoff: Duration::from_millis(10),
        loop_backoff: Duration::from_millis(10),
        liveness_poll: Duration::from_millis(10),
        ingest_restart_backoff: Duration::from_millis(10),
        encoder_warmup: Duration::from_millis(5),
        stop_broadcast_delay: Duration::from_millis(40),
        ..RelayConfig::default()
    }
}

struct Harness {
    supervisor: Arc<FakeSupervisor>,
    destination: Arc<FakeDestination>,
    resolver: Arc<FakeResolver>,
    registry: Arc<TaskRegistry>,
    manager: Arc<RelayManager>,
}

fn harness(accounts: Vec<Arc<Account>>) -> Harness {
    let supervisor = FakeSupervisor::new();
    let destination = Arc::new(FakeDestination::default());
    let resolver = Arc::new(FakeResolver::default());
    let settings = InMemorySettings::new(accounts);
    let registry = TaskRegistry::new();
    let ctx = Arc::new(RelayContext {
        registry: Arc::clone(&registry),
        settings: settings.clone(),
        resolver: resolver.clone(),
        destinations: vec![destination.clone()],
        supervisor: supervisor.clone(),
        config: fast_config(),
    });
    let manager = RelayManager::new(ctx);
    manager.subscribe();
    Harness {
        supervisor,
        destination,
        resolver,
        registry,
        manager,
    }
}

fn account(id: &str, auto_balance: bool, disabled: bool, auto_title: bool) -> Arc<Account> {
    Account::new(AccountConfig {
        account_id: id.into(),
        platform: "test".into(),
        room_id: format!("room-{id}"),
        disabled,
        join_auto_balance: auto_balance,
        auto_title,
    })
}

fn channel_video(id: &str, mode: OverlayMode) -> Arc<Video> {
    let desc = VideoDescriptor::new(
        id,
        format!("stream {id}"),
        Url::parse(&format!("https://live.example.com/{id}")).unwrap(),
        Url::parse(&format!("https://cdn.example.com/{id}.m3u8")).unwrap(),
    )
    .with_channel(ChannelConfig {
        channel_name: "ch".into(),
        default_account_id: None,
        auto_balance: true,
    });
    let video = Video::new(desc);
    video.set_overlay_mode(mode);
    video
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}

#[tokio::test]
async fn test_auto_relay_acquires_pool_account_and_starts_egress() {
    let disabled = account("a1", true, true, false);
    let enabled = account("a2", true, false, true);
    let h = harness(vec![Arc::clone(&disabled), Arc::clone(&enabled)]);

    let video = channel_video("v1", OverlayMode::None);
    h.manager.start_proxy(Arc::clone(&video)).unwrap();
    settle().await;

    assert!(enabled.is_leased_to(&video));
    assert!(!disabled.is_leased_to(&video));
    assert!(video.current_relay().is_some());

    let egress: Vec<_> = h
        .supervisor
        .spawned()
        .into_iter()
        .filter(|(tag, _)| tag.starts_with("egress:"))
        .collect();
    assert!(!egress.is_empty());
    assert!(egress[0].1.contains(&"fake://room-a2".to_string()));
    // auto_title pushed the video title before egress started
    assert_eq!(h.destination.title_calls()[0].1, "stream v1");
    // the announcement went out exactly once despite loop iterations
    assert_eq!(h.destination.announcements(), vec!["a2".to_string()]);
}

#[tokio::test]
async fn test_proxy_stop_terminates_relay_and_frees_account() {
    let acct = account("a1", true, false, false);
    let h = harness(vec![Arc::clone(&acct)]);

    let video = channel_video("v1", OverlayMode::None);
    let proxy = h.manager.start_proxy(Arc::clone(&video)).unwrap();
    settle().await;
    assert!(acct.is_leased_to(&video));

    proxy.terminate().await;
    proxy.wait_terminated().await;
    settle().await;

    assert!(video.current_relay().is_none());
    assert!(acct.current_video().is_none());
    assert!(h.supervisor.alive_pids_tagged("egress:").is_empty());

    // deferred stop fires once the grace period passes with the lease idle
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(h.destination.stop_calls(), vec![("a1".to_string(), true)]);
}

#[tokio::test]
async fn test_manual_relay_conflict_fails_fast() {
    let acct = account("a1", false, false, false);
    let h = harness(vec![Arc::clone(&acct)]);

    let other = channel_video("v0", OverlayMode::None);
    assert!(acct.try_acquire(&other));

    let video = channel_video("v1", OverlayMode::None);
    let err = h
        .manager
        .create_manual_relay(Arc::clone(&video), Arc::clone(&acct))
        .unwrap_err();

    match err {
        RelayError::AccountBusy { account_id, owner } => {
            assert_eq!(account_id.as_str(), "a1");
            assert_eq!(owner, "stream v0");
        }
        other => panic!("unexpected error: {other}"),
    }
    // nothing was bound or spawned
    assert!(video.current_relay().is_none());
    assert!(acct.is_leased_to(&other));
    assert!(h.supervisor.spawned().is_empty());
}

#[tokio::test]
async fn test_manual_relay_runs_without_channel() {
    let acct = account("a1", false, false, false);
    let h = harness(vec![Arc::clone(&acct)]);

    let desc = VideoDescriptor::new(
        "v1",
        "manual stream",
        Url::parse("https://live.example.com/v1").unwrap(),
        Url::parse("https://cdn.example.com/v1.m3u8").unwrap(),
    );
    let video = Video::new(desc);

    let task = h
        .manager
        .create_manual_relay(Arc::clone(&video), Arc::clone(&acct))
        .unwrap();
    settle().await;

    assert!(task.is_single_task());
    assert!(acct.is_leased_to(&video));
    assert!(h.registry.contains(video.id()));
    assert!(!h.supervisor.alive_pids_tagged("egress:").is_empty());

    task.force_terminate().await;
    settle().await;
    assert!(acct.current_video().is_none());
    assert!(video.current_relay().is_none());
    assert!(h.supervisor.alive_pids_tagged("egress:").is_empty());
}

#[tokio::test]
async fn test_shadow_proxy_created_and_torn_down_on_mode_change() {
    let acct = account("a1", true, false, false);
    let h = harness(vec![Arc::clone(&acct)]);

    let video = channel_video("v1", OverlayMode::AreaScreen);
    h.manager.start_proxy(Arc::clone(&video)).unwrap();
    settle().await;

    let shadow_id = video.id().shadow();
    assert!(h.registry.contains(&shadow_id));

    // egress ran against the shadow's served URL
    let egress = h.supervisor.spawned();
    let (_, cmdline) = egress
        .iter()
        .find(|(tag, _)| tag.starts_with("egress:"))
        .expect("egress spawned");
    assert!(cmdline.iter().any(|a| a.contains("v1_low")));

    // switching censorship off tears the shadow down before the next egress
    video.set_overlay_mode(OverlayMode::None);
    for pid in h.supervisor.alive_pids_tagged("egress:") {
        h.supervisor.finish(pid);
    }
    settle().await;

    assert!(!h.registry.contains(&shadow_id));
    assert!(h.resolver.released().contains(&shadow_id));

    let last_egress = h
        .supervisor
        .spawned()
        .into_iter()
        .filter(|(tag, _)| tag.starts_with("egress:"))
        .next_back()
        .expect("egress after mode change");
    assert!(last_egress.1.iter().any(|a| a.contains("/v1.flv")));
    assert!(!last_egress.1.iter().any(|a| a.contains("v1_low")));

    // the account lease is untouched by the mode change
    assert!(acct.is_leased_to(&video));
}

#[tokio::test]
async fn test_image_segment_replaces_previous_and_reaches_shadow() {
    let acct = account("a1", true, false, false);
    let h = harness(vec![Arc::clone(&acct)]);

    let video = channel_video("v1", OverlayMode::CustomScreen);
    video
        .overlays()
        .add(Arc::new(CoverOverlay::new(OverlayPlacement::new(0, 0, 0, 10, 10))));
    h.manager.start_proxy(Arc::clone(&video)).unwrap();
    settle().await;

    let task = video.current_relay().expect("relay bound");
    let shadow_proxy = h
        .registry
        .get(&video.id().shadow())
        .expect("shadow proxy running");
    // the shadow paints from the parent's collection
    assert!(Arc::ptr_eq(&video.overlays(), &shadow_proxy.video().overlays()));

    task.accept_image_segment(image::DynamicImage::new_rgba8(1280, 960), 1280, 960);
    task.accept_image_segment(image::DynamicImage::new_rgba8(640, 720), 640, 720);

    // the newer segmentation result replaced the older one; the mutation is
    // visible through the shadow's shared set
    let overlays = shadow_proxy.video().overlays().snapshot();
    let segments: Vec<_> = overlays.iter().filter(|o| o.is_image_segment()).collect();
    assert_eq!(segments.len(), 1);
    assert_eq!(overlays.len(), 2);

    // segments composite above the manually placed cover
    assert!(overlays.last().unwrap().is_image_segment());

    // scaled to the egress canvas height, width keeping the source aspect
    let placement = segments[0].placement();
    let height = fast_config().canvas_height;
    assert_eq!(placement.height, height);
    assert_eq!(placement.width, 640 * height / 720);
    assert_eq!((placement.x, placement.y), (0, 0));
}
