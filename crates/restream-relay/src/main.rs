//! Live relay daemon binary.

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use restream_media::{check_ffmpeg, FfmpegSupervisor};
use restream_models::{AccountConfig, VideoDescriptor};
use restream_relay::{
    Account, DirectResolver, InMemorySettings, RelayConfig, RelayContext, RelayManager,
    RtmpDestination, TaskRegistry, Video,
};

fn load_json<T: serde::de::DeserializeOwned>(env_var: &str) -> anyhow::Result<Vec<T>> {
    let Ok(path) = std::env::var(env_var) else {
        return Ok(Vec::new());
    };
    let raw = std::fs::read_to_string(&path)?;
    Ok(serde_json::from_str(&raw)?)
}

#[tokio::main]
async fn main() {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing with colored output for dev, JSON for production
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::from_default_env()
        .add_directive("restream=info".parse().unwrap());

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }

    info!("Starting restream-relay");

    if let Err(e) = check_ffmpeg() {
        error!("FFmpeg not available: {}", e);
        std::process::exit(1);
    }

    let config = RelayConfig::from_env();
    info!("Relay config: {:?}", config);

    let accounts: Vec<AccountConfig> = match load_json("RELAY_ACCOUNTS_FILE") {
        Ok(a) => a,
        Err(e) => {
            error!("Failed to load accounts file: {}", e);
            std::process::exit(1);
        }
    };
    let sources: Vec<VideoDescriptor> = match load_json("RELAY_SOURCES_FILE") {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to load sources file: {}", e);
            std::process::exit(1);
        }
    };
    info!(accounts = accounts.len(), sources = sources.len(), "Loaded settings");

    let settings = InMemorySettings::new(accounts.into_iter().map(Account::new).collect());
    let registry = TaskRegistry::new();
    let ctx = Arc::new(RelayContext {
        registry: Arc::clone(&registry),
        settings,
        resolver: Arc::new(DirectResolver),
        destinations: vec![Arc::new(RtmpDestination)],
        supervisor: Arc::new(FfmpegSupervisor::new()),
        config,
    });

    let manager = RelayManager::new(Arc::clone(&ctx));
    manager.subscribe();

    for descriptor in sources {
        let video = Video::new(descriptor);
        if let Err(e) = manager.start_proxy(video) {
            error!("Failed to start proxy: {}", e);
        }
    }

    tokio::signal::ctrl_c().await.ok();
    info!("Received shutdown signal");

    for proxy in registry.tasks() {
        proxy.terminate().await;
    }
    for proxy in registry.tasks() {
        proxy.wait_terminated().await;
    }

    info!("Relay shutdown complete");
}
