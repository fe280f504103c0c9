// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Tether session host binary.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tether_app_core::config::ConfigService;
use tether_app_core::settings::{HostSettings, HOST_SETTINGS_KEY};
use tether_config_fs::FsConfigStore;
use tether_proto::default_socket_path;
use tether_session_service::hub::validate;
use tether_session_service::{handle_client, spawn_push_task, DemoApp, HubState};
use tokio::net::UnixListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Tether session host")]
struct Args {
    /// Unix socket to listen on (overrides the stored setting)
    #[arg(long)]
    socket: Option<PathBuf>,
    /// Responses kept per session for replay on reconnect
    #[arg(long)]
    history: Option<usize>,
    /// Demo push interval in milliseconds; 0 disables pushes
    #[arg(long)]
    push_interval_ms: Option<u64>,
    /// Milliseconds a session without connections is kept for resume
    #[arg(long)]
    session_idle_ms: Option<u64>,
    /// Items in the demo list
    #[arg(long, default_value_t = 5)]
    demo_items: usize,
    /// Do not read or write the stored host settings
    #[arg(long)]
    no_config: bool,
}

fn load_settings(args: &Args) -> HostSettings {
    let stored = if args.no_config {
        None
    } else {
        FsConfigStore::new()
            .map(ConfigService::new)
            .and_then(|c| c.load_or_init::<HostSettings>(HOST_SETTINGS_KEY))
            .map_err(|err| warn!(%err, "host settings unavailable; using defaults"))
            .ok()
    };
    let mut settings = stored.unwrap_or_default();
    if let Some(socket) = &args.socket {
        settings.socket_path = Some(socket.display().to_string());
    }
    if let Some(history) = args.history {
        settings.history_capacity = history;
    }
    if let Some(interval) = args.push_interval_ms {
        settings.push_interval_ms = interval;
    }
    if let Some(idle) = args.session_idle_ms {
        settings.session_idle_ms = idle;
    }
    settings
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let args = Args::parse();
    let settings = load_settings(&args);
    validate(&settings)?;

    let socket_path = settings
        .socket_path
        .clone()
        .map_or_else(default_socket_path, PathBuf::from);
    let push_interval = settings.push_interval_ms;
    let app = Arc::new(DemoApp::new(args.demo_items)?);
    let hub = HubState::new(settings, app).shared();

    if push_interval > 0 {
        spawn_push_task(hub.clone(), Duration::from_millis(push_interval));
    }

    // Remove stale socket if present
    let _ = std::fs::remove_file(&socket_path);
    let listener = UnixListener::bind(&socket_path)?;
    info!("session host listening at {}", socket_path.display());

    loop {
        let (stream, _) = listener.accept().await?;
        let hub_state = hub.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_client(stream, hub_state).await {
                warn!(?err, "client handler error");
            }
        });
    }
}
