// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Camera bridge — P2P/IOTC to RTSP/HLS/WebRTC relay.
//!
//! Usage:
//!   camera-bridge run    --config config.toml
//!   camera-bridge status --config config.toml
//!   camera-bridge list   --config config.toml
//!   camera-bridge cmd    --config config.toml --camera front-door --topic irled --value on

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use camera_bridge::cloud::{CloudCollaborator, FileCacheCloudCollaborator, StaticCloudCollaborator};
use camera_bridge::config::{self, BridgeConfig};
use camera_bridge::model::Credential;
use camera_bridge::relay::RelayEvent;
use camera_bridge::supervisor::StreamSupervisor;
use camera_bridge::transport::{NativeAvTransport, NativeLibrary};

#[derive(Parser)]
#[command(name = "camera-bridge", about = "P2P/IOTC camera bridge", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect to every configured camera and run the relay until CTRL+C.
    Run {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Print stream state for every configured camera and exit.
    Status {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// List camera descriptors visible to the cloud collaborator.
    List {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Send a sideband command to a live stream and print its reply.
    Cmd {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
        #[arg(long)]
        camera: String,
        #[arg(long)]
        topic: String,
        #[arg(long)]
        value: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run { config } => run(config).await,
        Command::Status { config } => status(config).await,
        Command::List { config } => list(config).await,
        Command::Cmd { config, camera, topic, value } => cmd(config, &camera, &topic, value).await,
    }
}

fn load_config(path: PathBuf) -> BridgeConfig {
    match BridgeConfig::from_file(&path) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    }
}

fn build_cloud(cfg: &BridgeConfig) -> Arc<dyn CloudCollaborator> {
    let base = StaticCloudCollaborator { cameras: Vec::new() };
    let cache_dir = cfg.cloud.cache_dir.clone().unwrap_or_else(|| PathBuf::from(".cache"));
    Arc::new(FileCacheCloudCollaborator::new(base, cache_dir, cfg.cloud.fresh_data))
}

async fn build_supervisor(cfg: &BridgeConfig) -> Arc<StreamSupervisor> {
    let search_paths = camera_bridge::transport::resolve_library_paths(&cfg.native_library.search_paths);
    let library = match NativeLibrary::init(
        &search_paths,
        cfg.native_library.udp_port,
        cfg.native_library.max_channels,
        &cfg.native_library.license_key,
    ) {
        Ok(lib) => Arc::new(lib),
        Err(e) => {
            error!(error = %e, "failed to initialize the vendor transport library");
            std::process::exit(1);
        }
    };
    let transport = Arc::new(NativeAvTransport::new(library));
    let cloud = build_cloud(cfg);
    let cred: Option<Credential> = None;

    let supervisor = Arc::new(StreamSupervisor::new(transport, cloud.clone(), cred));

    let cameras = match tokio::task::spawn_blocking({
        let cloud = cloud.clone();
        move || {
            let placeholder = Credential {
                access_token: String::new(),
                refresh_token: String::new(),
                user_id: String::new(),
                phone_id: String::new(),
                mfa: None,
            };
            cloud.list_cameras(&placeholder)
        }
    })
    .await
    {
        Ok(Ok(cams)) => cams,
        Ok(Err(e)) => {
            warn!(error = %e, "cloud collaborator returned no cameras");
            Vec::new()
        }
        Err(e) => {
            warn!(error = %e, "camera list task panicked");
            Vec::new()
        }
    };

    for camera in cameras {
        let uri = camera.uri_name('-');
        let over = cfg.override_for(&camera.nickname, &camera.mac).cloned();
        let options = config::resolve_options(&cfg.defaults, over.as_ref());
        let policy = config::resolve_policy(&cfg.defaults, over.as_ref(), cfg.relay.rtsp_port);
        info!(uri, model = camera.model_label(), "registering camera");
        supervisor.add(uri, camera, options, policy);
    }

    supervisor
}

async fn run(config_path: PathBuf) {
    let cfg = load_config(config_path);
    let supervisor = build_supervisor(&cfg).await;

    for uri in supervisor.list_uris() {
        supervisor.start(&uri);
    }

    let (event_tx, event_rx) = tokio::sync::mpsc::channel::<RelayEvent>(64);
    if let Some(pipe_path) = cfg.relay.event_pipe_path.clone() {
        tokio::task::spawn_blocking(move || {
            if let Err(e) = camera_bridge::relay::read_event_pipe(&pipe_path, event_tx) {
                error!(error = %e, "relay event pipe reader exited");
            }
        });
    }

    let monitor_supervisor = supervisor.clone();
    let monitor = tokio::spawn(async move {
        monitor_supervisor.monitor(event_rx, false, Duration::from_secs(120)).await;
    });

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received CTRL+C, shutting down"),
        Err(e) => error!(error = %e, "signal error"),
    }

    monitor.abort();
    supervisor.stop_all().await;
}

async fn status(config_path: PathBuf) {
    let cfg = load_config(config_path);
    let supervisor = build_supervisor(&cfg).await;
    println!("=== Camera Bridge Status ===");
    for uri in supervisor.list_uris() {
        let code = supervisor.state_of(&uri).unwrap_or(1);
        println!("  {uri}: state={code}");
    }
}

async fn list(config_path: PathBuf) {
    let cfg = load_config(config_path);
    let supervisor = build_supervisor(&cfg).await;
    let uris = supervisor.list_uris();
    println!("{} camera(s) configured", uris.len());
    for uri in uris {
        println!("  {uri}");
    }
}

async fn cmd(config_path: PathBuf, camera: &str, topic: &str, value: Option<String>) {
    let cfg = load_config(config_path);
    let supervisor = build_supervisor(&cfg).await;
    let payload = value.map(serde_json::Value::String);
    let reply = supervisor.send_command(camera, topic, payload).await;
    println!("{}", serde_json::to_string_pretty(&reply).unwrap_or_else(|_| format!("{reply:?}")));
}
