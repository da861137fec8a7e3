//! Device connect daemon entry point: loads configuration, constructs the
//! core building blocks (ADB bridge, Source Registry, Session manager,
//! ADB-Expose Multiplexer), and runs until signalled to stop. The HTTP/WS
//! transport that drives these (§6) is external to this crate; this binary
//! exposes the constructor surface an embedder wires a transport onto.

use anyhow::Context;
use scrcpy_core::adb::{AdbBridge, AdbClient, ExecutionConfig};
use scrcpy_core::session::peer::IceServerConfig;
use scrcpy_core::{Multiplexer, Registry, SessionManager};
use scrcpy_protocol::Config;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATH: &str = "scrcpy-connect.toml";

fn load_config() -> anyhow::Result<Config> {
    let path = std::env::var("SCRCPY_CONNECT_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

    let config = if path.exists() {
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file at {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("failed to parse config file at {}", path.display()))?
    } else {
        info!(path = %path.display(), "no config file found, using defaults");
        Config::default()
    };

    match config.validate() {
        Ok(()) => {}
        Err(issues) => {
            let mut fatal = false;
            for issue in &issues {
                if issue.starts_with("ERROR:") {
                    fatal = true;
                    error!("{issue}");
                } else {
                    warn!("{issue}");
                }
            }
            if fatal {
                anyhow::bail!("configuration is invalid, see errors above");
            }
        }
    }

    Ok(config)
}

/// The daemon's constructed core state, handed to whatever transport layer
/// an embedder wires on top (§6 treats that transport as external).
pub struct Daemon {
    pub registry: Arc<Registry>,
    pub sessions: Arc<SessionManager>,
    pub adb_expose: Arc<Multiplexer>,
}

impl Daemon {
    pub fn new(config: &Config) -> Self {
        let adb_client = AdbClient::new(config.adb.adb_path.clone());
        let adb_exec_config = ExecutionConfig {
            timeout: Duration::from_millis(config.adb.command_timeout_ms),
            retries: config.adb.retries,
        };
        let bridge = Arc::new(AdbBridge::new(adb_client, adb_exec_config));

        let registry = Arc::new(Registry::new(
            bridge,
            config.source.video_buffer_size,
            config.source.audio_buffer_size,
        ));

        let ice_servers = config
            .webrtc
            .ice_servers
            .iter()
            .map(|url| IceServerConfig {
                urls: vec![url.clone()],
                username: None,
                credential: None,
            })
            .collect();
        let sessions = Arc::new(SessionManager::new(ice_servers));

        let adb_expose = Arc::new(Multiplexer::new());

        Self { registry, sessions, adb_expose }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = load_config()?;
    info!(
        adb_path = %config.adb.adb_path,
        video_buffer_size = config.source.video_buffer_size,
        audio_buffer_size = config.source.audio_buffer_size,
        "starting scrcpy-connect daemon"
    );

    let daemon = Daemon::new(&config);
    info!(
        sessions = daemon.sessions.session_count().await,
        "daemon core constructed; awaiting transport wiring"
    );

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");

    for serial in daemon.registry.serials().await {
        daemon.registry.remove(&serial).await;
    }
    daemon.adb_expose.stop().await;

    Ok(())
}
