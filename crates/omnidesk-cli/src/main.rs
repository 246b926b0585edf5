use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::OmnideskConfig;
use omnidesk_channels::{
    ChannelRegistry, FacebookSession, InstagramSession, WhatsAppSession,
};
use omnidesk_core::IntegrationCore;
use omnidesk_hub::HubServer;
use omnidesk_store::SqliteStore;

const EVENT_BUFFER: usize = 256;
const DEAD_LETTER_CAPACITY: usize = 256;

#[derive(Parser)]
#[command(name = "omnidesk")]
#[command(version)]
#[command(about = "Omnidesk — omnichannel conversation hub")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize config directory and default config
    Init,

    /// Show current configuration (secrets masked)
    Config,

    /// Start the hub and all enabled channels
    Start {
        /// Allow starting with an empty hub auth token (operator
        /// sockets will be unauthenticated)
        #[arg(long)]
        insecure: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match cli.command {
        Commands::Init => cmd_init().await,
        Commands::Config => cmd_config(&cli.config).await,
        Commands::Start { insecure } => cmd_start(&cli.config, insecure).await,
    }
}

async fn cmd_init() -> Result<()> {
    let config_dir = config::config_dir();
    tokio::fs::create_dir_all(&config_dir)
        .await
        .with_context(|| format!("Failed to create config dir: {}", config_dir.display()))?;

    let config_path = config_dir.join("config.toml");
    if config_path.exists() {
        warn!("Config already exists at {}", config_path.display());
    } else {
        let default_config = include_str!("../../../config/default.toml");
        tokio::fs::write(&config_path, default_config).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&config_path, std::fs::Permissions::from_mode(0o600))
                .await?;
        }
        info!("Created default config at {}", config_path.display());
    }

    println!("Omnidesk initialized at {}", config_dir.display());
    println!(
        "Edit {} to enable channels and set credentials.",
        config_path.display()
    );
    Ok(())
}

async fn cmd_config(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = OmnideskConfig::load(config_path)?;
    // Debug impls mask every secret field
    println!("{:#?}", cfg);
    Ok(())
}

async fn cmd_start(config_path: &Option<PathBuf>, insecure: bool) -> Result<()> {
    let cfg = OmnideskConfig::load(config_path)?;
    ensure_hub_auth(&cfg.hub.auth_token, insecure)?;
    info!("Starting omnidesk...");

    let cancel = CancellationToken::new();

    // Store
    let db_path = config::shellexpand(&cfg.store.db_path);
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = Arc::new(
        SqliteStore::new(&db_path)
            .map_err(|e| anyhow::anyhow!("Failed to open database at {:?}: {}", db_path, e))?,
    );
    info!("Conversation database ready at {:?}", db_path);

    // Channel registry; a channel that fails its first connect stays
    // registered and can be reconnected, so startup proceeds
    let registry = ChannelRegistry::new(EVENT_BUFFER);

    if cfg.channels.whatsapp.enabled {
        let wa = &cfg.channels.whatsapp;
        let session = Arc::new(WhatsAppSession::new(
            wa.bridge_url.clone(),
            wa.api_key.clone(),
            Duration::from_secs(wa.poll_interval_secs),
        ));
        if let Err(e) = registry.register(&wa.channel_id, session).await {
            warn!("WhatsApp channel {} failed to connect: {}", wa.channel_id, e);
        } else {
            info!("WhatsApp channel {} registered", wa.channel_id);
        }
    }

    if cfg.channels.facebook.enabled {
        let fb = &cfg.channels.facebook;
        let session = Arc::new(FacebookSession::new(
            fb.bridge_url.clone(),
            fb.app_state.clone(),
            Duration::from_secs(fb.poll_interval_secs),
        ));
        if let Err(e) = registry.register(&fb.channel_id, session).await {
            warn!("Facebook channel {} failed to connect: {}", fb.channel_id, e);
        } else {
            info!("Facebook channel {} registered", fb.channel_id);
        }
    }

    if cfg.channels.instagram.enabled {
        let ig = &cfg.channels.instagram;
        let session = Arc::new(InstagramSession::new(
            ig.bridge_url.clone(),
            ig.username.clone(),
            ig.session_token.clone(),
            Duration::from_secs(ig.poll_interval_secs),
        ));
        if let Err(e) = registry.register(&ig.channel_id, session).await {
            warn!("Instagram channel {} failed to connect: {}", ig.channel_id, e);
        } else {
            info!("Instagram channel {} registered", ig.channel_id);
        }
    }

    if registry.channel_count() == 0 {
        warn!("No channels enabled — the hub will run without provider connections");
    }

    // Wire registry → core → hub
    let (events_rx, registry_sender) = registry.split();
    let (hub_tx, hub_rx) = tokio::sync::mpsc::channel(EVENT_BUFFER);
    let core = Arc::new(IntegrationCore::new(
        store,
        Arc::new(registry_sender.clone()),
        hub_tx,
        DEAD_LETTER_CAPACITY,
    ));
    let core_task = tokio::spawn(core.clone().run(events_rx, cancel.clone()));

    let bind: SocketAddr = format!("{}:{}", cfg.hub.bind, cfg.hub.port)
        .parse()
        .with_context(|| format!("Invalid hub bind address {}:{}", cfg.hub.bind, cfg.hub.port))?;
    let hub = HubServer::new(bind, cfg.hub.auth_token.clone(), core, registry_sender);
    let pump_task = hub.spawn_event_pump(hub_rx, cancel.clone());
    let hub_task = tokio::spawn(hub.run(cancel.clone()));

    println!("Omnidesk is running on {}. Press Ctrl+C to stop.", bind);

    signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");
    cancel.cancel();

    // Intake stops first; in-flight persistence drains before the pump
    // and server exit
    let _ = core_task.await;
    let _ = pump_task.await;
    if let Ok(Err(e)) = hub_task.await {
        warn!("Hub server exited with error: {}", e);
    }

    println!("Omnidesk stopped.");
    Ok(())
}

/// Every operator socket and API call must present the hub token; an
/// empty token only passes with an explicit opt-out.
fn ensure_hub_auth(token: &str, insecure: bool) -> Result<()> {
    if token.is_empty() {
        if !insecure {
            anyhow::bail!(
                "hub auth_token is empty; set OMNIDESK_HUB_TOKEN (or hub.auth_token) \
                 or pass --insecure to run without operator authentication"
            );
        }
        warn!("Hub auth token is empty — operator authentication is disabled");
    }
    Ok(())
}
