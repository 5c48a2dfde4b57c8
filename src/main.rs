//! Nodelink
//!
//! Keeps a machine behind NAT reachable from a remote control plane.
//!
//! The node holds outbound control connections open and serves what arrives
//! over them:
//! - Proxied HTTP requests against a local service
//! - WebSocket sessions bridged to a local WebSocket service
//! - Registration, heartbeats, and bandwidth tests on the primary channel
//!
//! The node authenticates with an API key pair and identifies itself with a
//! client id and an ed25519 public key created by `nodelink init`.

#![deny(clippy::correctness)]
#![warn(clippy::suspicious)]
#![warn(clippy::style)]
#![warn(clippy::complexity)]
#![warn(clippy::perf)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;
mod crypto;
mod error;
mod protocol;
mod relay;

use config::{Config, SubProtocol};
use crypto::keypair::default_keypair_path;
use crypto::Keypair;
use relay::{
    bootstrap_identity, ConnectOutcome, LocalHttp, NodeIdentity, PrimaryControlChannel,
    PrimarySettings, ReconnectPolicy, ReqwestLocalHttp, SystemReport, TunnelSupervisor,
};

#[derive(Parser, Debug)]
#[command(name = "nodelink")]
#[command(author, version, about = "Expose local services to a remote control plane")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to the config file
    #[arg(short, long, global = true, env = "NODELINK_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect the primary channel and every configured tunnel
    Start(StartArgs),

    /// Save the API key pair used to authenticate
    Login(LoginArgs),

    /// Create the node identity (client id and keypair)
    Init,

    /// List configured tunnels
    Tunnels,
}

#[derive(Parser, Debug)]
struct StartArgs {
    /// Primary control channel URL
    #[arg(long, env = "NODELINK_PRIMARY_URL")]
    primary_url: Option<String>,

    /// Base URL of the local HTTP service
    #[arg(long, env = "NODELINK_LOCAL_URL")]
    local_url: Option<String>,
}

#[derive(Parser, Debug)]
struct LoginArgs {
    /// API key id
    #[arg(long, env = "NODELINK_API_KEY_ID")]
    api_key_id: Option<String>,

    /// API key secret
    #[arg(long, env = "NODELINK_API_KEY")]
    api_key: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = match cli.config {
        Some(path) => path,
        None => Config::config_path()?,
    };

    match cli.command {
        Some(Commands::Start(args)) => run_start(&config_path, cli.verbose, args).await,
        Some(Commands::Login(args)) => run_login(&config_path, args),
        Some(Commands::Init) => run_init(&config_path),
        Some(Commands::Tunnels) => run_tunnels(&config_path),
        None => {
            eprintln!("No command specified. Use --help for usage information.");
            eprintln!();
            eprintln!("Quick start:");
            eprintln!("  nodelink login                 Save your API key pair");
            eprintln!("  nodelink init                  Create the node identity");
            eprintln!("  nodelink start                 Connect and serve");
            std::process::exit(1);
        }
    }
}

async fn run_start(config_path: &Path, verbose: bool, args: StartArgs) -> Result<()> {
    init_logging(verbose);

    let mut config = Config::load_from(config_path)?;
    if let Some(url) = args.primary_url {
        config.node.primary_url = url;
    }
    if let Some(url) = args.local_url {
        config.local.http_base_url = url;
    }

    let keypair_path = config
        .node
        .keypair_path
        .clone()
        .unwrap_or_else(default_keypair_path);
    let keypair = Keypair::load(&keypair_path).with_context(|| {
        format!(
            "Failed to load keypair from {}. Run 'nodelink init' first",
            keypair_path.display()
        )
    })?;
    let identity = NodeIdentity::from_config(&config.node, &keypair)
        .context("Node identity incomplete. Run 'nodelink init' first")?;

    if config.auth.api_key_id.is_none() || config.auth.api_key.is_none() {
        warn!("No API key configured; run 'nodelink login' if the control plane rejects us");
    }

    let local: Arc<dyn LocalHttp> =
        Arc::new(ReqwestLocalHttp::new().context("Failed to build local HTTP client")?);

    let supervisor = TunnelSupervisor::new(
        identity.client_id.as_str(),
        ReconnectPolicy::default(),
        config.timing.liveness_interval(),
    );
    for tunnel in config.resolved_tunnels() {
        supervisor.add_endpoint(tunnel, local.clone());
    }

    let primary = PrimaryControlChannel::new(
        PrimarySettings::from_config(&config),
        Some(identity.clone()),
        Arc::new(SystemReport::new()),
        local,
    );

    let follow_ids = supervisor.follow_node_id(primary.client_ids());

    info!("Starting node {}", identity.client_id);
    match primary.connect().await {
        ConnectOutcome::Error(e) => warn!("Primary channel not connected yet: {}", e),
        _ => info!("Primary channel connected"),
    }
    supervisor.connect_all().await;

    for (name, connected) in supervisor.status() {
        info!("Tunnel {}: {}", name, if connected { "connected" } else { "retrying" });
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutting down");
    follow_ids.abort();
    supervisor.disconnect_all().await;
    primary.disconnect().await;
    Ok(())
}

fn run_login(config_path: &Path, args: LoginArgs) -> Result<()> {
    let api_key_id = match args.api_key_id {
        Some(id) => id,
        None => prompt("API key id: ")?,
    };
    let api_key = match args.api_key {
        Some(key) => key,
        None => prompt("API key: ")?,
    };

    if api_key_id.is_empty() || api_key.is_empty() {
        anyhow::bail!("Both an API key id and an API key are required");
    }

    let mut config = Config::load_from(config_path)?;
    config.auth.api_key_id = Some(api_key_id);
    config.auth.api_key = Some(api_key);
    config.save_to(config_path)?;

    println!();
    println!("Credentials saved to {}", config_path.display());
    println!("You can now run: nodelink start");

    Ok(())
}

fn run_init(config_path: &Path) -> Result<()> {
    let mut config = Config::load_from(config_path)?;
    let created = bootstrap_identity(&mut config.node);

    let keypair_path = config
        .node
        .keypair_path
        .get_or_insert_with(default_keypair_path)
        .clone();
    let keypair = Keypair::load_or_generate(&keypair_path)
        .with_context(|| format!("Failed to prepare keypair at {}", keypair_path.display()))?;

    config.save_to(config_path)?;

    if created {
        println!("Created node identity");
    } else {
        println!("Node identity already present");
    }
    println!();
    println!("  Client id:  {}", config.node.client_id.as_deref().unwrap_or("?"));
    println!("  Public key: {}", keypair.public_key_base64());
    println!("  Keypair:    {}", keypair_path.display());
    println!("  Config:     {}", config_path.display());

    Ok(())
}

fn run_tunnels(config_path: &Path) -> Result<()> {
    let config = Config::load_from(config_path)?;

    if config.tunnels.is_empty() {
        println!("No tunnels configured.");
        return Ok(());
    }

    println!("Configured tunnels:");
    println!();
    for tunnel in &config.tunnels {
        let disabled: Vec<&str> = tunnel
            .disabled_sub_protocols
            .iter()
            .map(|p| match p {
                SubProtocol::Http => "http",
                SubProtocol::Https => "https",
                SubProtocol::Ws => "ws",
                SubProtocol::Wss => "wss",
            })
            .collect();
        println!("  {}", tunnel.name);
        println!("    remote:   {}", tunnel.remote_url);
        println!("    local:    {}", tunnel.local_base_path);
        println!(
            "    serves:   http={} ws={}",
            tunnel.http_enabled(),
            tunnel.ws_enabled()
        );
        if !disabled.is_empty() {
            println!("    disabled: {}", disabled.join(", "));
        }
    }

    Ok(())
}

fn prompt(label: &str) -> Result<String> {
    use std::io::{self, Write};

    print!("{}", label);
    io::stdout().flush()?;

    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
