//! BitChat CLI
//!
//! A peer-to-peer encrypted chat node carried over a Bluetooth Low Energy
//! mesh: no server, no internet, no persistent routing identities.

mod ble;
mod config;
mod control;
mod delegate;
mod identity_store;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use bitchat_core::Node;
use bitchat_transport::TransportConfig;
use delegate::TerminalDelegate;

/// BitChat - peer-to-peer encrypted mesh chat over BLE
#[derive(Parser)]
#[command(name = "bitchat")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Identity key-store path
    #[arg(long)]
    identity: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new long-term identity and save it, encrypted, to disk
    Keygen {
        /// Overwrite an existing identity file at the target path
        #[arg(long)]
        force: bool,
    },

    /// Run a node: bring up the BLE mesh, print peer/session status to stdout
    Daemon,

    /// Query a running daemon's connected-peer count
    Status,

    /// Query a running daemon's known peer table
    Peers,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(config::default_path);
    let node_config = config::load_or_default(&config_path)?;

    tracing_subscriber::fmt()
        .with_env_filter(if cli.verbose {
            "debug"
        } else {
            node_config.logging.level.as_str()
        })
        .init();

    let identity_path = cli
        .identity
        .clone()
        .unwrap_or_else(config::default_identity_path);

    match cli.command {
        Commands::Keygen { force } => keygen(&identity_path, force)?,
        Commands::Daemon => run_daemon(node_config, &identity_path).await?,
        Commands::Status => query_daemon("STATUS").await?,
        Commands::Peers => query_daemon("PEERS").await?,
    }

    Ok(())
}

/// Generate a new identity, encrypted under a passphrase read from the
/// terminal, and print its fingerprint.
fn keygen(identity_path: &PathBuf, force: bool) -> anyhow::Result<()> {
    if identity_path.exists() && !force {
        anyhow::bail!(
            "identity already exists at {} (use --force to overwrite)",
            identity_path.display()
        );
    }

    let passphrase = rpassword::prompt_password("passphrase to encrypt the identity: ")?;
    let confirm = rpassword::prompt_password("confirm passphrase: ")?;
    if passphrase != confirm {
        anyhow::bail!("passphrases did not match");
    }

    let identity = identity_store::generate_and_save(identity_path, passphrase.as_bytes())?;

    println!("identity fingerprint: {}", identity.fingerprint().to_hex());
    println!("saved to: {}", identity_path.display());
    Ok(())
}

/// Run a node in the foreground: load (or generate) the identity, bring up
/// the dual-role BLE backend, serve the control channel, print mesh events.
async fn run_daemon(node_config: bitchat_core::NodeConfig, identity_path: &PathBuf) -> anyhow::Result<()> {
    let passphrase = if identity_path.exists() {
        rpassword::prompt_password("identity passphrase: ")?
    } else {
        println!("no identity found at {}, generating one", identity_path.display());
        let passphrase = rpassword::prompt_password("passphrase to encrypt the new identity: ")?;
        let confirm = rpassword::prompt_password("confirm passphrase: ")?;
        if passphrase != confirm {
            anyhow::bail!("passphrases did not match");
        }
        passphrase
    };

    let identity = identity_store::load_or_generate(identity_path, passphrase.as_bytes())?;
    println!("identity fingerprint: {}", identity.fingerprint().to_hex());

    let transport_config = TransportConfig {
        scan_rssi_floor_dbm: node_config.ble.scan_rssi_floor_dbm,
        ..TransportConfig::default()
    };
    let (backend, mut events) = ble::DualBleBackend::new(transport_config);
    let backend = Arc::new(backend);
    let delegate = Arc::new(TerminalDelegate::new(&node_config));

    let node = Arc::new(Node::with_identity(
        node_config,
        identity,
        backend.clone(),
        delegate.clone(),
    )?);
    node.start();

    let socket_path = config::default_control_socket_path();
    let control_delegate = Arc::clone(&delegate);
    tokio::spawn(async move {
        if let Err(e) = control::serve(&socket_path, control_delegate).await {
            tracing::error!("control channel exited: {e}");
        }
    });

    backend.start(node.current_peer_id().await).await?;

    let event_node = Arc::clone(&node);
    let event_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let Err(e) = event_node.handle_event(event).await {
                tracing::warn!("error handling transport event: {e}");
            }
        }
    });

    let sweep_node = Arc::clone(&node);
    let sweep_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
        loop {
            interval.tick().await;
            sweep_node.run_periodic_tasks().await;
        }
    });

    println!("bitchat node running, peer-id {}", node.current_peer_id().await.to_hex());
    println!("press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    println!("\nshutting down...");
    node.stop().await;
    event_task.abort();
    sweep_task.abort();
    Ok(())
}

/// Send a one-word command to the running daemon's control channel and
/// print its reply.
async fn query_daemon(command: &str) -> anyhow::Result<()> {
    let socket_path = config::default_control_socket_path();
    let reply = control::query(&socket_path, command).await?;
    print!("{reply}");
    Ok(())
}
