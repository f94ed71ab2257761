//! adb-bridge: manage the host's device identity and run reverse tunnels
//!
//! - `keygen` creates `~/.android/adbkey` and `adbkey.pub`
//! - `pubkey` prints the public key line a device would store
//! - `forward` serves every configured `<local> -> <service>` rule

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tracing::{error, info};

use adb_bridge::config::Config;
use adb_bridge::credentials::CredentialStore;
use adb_bridge::forward::{ForwardRule, ForwardServer, TcpChannelOpener};
use adb_bridge::relay::RelayEndpoint;

#[derive(Parser)]
#[command(name = "adb-bridge")]
#[command(about = "Host identity and reverse tunnels for device sessions")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "adb-bridge.toml")]
    config: PathBuf,

    /// Directory holding adbkey / adbkey.pub
    #[arg(short, long, env = "ADB_BRIDGE_KEY_DIR")]
    key_dir: Option<PathBuf>,

    /// Label stored with a newly generated key
    #[arg(long, env = "ADB_BRIDGE_LABEL")]
    label: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a new identity
    Keygen {
        /// Overwrite an existing key. Devices that trusted it will ask again.
        #[arg(long)]
        force: bool,
    },
    /// Print the stored public key line
    Pubkey,
    /// Serve the configured forwarding rules until Ctrl-C
    Forward {
        /// Extra rule, e.g. "tcp:8899 -> tcp:127.0.0.1:9000"
        #[arg(short, long)]
        rule: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("adb_bridge=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let mut config = Config::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(key_dir) = cli.key_dir {
        config.credentials.key_dir = key_dir;
    }
    if let Some(label) = cli.label {
        config.credentials.label = Some(label);
    }

    let store = CredentialStore::from_config(&config.credentials);
    info!("Key dir: {}", store.key_dir().display());

    match cli.command {
        Command::Keygen { force } => keygen(&store, force).await,
        Command::Pubkey => {
            let key = store.load()?;
            print!("{}", key.public_key_line());
            Ok(())
        }
        Command::Forward { rule } => forward(&config, rule).await,
    }
}

async fn keygen(store: &CredentialStore, force: bool) -> anyhow::Result<()> {
    match store.load() {
        Ok(existing) if !force => {
            bail!(
                "{} already holds {} ({}); pass --force to replace it",
                store.private_key_path().display(),
                existing.label(),
                existing.fingerprint()
            );
        }
        Err(e) if !e.is_not_found() && !force => {
            return Err(e).context("existing key is unreadable; pass --force to replace it");
        }
        _ => {}
    }

    std::fs::create_dir_all(store.key_dir())
        .with_context(|| format!("creating {}", store.key_dir().display()))?;
    let key = store.generate_key().await?;
    println!("{} {}", key.fingerprint(), key.label());
    Ok(())
}

async fn forward(config: &Config, extra_rules: Vec<String>) -> anyhow::Result<()> {
    let mut rules = config
        .forward
        .iter()
        .map(ForwardRule::try_from)
        .collect::<Result<Vec<_>, _>>()?;
    for rule in &extra_rules {
        rules.push(rule.parse()?);
    }
    if rules.is_empty() {
        bail!("no forwarding rules configured");
    }

    let opener = Arc::new(TcpChannelOpener);
    let handler = Arc::new(RelayEndpoint::new(&config.relay));
    let (shutdown_tx, _) = broadcast::channel(1);

    let mut servers = Vec::new();
    for rule in rules {
        let server = ForwardServer::bind(rule, opener.clone(), handler.clone()).await?;
        info!(rule = %server.rule(), addr = ?server.local_addr().ok(), "Listening");
        servers.push(tokio::spawn(server.run(shutdown_tx.subscribe())));
    }

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("Shutting down");
    let _ = shutdown_tx.send(());

    for server in servers {
        if let Err(e) = server.await {
            error!(error = %e, "Forward task failed");
        }
    }
    Ok(())
}
