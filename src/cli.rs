//! # Command Line Interface
//!
//! Argument parsing and command implementations for backsync.
//!
//! ## Commands
//!
//! - `init` - Create the configuration directory, a client config and a host key
//! - `keygen` - Generate a host key pair into a file
//! - `add` / `edit` / `remove` / `list` - Manage backup roots
//! - `sync` - Back every root up to every configured target
//! - `host` - Run the backup host

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use crate::config::{self, ClientConfig, HostConfig, HOST_KEY_FILE};
use crate::crypto::HostKey;
use crate::host;
use crate::roots::SyncPolicy;
use crate::status::{StatusAggregator, StatusSender};
use crate::sync::SyncEngine;
use crate::target::TargetRegistry;

#[derive(Parser, Debug)]
#[command(name = "backsync")]
#[command(about = "Timestamp-driven file backup between a client and a host")]
#[command(version = "1.0.0")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the client configuration and a host key
    Init,

    /// Generate a host key pair and print its public half
    Keygen {
        /// Where to write the key file
        file: PathBuf,
    },

    /// Add a file or directory to back up
    Add {
        path: PathBuf,
        /// all, push-only, pull-only, missing-only or contents-only
        #[arg(short, long, default_value = "all")]
        policy: SyncPolicy,
        /// Name of the tree on the host (defaults to the file or directory name)
        #[arg(short, long)]
        remote_name: Option<String>,
    },

    /// Change the policy or remote name of a backup root
    Edit {
        path: PathBuf,
        #[arg(short, long)]
        policy: Option<SyncPolicy>,
        #[arg(short, long)]
        remote_name: Option<String>,
    },

    /// Stop backing up a file or directory
    Remove { path: PathBuf },

    /// Show backup roots and targets
    List,

    /// Back up every root to every target
    Sync,

    /// Run the backup host
    Host {
        /// Host configuration file (defaults to host.toml in the config directory)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

pub async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Init => init().await,
        Commands::Keygen { file } => keygen(file).await,
        Commands::Add {
            path,
            policy,
            remote_name,
        } => add_root(path, policy, remote_name).await,
        Commands::Edit {
            path,
            policy,
            remote_name,
        } => edit_root(path, policy, remote_name).await,
        Commands::Remove { path } => remove_root(path).await,
        Commands::List => list().await,
        Commands::Sync => sync().await,
        Commands::Host { config } => run_host(config).await,
    }
}

pub async fn init() -> Result<()> {
    info!("Initializing backsync...");

    let config = ClientConfig::init().await?;
    info!("Configuration initialized at: {}", config.config_path().display());

    let key_path = config::config_dir()?.join(HOST_KEY_FILE);
    let key = if key_path.exists() {
        HostKey::load(&key_path)?
    } else {
        let key = HostKey::generate();
        key.save(&key_path)?;
        key
    };

    println!("✅ backsync initialized successfully!");
    println!("Client config: {}", config.config_path().display());
    println!("Host key:      {}", key_path.display());
    println!("Host public key: {}", key.public_key().to_hex());
    Ok(())
}

pub async fn keygen(file: PathBuf) -> Result<()> {
    if file.exists() {
        anyhow::bail!("Refusing to overwrite existing key file {}", file.display());
    }
    let key = HostKey::generate();
    key.save(&file)?;

    println!("🔑 Host key written to {}", file.display());
    println!("Public key: {}", key.public_key().to_hex());
    println!("\n💡 Put the public key in each client's [network] host_public_key.");
    Ok(())
}

pub async fn add_root(path: PathBuf, policy: SyncPolicy, remote_name: Option<String>) -> Result<()> {
    info!("Adding root: {}", path.display());

    let mut config = ClientConfig::load().await?;
    let root = config.add_root(&path, policy, remote_name)?;
    println!("✅ Added root: {}", root.path.display());
    println!("   Policy: {}", root.policy);
    println!("   Remote name: {}", root.remote_name());
    config.save().await?;
    Ok(())
}

pub async fn edit_root(path: PathBuf, policy: Option<SyncPolicy>, remote_name: Option<String>) -> Result<()> {
    if policy.is_none() && remote_name.is_none() {
        anyhow::bail!("Nothing to change. Pass --policy and/or --remote-name");
    }

    let mut config = ClientConfig::load().await?;
    let root = config.edit_root(&path, policy, remote_name)?;
    println!("✏️  Updated root: {}", root.path.display());
    println!("   Policy: {}", root.policy);
    println!("   Remote name: {}", root.remote_name());
    config.save().await?;
    Ok(())
}

pub async fn remove_root(path: PathBuf) -> Result<()> {
    let mut config = ClientConfig::load().await?;
    let removed = config.remove_root(&path)?;
    config.save().await?;
    println!("🗑️  Removed root: {}", removed.path.display());
    Ok(())
}

pub async fn list() -> Result<()> {
    let config = ClientConfig::load().await?;

    if config.roots().is_empty() {
        println!("No backup roots configured.");
        println!("\n💡 Add one with 'backsync add <path>'");
    } else {
        println!("📂 Backup roots ({}):\n", config.roots().len());
        for (i, root) in config.roots().iter().enumerate() {
            println!("{}. {}", i + 1, root.path.display());
            println!("   Policy: {}", root.policy);
            println!("   Remote name: {}", root.remote_name());
        }
    }

    let targets = config.target_entries();
    println!();
    if targets.is_empty() {
        println!("No targets configured.");
    } else {
        println!("🎯 Targets ({}):", targets.len());
        for entry in targets {
            match (&entry.path, &config.network) {
                (Some(path), _) => println!("   {} [{}] {}", entry.name, entry.kind, path.display()),
                (None, Some(network)) if entry.kind == "network" => {
                    println!("   {} [{}] {}", entry.name, entry.kind, network.address())
                }
                _ => println!("   {} [{}]", entry.name, entry.kind),
            }
        }
    }
    Ok(())
}

pub async fn sync() -> Result<()> {
    let config = ClientConfig::load().await?;
    if config.roots().is_empty() {
        anyhow::bail!("No backup roots. Add one first with 'backsync add <path>'");
    }

    let (status, rx) = StatusSender::new();
    let aggregator = StatusAggregator::new();
    let status_task = tokio::spawn(aggregator.clone().run(rx));

    let mut targets = config.build_targets(&TargetRegistry::default(), status.clone())?;
    let mut engine = SyncEngine::new(status);

    println!("🚀 Backing up {} root(s) to {} target(s)...", config.roots().len(), targets.len());
    let results = engine.run_all(config.roots(), &mut targets).await;

    drop(engine);
    drop(targets);
    if let Err(e) = status_task.await {
        error!("Status task ended abnormally: {}", e);
    }

    let mut problems = 0usize;
    for (name, result) in &results {
        match result {
            Ok(report) => {
                println!(
                    "✅ {}: {} pushed, {} pulled, {} skipped, {} directories",
                    name, report.pushed, report.pulled, report.skipped, report.directories
                );
                if !report.is_clean() {
                    problems += 1;
                    println!("   ⚠️  {} item(s) failed:", report.failed.len());
                    for item in &report.failed {
                        println!("      {}", item.path.display());
                    }
                }
            }
            Err(e) => {
                problems += 1;
                println!("❌ {}: {}", name, e);
            }
        }
    }

    info!("Final status: {:?}", aggregator.snapshot().phase);
    if problems > 0 {
        anyhow::bail!("{} of {} target(s) did not complete cleanly", problems, results.len());
    }
    Ok(())
}

pub async fn run_host(config_path: Option<PathBuf>) -> Result<()> {
    info!("Starting backup host...");

    let config = HostConfig::load(config_path.as_deref()).await?;
    let (status, rx) = StatusSender::new();
    let aggregator = StatusAggregator::new();
    tokio::spawn(aggregator.clone().run(rx));

    let ctx = Arc::new(config.context(status)?);
    if let crate::handshake::HostAuth::Secure { key, .. } = &ctx.auth {
        println!("Host public key: {}", key.public_key().to_hex());
    }

    let listener = host::bind_with_retry(&config.listen_addr(), config.bind_retry(), None).await?;
    println!("🚀 backsync host listening on {}", listener.local_addr()?);
    println!("📂 Storage root: {}", config.storage_root.display());
    println!("💚 Press Ctrl+C to stop.");

    tokio::select! {
        result = host::serve(listener, ctx) => result?,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            let clients = aggregator.snapshot().clients.len();
            println!("\n🛑 backsync host stopping ({} client(s) connected)...", clients);
        }
    }
    Ok(())
}
