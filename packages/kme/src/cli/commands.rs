use crate::api::{bind, build_router, serve, ApiState};
use crate::config::KmeConfig;
use crate::error::{KmeError, Result};
use crate::manager::KeyManager;
use crate::types::EpochId;
use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;

/// Command line arguments
#[derive(Parser)]
#[command(name = "qkme-node")]
#[command(about = "Key management entity for QKD key material")]
pub struct Cli {
    /// TOML configuration file; `QKME_*` variables override it
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Command to run
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Node commands
#[derive(Clone, Subcommand)]
pub enum Commands {
    /// Serve the peer ledger replication endpoint (default)
    Serve,

    /// Print the pool status of the issuing channel as JSON
    Status,

    /// Add a file of raw key material to the pool as a new epoch
    Publish {
        /// Channel direction, defaults to the issuing channel
        #[arg(long)]
        channel: Option<String>,

        /// Epoch identifier
        #[arg(long)]
        epoch: String,

        /// File holding the raw key bytes
        #[arg(long)]
        file: PathBuf,
    },
}

/// Load configuration, connect and run the selected command
pub async fn run(cli: Cli) -> Result<()> {
    let config = KmeConfig::load(cli.config.as_deref())?;
    let manager = KeyManager::connect(config).await?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let settings = manager.config().server.clone();
            let state = ApiState::new(manager.receiver().clone(), &settings);
            let listener = bind(&settings).await?;
            serve(listener, &settings, build_router(state), shutdown_signal()).await
        }
        Commands::Status => {
            let status = manager.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Commands::Publish {
            channel,
            epoch,
            file,
        } => {
            let channel = channel.unwrap_or_else(|| manager.config().issue_channel.clone());
            let content = tokio::fs::read(&file).await.map_err(|e| {
                KmeError::invalid(format!("cannot read {}: {e}", file.display()))
            })?;
            let bytes = manager
                .producer()
                .publish(&channel, &EpochId::new(epoch), content)
                .await?;
            info!("Published {bytes} bytes from {}", file.display());
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
