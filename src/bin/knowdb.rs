//! knowdb CLI
//!
//! ```bash
//! # Run a knowledge base and serve its RPC
//! knowdb serve --name notes --data-dir ./notes.db --listen 127.0.0.1:7700
//!
//! # Run a storage node for distributed backends
//! knowdb storage-node --data-dir ./node-a --listen 0.0.0.0:7800 --token s3cret
//!
//! # Ask a running instance for its status
//! knowdb status --remote http://127.0.0.1:7700
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use knowdb::server::{self, storage_router};
use knowdb::{EmbeddedBackend, EngineConfig, InstanceManager, LocalInstanceConfig};

#[derive(Parser)]
#[command(name = "knowdb")]
#[command(about = "Hybrid graph + vector memory store")]
#[command(version)]
struct Cli {
    /// Engine configuration (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an embedded knowledge base and serve the instance RPC
    Serve {
        /// Knowledge base name
        #[arg(long, default_value = "default")]
        name: String,

        /// Database directory
        #[arg(short, long)]
        data_dir: PathBuf,

        /// Address for the instance RPC
        #[arg(short, long, default_value = "127.0.0.1:7700")]
        listen: SocketAddr,
    },

    /// Serve the storage-node protocol over a local database
    StorageNode {
        /// Database directory
        #[arg(short, long)]
        data_dir: PathBuf,

        #[arg(short, long, default_value = "127.0.0.1:7800")]
        listen: SocketAddr,

        /// Bearer token clients must present
        #[arg(long, env = "KNOWDB_TOKEN")]
        token: Option<String>,
    },

    /// Print the status of a running instance as JSON
    Status {
        /// Instance address
        #[arg(short, long)]
        remote: String,
    },
}

#[tokio::main]
async fn main() -> knowdb::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("knowdb=info")))
        .init();

    let cli = Cli::parse();
    let engine = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    match cli.command {
        Commands::Serve { name, data_dir, listen } => {
            let manager = InstanceManager::new(engine.clone());
            let config = LocalInstanceConfig::embedded(name, data_dir).with_listen(listen).with_engine(engine);
            let handle = manager.ensure_local(config).await?;
            if let Some(instance) = handle.as_local() {
                info!(instance = %instance.id(), addr = ?instance.listen_addr(), "instance ready");
            }
            tokio::signal::ctrl_c().await?;
            info!("shutting down");
            manager.shutdown_all().await?;
        }

        Commands::StorageNode { data_dir, listen, token } => {
            let backend = Arc::new(EmbeddedBackend::open(data_dir, engine.conflict_retry).await?);
            let shutdown = CancellationToken::new();
            let router = storage_router(backend, token, engine.snapshot_lease());
            let (addr, task) = server::spawn(listen, router, shutdown.clone()).await?;
            info!(%addr, "storage node ready");
            tokio::signal::ctrl_c().await?;
            info!("shutting down");
            shutdown.cancel();
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "listener task aborted");
            }
        }

        Commands::Status { remote } => {
            let manager = InstanceManager::new(engine);
            let handle = manager.connect(&remote).await?;
            let status = handle.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(())
}
