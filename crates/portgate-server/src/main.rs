//! `portgated` entry point

use clap::Parser;
use portgate_server::{Server, ServerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "portgated", about = "Portgate gateway server", version)]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long, default_value = "portgated.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = ServerConfig::load(&cli.config)?;
    let server = Arc::new(Server::new(config)?);

    let shutdown_server = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            shutdown_server.close().await;
        }
    });

    server.run().await?;
    Ok(())
}
