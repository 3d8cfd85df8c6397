//! Registry storage server
//!
//! Run with: cargo run -p registry --features cli -- --config registry.toml

use camino::Utf8PathBuf;
use clap::Parser;
use registry::{Config, RegistryBuilder};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<Utf8PathBuf>,

    /// Override the storage root directory
    #[arg(short, long)]
    root: Option<Utf8PathBuf>,
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log.level));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if config.log.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(root) = cli.root {
        config.storage.root_directory = root;
    }

    init_tracing(&config);

    let registry = RegistryBuilder::new(config).build().await?;

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("received ctrl-c, shutting down"),
            Err(err) => tracing::error!(error = %err, "failed to listen for ctrl-c"),
        }
        shutdown.cancel();
    });

    registry.run(cancel).await?;
    Ok(())
}
