use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cc_broker::{Broker, BrokerConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "CloakChat routing broker", long_about = None)]
struct Cli {
    /// Host to bind to (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Port to bind to (overrides config)
    #[arg(long)]
    port: Option<u16>,

    /// Directory for durable broker state
    #[arg(long, default_value = "./server_data")]
    data_dir: PathBuf,

    /// Broker configuration file
    #[arg(long, default_value = "server_config.json")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let mut config = BrokerConfig::load(&cli.config);
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }

    let broker = Broker::new(config, cli.data_dir)?;
    broker.run().await
}
