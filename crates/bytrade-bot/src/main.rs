//! bytrade bot entry point.
//!
//! Connects the private stream, verifies the account and runs the configured
//! recurring orders until Ctrl-C.

use anyhow::Result;
use clap::Parser;
use tracing::info;

/// bytrade recurring-order bot
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (can also be set via BYTRADE_CONFIG env var)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize TLS crypto provider (must be before any WS connections)
    bytrade_ws::init_crypto();

    // Credentials may live in a local .env file
    dotenvy::dotenv().ok();

    let args = Args::parse();

    bytrade_telemetry::init_logging()?;

    info!("Starting bytrade bot v{}", env!("CARGO_PKG_VERSION"));

    // Config path: CLI arg > BYTRADE_CONFIG env var > default
    let config = match args.config {
        Some(path) => {
            info!(config_path = %path, "Loading configuration");
            bytrade_bot::AppConfig::from_file(&path)?
        }
        None => bytrade_bot::AppConfig::load()?,
    };
    info!(
        testnet = config.testnet,
        recurring = config.recurring.len(),
        "Configuration loaded"
    );

    let app = bytrade_bot::Application::new(config)?;
    app.run().await?;

    Ok(())
}
