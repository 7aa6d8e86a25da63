//! duplex-bridge CLI.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use duplex_bridge::{logging, relay, BridgeConfig};
use duplex_serial::{list, SystemSerialTransport};
use duplex_tcp::TokioSocketTransport;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "duplex-bridge")]
#[command(about = "Relay frames between TCP clients and a serial device", long_about = None)]
#[command(version)]
struct Cli {
    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `duplex_core=trace,info` (overrides RUST_LOG)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the serial devices that can be opened, as JSON
    List,
    /// Open the configured serial port and accept TCP clients
    Relay {
        /// Serial device path (overrides the config file)
        #[arg(long)]
        path: Option<String>,
        /// TCP port to listen on (overrides the config file)
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_level.as_deref())?;
    let mut config = BridgeConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::List => {
            let devices = list(SystemSerialTransport::new().as_ref())
                .await
                .context("Failed to enumerate serial devices")?;
            println!("{}", serde_json::to_string_pretty(&devices)?);
        }
        Commands::Relay { path, port } => {
            if let Some(path) = path {
                config.serial.path = path;
            }
            if let Some(port) = port {
                config.tcp.port = port;
            }
            let shutdown = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!("Failed to listen for ctrl-c: {}", e);
                    std::future::pending::<()>().await;
                }
                tracing::info!("shutting down");
            };
            relay::run(SystemSerialTransport::new(), TokioSocketTransport::new(), &config, shutdown).await?;
        }
    }

    Ok(())
}
