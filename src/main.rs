//! camwire - camera control and preview streaming server.
//!
//! ```bash
//! camwire --config camwire.toml
//! camwire --host 127.0.0.1 --port 9000 --log-level debug
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use camwire::{ServerBuilder, ServerConfig, SimulatedCamera};
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "camwire", version, about = "Camera control and preview streaming server")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address (overrides tcp.host)
    #[arg(long)]
    host: Option<String>,

    /// Listen port (overrides tcp.port)
    #[arg(short, long)]
    port: Option<u16>,

    /// Log filter used when RUST_LOG is unset (overrides logging.level)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ServerConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => ServerConfig::default(),
    };
    if let Some(host) = args.host {
        config.tcp.host = host;
    }
    if let Some(port) = args.port {
        config.tcp.port = port;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    init_tracing(&config.logging.level);

    let camera = SimulatedCamera::new(config.camera.simulated_width, config.camera.simulated_height);
    let server = ServerBuilder::new()
        .config(config)
        .camera(camera)
        .bind()
        .await
        .context("failed to start server")?;

    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Waiting for Ctrl-C failed: {}", e);
            }
        })
        .await?;
    Ok(())
}

fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
