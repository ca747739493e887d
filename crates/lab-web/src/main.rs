//! Lab Web Dashboard - Binary entry point

use anyhow::Context;
use clap::Parser;
use lab_core::LabConfig;
use lab_web::{AppState, Config, build_registry, serve};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Control plane for the lab dashboard.
#[derive(Debug, Parser)]
#[command(name = "lab-web", version, about)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, env = "LAB_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on, overriding the config file
    #[arg(short, long, env = "LAB_PORT")]
    port: Option<u16>,

    /// Directory of the built dashboard, overriding the config file
    #[arg(long, env = "LAB_STATIC_DIR")]
    static_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lab_web=info,lab_core=info,lab_adapters=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let lab_config = match &cli.config {
        Some(path) => LabConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => LabConfig::default(),
    };

    let mut config = Config::from(&lab_config.server);
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(static_dir) = cli.static_dir {
        config.static_dir = Some(static_dir);
    }

    let registry = build_registry(&lab_config);
    tracing::info!(
        stacks = ?registry.names(),
        "Starting Lab Web Dashboard on http://{}:{}",
        config.host,
        config.port
    );

    serve(config, AppState::new(registry)).await
}
