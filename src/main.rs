use anyhow::{Context, Result};
use clap::Parser;
use sigrelay::{Backbone, BackboneConfig};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "sigrelay")]
#[command(about = "Signal store and announcer notification backbone")]
struct Cli {
    /// JSON configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides the signal listener port.
    #[arg(long)]
    listen_port: Option<u16>,

    /// Serves the status endpoint on this port.
    #[arg(long)]
    web_port: Option<u16>,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, default_value = "sigrelay=info,tower_http=info")]
    log: String,

    /// Seconds running deliveries get to finish on shutdown.
    #[arg(long, default_value_t = 10)]
    grace_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log);

    let mut config = match &cli.config {
        Some(path) => BackboneConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => BackboneConfig::default(),
    };
    if let Some(port) = cli.listen_port {
        config.listener.port = port;
    }
    if let Some(port) = cli.web_port {
        config.web.enabled = true;
        config.web.port = port;
    }

    let backbone = Backbone::start(config)
        .await
        .context("failed to start backbone")?;
    info!(
        listener = ?backbone.listener_addr(),
        web = ?backbone.web_addr(),
        clients = backbone.registry().len(),
        "sigrelay running"
    );

    shutdown_signal().await;

    let detached = backbone
        .shutdown(Duration::from_secs(cli.grace_secs))
        .await;
    info!(detached = detached, "sigrelay stopped");
    Ok(())
}

fn init_tracing(default_filter: &str) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "unable to install ctrl+c handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "unable to install sigterm handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
