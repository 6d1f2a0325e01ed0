use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use portico::config::PorticoConfig;
use portico::gateway::GatewayServer;

/// Rate-limited HTTP gateway for a single-page application and its API.
#[derive(Parser, Debug)]
#[command(name = "portico", version)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Trust X-Forwarded-For / X-Real-IP from a reverse proxy
    #[arg(long)]
    proxy: bool,

    /// API requests allowed per client per window (0 disables limiting)
    #[arg(long)]
    limit: Option<u64>,

    /// Maximum concurrent requests (0 disables the throttle)
    #[arg(long)]
    throttle: Option<usize>,

    /// Directory holding the SPA bundle
    #[arg(long)]
    public_dir: Option<PathBuf>,

    /// Include panic details in 500 responses
    #[arg(long)]
    debug: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

impl Args {
    /// Command-line flags take precedence over file and environment settings.
    fn apply(&self, config: &mut PorticoConfig) {
        if let Some(bind) = self.bind {
            config.server.bind = bind;
        }
        if self.proxy {
            config.server.proxy = true;
        }
        if let Some(limit) = self.limit {
            config.rate_limiting.limit = limit;
        }
        if let Some(throttle) = self.throttle {
            config.server.throttle = throttle;
        }
        if let Some(dir) = &self.public_dir {
            config.server.public_dir = dir.clone();
        }
        if self.debug {
            config.server.debug = true;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    if args.log_json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }

    info!("Starting Portico gateway");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = PorticoConfig::load(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;

    info!(
        bind = %config.server.bind,
        limit = config.rate_limiting.limit,
        interval = ?config.rate_limiting.interval(),
        proxy = config.server.proxy,
        "Configuration loaded"
    );

    let server = GatewayServer::new(config)?;

    if let Err(e) = server.serve_with_shutdown(shutdown_signal()).await {
        error!(error = %e, "Gateway failed");
        return Err(e.into());
    }

    info!("Portico gateway stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
