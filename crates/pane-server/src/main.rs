//! paned: PTY pane server.
//!
//! Keeps shell panes alive while UI clients detach and reattach over
//! WebSocket or a local Unix socket.

mod config;
mod server;
mod session;
mod transport;

use clap::Parser;
use config::{Overrides, ServerConfig};
use server::PaneServer;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// paned: persistent terminal panes
#[derive(Parser, Debug)]
#[command(name = "paned", version, about = "Persistent PTY pane server")]
struct Cli {
    /// Config file path (default ~/.paned/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// WebSocket listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Unix socket path
    #[arg(long)]
    socket: Option<String>,

    /// Shell executable for new panes
    #[arg(long)]
    shell: Option<String>,

    /// Bytes of output kept per detached pane
    #[arg(long)]
    buffer_capacity: Option<usize>,

    /// Maximum concurrent panes
    #[arg(long)]
    max_panes: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting paned");

    let overrides = Overrides {
        listen: cli.listen,
        socket: cli.socket,
        shell: cli.shell,
        buffer_capacity: cli.buffer_capacity,
        max_panes: cli.max_panes,
    };
    let server_config = match ServerConfig::load(cli.config.as_deref(), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let server = Arc::new(PaneServer::new(server_config));

    tokio::select! {
        result = server.clone().run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                server.shutdown().await;
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    server.shutdown().await;
    info!("paned stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
