//! termlink-server: serve persistent terminal sessions over WebSocket.

use clap::Parser;
use std::path::PathBuf;
use termlink_server::{ConfigOverrides, ServerConfig, TermlinkServer};
use tracing::{error, info, warn};

/// termlink-server: persistent terminal sessions over WebSocket
#[derive(Parser, Debug)]
#[command(name = "termlink-server", version, about = "Persistent terminal sessions over WebSocket")]
struct Cli {
    /// Listen address
    #[arg(long)]
    host: Option<String>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Upgrade endpoint path
    #[arg(long)]
    path: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.termlink/config.toml")]
    config: String,

    /// Maximum concurrent sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Seconds a detached session is kept alive
    #[arg(long)]
    grace_period: Option<u64>,

    /// Bytes of output kept for replay while detached
    #[arg(long)]
    ring_buffer_size: Option<usize>,

    /// Command to run for each session
    #[arg(long)]
    shell: Option<String>,

    /// Working directory for new sessions
    #[arg(long)]
    cwd: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting termlink-server");

    let overrides = ConfigOverrides {
        host: cli.host,
        port: cli.port,
        path: cli.path,
        max_sessions: cli.max_sessions,
        grace_period: cli.grace_period,
        ring_buffer_size: cli.ring_buffer_size,
        shell: cli.shell,
        cwd: cli.cwd,
    };
    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };
    info!(shell = %server_config.shell, "sessions will run");

    let server = TermlinkServer::new(server_config);
    if let Err(e) = server.run(shutdown_signal()).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }

    info!("termlink-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
