//! termlink: attach a local terminal to a termlink server.
//!
//! Sessions outlive the connection: detach with Ctrl+] (or lose the
//! network) and reattach later with the printed session id.

mod commands;
mod config;
mod terminal;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::EnvFilter;

use commands::attach::Outcome;

/// termlink client
#[derive(Parser)]
#[command(name = "termlink", version, about = "Attach to a persistent remote terminal session")]
struct Cli {
    /// Config file path [default: ~/.termlink/client.toml]
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Open an interactive session, or reattach to one
    Attach {
        /// Server endpoint, e.g. ws://host:7681/terminal
        url: Option<String>,

        /// Session id printed by an earlier detach
        #[arg(short, long)]
        session: Option<String>,

        /// Wait for the server to start accepting connections
        #[arg(short, long)]
        wait: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli.config.clone().unwrap_or_else(config::default_path);
    let cfg = match config::Config::load(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("termlink: {e:#}");
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Command::Attach { url, session, wait } => {
            let url = url.unwrap_or(cfg.default.url);
            commands::attach::run(&url, session.as_deref(), wait).await
        }
    };

    match result {
        Ok(Outcome::Detached(Some(id))) => {
            eprintln!("\r\nDetached. Reattach with: termlink attach --session {id}");
        }
        Ok(Outcome::Detached(None)) => eprintln!("\r\nDetached."),
        Ok(Outcome::Exited(code)) => {
            eprintln!("\r\nSession ended with code {code}.");
            std::process::exit(code);
        }
        Err(e) => {
            error!("{:#}", e);
            eprintln!("termlink: {e:#}");
            std::process::exit(1);
        }
    }
}
