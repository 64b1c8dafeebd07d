//! Server configuration: TOML file + CLI overrides.

use crate::session::{HostOptions, SpawnSpec};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use termlink_core::{BridgeError, BridgeResult};
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub pty: PtySection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Seconds a detached session survives.
    #[serde(default = "default_grace_period")]
    pub grace_period: u64,
    #[serde(default = "default_ring_buffer_size")]
    pub ring_buffer_size: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            path: default_path(),
            max_sessions: default_max_sessions(),
            grace_period: default_grace_period(),
            ring_buffer_size: default_ring_buffer_size(),
        }
    }
}

/// `[pty]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct PtySection {
    /// Command to run; `$SHELL` or `/bin/sh` when unset.
    pub shell: Option<String>,
    /// Working directory; the home directory when unset.
    pub cwd: Option<String>,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default = "default_term")]
    pub term: String,
}

impl Default for PtySection {
    fn default() -> Self {
        Self {
            shell: None,
            cwd: None,
            cols: default_cols(),
            rows: default_rows(),
            term: default_term(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    7681
}
fn default_path() -> String {
    "/terminal".to_string()
}
fn default_max_sessions() -> usize {
    64
}
fn default_grace_period() -> u64 {
    300
}
fn default_ring_buffer_size() -> usize {
    256 * 1024
}
fn default_cols() -> u16 {
    80
}
fn default_rows() -> u16 {
    24
}
fn default_term() -> String {
    "xterm-256color".to_string()
}

/// Values given on the command line; each one wins over the file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub path: Option<String>,
    pub max_sessions: Option<usize>,
    pub grace_period: Option<u64>,
    pub ring_buffer_size: Option<usize>,
    pub shell: Option<String>,
    pub cwd: Option<String>,
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Upgrade endpoint path, always starting with `/`.
    pub path: String,
    pub max_sessions: usize,
    pub grace_period: Duration,
    pub ring_buffer_size: usize,
    pub shell: String,
    pub cwd: Option<PathBuf>,
    pub default_cols: u16,
    pub default_rows: u16,
    pub term: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::resolve(ConfigFile::default(), ConfigOverrides::default())
    }
}

impl ServerConfig {
    /// Load config from a TOML file (missing file means defaults), then
    /// apply CLI overrides.
    pub fn load(config_path: Option<&Path>, overrides: ConfigOverrides) -> BridgeResult<Self> {
        let file = match config_path.map(expand_tilde) {
            Some(path) if path.exists() => {
                info!(path = %path.display(), "loading config file");
                let content = std::fs::read_to_string(&path)?;
                toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| BridgeError::Config(format!("{}: {e}", path.display())))?
            }
            Some(path) => {
                info!(path = %path.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
            None => ConfigFile::default(),
        };
        Ok(Self::resolve(file, overrides))
    }

    fn resolve(file: ConfigFile, cli: ConfigOverrides) -> Self {
        let path = cli.path.unwrap_or(file.server.path);
        let path = if path.starts_with('/') {
            path
        } else {
            format!("/{path}")
        };
        let shell = cli
            .shell
            .or(file.pty.shell)
            .or_else(|| std::env::var("SHELL").ok().filter(|s| !s.is_empty()))
            .unwrap_or_else(|| "/bin/sh".to_string());
        let cwd = cli
            .cwd
            .or(file.pty.cwd)
            .map(|s| expand_tilde_str(&s))
            .or_else(dirs::home_dir);

        Self {
            host: cli.host.unwrap_or(file.server.host),
            port: cli.port.unwrap_or(file.server.port),
            path,
            max_sessions: cli.max_sessions.unwrap_or(file.server.max_sessions),
            grace_period: Duration::from_secs(cli.grace_period.unwrap_or(file.server.grace_period)),
            ring_buffer_size: cli.ring_buffer_size.unwrap_or(file.server.ring_buffer_size),
            shell,
            cwd,
            default_cols: file.pty.cols.max(1),
            default_rows: file.pty.rows.max(1),
            term: file.pty.term,
        }
    }

    /// Settings every PTY host is started with.
    pub fn host_options(&self) -> HostOptions {
        HostOptions {
            grace_period: self.grace_period,
            ring_buffer_size: self.ring_buffer_size,
        }
    }

    /// What a fresh session runs.
    pub fn spawn_spec(&self) -> SpawnSpec {
        SpawnSpec {
            command: self.shell.clone(),
            cwd: self.cwd.clone(),
            cols: self.default_cols,
            rows: self.default_rows,
            term: self.term.clone(),
        }
    }
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
