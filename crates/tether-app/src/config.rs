//! Deployment configuration, from flags or `TETHER_*` environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tether_pty::{ReapPolicy, SessionConfig};

use crate::auth::TokenSpec;

#[derive(Parser, Debug, Clone)]
#[command(name = "tether", version, about = "Terminal session broker")]
pub struct Config {
    /// Address to listen on
    #[arg(long, env = "TETHER_BIND", default_value = "127.0.0.1:7681")]
    pub bind: SocketAddr,

    /// Directory holding one sub-directory per project
    #[arg(long, env = "TETHER_WORKSPACE_ROOT", value_name = "PATH")]
    pub workspace_root: PathBuf,

    /// Tab ledger database (default: ~/.tether/tether.db)
    #[arg(long = "db", env = "TETHER_DB", value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// Shell to spawn (default: $SHELL or /bin/sh)
    #[arg(long, env = "TETHER_SHELL", value_name = "PATH")]
    pub shell: Option<String>,

    /// Scrollback kept per session, in bytes
    #[arg(long, env = "TETHER_SCROLLBACK_BYTES", default_value_t = tether_pty::DEFAULT_SCROLLBACK_BYTES)]
    pub scrollback_bytes: usize,

    /// Kill sessions with no attached client after this many idle seconds (0 disables)
    #[arg(long, env = "TETHER_IDLE_TIMEOUT_SECS", default_value_t = 86_400)]
    pub idle_timeout_secs: u64,

    /// Keep exited sessions this many seconds before reaping them
    #[arg(long, env = "TETHER_EXITED_RETENTION_SECS", default_value_t = 300)]
    pub exited_retention_secs: u64,

    /// Seconds between reaper passes
    #[arg(long, env = "TETHER_REAP_INTERVAL_SECS", default_value_t = 30)]
    pub reap_interval_secs: u64,

    /// Accepted credentials as principal=secret (repeatable)
    #[arg(long = "token", env = "TETHER_TOKENS", value_delimiter = ',', required = true)]
    pub tokens: Vec<TokenSpec>,
}

impl Config {
    /// Check the values clap cannot check on its own.
    pub fn validate(&self) -> Result<(), String> {
        if self.scrollback_bytes == 0 {
            return Err("scrollback capacity must be greater than zero".into());
        }
        if self.reap_interval_secs == 0 {
            return Err("reap interval must be greater than zero".into());
        }
        if !self.workspace_root.is_dir() {
            return Err(format!(
                "workspace root {} is not a directory",
                self.workspace_root.display()
            ));
        }
        Ok(())
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            shell: self.shell.clone(),
            scrollback_bytes: self.scrollback_bytes,
        }
    }

    pub fn reap_policy(&self) -> ReapPolicy {
        ReapPolicy {
            idle_timeout: (self.idle_timeout_secs > 0)
                .then(|| Duration::from_secs(self.idle_timeout_secs)),
            exited_retention: Duration::from_secs(self.exited_retention_secs),
        }
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    /// Ledger path, defaulting to `~/.tether/tether.db`.
    pub fn resolved_db_path(&self) -> Option<PathBuf> {
        self.db_path
            .clone()
            .or_else(|| home_dir().map(|home| home.join(".tether").join("tether.db")))
    }
}

/// Get the user's home directory.
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}
