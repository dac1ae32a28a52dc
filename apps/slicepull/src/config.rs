//! Ingest configuration.
//!
//! Stored as TOML. Unless a path is given on the command line (or via
//! `SLICEPULL_CONFIG`), it lives at:
//! - Linux: `~/.config/slicepull/config.toml`
//! - Windows: `%APPDATA%/slicepull/config.toml`

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use slicepull_server::ServerConfig;

/// Ingest configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Bytes pulled per chunk request.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// Seconds without progress before a session is failed.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Seconds a finished session keeps answering a redelivered start.
    #[serde(default = "default_done_grace_secs")]
    pub done_grace_secs: u64,

    /// Malformed messages tolerated per session.
    #[serde(default = "default_max_violations")]
    pub max_violations: u32,

    /// Directory ingested files are written to.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Reject files that are not PNG, ZIP, JPEG or VHDX.
    #[serde(default)]
    pub require_known_format: bool,
}

fn default_chunk_size() -> u64 {
    ServerConfig::default().chunk_size
}

fn default_idle_timeout_secs() -> u64 {
    ServerConfig::default().idle_timeout.as_secs()
}

fn default_done_grace_secs() -> u64 {
    ServerConfig::default().done_grace.as_secs()
}

fn default_max_violations() -> u32 {
    ServerConfig::default().max_violations
}

fn default_output_dir() -> String {
    "ingested".into()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            idle_timeout_secs: default_idle_timeout_secs(),
            done_grace_secs: default_done_grace_secs(),
            max_violations: default_max_violations(),
            output_dir: default_output_dir(),
            require_known_format: false,
        }
    }
}

impl Config {
    /// Loads the configuration at `path`, writing the defaults there if
    /// the file does not exist yet.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            tracing::debug!(path = %path.display(), "configuration loaded");
            config
        } else {
            let config = Config::default();
            config.save(path)?;
            config
        };
        config.validate()?;
        Ok(config)
    }

    /// Writes the configuration to `path`.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.chunk_size == 0 {
            anyhow::bail!("chunk_size must be greater than zero");
        }
        if self.idle_timeout_secs == 0 {
            anyhow::bail!("idle_timeout_secs must be greater than zero");
        }
        Ok(())
    }

    /// Chunking policy handed to the ingest server.
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            chunk_size: self.chunk_size,
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            done_grace: Duration::from_secs(self.done_grace_secs),
            max_violations: self.max_violations,
        }
    }
}

/// Resolves the configuration file path.
pub fn config_path(explicit: Option<&Path>) -> PathBuf {
    explicit.map_or_else(default_config_path, Path::to_path_buf)
}

fn default_config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata).join("slicepull").join("config.toml")
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home)
            .join(".config")
            .join("slicepull")
            .join("config.toml")
    }
}
