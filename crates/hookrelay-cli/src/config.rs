//! Configuration file handling for hookrelay

use anyhow::{Context, Result};
use hookrelay::{BackoffConfig, PayloadMode, RelayConfig, DEFAULT_CHANNEL_HOST};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_PATH: &str = "/";

/// Configuration for the CLI tool
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Default channel URL
    pub url: Option<String>,
    /// Full target URL, takes precedence over port and path
    pub target: Option<String>,
    /// Local port to forward to
    pub port: Option<u16>,
    /// Local path to forward to
    pub path: Option<String>,
    /// Treat event data as a smee JSON envelope
    pub envelope: Option<bool>,
    /// Event types to forward
    pub events: Option<Vec<String>>,
    /// Host asked for a new channel when no URL is given
    pub channel_host: Option<String>,
    /// Disable colored output
    pub no_color: Option<bool>,
    /// Reconnect backoff
    pub backoff: Option<BackoffConfig>,
    /// Forward request timeout in milliseconds
    pub forward_timeout_ms: Option<u64>,
    /// Upstream connect and response-header timeout in milliseconds
    pub connect_timeout_ms: Option<u64>,
}

/// Values given on the command line
#[derive(Debug, Clone, Default)]
pub struct ArgOverrides<'a> {
    pub url: Option<&'a str>,
    pub target: Option<&'a str>,
    pub port: Option<u16>,
    pub path: Option<&'a str>,
    pub envelope: bool,
    pub events: &'a [String],
    pub channel_host: Option<&'a str>,
    pub no_color: bool,
}

impl Config {
    /// Load configuration from the default config file
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Get the default config file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?
            .join("hookrelay");

        Ok(config_dir.join("config.toml"))
    }

    /// Merge CLI arguments over config file values
    pub fn merge_with_args(&self, args: &ArgOverrides<'_>) -> MergedConfig {
        let target = args
            .target
            .map(String::from)
            .or_else(|| self.target.clone())
            .unwrap_or_else(|| {
                let port = args.port.or(self.port).unwrap_or(DEFAULT_PORT);
                let path = args
                    .path
                    .map(String::from)
                    .or_else(|| self.path.clone())
                    .unwrap_or_else(|| DEFAULT_PATH.to_string());
                local_target(port, &path)
            });

        let events = if args.events.is_empty() {
            self.events.clone().unwrap_or_default()
        } else {
            args.events.to_vec()
        };

        MergedConfig {
            url: args.url.map(String::from).or_else(|| self.url.clone()),
            target,
            envelope: args.envelope || self.envelope.unwrap_or(false),
            events,
            channel_host: args
                .channel_host
                .map(String::from)
                .or_else(|| self.channel_host.clone())
                .unwrap_or_else(|| DEFAULT_CHANNEL_HOST.to_string()),
            no_color: args.no_color || self.no_color.unwrap_or(false),
            backoff: self.backoff.unwrap_or_default(),
            forward_timeout_ms: self.forward_timeout_ms,
            connect_timeout_ms: self.connect_timeout_ms,
        }
    }
}

fn local_target(port: u16, path: &str) -> String {
    if path.starts_with('/') {
        format!("http://127.0.0.1:{}{}", port, path)
    } else {
        format!("http://127.0.0.1:{}/{}", port, path)
    }
}

/// Fully resolved configuration after merging CLI args
#[derive(Debug, Clone)]
pub struct MergedConfig {
    /// Channel URL; `None` means a new channel is created
    pub url: Option<String>,
    pub target: String,
    pub envelope: bool,
    pub events: Vec<String>,
    pub channel_host: String,
    pub no_color: bool,
    pub backoff: BackoffConfig,
    pub forward_timeout_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
}

impl MergedConfig {
    /// Session configuration reading from `source`
    pub fn relay_config(&self, source: &str) -> RelayConfig {
        let mut config = RelayConfig::new(source, self.target.as_str()).with_events(&self.events);
        config.backoff = self.backoff;
        if let Some(timeout) = self.forward_timeout_ms {
            config.forward_timeout_ms = timeout;
        }
        if let Some(timeout) = self.connect_timeout_ms {
            config.connect_timeout_ms = timeout;
        }
        if self.envelope {
            config = config.with_payload(PayloadMode::Envelope);
        }
        config
    }
}
