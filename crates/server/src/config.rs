//! Configuration management for the podterm server.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/podterm/config.toml`.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use protocol::TerminalSize;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::discovery::StaticWorkload;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("listen must be a socket address like 0.0.0.0:8000, got {0}")]
    InvalidListenAddress(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("max_sessions must be between 1 and {MAX_SESSIONS_LIMIT}, got {0}")]
    InvalidMaxSessions(usize),

    #[error("shells must list at least one shell")]
    NoShells,

    #[error("terminal size must be non-zero, got {cols}x{rows}")]
    InvalidTerminalSize { cols: u16, rows: u16 },

    #[error("jwt_secret is not set (use [auth] jwt_secret or PODTERM_JWT_SECRET)")]
    MissingJwtSecret,

    #[error("leeway_secs must be at most {MAX_LEEWAY_SECS}, got {0}")]
    InvalidLeeway(u64),

    #[error("start_probe_ms must be at most {MAX_START_PROBE_MS}, got {0}")]
    InvalidStartProbe(u64),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

const MAX_SESSIONS_LIMIT: usize = 10_000;
const MAX_LEEWAY_SECS: u64 = 300;
const MAX_START_PROBE_MS: u64 = 10_000;

/// Main configuration structure for the podterm server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Listener and logging.
    pub server: ServerConfig,

    /// Terminal session settings.
    pub session: SessionConfig,

    /// Token validation.
    pub auth: AuthConfig,

    /// How shells reach the workload.
    pub exec: ExecConfig,

    /// How workloads are listed.
    pub discovery: DiscoveryConfig,
}

/// Listener and logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP server binds to.
    pub listen: String,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Terminal session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell candidates, tried in order until one starts.
    pub shells: Vec<String>,

    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,

    /// Initial terminal width.
    pub cols: u16,

    /// Initial terminal height.
    pub rows: u16,
}

/// Token validation settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuthConfig {
    /// Shared HS256 secret.
    pub jwt_secret: String,

    /// Allowed clock skew when checking `exp` and `nbf`.
    pub leeway_secs: u64,
}

/// Exec backend selection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecBackend {
    #[default]
    Kubectl,
    Local,
}

/// Exec backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecConfig {
    pub mode: ExecBackend,

    /// kubectl binary, looked up in PATH when relative.
    pub kubectl: PathBuf,

    /// Kubeconfig passed to kubectl. kubectl's own default when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<PathBuf>,

    /// Kubeconfig context. The current context when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,

    /// How long a new shell is watched for an immediate "not found" exit.
    pub start_probe_ms: u64,
}

/// Discovery backend selection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryBackend {
    #[default]
    Kubectl,
    Static,
}

/// Workload discovery configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub mode: DiscoveryBackend,

    /// Workloads served in `static` mode.
    pub workloads: Vec<StaticWorkload>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8000".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        let size = TerminalSize::default();
        Self {
            shells: vec!["bash".to_string(), "sh".to_string()],
            max_sessions: 100,
            cols: size.cols,
            rows: size.rows,
        }
    }
}

impl SessionConfig {
    /// The size new terminals start with.
    pub fn initial_size(&self) -> TerminalSize {
        TerminalSize::new(self.cols, self.rows)
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            leeway_secs: 30,
        }
    }
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            mode: ExecBackend::Kubectl,
            kubectl: PathBuf::from("kubectl"),
            kubeconfig: None,
            context: None,
            start_probe_ms: 300,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("podterm")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - PODTERM_LISTEN: Override the listen address
    /// - PODTERM_JWT_SECRET: Override the token secret
    /// - PODTERM_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Some(listen) = non_empty_var("PODTERM_LISTEN") {
            tracing::info!(listen = %listen, "Overriding listen address from environment");
            self.server.listen = listen;
        }

        if let Some(secret) = non_empty_var("PODTERM_JWT_SECRET") {
            tracing::info!("Overriding jwt_secret from environment");
            self.auth.jwt_secret = secret;
        }

        if let Some(level) = non_empty_var("PODTERM_LOG_LEVEL") {
            tracing::info!(level = %level, "Overriding log_level from environment");
            self.server.log_level = level;
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_addr()?;

        let level = self.server.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.server.log_level.clone()));
        }

        if !(1..=MAX_SESSIONS_LIMIT).contains(&self.session.max_sessions) {
            return Err(ConfigError::InvalidMaxSessions(self.session.max_sessions));
        }

        if self.session.shells.iter().all(|s| s.trim().is_empty()) {
            return Err(ConfigError::NoShells);
        }

        if self.session.cols == 0 || self.session.rows == 0 {
            return Err(ConfigError::InvalidTerminalSize {
                cols: self.session.cols,
                rows: self.session.rows,
            });
        }

        if self.auth.jwt_secret.is_empty() {
            return Err(ConfigError::MissingJwtSecret);
        }

        if self.auth.leeway_secs > MAX_LEEWAY_SECS {
            return Err(ConfigError::InvalidLeeway(self.auth.leeway_secs));
        }

        if self.exec.start_probe_ms > MAX_START_PROBE_MS {
            return Err(ConfigError::InvalidStartProbe(self.exec.start_probe_ms));
        }

        Ok(())
    }

    /// The parsed listen address.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.server
            .listen
            .parse()
            .map_err(|_| ConfigError::InvalidListenAddress(self.server.listen.clone()))
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
