#![deny(unsafe_code)]

//! Configuration loading and validation for onionctl.
//!
//! Loads TOML configuration files and validates them before any component
//! sees them. [`AppConfig`] is the central configuration structure; each
//! section maps onto one part of the control core (daemon supervision,
//! proxying, IPC, logging).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Top-level application configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Tor daemon supervision.
    #[serde(default)]
    pub tor: TorConfig,

    /// Request routing through the SOCKS port.
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Controller IPC socket.
    #[serde(default)]
    pub ipc: IpcConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// How the Tor daemon is launched and supervised.
///
/// ## TOML Example
///
/// ```toml
/// [tor]
/// binary = "/usr/bin/tor"
/// data_dir = "/var/lib/onionctl/tor"
/// socks_port = 0                 # 0 = pick a free port
/// bootstrap_timeout_ms = 120000
/// keep_running_in_background = true
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TorConfig {
    /// Tor executable, either a path or a name looked up on `PATH`.
    #[serde(default = "default_tor_binary")]
    pub binary: String,

    /// Daemon data directory (state, cached consensus, auth cookie).
    #[serde(default = "default_tor_data_dir")]
    pub data_dir: String,

    /// Control port on 127.0.0.1 (0 = auto-assign).
    #[serde(default)]
    pub control_port: u16,

    /// SOCKS port on 127.0.0.1 (0 = auto-assign).
    #[serde(default)]
    pub socks_port: u16,

    /// Upper bound on reaching 100% bootstrap, in milliseconds.
    #[serde(default = "default_bootstrap_timeout_ms")]
    pub bootstrap_timeout_ms: u64,

    /// Grace period between the shutdown request and a forced kill.
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,

    /// Keep the daemon running while the host application is backgrounded.
    #[serde(default)]
    pub keep_running_in_background: bool,

    /// Extra command-line arguments appended to the Tor invocation.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for TorConfig {
    fn default() -> Self {
        Self {
            binary: default_tor_binary(),
            data_dir: default_tor_data_dir(),
            control_port: 0,
            socks_port: 0,
            bootstrap_timeout_ms: default_bootstrap_timeout_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            keep_running_in_background: false,
            extra_args: Vec::new(),
        }
    }
}

impl TorConfig {
    /// Bootstrap timeout as a [`Duration`].
    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_millis(self.bootstrap_timeout_ms)
    }

    /// Stop grace period as a [`Duration`].
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    /// Data directory as a path.
    pub fn data_dir_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir)
    }
}

fn default_tor_binary() -> String {
    "tor".to_string()
}

fn default_tor_data_dir() -> String {
    "data/tor".to_string()
}

fn default_bootstrap_timeout_ms() -> u64 {
    120_000
}

fn default_stop_grace_ms() -> u64 {
    5_000
}

/// Settings for requests routed through the daemon's SOCKS port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Default end-to-end request timeout (SOCKS negotiation through body).
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Timeout for the local TCP connect to the SOCKS port.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Maximum accepted response body size.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Give every request its own circuit via unique SOCKS credentials.
    #[serde(default)]
    pub isolate_streams: bool,

    /// Accept self-signed or otherwise invalid TLS certificates (HTTPS only).
    #[serde(default)]
    pub accept_invalid_certs: bool,

    /// `User-Agent` sent when the request does not set one.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            max_body_bytes: default_max_body_bytes(),
            isolate_streams: false,
            accept_invalid_certs: false,
            user_agent: default_user_agent(),
        }
    }
}

impl ProxyConfig {
    /// Request timeout as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Connect timeout as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn default_request_timeout_ms() -> u64 {
    60_000
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_max_body_bytes() -> usize {
    8 * 1024 * 1024 // 8 MiB
}

fn default_user_agent() -> String {
    format!("onionctl/{}", env!("CARGO_PKG_VERSION"))
}

/// Controller IPC configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcConfig {
    /// Unix domain socket the controller listens on.
    #[serde(default = "default_socket_path")]
    pub socket_path: String,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
        }
    }
}

fn default_socket_path() -> String {
    "/tmp/onionctl.sock".to_string()
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "debug", "trace").
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from a TOML file at the given path using async I/O.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let tor = &self.tor;
        if tor.binary.is_empty() {
            return Err(ConfigError::Validation(
                "tor.binary must not be empty".to_string(),
            ));
        }
        if tor.data_dir.is_empty() {
            return Err(ConfigError::Validation(
                "tor.data_dir must not be empty".to_string(),
            ));
        }
        if tor.bootstrap_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "tor.bootstrap_timeout_ms must be non-zero".to_string(),
            ));
        }
        if tor.stop_grace_ms == 0 {
            return Err(ConfigError::Validation(
                "tor.stop_grace_ms must be non-zero".to_string(),
            ));
        }
        if tor.control_port != 0 && tor.control_port == tor.socks_port {
            return Err(ConfigError::Validation(format!(
                "tor.control_port and tor.socks_port must differ, both are {}",
                tor.control_port
            )));
        }

        let proxy = &self.proxy;
        if proxy.request_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "proxy.request_timeout_ms must be non-zero".to_string(),
            ));
        }
        if proxy.connect_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "proxy.connect_timeout_ms must be non-zero".to_string(),
            ));
        }
        if proxy.max_body_bytes == 0 {
            return Err(ConfigError::Validation(
                "proxy.max_body_bytes must be non-zero".to_string(),
            ));
        }

        if self.ipc.socket_path.is_empty() {
            return Err(ConfigError::Validation(
                "ipc.socket_path must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}
