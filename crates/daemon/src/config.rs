//! Configuration management for the StayTerm server.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/stayterm/config.toml`.

use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ipc::{get_socket_path, get_user_socket_path, pidfile::get_pid_file_path};
use crate::session::{MultiplexerOptions, PtyOptions, SessionConfig};

/// Default listen port.
pub const DEFAULT_PORT: u16 = 2022;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("port must not be 0")]
    InvalidPort,

    #[error("bind_address must be an IP address, got {0}")]
    InvalidBindAddress(String),

    #[error("handshake_timeout_secs must be between 1 and 300, got {0}")]
    InvalidHandshakeTimeout(u64),

    #[error("poll_interval_ms must be between 1 and 1000, got {0}")]
    InvalidPollInterval(u64),

    #[error("read_buffer_size must be between 1 and 65536, got {0}")]
    InvalidReadBufferSize(usize),

    #[error("shutdown_grace_secs must be at most 60, got {0}")]
    InvalidShutdownGrace(u64),

    #[error("default_shell must be an absolute path to an existing file: {0}")]
    InvalidShellPath(String),

    #[error("default_path must not be empty")]
    EmptyDefaultPath,

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// An environment variable seen by [`Config::apply_env_overrides`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvOverride {
    /// `STAYTERM_PORT` replaced the listen port.
    Port(u16),
    /// `STAYTERM_PORT` was set but is not a port number; it was ignored.
    InvalidPort(String),
    /// `STAYTERM_LOG_LEVEL` replaced the log level.
    LogLevel(String),
}

impl EnvOverride {
    /// Report the override through the installed subscriber.
    pub fn log(&self) {
        match self {
            EnvOverride::Port(port) => {
                tracing::info!("Overriding port from environment: {}", port)
            }
            EnvOverride::InvalidPort(value) => {
                tracing::warn!("Ignoring invalid STAYTERM_PORT value: {}", value)
            }
            EnvOverride::LogLevel(level) => {
                tracing::info!("Overriding log_level from environment: {}", level)
            }
        }
    }
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the StayTerm server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Listener configuration.
    pub network: NetworkConfig,

    /// Shell session configuration.
    pub session: SessionSettings,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory for daemon state and log files.
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// PID file location. Defaults to the XDG data directory.
    pub pid_file: Option<PathBuf>,

    /// Registration socket location. Defaults to a system-wide path shared by all users.
    pub ipc_socket: Option<PathBuf>,
}

/// Listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to listen on.
    pub bind_address: String,

    /// TCP port to listen on.
    pub port: u16,

    /// Seconds a new connection has to complete its handshake.
    pub handshake_timeout_secs: u64,
}

/// Shell session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionSettings {
    /// Shell for users whose account names none.
    pub default_shell: PathBuf,

    /// `PATH` exported to every shell.
    pub default_path: String,

    /// Upper bound on one readiness wait of the session loop, in milliseconds.
    pub poll_interval_ms: u64,

    /// Maximum bytes read from a PTY per iteration.
    pub read_buffer_size: usize,

    /// Seconds to wait after the listener closes before exiting.
    pub shutdown_grace_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            pid_file: None,
            ipc_socket: None,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            handshake_timeout_secs: 10,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            default_shell: PathBuf::from(crate::session::pty::DEFAULT_SHELL),
            default_path: crate::session::pty::DEFAULT_PATH.to_string(),
            poll_interval_ms: 10,
            read_buffer_size: 1024,
            shutdown_grace_secs: 3,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("stayterm")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("stayterm")
}

impl DaemonConfig {
    /// Resolved PID file path.
    pub fn pid_file_path(&self) -> PathBuf {
        self.pid_file.clone().unwrap_or_else(get_pid_file_path)
    }

    /// Resolved registration socket path.
    pub fn ipc_socket_path(&self) -> PathBuf {
        self.ipc_socket.clone().unwrap_or_else(get_socket_path)
    }

    /// Per-user socket to fall back to. Only the default path has one; an
    /// explicitly configured socket is used as is.
    pub fn ipc_socket_fallback(&self) -> Option<PathBuf> {
        match self.ipc_socket {
            Some(_) => None,
            None => Some(get_user_socket_path()),
        }
    }
}

impl NetworkConfig {
    /// Socket address to bind.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self
            .bind_address
            .parse()
            .map_err(|_| ConfigError::InvalidBindAddress(self.bind_address.clone()))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    /// Handshake deadline.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

impl SessionSettings {
    /// Grace period of the halt sequence.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Runtime settings for spawning and running sessions.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            pty: PtyOptions {
                default_shell: self.default_shell.clone(),
                default_path: self.default_path.clone(),
            },
            multiplexer: MultiplexerOptions {
                poll_interval: Duration::from_millis(self.poll_interval_ms),
                read_buffer_size: self.read_buffer_size,
            },
        }
    }
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - STAYTERM_PORT: Override listen port
    /// - STAYTERM_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    ///
    /// This runs before logging is set up, so what was applied is returned
    /// for the caller to log.
    pub fn apply_env_overrides(&mut self) -> Vec<EnvOverride> {
        let mut applied = Vec::new();

        if let Ok(port) = std::env::var("STAYTERM_PORT") {
            if !port.is_empty() {
                match port.parse::<u16>() {
                    Ok(port) => {
                        self.network.port = port;
                        applied.push(EnvOverride::Port(port));
                    }
                    Err(_) => applied.push(EnvOverride::InvalidPort(port)),
                }
            }
        }

        if let Ok(level) = std::env::var("STAYTERM_LOG_LEVEL") {
            if !level.is_empty() {
                self.daemon.log_level = level.clone();
                applied.push(EnvOverride::LogLevel(level));
            }
        }

        applied
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.port == 0 {
            return Err(ConfigError::InvalidPort);
        }

        self.network.listen_addr()?;

        let timeout = self.network.handshake_timeout_secs;
        if !(1..=300).contains(&timeout) {
            return Err(ConfigError::InvalidHandshakeTimeout(timeout));
        }

        let poll = self.session.poll_interval_ms;
        if !(1..=1000).contains(&poll) {
            return Err(ConfigError::InvalidPollInterval(poll));
        }

        let buffer = self.session.read_buffer_size;
        if !(1..=65536).contains(&buffer) {
            return Err(ConfigError::InvalidReadBufferSize(buffer));
        }

        if self.session.shutdown_grace_secs > 60 {
            return Err(ConfigError::InvalidShutdownGrace(
                self.session.shutdown_grace_secs,
            ));
        }

        let shell = &self.session.default_shell;
        if !shell.is_absolute() || !shell.is_file() {
            return Err(ConfigError::InvalidShellPath(shell.display().to_string()));
        }

        if self.session.default_path.is_empty() {
            return Err(ConfigError::EmptyDefaultPath);
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
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

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.daemon.log_level, "info");
        assert!(config.daemon.data_dir.to_string_lossy().contains("stayterm"));
        assert_eq!(config.network.port, 2022);
        assert_eq!(config.network.bind_address, "0.0.0.0");
        assert_eq!(config.session.default_shell, PathBuf::from("/bin/sh"));
        assert_eq!(config.session.default_path, "/usr/local/bin:/bin:/usr/bin");
        assert_eq!(config.session.poll_interval_ms, 10);
        assert_eq!(config.session.shutdown_grace_secs, 3);
        assert_eq!(
            config.daemon.ipc_socket_path(),
            PathBuf::from(crate::ipc::SYSTEM_SOCKET_PATH)
        );
        assert!(config.daemon.ipc_socket_fallback().is_some());
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[network]
port = 4022

[session]
poll_interval_ms = 25
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.network.port, 4022);
        assert_eq!(config.network.bind_address, "0.0.0.0");
        assert_eq!(config.session.poll_interval_ms, 25);
        assert_eq!(config.session.read_buffer_size, 1024);
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[daemon]
data_dir = "/var/lib/stayterm"
log_level = "debug"
pid_file = "/run/stayterm.pid"
ipc_socket = "/run/stayterm/register.sock"

[network]
bind_address = "127.0.0.1"
port = 2222
handshake_timeout_secs = 5

[session]
default_shell = "/bin/bash"
default_path = "/usr/bin:/bin"
poll_interval_ms = 20
read_buffer_size = 4096
shutdown_grace_secs = 1
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.data_dir, PathBuf::from("/var/lib/stayterm"));
        assert_eq!(config.daemon.pid_file_path(), PathBuf::from("/run/stayterm.pid"));
        assert_eq!(
            config.daemon.ipc_socket_path(),
            PathBuf::from("/run/stayterm/register.sock")
        );
        assert!(config.daemon.ipc_socket_fallback().is_none());
        assert_eq!(
            config.network.listen_addr().unwrap(),
            "127.0.0.1:2222".parse().unwrap()
        );
        assert_eq!(config.network.handshake_timeout(), Duration::from_secs(5));
        assert_eq!(config.session.shutdown_grace(), Duration::from_secs(1));

        let session = config.session.session_config();
        assert_eq!(session.pty.default_shell, PathBuf::from("/bin/bash"));
        assert_eq!(session.pty.default_path, "/usr/bin:/bin");
        assert_eq!(session.multiplexer.poll_interval, Duration::from_millis(20));
        assert_eq!(session.multiplexer.read_buffer_size, 4096);
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let result = Config::from_toml("[network\nport = 1");
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Invalid TOML configuration"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let result = Config::from_toml("[network]\nport = \"not a number\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let config = Config::from_toml("[network]\nport = 3000\nsignaling_url = \"x\"").unwrap();
        assert_eq!(config.network.port, 3000);
    }

    #[test]
    fn test_roundtrip() {
        let mut config = Config::default();
        config.network.port = 9022;
        config.daemon.pid_file = Some(PathBuf::from("/tmp/stayterm.pid"));

        let toml = config.to_toml().unwrap();
        assert_eq!(Config::from_toml(&toml).unwrap(), config);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(dir.path().join("missing.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.session.default_path = "/opt/bin:/usr/bin".to_string();
        config.save(&path).unwrap();

        assert!(path.exists());
        assert_eq!(Config::load(&path).unwrap(), config);
    }

    #[test]
    fn test_load_invalid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "this is not toml ===").unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with("stayterm/config.toml"));
    }

    #[test]
    #[serial]
    fn test_env_override_port() {
        std::env::set_var("STAYTERM_PORT", "7022");
        let mut config = Config::default();
        let applied = config.apply_env_overrides();
        std::env::remove_var("STAYTERM_PORT");

        assert_eq!(config.network.port, 7022);
        assert_eq!(applied, vec![EnvOverride::Port(7022)]);
    }

    #[test]
    #[serial]
    fn test_env_override_invalid_port_ignored() {
        std::env::set_var("STAYTERM_PORT", "not-a-port");
        let mut config = Config::default();
        let applied = config.apply_env_overrides();
        std::env::remove_var("STAYTERM_PORT");

        assert_eq!(config.network.port, DEFAULT_PORT);
        assert_eq!(
            applied,
            vec![EnvOverride::InvalidPort("not-a-port".to_string())]
        );
    }

    #[test]
    #[serial]
    fn test_env_override_log_level() {
        std::env::set_var("STAYTERM_LOG_LEVEL", "trace");
        let mut config = Config::default();
        let applied = config.apply_env_overrides();
        std::env::remove_var("STAYTERM_LOG_LEVEL");

        assert_eq!(config.daemon.log_level, "trace");
        assert_eq!(applied, vec![EnvOverride::LogLevel("trace".to_string())]);
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        std::env::set_var("STAYTERM_LOG_LEVEL", "");
        std::env::set_var("STAYTERM_PORT", "");
        let mut config = Config::default();
        let applied = config.apply_env_overrides();
        std::env::remove_var("STAYTERM_LOG_LEVEL");
        std::env::remove_var("STAYTERM_PORT");

        assert_eq!(config, Config::default());
        assert!(applied.is_empty());
    }

    #[test]
    fn test_validate_default_config() {
        assert_eq!(Config::default().validate(), Ok(()));
    }

    #[test]
    fn test_validate_port_zero() {
        let mut config = Config::default();
        config.network.port = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidPort));
    }

    #[test]
    fn test_validate_bind_address() {
        let mut config = Config::default();
        config.network.bind_address = "localhost".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidBindAddress("localhost".to_string()))
        );

        config.network.bind_address = "::1".to_string();
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_validate_handshake_timeout_bounds() {
        let mut config = Config::default();
        config.network.handshake_timeout_secs = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidHandshakeTimeout(0)));

        config.network.handshake_timeout_secs = 300;
        assert_eq!(config.validate(), Ok(()));

        config.network.handshake_timeout_secs = 301;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidHandshakeTimeout(301))
        );
    }

    #[test]
    fn test_validate_session_bounds() {
        let mut config = Config::default();
        config.session.poll_interval_ms = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidPollInterval(0)));

        let mut config = Config::default();
        config.session.read_buffer_size = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidReadBufferSize(0)));

        let mut config = Config::default();
        config.session.shutdown_grace_secs = 61;
        assert_eq!(config.validate(), Err(ConfigError::InvalidShutdownGrace(61)));

        let mut config = Config::default();
        config.session.default_path.clear();
        assert_eq!(config.validate(), Err(ConfigError::EmptyDefaultPath));
    }

    #[test]
    fn test_validate_shell_path() {
        let mut config = Config::default();
        config.session.default_shell = PathBuf::from("sh");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidShellPath(_))
        ));

        config.session.default_shell = PathBuf::from("/nonexistent/shell");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidShellPath(_))
        ));
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = Config::default();
        config.daemon.log_level = "DEBUG".to_string();
        assert_eq!(config.validate(), Ok(()));

        config.daemon.log_level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );
    }
}
