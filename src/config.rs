//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `TERMRELAY_LISTEN`, `TERMRELAY_TOKEN`,
//!    `TERMRELAY_SHELL`, `PORT`
//! 2. **Config file**: path via `--config <path>`, or `termrelay.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:3000"
//! replay_buffer_bytes = 50000
//! max_terminals_per_visitor = 20
//!
//! [auth]
//! token_lifetime_secs = 86400
//! rotation_interval_secs = 3600      # 0 = never rotate
//! grace_period_secs = 300
//! one_time = true
//!
//! [rate_limit]
//! max_attempts = 5
//! window_secs = 60
//! block_secs = 300
//!
//! [shell]
//! default_shell = "/bin/zsh"         # omit to use $SHELL
//!
//! [multiplexer]
//! enabled = true
//!
//! [logging]
//! level = "info"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Failure to read or parse a config file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub shell: ShellConfig,
    #[serde(default)]
    pub multiplexer: MultiplexerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and per-visitor resource settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:3000`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Bytes of recent output kept per terminal for reconnect replay (default 50 000).
    #[serde(default = "default_replay_buffer_bytes")]
    pub replay_buffer_bytes: usize,
    /// Maximum terminals one visitor may hold open (default 20).
    #[serde(default = "default_max_terminals")]
    pub max_terminals_per_visitor: usize,
    /// Initial PTY columns (default 80).
    #[serde(default = "default_cols")]
    pub default_cols: u16,
    /// Initial PTY rows (default 24).
    #[serde(default = "default_rows")]
    pub default_rows: u16,
    /// Outbound messages buffered per connection before it is considered
    /// too slow and dropped from the fan-out (default 1024).
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
    /// Use the first `X-Forwarded-For` entry as the client address. Enable only
    /// when a trusted tunnel or proxy terminates connections in front of us.
    #[serde(default)]
    pub trust_forwarded_for: bool,
}

/// Access token settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Fixed initial token. Override with `TERMRELAY_TOKEN`. When unset a
    /// random token is generated at startup.
    #[serde(default)]
    pub token: Option<String>,
    /// How long a token is accepted after issuance (default 24 h).
    #[serde(default = "default_token_lifetime")]
    pub token_lifetime_secs: u64,
    /// Automatic rotation interval in seconds; 0 disables rotation (default 3600).
    #[serde(default = "default_rotation_interval")]
    pub rotation_interval_secs: u64,
    /// How long the previous token stays valid after a rotation (default 300).
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,
    /// One link, one user: a token is bound to the first visitor that uses it.
    #[serde(default = "default_true")]
    pub one_time: bool,
}

/// Brute-force throttling of failed handshakes.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Failures within `window_secs` that trigger a block (default 5).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Sliding window length in seconds (default 60).
    #[serde(default = "default_window")]
    pub window_secs: u64,
    /// Block duration in seconds (default 300).
    #[serde(default = "default_block")]
    pub block_secs: u64,
    /// Seconds between sweeps of expired records (default 60).
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

/// Shell used for plain terminals.
#[derive(Debug, Clone, Deserialize)]
pub struct ShellConfig {
    /// Preferred shell. Falls back to `$SHELL`, then zsh, bash, sh.
    #[serde(default)]
    pub default_shell: Option<String>,
    /// Working directory for new terminals (default `~`).
    #[serde(default = "default_working_dir")]
    pub working_dir: String,
}

/// tmux integration.
#[derive(Debug, Clone, Deserialize)]
pub struct MultiplexerConfig {
    /// Probe for tmux at startup (default true). When false, every
    /// multiplexer request fails with `NotAvailable`.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:3000".to_string()
}
fn default_replay_buffer_bytes() -> usize {
    50_000
}
fn default_max_terminals() -> usize {
    20
}
fn default_cols() -> u16 {
    80
}
fn default_rows() -> u16 {
    24
}
fn default_outbound_queue() -> usize {
    1024
}
fn default_token_lifetime() -> u64 {
    24 * 60 * 60
}
fn default_rotation_interval() -> u64 {
    60 * 60
}
fn default_grace_period() -> u64 {
    5 * 60
}
fn default_true() -> bool {
    true
}
fn default_max_attempts() -> u32 {
    5
}
fn default_window() -> u64 {
    60
}
fn default_block() -> u64 {
    300
}
fn default_cleanup_interval() -> u64 {
    60
}
fn default_working_dir() -> String {
    "~".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            replay_buffer_bytes: default_replay_buffer_bytes(),
            max_terminals_per_visitor: default_max_terminals(),
            default_cols: default_cols(),
            default_rows: default_rows(),
            outbound_queue: default_outbound_queue(),
            trust_forwarded_for: false,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token: None,
            token_lifetime_secs: default_token_lifetime(),
            rotation_interval_secs: default_rotation_interval(),
            grace_period_secs: default_grace_period(),
            one_time: true,
        }
    }
}

impl AuthConfig {
    pub fn lifetime(&self) -> Duration {
        Duration::from_secs(self.token_lifetime_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    /// `None` when rotation is disabled.
    pub fn rotation_interval(&self) -> Option<Duration> {
        (self.rotation_interval_secs > 0).then(|| Duration::from_secs(self.rotation_interval_secs))
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            window_secs: default_window(),
            block_secs: default_block(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            default_shell: None,
            working_dir: default_working_dir(),
        }
    }
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `termrelay.toml` in
    /// the current directory is used when present.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new("termrelay.toml").exists() => Self::from_file("termrelay.toml")?,
            None => Config::default(),
        };
        config.apply_env();
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    fn apply_env(&mut self) {
        if let Ok(listen) = std::env::var("TERMRELAY_LISTEN") {
            self.server.listen = listen;
        } else if let Ok(port) = std::env::var("PORT") {
            self.set_port(&port);
        }
        if let Ok(token) = std::env::var("TERMRELAY_TOKEN") {
            if !token.is_empty() {
                self.auth.token = Some(token);
            }
        }
        if let Ok(shell) = std::env::var("TERMRELAY_SHELL") {
            self.shell.default_shell = Some(shell);
        }
    }

    /// Replace the port of `server.listen`, keeping the host part.
    pub fn set_port(&mut self, port: &str) {
        let host = self
            .server
            .listen
            .rsplit_once(':')
            .map_or("0.0.0.0", |(h, _)| h)
            .to_string();
        self.server.listen = format!("{host}:{port}");
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit.window_secs)
    }

    pub fn rate_limit_block(&self) -> Duration {
        Duration::from_secs(self.rate_limit.block_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.replay_buffer_bytes, 50_000);
        assert_eq!(config.server.listen, "0.0.0.0:3000");
        assert!(config.auth.one_time);
        assert_eq!(config.auth.rotation_interval(), Some(Duration::from_secs(3600)));
        assert_eq!(config.rate_limit.max_attempts, 5);
        assert!(config.multiplexer.enabled);
    }

    #[test]
    fn test_partial_file_keeps_field_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[server]\nreplay_buffer_bytes = 1024\n\n[auth]\nrotation_interval_secs = 0"
        )
        .unwrap();

        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.server.replay_buffer_bytes, 1024);
        assert_eq!(config.server.default_cols, 80);
        assert_eq!(config.auth.rotation_interval(), None);
        assert_eq!(config.auth.grace_period_secs, 300);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = Config::from_file("/nonexistent/termrelay.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server\nlisten = ").unwrap();
        let err = Config::from_file(file.path().to_str().unwrap()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_set_port_keeps_host() {
        let mut config = Config::default();
        config.server.listen = "127.0.0.1:3000".to_string();
        config.set_port("8080");
        assert_eq!(config.server.listen, "127.0.0.1:8080");
    }
}
