//! Relay configuration.
//!
//! Resolution order: built-in defaults, then a TOML file, then the
//! `DISUCORD_HOST` / `DISUCORD_PORT` environment variables, then CLI flags.
//!
//! ```toml
//! host = "0.0.0.0"
//! port = 9000
//! channels = ["IF 100", "SPS 101"]
//! ```

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Default listen host
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default listen port
pub const DEFAULT_PORT: u16 = 8080;

/// Channels available when no configuration overrides them
pub const DEFAULT_CHANNELS: &[&str] = &["IF 100", "SPS 101"];

/// Environment variable overriding the listen host
pub const HOST_ENV: &str = "DISUCORD_HOST";

/// Environment variable overriding the listen port
pub const PORT_ENV: &str = "DISUCORD_PORT";

/// Host and port the relay binds to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_PORT)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Relay settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayConfig {
    /// Interface to listen on
    pub host: String,

    /// TCP port to listen on
    pub port: u16,

    /// Fixed set of channels clients may subscribe to
    pub channels: Vec<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            channels: DEFAULT_CHANNELS.iter().map(|c| c.to_string()).collect(),
        }
    }
}

impl RelayConfig {
    /// Parses and validates a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        Self::from_toml_str(&content)
    }

    /// Loads `path` if given, else the default config file if it exists,
    /// else returns the built-in defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => match default_config_path() {
                Some(path) if path.exists() => Self::load(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    /// Applies `DISUCORD_HOST` / `DISUCORD_PORT` from the process environment.
    pub fn apply_env(self) -> Result<Self, ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Applies host/port overrides looked up through `lookup`.
    pub fn apply_env_from<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup(HOST_ENV) {
            self.host = host;
        }
        if let Some(port) = lookup(PORT_ENV) {
            self.port = port.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                name: PORT_ENV,
                value: port,
            })?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Applies command-line overrides.
    pub fn apply_overrides(mut self, host: Option<String>, port: Option<u16>) -> Self {
        if let Some(host) = host {
            self.host = host;
        }
        if let Some(port) = port {
            self.port = port;
        }
        self
    }

    /// Checks the host and channel list.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::BlankHost);
        }
        if self.channels.is_empty() {
            return Err(ConfigError::NoChannels);
        }

        let mut seen = HashSet::new();
        for channel in &self.channels {
            if channel.trim().is_empty() {
                return Err(ConfigError::BlankChannel);
            }
            if !seen.insert(channel.as_str()) {
                return Err(ConfigError::DuplicateChannel(channel.clone()));
            }
        }
        Ok(())
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }
}

/// Returns `<config dir>/disucord/config.toml`, if a config dir exists.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("disucord").join("config.toml"))
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {error}")]
    Read { path: PathBuf, error: String },

    #[error("Invalid config: {0}")]
    Parse(String),

    #[error("Invalid value for {name}: {value:?}")]
    InvalidEnv { name: &'static str, value: String },

    #[error("Host must not be empty")]
    BlankHost,

    #[error("At least one channel must be configured")]
    NoChannels,

    #[error("Channel names must not be blank")]
    BlankChannel,

    #[error("Duplicate channel: {0}")]
    DuplicateChannel(String),
}
