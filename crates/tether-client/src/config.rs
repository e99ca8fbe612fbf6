//! Client configuration
//!
//! Load order (later wins):
//! 1. Built-in defaults
//! 2. TOML file (explicit path, else `~/.config/tether/config.toml` if present)
//! 3. `TETHER_*` environment variables
//!
//! CLI flags are applied on top by the binary.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tether_protocol::PROTOCOL_VERSION;
use tracing::{debug, warn};

pub const ENV_URL: &str = "TETHER_URL";
pub const ENV_REQUEST_TIMEOUT: &str = "TETHER_REQUEST_TIMEOUT";
pub const ENV_ESTABLISH_SESSION: &str = "TETHER_ESTABLISH_SESSION";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Whether an error class ends the session or is logged and survived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPolicy {
    #[default]
    Recover,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorPolicies {
    /// Malformed frames, unknown ops, bad push payloads
    pub protocol: ErrorPolicy,
    /// Requests whose ack did not arrive before the deadline
    pub timeout: ErrorPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// Fetch `/session` before opening the socket and forward its cookies
    pub establish_session: bool,

    /// Override for the session endpoint (defaults to the page origin + `/session`)
    pub session_url: Option<String>,

    /// Wait for the daemon to ack `hello` before `connect` returns
    pub await_hello_ack: bool,

    /// Version announced in `hello`
    pub protocol_version: String,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            establish_session: false,
            session_url: None,
            await_hello_ack: false,
            protocol_version: PROTOCOL_VERSION.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// URL of the page the client belongs to; the socket URL is derived from it
    pub url: String,

    /// Per-request deadline in seconds (0 = wait forever)
    pub request_timeout_secs: u64,

    pub handshake: HandshakeConfig,

    pub errors: ErrorPolicies,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8080/".to_string(),
            request_timeout_secs: 30,
            handshake: HandshakeConfig::default(),
            errors: ErrorPolicies::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        match self.request_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("tether").join("config.toml"))
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load from file and environment.
    ///
    /// An explicit `config_file` must exist; the default location is only
    /// read when present.
    pub fn load(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match config_file {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_config_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => {
                    debug!("No config file found, using defaults");
                    Self::default()
                }
            },
        };

        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply `TETHER_*` overrides from `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_URL) {
            self.url = url;
        }
        if let Some(timeout) = lookup(ENV_REQUEST_TIMEOUT) {
            match timeout.trim().parse() {
                Ok(secs) => self.request_timeout_secs = secs,
                Err(_) => warn!(value = %timeout, "Ignoring invalid {}", ENV_REQUEST_TIMEOUT),
            }
        }
        if let Some(flag) = lookup(ENV_ESTABLISH_SESSION) {
            self.handshake.establish_session =
                matches!(flag.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
    }
}
