//! Broker configuration: `~/.2kc/config.json`.
//!
//! Every section is optional on disk; missing fields take defaults. Loading
//! validates per-field and fails with the offending key. Sensitive fields
//! never appear in `Debug` output; `config show` renders a redacted view.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 2274;
pub const DEFAULT_APPROVAL_TIMEOUT_MS: u64 = 300_000;

#[cfg(unix)]
const CONFIG_FILE_MODE: u32 = 0o600;

/// Which facade realization the CLI talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Standalone,
    Client,
}

/// HTTP server coordinates and bearer token.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            auth_token: None,
        }
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("auth_token", &self.auth_token.is_some())
            .finish()
    }
}

/// Secret store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreConfig {
    /// A leading `~` expands to the user home.
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: "~/.2kc/secrets.json".to_string(),
        }
    }
}

/// Discord approval channel coordinates.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscordConfig {
    pub webhook_url: String,
    pub bot_token: String,
    pub channel_id: String,
}

impl std::fmt::Debug for DiscordConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscordConfig")
            .field("webhook_url", &redact_prefix(&self.webhook_url, 20))
            .field("bot_token", &redact_prefix(&self.bot_token, 4))
            .field("channel_id", &self.channel_id)
            .finish()
    }
}

/// Full broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub mode: Mode,
    pub server: ServerConfig,
    pub store: StoreConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discord: Option<DiscordConfig>,
    /// Tag -> approval requirement. An explicit `false` opts a tag out even
    /// when the default says otherwise.
    pub require_approval: HashMap<String, bool>,
    pub default_require_approval: bool,
    pub approval_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            server: ServerConfig::default(),
            store: StoreConfig::default(),
            discord: None,
            require_approval: HashMap::new(),
            default_require_approval: false,
            approval_timeout_ms: DEFAULT_APPROVAL_TIMEOUT_MS,
        }
    }
}

impl Config {
    /// Directory every broker file lives under.
    pub fn data_dir() -> Result<PathBuf, ConfigError> {
        dirs::home_dir()
            .map(|h| h.join(".2kc"))
            .ok_or(ConfigError::NoHomeDir)
    }

    pub fn default_path() -> Result<PathBuf, ConfigError> {
        Ok(Self::data_dir()?.join("config.json"))
    }

    /// Load from the given path, or the default path when `None`. A missing
    /// file yields the default config.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_path()?,
        };
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(&path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let config: Config = serde_json::from_str(&raw).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.approval_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "approvalTimeoutMs".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.server.port == 0 {
            return Err(ConfigError::InvalidValue {
                key: "server.port".to_string(),
                message: "must be in 1..=65535".to_string(),
            });
        }
        if self.server.host.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "server.host".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        if self.store.path.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "store.path".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    /// Store path with `~` expanded.
    pub fn store_path(&self) -> Result<PathBuf, ConfigError> {
        expand_tilde(&self.store.path)
    }

    /// Persist to disk with mode `0600`.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        fs::write(path, raw)?;
        restrict_mode(path)?;
        Ok(())
    }

    /// JSON rendering for `config show`: tokens cut to their first four
    /// characters, the webhook url to its first twenty.
    pub fn redacted_json(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let Some(token) = value.pointer_mut("/server/authToken") {
            if let Some(s) = token.as_str() {
                *token = serde_json::Value::String(redact_prefix(s, 4));
            }
        }
        if let Some(token) = value.pointer_mut("/discord/botToken") {
            if let Some(s) = token.as_str() {
                *token = serde_json::Value::String(redact_prefix(s, 4));
            }
        }
        if let Some(url) = value.pointer_mut("/discord/webhookUrl") {
            if let Some(s) = url.as_str() {
                *url = serde_json::Value::String(redact_prefix(s, 20));
            }
        }
        value
    }
}

/// First `keep` characters followed by `"..."`.
fn redact_prefix(value: &str, keep: usize) -> String {
    let prefix: String = value.chars().take(keep).collect();
    format!("{prefix}...")
}

/// Expand a leading `~` to the user home directory.
pub fn expand_tilde(path: &str) -> Result<PathBuf, ConfigError> {
    if let Some(rest) = path.strip_prefix("~/") {
        Ok(dirs::home_dir().ok_or(ConfigError::NoHomeDir)?.join(rest))
    } else if path == "~" {
        dirs::home_dir().ok_or(ConfigError::NoHomeDir)
    } else {
        Ok(PathBuf::from(path))
    }
}

#[cfg(unix)]
fn restrict_mode(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(CONFIG_FILE_MODE))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_mode(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}
