//! Startup configuration loaded once from `appsettings.json`.
//!
//! The file carries an `AppSettings` object:
//!
//! ```json
//! {
//!   "AppSettings": {
//!     "WebSocketUrl": "wss://push.example.com/ws",
//!     "BindUrl": "https://push.example.com/bind",
//!     "SecretId": "..."
//!   }
//! }
//! ```
//!
//! Any missing or malformed value is fatal: callers must not open connections
//! when [`AppConfig::load`] fails.

use std::path::{Path, PathBuf};

use secrecy::SecretString;
use serde::Deserialize;
use thiserror::Error;

/// Default configuration file name, resolved against the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "appsettings.json";

/// Validated client configuration.
#[derive(Clone)]
pub struct AppConfig {
    /// Websocket endpoint of the push server.
    pub websocket_url: String,
    /// HTTP endpoint that binds a server-issued client id to our secret.
    pub bind_url: String,
    /// Secret sent as `secret_id` with every bind request.
    pub secret_id: SecretString,
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("websocket_url", &self.websocket_url)
            .field("bind_url", &self.bind_url)
            .field("secret_id", &"[redacted]")
            .finish()
    }
}

/// Errors produced while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid configuration json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration is missing the AppSettings section")]
    MissingSection,

    #[error("AppSettings.{0} is missing or empty")]
    MissingField(&'static str),

    #[error("AppSettings.{field} is invalid: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

#[derive(Debug, Deserialize)]
struct SettingsFile {
    #[serde(rename = "AppSettings")]
    app_settings: Option<RawAppSettings>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawAppSettings {
    #[serde(default)]
    web_socket_url: Option<String>,
    #[serde(default)]
    bind_url: Option<String>,
    #[serde(default)]
    secret_id: Option<String>,
}

impl AppConfig {
    /// Reads and validates the configuration file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    /// Parses and validates configuration from JSON text.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let file: SettingsFile = serde_json::from_str(text)?;
        let raw = file.app_settings.ok_or(ConfigError::MissingSection)?;

        let websocket_url = required(raw.web_socket_url, "WebSocketUrl")?;
        validate_scheme(&websocket_url, "WebSocketUrl", &["ws", "wss"])?;

        let bind_url = required(raw.bind_url, "BindUrl")?;
        validate_scheme(&bind_url, "BindUrl", &["http", "https"])?;

        let secret_id = SecretString::new(required(raw.secret_id, "SecretId")?);

        Ok(Self {
            websocket_url,
            bind_url,
            secret_id,
        })
    }
}

fn required(value: Option<String>, field: &'static str) -> Result<String, ConfigError> {
    let value = value.map(|v| v.trim().to_string()).unwrap_or_default();
    if value.is_empty() {
        return Err(ConfigError::MissingField(field));
    }
    Ok(value)
}

fn validate_scheme(url: &str, field: &'static str, schemes: &[&str]) -> Result<(), ConfigError> {
    let parsed = reqwest::Url::parse(url).map_err(|err| ConfigError::InvalidField {
        field,
        reason: err.to_string(),
    })?;
    if !schemes.contains(&parsed.scheme()) {
        return Err(ConfigError::InvalidField {
            field,
            reason: format!(
                "scheme must be one of {}, got {}",
                schemes.join("/"),
                parsed.scheme()
            ),
        });
    }
    Ok(())
}
