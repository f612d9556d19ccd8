// src/config.rs
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use dotenv::dotenv;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::errors::{ConnectorError, Result};

/// Environment variable pointing at an explicit config file. Takes
/// precedence over every default location when set.
pub const CONFIG_PATH_ENV: &str = "MQ_CONNECTOR_CONFIG";

/// Resolved broker configuration.
///
/// The wire shape mirrors what services already deploy:
///
/// ```json
/// {
///   "users": { "<service_name>": { "user": "...", "password": "..." } },
///   "server": "localhost",
///   "port": 5672
/// }
/// ```
///
/// The whole mapping may be wrapped under a top-level `"MQ"` key; loading
/// unwraps that automatically. `server` and `port` are optional; the
/// connector falls back to localhost:5672.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MqConfig {
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub users: HashMap<String, MqCredentialsEntry>,
}

/// Per-service credential entry. Absent fields fall back to "guest".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MqCredentialsEntry {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl MqConfig {
    /// Builds a config from a raw JSON mapping, unwrapping a non-empty
    /// top-level `"MQ"` object if one is present.
    pub fn from_value(value: Value) -> Result<Self> {
        let unwrapped = match value.get("MQ").and_then(Value::as_object) {
            Some(inner) if !inner.is_empty() => Value::Object(inner.clone()),
            _ => value,
        };
        serde_json::from_value(unwrapped).map_err(|e| {
            ConnectorError::Configuration(format!("malformed MQ configuration: {e}"))
        })
    }

    /// Reads and parses a JSON config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            ConnectorError::Configuration(format!(
                "failed to read config file at {}: {e}",
                path.display()
            ))
        })?;
        let value: Value = serde_json::from_str(&content).map_err(|e| {
            ConnectorError::Configuration(format!(
                "config file at {} contains invalid JSON: {e}",
                path.display()
            ))
        })?;
        Self::from_value(value)
    }

    /// Locates and loads the global MQ configuration.
    ///
    /// Checks `$MQ_CONNECTOR_CONFIG` first (after loading `.env`); a set but
    /// unreadable override is an error rather than a fallthrough. Otherwise
    /// scans the default locations in order and loads the first file that
    /// exists.
    pub fn load_default() -> Result<Self> {
        dotenv().ok();

        if let Ok(explicit) = env::var(CONFIG_PATH_ENV) {
            debug!(path = %explicit, "loading config from {CONFIG_PATH_ENV}");
            return Self::from_file(Path::new(&explicit));
        }

        for path in default_config_paths() {
            if path.is_file() {
                debug!(path = %path.display(), "found config file");
                return Self::from_file(&path);
            }
        }

        Err(ConnectorError::Configuration(
            "no MQ configuration found: set MQ_CONNECTOR_CONFIG or place \
             mq_config.json in the working directory, ./config, \
             ~/.config/mq_connector or ~/.local/share/mq_connector"
                .to_string(),
        ))
    }

    /// Credential entry for a service, if one is configured.
    pub fn credentials_entry(&self, service_name: &str) -> Option<&MqCredentialsEntry> {
        self.users.get(service_name)
    }
}

fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = vec![
        PathBuf::from("mq_config.json"),
        PathBuf::from("config/mq_config.json"),
    ];
    if let Some(home_dir) = home::home_dir() {
        paths.push(home_dir.join(".config/mq_connector/mq_config.json"));
        paths.push(home_dir.join(".local/share/mq_connector/credentials.json"));
    }
    paths
}
