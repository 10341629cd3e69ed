//! Server configuration: structs, JSON file loading, environment
//! overrides and validation.
//!
//! Precedence is file < environment < command-line flags; the binary applies
//! flag overrides itself after calling [`Config::apply_env`].

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use log::warn;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    FileReadError(#[from] std::io::Error),

    #[error("failed to parse JSON: {0}")]
    JsonParseError(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    ValidationError(String),
}

/// Listener addresses.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// host:port for the WebSocket session endpoint.
    pub ws_addr: String,
    /// host:port for the administrative HTTP endpoint.
    pub admin_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ws_addr: "127.0.0.1:8000".to_string(),
            admin_addr: "127.0.0.1:8001".to_string(),
        }
    }
}

/// Token verification and admin authentication.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct AuthConfig {
    /// HMAC secret for capability tokens.
    pub secret: String,
    /// Bearer token guarding the log-level and dump endpoints. `None`
    /// disables them.
    pub admin_bearer: Option<String>,
    /// Expose the development token route.
    pub dev_routes: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: "developmentKey".to_string(),
            admin_bearer: None,
            dev_routes: false,
        }
    }
}

/// Durable storage location. No path means no durability.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    pub path: Option<PathBuf>,
}

/// Spatial engine tuning.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Depth to which the quad-tree is fully built at startup.
    pub min_depth: usize,
    /// Coalescing window for session batches and webhook drains, in
    /// milliseconds.
    pub message_send_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_depth: 5,
            message_send_interval_ms: 1000,
        }
    }
}

/// Outbound webhook destination for air-beacon notifications.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default, deny_unknown_fields)]
pub struct WebhookConfig {
    pub url: String,
    pub bearer_token: Option<String>,
    /// Extra headers added to every webhook request.
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub storage: StorageConfig,
    pub engine: EngineConfig,
    pub webhook: Option<WebhookConfig>,
}

impl Config {
    /// Loads and validates a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Applies environment overrides on top of the loaded values.
    pub fn apply_env(&mut self) {
        if let Ok(addr) = env::var("GEOPULSE_WS_ADDR") {
            self.server.ws_addr = addr;
        }
        if let Ok(addr) = env::var("GEOPULSE_ADMIN_ADDR") {
            self.server.admin_addr = addr;
        }
        if let Ok(secret) = env::var("GEOPULSE_SECRET") {
            self.auth.secret = secret;
        }
        if let Ok(bearer) = env::var("GEOPULSE_ADMIN_BEARER") {
            self.auth.admin_bearer = Some(bearer);
        }
        if env::var("GEOPULSE_DEV").is_ok() {
            self.auth.dev_routes = true;
        }
        if let Ok(path) = env::var("GEOPULSE_DB") {
            self.storage.path = Some(PathBuf::from(path));
        }
        if let Ok(url) = env::var("WEBHOOK_URL") {
            let webhook = self.webhook.get_or_insert_with(WebhookConfig::default);
            webhook.url = url;
        }
        if let Some(webhook) = self.webhook.as_mut() {
            if let Ok(bearer) = env::var("WEBHOOK_BEARER") {
                webhook.bearer_token = Some(bearer);
            }
            if let Ok(headers) = env::var("WEBHOOK_HEADERS") {
                match serde_json::from_str(&headers) {
                    Ok(parsed) => webhook.headers = parsed,
                    Err(err) => warn!("ignoring unparseable WEBHOOK_HEADERS: {err}"),
                }
            }
        }
    }

    /// Checks the semantic constraints the loaders cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.message_send_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "message_send_interval_ms must be greater than 0".to_string(),
            ));
        }
        // 4^depth nodes are allocated up front; 10 is already a million
        if self.engine.min_depth > 10 {
            return Err(ConfigError::ValidationError(
                "min_depth must be at most 10".to_string(),
            ));
        }
        if self.auth.secret.is_empty() {
            return Err(ConfigError::ValidationError(
                "auth.secret must not be empty".to_string(),
            ));
        }
        if let Some(webhook) = &self.webhook {
            if webhook.url.is_empty() {
                return Err(ConfigError::ValidationError(
                    "webhook.url must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.server.ws_addr, "127.0.0.1:8000");
        assert_eq!(config.engine.min_depth, 5);
        assert!(config.webhook.is_none());
    }

    #[test]
    fn loads_a_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "server": {{ "ws_addr": "0.0.0.0:9000" }},
                "engine": {{ "min_depth": 3 }},
                "webhook": {{ "url": "http://hooks.example/geo", "headers": {{"X-Env": "test"}} }}
            }}"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.server.ws_addr, "0.0.0.0:9000");
        assert_eq!(config.server.admin_addr, "127.0.0.1:8001");
        assert_eq!(config.engine.min_depth, 3);
        let webhook = config.webhook.unwrap();
        assert_eq!(webhook.url, "http://hooks.example/geo");
        assert_eq!(webhook.headers["X-Env"], "test");
    }

    #[test]
    fn rejects_a_zero_interval() {
        let mut config = Config::default();
        config.engine.message_send_interval_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn rejects_an_oversized_min_depth() {
        let mut config = Config::default();
        config.engine.min_depth = 11;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unknown_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "serverr": {{}} }}"#).unwrap();
        assert!(matches!(
            Config::from_file(file.path()),
            Err(ConfigError::JsonParseError(_))
        ));
    }

    #[test]
    fn env_overrides_take_effect() {
        env::set_var("GEOPULSE_SECRET", "from-env");
        let mut config = Config::default();
        config.apply_env();
        env::remove_var("GEOPULSE_SECRET");
        assert_eq!(config.auth.secret, "from-env");
    }
}
