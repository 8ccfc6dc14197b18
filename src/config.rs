//! TOML configuration file for the client
//!
//! Secrets never live in the file itself: the identity section names the
//! environment variable holding the secret, which is read when credentials are
//! built.
//!
//! ```toml
//! [device]
//! id = "thermostat-42"
//! secret_env = "DEVICE_SECRET"
//!
//! [endpoint]
//! url = "https://config.example.com"
//! timeout_secs = 10
//!
//! [connection]
//! protocol = "mqtt"
//! auto_reconnect = true
//! reconnect_timeout_ms = 5000
//!
//! [cache]
//! enabled = true
//! persist_path = "/var/lib/thermostat/publish-cache.json"
//! ```

use crate::client::{CacheOptions, ClientBuilder, ClientOptions, FileCacheStore, ReconnectPolicy};
use crate::provider::{Credentials, HttpConfigProvider};
use crate::transport::mqtt::MqttTransport;
use crate::transport::Protocol;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SdkConfig {
    /// Identity of a single device
    pub device: Option<IdentitySection>,
    /// Identity of an application client
    pub client: Option<IdentitySection>,
    pub endpoint: EndpointSection,
    #[serde(default)]
    pub connection: ConnectionSection,
    #[serde(default)]
    pub cache: CacheSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IdentitySection {
    /// Identifier (must match [a-zA-Z0-9._-]+)
    pub id: String,
    /// Environment variable containing the secret
    pub secret_env: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EndpointSection {
    pub url: String,
    #[serde(default = "default_endpoint_timeout")]
    pub timeout_secs: u64,
}

fn default_endpoint_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionSection {
    #[serde(default = "default_protocol")]
    pub protocol: Protocol,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    #[serde(default = "default_reconnect_timeout")]
    pub reconnect_timeout_ms: u64,
    /// Per-attempt delays tried before settling on `reconnect_timeout_ms`
    #[serde(default)]
    pub backoff_pattern_ms: Vec<u64>,
    pub max_attempts: Option<u32>,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            protocol: default_protocol(),
            auto_reconnect: true,
            reconnect_timeout_ms: default_reconnect_timeout(),
            backoff_pattern_ms: Vec::new(),
            max_attempts: None,
        }
    }
}

fn default_protocol() -> Protocol {
    Protocol::PubSub
}

fn default_true() -> bool {
    true
}

fn default_reconnect_timeout() -> u64 {
    5000
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub cache_while_connected: bool,
    /// Snapshot file; in-memory only when absent
    pub persist_path: Option<PathBuf>,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_while_connected: false,
            persist_path: None,
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SdkConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: SdkConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let identity = self.identity()?;
        validate_identifier(&identity.id)?;
        if identity.secret_env.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "secret_env must name an environment variable".to_string(),
            ));
        }

        let url = Url::parse(&self.endpoint.url).map_err(|e| {
            ConfigError::InvalidConfig(format!("endpoint url '{}': {e}", self.endpoint.url))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidConfig(format!(
                "endpoint url must be http or https, got '{}'",
                url.scheme()
            )));
        }
        if self.endpoint.timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "endpoint timeout_secs must be greater than 0".to_string(),
            ));
        }

        self.reconnect_policy()
            .validate()
            .map_err(ConfigError::InvalidConfig)
    }

    fn identity(&self) -> Result<&IdentitySection, ConfigError> {
        match (&self.device, &self.client) {
            (Some(device), None) => Ok(device),
            (None, Some(client)) => Ok(client),
            (Some(_), Some(_)) => Err(ConfigError::InvalidConfig(
                "configure either [device] or [client], not both".to_string(),
            )),
            (None, None) => Err(ConfigError::InvalidConfig(
                "missing [device] or [client] section".to_string(),
            )),
        }
    }

    /// Build credentials, reading the secret from the environment
    pub fn credentials(&self) -> Result<Credentials, ConfigError> {
        let identity = self.identity()?;
        let secret = std::env::var(&identity.secret_env)
            .map_err(|_| ConfigError::EnvVarNotFound(identity.secret_env.clone()))?;
        Ok(match self.device {
            Some(_) => Credentials::device(identity.id.clone(), secret),
            None => Credentials::client(identity.id.clone(), secret),
        })
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            auto_reconnect: self.connection.auto_reconnect,
            reconnect_timeout: Duration::from_millis(self.connection.reconnect_timeout_ms),
            backoff_pattern: self
                .connection
                .backoff_pattern_ms
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
            max_attempts: self.connection.max_attempts,
        }
    }

    pub fn cache_options(&self) -> CacheOptions {
        CacheOptions {
            enabled: self.cache.enabled,
            cache_while_connected: self.cache.cache_while_connected,
        }
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            reconnect: self.reconnect_policy(),
            cache: self.cache_options(),
            ..ClientOptions::default()
        }
    }

    pub fn config_provider(&self) -> Result<HttpConfigProvider, ConfigError> {
        HttpConfigProvider::new(
            &self.endpoint.url,
            Duration::from_secs(self.endpoint.timeout_secs),
        )
        .map_err(|e| ConfigError::InvalidConfig(e.to_string()))
    }

    pub fn cache_store(&self) -> Option<FileCacheStore> {
        self.cache.persist_path.as_ref().map(FileCacheStore::new)
    }

    /// Built-in transport for the configured protocol
    pub fn transport(&self) -> Result<MqttTransport, ConfigError> {
        match self.connection.protocol {
            Protocol::PubSub => Ok(MqttTransport::default()),
            other => Err(ConfigError::InvalidConfig(format!(
                "no built-in {other} transport, start the client with your own Transport"
            ))),
        }
    }

    /// Builder wired with credentials, the HTTP provider, options and cache store
    pub fn client_builder(&self) -> Result<ClientBuilder, ConfigError> {
        let mut builder = ClientBuilder::new(self.credentials()?)
            .provider(Arc::new(self.config_provider()?))
            .options(self.client_options());
        if let Some(store) = self.cache_store() {
            builder = builder.cache_store(Arc::new(store));
        }
        Ok(builder)
    }
}

/// Identifiers end up inside routing addresses, so only [a-zA-Z0-9._-]+ is allowed
pub fn validate_identifier(id: &str) -> Result<(), ConfigError> {
    let valid_chars = id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if id.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidIdentifier(format!(
            "'{id}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }

    Ok(())
}
