//! Resolution of device credentials into transport connection parameters
//!
//! A [`ConfigProvider`] turns [`Credentials`] into [`ConnectionParams`]. The
//! engine wraps it in a [`ParamsCache`] so the endpoint is asked once per
//! client instance unless the cache is explicitly reset.

pub mod http;

use crate::transport::Protocol;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

pub use http::HttpConfigProvider;

/// Identity presented to the configuration endpoint
#[derive(Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Credentials {
    /// A single device
    Device { id: String, secret: String },
    /// An application client acting on streams
    Client { id: String, secret: String },
}

impl Credentials {
    pub fn device(id: impl Into<String>, secret: impl Into<String>) -> Self {
        Credentials::Device {
            id: id.into(),
            secret: secret.into(),
        }
    }

    pub fn client(id: impl Into<String>, secret: impl Into<String>) -> Self {
        Credentials::Client {
            id: id.into(),
            secret: secret.into(),
        }
    }

    /// Identity this client publishes and subscribes as
    pub fn principal(&self) -> &str {
        match self {
            Credentials::Device { id, .. } | Credentials::Client { id, .. } => id,
        }
    }

    pub(crate) fn secret(&self) -> &str {
        match self {
            Credentials::Device { secret, .. } | Credentials::Client { secret, .. } => secret,
        }
    }

    /// Fail fast before any network round trip
    pub fn validate(&self) -> Result<(), ProviderError> {
        if self.principal().trim().is_empty() {
            return Err(ProviderError::InvalidCredentials(
                "identifier is empty".to_string(),
            ));
        }
        if self.secret().is_empty() {
            return Err(ProviderError::InvalidCredentials(format!(
                "no secret supplied for '{}'",
                self.principal()
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Credentials::Device { .. } => "Device",
            Credentials::Client { .. } => "Client",
        };
        f.debug_struct(kind)
            .field("id", &self.principal())
            .field("secret", &"***")
            .finish()
    }
}

/// Per-protocol broker ports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProtocolPorts {
    pub amqp: Option<u16>,
    pub mqtt: Option<u16>,
    pub stomp: Option<u16>,
}

/// Everything a transport needs to open a connection
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub host: String,
    pub vhost: Option<String>,
    pub principal: String,
    pub secret: String,
    pub tls: bool,
    pub ports: ProtocolPorts,
}

impl ConnectionParams {
    /// Port for a protocol, falling back to the IANA default for the TLS mode
    pub fn port(&self, protocol: Protocol) -> u16 {
        let configured = match protocol {
            Protocol::Queue => self.ports.amqp,
            Protocol::PubSub => self.ports.mqtt,
            Protocol::Frame => self.ports.stomp,
        };
        configured.unwrap_or_else(|| protocol.default_port(self.tls))
    }
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("host", &self.host)
            .field("vhost", &self.vhost)
            .field("principal", &self.principal)
            .field("secret", &"***")
            .field("tls", &self.tls)
            .field("ports", &self.ports)
            .finish()
    }
}

/// Configuration endpoint errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProviderError {
    #[error("Insufficient credentials: {0}")]
    InvalidCredentials(String),
    #[error("Credentials rejected by configuration endpoint: {0}")]
    Rejected(String),
    #[error("Invalid configuration endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("Configuration endpoint unreachable: {0}")]
    Unreachable(String),
    #[error("Invalid configuration response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    /// Fatal errors are never retried by the reconnect policy
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProviderError::InvalidCredentials(_)
                | ProviderError::Rejected(_)
                | ProviderError::InvalidEndpoint(_)
        )
    }
}

/// Resolves credentials into connection parameters
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    async fn resolve(&self, credentials: &Credentials) -> Result<ConnectionParams, ProviderError>;
}

/// Provider returning fixed parameters, for brokers configured out of band
#[derive(Debug, Clone)]
pub struct StaticConfigProvider {
    params: ConnectionParams,
}

impl StaticConfigProvider {
    pub fn new(params: ConnectionParams) -> Self {
        Self { params }
    }
}

#[async_trait]
impl ConfigProvider for StaticConfigProvider {
    async fn resolve(&self, credentials: &Credentials) -> Result<ConnectionParams, ProviderError> {
        credentials.validate()?;
        Ok(self.params.clone())
    }
}

/// Memoizes the provider result for the lifetime of a client
pub struct ParamsCache {
    provider: Arc<dyn ConfigProvider>,
    credentials: Credentials,
    resolved: Option<ConnectionParams>,
}

impl ParamsCache {
    pub fn new(provider: Arc<dyn ConfigProvider>, credentials: Credentials) -> Self {
        Self {
            provider,
            credentials,
            resolved: None,
        }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn cached(&self) -> Option<&ConnectionParams> {
        self.resolved.as_ref()
    }

    /// Return memoized parameters, resolving them on first use
    pub async fn get(&mut self) -> Result<ConnectionParams, ProviderError> {
        if let Some(params) = &self.resolved {
            debug!(host = %params.host, "Using memoized connection parameters");
            return Ok(params.clone());
        }

        self.credentials.validate()?;
        let params = self.provider.resolve(&self.credentials).await?;
        info!(
            principal = %self.credentials.principal(),
            host = %params.host,
            tls = params.tls,
            "Resolved connection parameters"
        );
        self.resolved = Some(params.clone());
        Ok(params)
    }

    /// Force the next `get` to ask the provider again
    pub fn reset(&mut self) {
        self.resolved = None;
    }
}
