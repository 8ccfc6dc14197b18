//! HTTP configuration endpoint provider

use super::{ConfigProvider, ConnectionParams, Credentials, ProtocolPorts, ProviderError};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Path appended to the endpoint base URL
const CONNECTION_PATH: &str = "v1/connection";

/// Body returned by the configuration endpoint
#[derive(Debug, Deserialize)]
struct ConnectionResponse {
    host: String,
    #[serde(default)]
    vhost: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    tls: bool,
    #[serde(default)]
    ports: ProtocolPorts,
}

/// Calls the platform configuration endpoint over HTTPS
#[derive(Debug, Clone)]
pub struct HttpConfigProvider {
    url: Url,
    client: Client,
}

impl HttpConfigProvider {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, ProviderError> {
        let url = Self::connection_url(endpoint)?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::InvalidEndpoint(e.to_string()))?;

        Ok(Self { url, client })
    }

    /// Build `<endpoint>/v1/connection`, tolerating a trailing slash (pure function)
    fn connection_url(endpoint: &str) -> Result<Url, ProviderError> {
        let mut base =
            Url::parse(endpoint).map_err(|e| ProviderError::InvalidEndpoint(format!("{endpoint}: {e}")))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(ProviderError::InvalidEndpoint(format!(
                "unsupported scheme '{}'",
                base.scheme()
            )));
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        base.join(CONNECTION_PATH)
            .map_err(|e| ProviderError::InvalidEndpoint(e.to_string()))
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Map an HTTP status to a provider error (pure function)
    fn classify_status(status: StatusCode, body: &str) -> ProviderError {
        if status.is_client_error() {
            ProviderError::Rejected(format!("{status}: {body}"))
        } else {
            ProviderError::Unreachable(format!("{status}: {body}"))
        }
    }
}

#[async_trait]
impl ConfigProvider for HttpConfigProvider {
    async fn resolve(&self, credentials: &Credentials) -> Result<ConnectionParams, ProviderError> {
        credentials.validate()?;
        debug!(url = %self.url, principal = %credentials.principal(), "Requesting connection parameters");

        let response = self
            .client
            .post(self.url.clone())
            .json(credentials)
            .send()
            .await
            .map_err(|e| ProviderError::Unreachable(e.without_url().to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(%status, "Configuration endpoint refused request");
            return Err(Self::classify_status(status, body.trim()));
        }

        let body: ConnectionResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.without_url().to_string()))?;

        if body.host.is_empty() {
            return Err(ProviderError::InvalidResponse(
                "response carries no host".to_string(),
            ));
        }

        Ok(ConnectionParams {
            host: body.host,
            vhost: body.vhost,
            principal: body
                .username
                .unwrap_or_else(|| credentials.principal().to_string()),
            secret: body
                .password
                .unwrap_or_else(|| credentials.secret().to_string()),
            tls: body.tls,
            ports: body.ports,
        })
    }
}
