//! Error taxonomy for the device pub/sub client
//!
//! Every operation the application invokes directly (`connect`, `publish`,
//! `on_message`, ...) surfaces one of these variants. Background work
//! (reconnect attempts, listener rebinding, cache replay) never returns them;
//! it logs and retries instead.

use crate::client::ConnectionState;
use crate::codec::CodecError;
use crate::config::ConfigError;
use crate::provider::ProviderError;
use crate::routing::RoutingError;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Main error type for client operations
#[derive(Debug, Error)]
pub enum ClientError {
    /// Missing or rejected credentials; never retried automatically
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Transport-level failure or unreachable configuration endpoint
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscription failed for listener {listener}: {message}")]
    Subscription { listener: String, message: String },

    #[error("Malformed routing address: {0}")]
    MalformedMessage(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(#[from] RoutingError),

    #[error("Acknowledgement failed: {0}")]
    Ack(String),

    #[error("Listener not found: {0}")]
    ListenerNotFound(String),

    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Cache persistence error: {0}")]
    Persistence(String),

    #[error("Client engine has shut down")]
    Closed,
}

impl ClientError {
    /// Create configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration(message.into())
    }

    /// Create connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection(message.into())
    }

    /// Create publish error
    pub fn publish<S: Into<String>>(message: S) -> Self {
        Self::Publish(message.into())
    }

    /// Create subscription error for a listener
    pub fn subscription<L: Into<String>, S: Into<String>>(listener: L, message: S) -> Self {
        Self::Subscription {
            listener: listener.into(),
            message: message.into(),
        }
    }

    /// Whether the automatic reconnect policy may retry after this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Connection(_))
    }

    /// Error text safe to log or forward as a client event
    pub fn sanitized(&self) -> String {
        sanitize_error_message(&self.to_string())
    }
}

impl From<ConfigError> for ClientError {
    fn from(err: ConfigError) -> Self {
        ClientError::Configuration(err.to_string())
    }
}

impl From<ProviderError> for ClientError {
    fn from(err: ProviderError) -> Self {
        if err.is_fatal() {
            ClientError::Configuration(err.to_string())
        } else {
            ClientError::Connection(err.to_string())
        }
    }
}

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").expect("secret pattern is valid")
});

static URL_CREDENTIALS_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"://[^/@\s:]+:[^/@\s]+@").expect("url pattern is valid"));

/// Redact secrets from error text before it leaves the engine
pub(crate) fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = SECRET_PATTERN
        .replace_all(message, "${1}=***")
        .to_string();

    sanitized = URL_CREDENTIALS_PATTERN
        .replace_all(&sanitized, "://***@")
        .to_string();

    if sanitized.len() > 500 {
        let truncate_suffix = "...[truncated]";
        let mut cut = 500 - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;
