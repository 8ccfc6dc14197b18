//! Lifecycle events broadcast to the application

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(name)
    }
}

/// Events produced by the client engine
///
/// Subscribers that fall behind lose the oldest events (`broadcast` semantics);
/// state itself is always available through `Client::state`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    Connect,
    Disconnect,
    Error { message: String },
    /// A listener's channel was opened and subscribed
    ChannelOpen { listener: String },
    /// A listener's channel went away; it is rebound on the next connect
    ChannelClose { listener: String },
    Log { level: LogLevel, message: String },
}

impl ClientEvent {
    pub fn error(message: impl Into<String>) -> Self {
        ClientEvent::Error {
            message: message.into(),
        }
    }

    pub fn log(level: LogLevel, message: impl Into<String>) -> Self {
        ClientEvent::Log {
            level,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let json = serde_json::to_string(&ClientEvent::ChannelOpen {
            listener: "1700000000000-0".to_string(),
        })
        .unwrap();
        assert_eq!(json, r#"{"event":"channel_open","listener":"1700000000000-0"}"#);

        let json = serde_json::to_string(&ClientEvent::log(LogLevel::Warn, "slow")).unwrap();
        assert_eq!(json, r#"{"event":"log","level":"warn","message":"slow"}"#);
    }

    #[test]
    fn test_log_level_display() {
        assert_eq!(LogLevel::Error.to_string(), "error");
        assert_eq!(LogLevel::Debug.to_string(), "debug");
    }
}
