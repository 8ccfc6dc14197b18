//! Acknowledgment discipline
//!
//! `auto` lets the transport acknowledge on delivery, `manual` requires an
//! explicit ack/nack (from the application, or from the engine when a message
//! is filtered out), and `none` passes through whatever the transport does by
//! default.

use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckMode {
    Auto,
    Manual,
    #[default]
    None,
}

impl AckMode {
    /// Parse an ack mode name; unrecognized names are logged and treated as `none`
    pub fn parse(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "auto" => AckMode::Auto,
            "manual" => AckMode::Manual,
            "none" | "" => AckMode::None,
            other => {
                warn!(ack_mode = other, "Unrecognized ack mode, using no explicit ack");
                AckMode::None
            }
        }
    }

    /// Whether a delivery under this mode must be settled explicitly
    pub fn requires_explicit_ack(self) -> bool {
        matches!(self, AckMode::Manual)
    }

    /// Whether the transport should acknowledge on delivery
    pub fn transport_auto_ack(self) -> bool {
        matches!(self, AckMode::Auto)
    }
}

/// Resolve an ack mode by name and report whether it needs an explicit ack
pub fn requires_explicit_ack(mode_name: &str) -> bool {
    AckMode::parse(mode_name).requires_explicit_ack()
}
