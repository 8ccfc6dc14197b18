//! Inbound message filtering applied before listener callbacks run

use crate::routing::RoutingInfo;
use crate::transport::Protocol;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Header the platform sets on messages injected through its API/UI path
pub const API_ORIGIN_HEADER: &str = "x-api-origin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GateOptions {
    /// Drop messages this client published itself
    #[serde(default)]
    pub discard_mine: bool,
    /// Drop messages injected through the platform API
    #[serde(default)]
    pub discard_from_api: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    RejectOwn,
    RejectFromApi,
}

impl Verdict {
    pub fn is_accepted(self) -> bool {
        matches!(self, Verdict::Accept)
    }
}

/// Per-listener accept/reject filter
#[derive(Debug, Clone)]
pub struct MessageGate {
    own_id: String,
    options: GateOptions,
}

impl MessageGate {
    pub fn new(own_id: impl Into<String>, options: GateOptions) -> Self {
        Self {
            own_id: own_id.into(),
            options,
        }
    }

    /// First matching rule wins
    pub fn evaluate(&self, sender: &str, from_api: bool) -> Verdict {
        if self.options.discard_mine && sender == self.own_id && !from_api {
            return Verdict::RejectOwn;
        }
        if self.options.discard_from_api && from_api {
            return Verdict::RejectFromApi;
        }
        Verdict::Accept
    }
}

/// Decide whether a delivery came in through the platform API.
///
/// Header-bearing transports carry [`API_ORIGIN_HEADER`]; pub/sub style
/// transports may instead route API input through the `_api` address prefix.
pub fn is_api_origin(
    protocol: Protocol,
    headers: &HashMap<String, String>,
    routing: &RoutingInfo,
) -> bool {
    let flagged = headers
        .get(API_ORIGIN_HEADER)
        .is_some_and(|value| !value.eq_ignore_ascii_case("false"));

    match protocol {
        Protocol::Queue | Protocol::Frame => flagged,
        Protocol::PubSub => flagged || routing.via_api_input,
    }
}
