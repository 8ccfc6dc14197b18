//! Routing address construction and parsing
//!
//! Addresses are `<principal>.<channel>[.<topic>]` on queue and frame style
//! transports and `<principal>/<channel>[/<topic>]` on pub/sub style ones.
//! Stream hooks address the stream by name instead of a device channel.

use crate::transport::Protocol;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Leading segment marking messages injected through the platform API input.
/// Only pub/sub style transports use it; header-bearing ones set a header.
pub const API_INPUT_SEGMENT: &str = "_api";

/// Header naming the publishing principal on stream messages, whose
/// addresses carry no sender segment
pub const SENDER_HEADER: &str = "x-sender";

/// What a listener listens on or a publish goes to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "lowercase")]
pub enum Target {
    /// A channel of this client's own principal
    Channel(String),
    /// A named multi-producer stream
    Stream(String),
}

impl Target {
    pub fn channel(name: impl Into<String>) -> Self {
        Target::Channel(name.into())
    }

    pub fn stream(name: impl Into<String>) -> Self {
        Target::Stream(name.into())
    }

    pub fn name(&self) -> &str {
        match self {
            Target::Channel(name) | Target::Stream(name) => name,
        }
    }
}

/// Routing address errors
#[derive(Debug, Error, PartialEq)]
pub enum RoutingError {
    #[error("{0} must not be empty")]
    EmptySegment(&'static str),
    #[error("{segment} '{value}' contains the address separator '{separator}'")]
    SeparatorInSegment {
        segment: &'static str,
        value: String,
        separator: char,
    },
    #[error("cannot parse routing address '{0}' into sender and channel")]
    Malformed(String),
}

/// Sender and channel recovered from an inbound routing address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingInfo {
    pub sender: String,
    pub channel: String,
    pub topic: Option<String>,
    /// Address carried the API input marker segment
    pub via_api_input: bool,
}

/// Pure mapping from `{target, principal, topic, explicit key}` to an address
#[derive(Debug, Clone)]
pub struct RoutingKeyResolver {
    protocol: Protocol,
    principal: String,
}

impl RoutingKeyResolver {
    pub fn new(protocol: Protocol, principal: impl Into<String>) -> Self {
        Self {
            protocol,
            principal: principal.into(),
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    /// Build the address for a target; an explicit routing key wins verbatim
    pub fn resolve(
        &self,
        target: &Target,
        topic: Option<&str>,
        routing_key: Option<&str>,
    ) -> Result<String, RoutingError> {
        if let Some(key) = routing_key {
            if key.is_empty() {
                return Err(RoutingError::EmptySegment("routing key"));
            }
            return Ok(key.to_string());
        }

        let separator = self.protocol.separator();
        let mut address = match target {
            Target::Channel(channel) => {
                check_segment("principal", &self.principal, separator)?;
                check_segment("channel", channel, separator)?;
                format!("{}{separator}{channel}", self.principal)
            }
            Target::Stream(stream) => {
                check_segment("stream", stream, separator)?;
                stream.clone()
            }
        };

        if let Some(topic) = topic {
            if topic.is_empty() {
                return Err(RoutingError::EmptySegment("topic"));
            }
            address.push(separator);
            address.push_str(topic);
        }

        Ok(address)
    }

    /// Parse an inbound address for this resolver's protocol
    pub fn parse(&self, address: &str) -> Result<RoutingInfo, RoutingError> {
        parse_address(self.protocol, address)
    }
}

fn check_segment(segment: &'static str, value: &str, separator: char) -> Result<(), RoutingError> {
    if value.is_empty() {
        return Err(RoutingError::EmptySegment(segment));
    }
    if value.contains(separator) {
        return Err(RoutingError::SeparatorInSegment {
            segment,
            value: value.to_string(),
            separator,
        });
    }
    Ok(())
}

/// Drop the pub/sub leading slash and the API input marker
fn strip_markers(protocol: Protocol, address: &str) -> (&str, bool) {
    let separator = protocol.separator();
    let mut rest = address;
    if protocol == Protocol::PubSub {
        rest = rest.strip_prefix('/').unwrap_or(rest);
    }
    match rest
        .strip_prefix(API_INPUT_SEGMENT)
        .and_then(|r| r.strip_prefix(separator))
    {
        Some(stripped) => (stripped, true),
        None => (rest, false),
    }
}

/// Split `<principal><sep><channel>[<sep><topic>]` into its parts.
/// Everything after the channel, separators included, is the topic.
pub fn parse_address(protocol: Protocol, address: &str) -> Result<RoutingInfo, RoutingError> {
    let separator = protocol.separator();
    let (rest, via_api_input) = strip_markers(protocol, address);

    let mut parts = rest.splitn(3, separator);
    let sender = parts.next().unwrap_or_default();
    let channel = parts.next().unwrap_or_default();
    let topic = parts.next();

    if sender.is_empty() || channel.is_empty() || topic.is_some_and(str::is_empty) {
        return Err(RoutingError::Malformed(address.to_string()));
    }

    Ok(RoutingInfo {
        sender: sender.to_string(),
        channel: channel.to_string(),
        topic: topic.map(str::to_string),
        via_api_input,
    })
}

/// Parse an address received by a listener on `stream`.
///
/// `<stream>[<sep><topic>]` yields the stream as channel and an empty sender;
/// the caller may fill the sender from [`SENDER_HEADER`]. Any other address
/// is read as a device channel address bound into the stream.
pub fn parse_stream_address(
    protocol: Protocol,
    stream: &str,
    address: &str,
) -> Result<RoutingInfo, RoutingError> {
    let separator = protocol.separator();
    let (rest, via_api_input) = strip_markers(protocol, address);

    let topic = if rest == stream {
        None
    } else if let Some(topic) = rest
        .strip_prefix(stream)
        .and_then(|r| r.strip_prefix(separator))
    {
        if topic.is_empty() {
            return Err(RoutingError::Malformed(address.to_string()));
        }
        Some(topic.to_string())
    } else {
        return parse_address(protocol, address);
    };

    Ok(RoutingInfo {
        sender: String::new(),
        channel: stream.to_string(),
        topic,
        via_api_input,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_channel_addresses_per_protocol() {
        let queue = RoutingKeyResolver::new(Protocol::Queue, "dev-1");
        assert_eq!(
            queue.resolve(&Target::channel("inbox"), None, None).unwrap(),
            "dev-1.inbox"
        );
        assert_eq!(
            queue
                .resolve(&Target::channel("data"), Some("temp"), None)
                .unwrap(),
            "dev-1.data.temp"
        );

        let pubsub = RoutingKeyResolver::new(Protocol::PubSub, "dev-1");
        assert_eq!(
            pubsub
                .resolve(&Target::channel("data"), Some("temp"), None)
                .unwrap(),
            "dev-1/data/temp"
        );

        let frame = RoutingKeyResolver::new(Protocol::Frame, "dev-1");
        assert_eq!(
            frame.resolve(&Target::channel("inbox"), None, None).unwrap(),
            "dev-1.inbox"
        );
    }

    #[test]
    fn test_stream_address() {
        let resolver = RoutingKeyResolver::new(Protocol::Queue, "dev-1");
        assert_eq!(
            resolver.resolve(&Target::stream("fleet"), None, None).unwrap(),
            "fleet"
        );
        assert_eq!(
            resolver
                .resolve(&Target::stream("fleet"), Some("alerts"), None)
                .unwrap(),
            "fleet.alerts"
        );
    }

    #[test]
    fn test_explicit_routing_key_wins() {
        let resolver = RoutingKeyResolver::new(Protocol::Queue, "dev-1");
        assert_eq!(
            resolver
                .resolve(&Target::channel("data"), Some("ignored"), Some("custom.key"))
                .unwrap(),
            "custom.key"
        );
        assert_eq!(
            resolver.resolve(&Target::channel("data"), None, Some("")),
            Err(RoutingError::EmptySegment("routing key"))
        );
    }

    #[test]
    fn test_rejects_bad_segments() {
        let resolver = RoutingKeyResolver::new(Protocol::Queue, "dev-1");
        assert_eq!(
            resolver.resolve(&Target::channel(""), None, None),
            Err(RoutingError::EmptySegment("channel"))
        );
        assert!(matches!(
            resolver.resolve(&Target::channel("a.b"), None, None),
            Err(RoutingError::SeparatorInSegment { .. })
        ));

        let anonymous = RoutingKeyResolver::new(Protocol::Queue, "");
        assert_eq!(
            anonymous.resolve(&Target::channel("inbox"), None, None),
            Err(RoutingError::EmptySegment("principal"))
        );
    }

    #[test]
    fn test_parse_queue_address() {
        let info = parse_address(Protocol::Queue, "dev-2.data.temp.avg").unwrap();
        assert_eq!(info.sender, "dev-2");
        assert_eq!(info.channel, "data");
        assert_eq!(info.topic.as_deref(), Some("temp.avg"));
        assert!(!info.via_api_input);
    }

    #[test]
    fn test_parse_pubsub_address_with_api_marker() {
        let info = parse_address(Protocol::PubSub, "/_api/dev-2/inbox").unwrap();
        assert_eq!(info.sender, "dev-2");
        assert_eq!(info.channel, "inbox");
        assert_eq!(info.topic, None);
        assert!(info.via_api_input);
    }

    #[test]
    fn test_parse_malformed_addresses() {
        for address in ["", "dev-1", "dev-1.", ".inbox", "dev-1.inbox.", "_api.dev-1"] {
            assert!(
                matches!(
                    parse_address(Protocol::Queue, address),
                    Err(RoutingError::Malformed(_))
                ),
                "address {address:?} should be malformed"
            );
        }
    }

    #[test]
    fn test_parse_stream_address() {
        let bare = parse_stream_address(Protocol::Queue, "fleet", "fleet").unwrap();
        assert_eq!(bare.sender, "");
        assert_eq!(bare.channel, "fleet");
        assert_eq!(bare.topic, None);

        let with_topic = parse_stream_address(Protocol::Queue, "fleet", "fleet.alerts.high").unwrap();
        assert_eq!(with_topic.sender, "");
        assert_eq!(with_topic.channel, "fleet");
        assert_eq!(with_topic.topic.as_deref(), Some("alerts.high"));

        let api = parse_stream_address(Protocol::PubSub, "fleet", "/_api/fleet/alerts").unwrap();
        assert!(api.via_api_input);
        assert_eq!(api.topic.as_deref(), Some("alerts"));

        // a device channel bound into the stream keeps its sender
        let device = parse_stream_address(Protocol::Queue, "fleet", "dev-3.data").unwrap();
        assert_eq!(device.sender, "dev-3");
        assert_eq!(device.channel, "data");

        // a longer stream name sharing the prefix is not this stream
        let other = parse_stream_address(Protocol::Queue, "fleet", "fleets.data").unwrap();
        assert_eq!(other.sender, "fleets");

        assert!(matches!(
            parse_stream_address(Protocol::Queue, "fleet", "fleet."),
            Err(RoutingError::Malformed(_))
        ));
    }

    fn segment() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9_-]{1,12}".prop_filter("not the api marker", |s| s != API_INPUT_SEGMENT)
    }

    proptest! {
        #[test]
        fn resolved_channel_addresses_parse_back(
            principal in segment(),
            channel in segment(),
            topic in proptest::option::of(segment()),
            pubsub in any::<bool>(),
        ) {
            let protocol = if pubsub { Protocol::PubSub } else { Protocol::Queue };
            let resolver = RoutingKeyResolver::new(protocol, principal.clone());
            let address = resolver
                .resolve(&Target::Channel(channel.clone()), topic.as_deref(), None)
                .unwrap();

            let info = resolver.parse(&address).unwrap();
            prop_assert_eq!(info.sender, principal);
            prop_assert_eq!(info.channel, channel);
            prop_assert_eq!(info.topic, topic);
        }

        #[test]
        fn parse_never_yields_empty_parts(address in ".*") {
            if let Ok(info) = parse_address(Protocol::Queue, &address) {
                prop_assert!(!info.sender.is_empty());
                prop_assert!(!info.channel.is_empty());
            }
        }
    }
}
