//! Pure routing of rumqttc events
//!
//! Maps raw event-loop output to [`EventRoute`] decisions and matches inbound
//! topics against subscription filters. The I/O side lives in `client`.

use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::{Packet, PubAckReason, PublishProperties};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::Event;
use rumqttc::Outgoing;
use std::collections::HashMap;

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    ConnectionAcknowledged,
    MessageReceived {
        topic: String,
        payload: Bytes,
        headers: HashMap<String, String>,
        duplicate: bool,
    },
    /// Broker sent DISCONNECT
    Disconnected,
    SubscriptionConfirmed { packet_id: u16 },
    /// A publish request was written to the socket; `0` for QoS 0
    PublishWritten { packet_id: u16 },
    /// Broker answered a QoS 1 publish
    PublishAcknowledged {
        packet_id: u16,
        rejection: Option<String>,
    },
    /// PingResp, UnsubAck and the like
    InfrastructureEvent(String),
    OutgoingEvent,
}

pub struct MessageHandler;

impl MessageHandler {
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: String::from_utf8_lossy(&publish.topic).to_string(),
                    payload: publish.payload.clone(),
                    headers: Self::properties_to_headers(publish.properties.as_ref()),
                    duplicate: publish.dup,
                },
                Packet::Disconnect(_) => EventRoute::Disconnected,
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                },
                Packet::PubAck(puback) => EventRoute::PublishAcknowledged {
                    packet_id: puback.pkid,
                    rejection: match puback.reason {
                        PubAckReason::Success | PubAckReason::NoMatchingSubscribers => None,
                        reason => Some(format!("{reason:?}")),
                    },
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(Outgoing::Publish(packet_id)) => EventRoute::PublishWritten {
                packet_id: *packet_id,
            },
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// MQTT v5 user properties carry message headers
    pub fn properties_to_headers(properties: Option<&PublishProperties>) -> HashMap<String, String> {
        properties
            .map(|props| props.user_properties.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn headers_to_properties(headers: &HashMap<String, String>) -> Option<PublishProperties> {
        if headers.is_empty() {
            return None;
        }
        let mut user_properties: Vec<(String, String)> = headers
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        user_properties.sort();
        Some(PublishProperties {
            user_properties,
            ..Default::default()
        })
    }

    /// At-least-once when the caller wants a confirm or persistence
    pub fn determine_qos_level(confirm: bool, persistent: bool) -> QoS {
        if confirm || persistent {
            QoS::AtLeastOnce
        } else {
            QoS::AtMostOnce
        }
    }

    /// MQTT filter matching with `+` (one level) and `#` (remaining levels)
    pub fn topic_matches(filter: &str, topic: &str) -> bool {
        let mut filter_levels = filter.split('/');
        let mut topic_levels = topic.split('/');

        loop {
            match (filter_levels.next(), topic_levels.next()) {
                (Some("#"), _) => return true,
                (Some("+"), Some(_)) => continue,
                (Some(expected), Some(actual)) if expected == actual => continue,
                (None, None) => return true,
                _ => return false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::v5::mqttbytes::v5::{ConnAck, ConnectReturnCode, Disconnect, PubAck, Publish};

    #[test]
    fn test_route_mqtt_event() {
        let connack = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
            properties: None,
        }));
        assert_eq!(
            MessageHandler::route_mqtt_event(&connack),
            EventRoute::ConnectionAcknowledged
        );

        let disconnect = Event::Incoming(Packet::Disconnect(Disconnect {
            reason_code: rumqttc::v5::mqttbytes::v5::DisconnectReasonCode::NormalDisconnection,
            properties: None,
        }));
        assert_eq!(
            MessageHandler::route_mqtt_event(&disconnect),
            EventRoute::Disconnected
        );
    }

    #[test]
    fn test_route_publish_confirmation_events() {
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Outgoing(Outgoing::Publish(7))),
            EventRoute::PublishWritten { packet_id: 7 }
        );
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Outgoing(Outgoing::PingReq)),
            EventRoute::OutgoingEvent
        );

        let accepted = Event::Incoming(Packet::PubAck(PubAck {
            pkid: 7,
            reason: PubAckReason::NoMatchingSubscribers,
            properties: None,
        }));
        assert_eq!(
            MessageHandler::route_mqtt_event(&accepted),
            EventRoute::PublishAcknowledged {
                packet_id: 7,
                rejection: None
            }
        );

        let refused = Event::Incoming(Packet::PubAck(PubAck {
            pkid: 8,
            reason: PubAckReason::NotAuthorized,
            properties: None,
        }));
        assert_eq!(
            MessageHandler::route_mqtt_event(&refused),
            EventRoute::PublishAcknowledged {
                packet_id: 8,
                rejection: Some("NotAuthorized".to_string())
            }
        );
    }

    #[test]
    fn test_publish_carries_user_properties() {
        let properties = PublishProperties {
            user_properties: vec![("x-api-origin".to_string(), "true".to_string())],
            ..Default::default()
        };
        let publish = Event::Incoming(Packet::Publish(Publish {
            dup: true,
            qos: QoS::AtLeastOnce,
            retain: false,
            topic: Bytes::from("dev-1/inbox"),
            pkid: 1,
            payload: Bytes::from("{\"a\":1}"),
            properties: Some(properties),
        }));

        match MessageHandler::route_mqtt_event(&publish) {
            EventRoute::MessageReceived {
                topic,
                payload,
                headers,
                duplicate,
            } => {
                assert_eq!(topic, "dev-1/inbox");
                assert_eq!(payload, Bytes::from("{\"a\":1}"));
                assert_eq!(headers.get("x-api-origin").map(String::as_str), Some("true"));
                assert!(duplicate);
            }
            other => panic!("Expected MessageReceived route, got {other:?}"),
        }
    }

    #[test]
    fn test_headers_to_properties() {
        assert!(MessageHandler::headers_to_properties(&HashMap::new()).is_none());

        let mut headers = HashMap::new();
        headers.insert("b".to_string(), "2".to_string());
        headers.insert("a".to_string(), "1".to_string());
        let properties = MessageHandler::headers_to_properties(&headers).unwrap();
        assert_eq!(
            properties.user_properties,
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string())
            ]
        );
    }

    #[test]
    fn test_determine_qos_level() {
        assert_eq!(MessageHandler::determine_qos_level(false, false), QoS::AtMostOnce);
        assert_eq!(MessageHandler::determine_qos_level(true, false), QoS::AtLeastOnce);
        assert_eq!(MessageHandler::determine_qos_level(false, true), QoS::AtLeastOnce);
    }

    #[test]
    fn test_topic_matches() {
        assert!(MessageHandler::topic_matches("dev-1/inbox", "dev-1/inbox"));
        assert!(!MessageHandler::topic_matches("dev-1/inbox", "dev-1/outbox"));
        assert!(MessageHandler::topic_matches("dev-1/+", "dev-1/inbox"));
        assert!(!MessageHandler::topic_matches("dev-1/+", "dev-1/inbox/alerts"));
        assert!(MessageHandler::topic_matches("dev-1/#", "dev-1/inbox/alerts"));
        assert!(MessageHandler::topic_matches("#", "anything/at/all"));
        assert!(!MessageHandler::topic_matches("dev-1/inbox/alerts", "dev-1/inbox"));
    }
}
