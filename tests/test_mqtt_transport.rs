//! MQTT transport behavior without a running broker
//!
//! Broker-backed scenarios are covered by the engine tests over the mock
//! transport; these check that the real adapter fails the way the engine
//! expects when nothing is listening.

use device_pubsub::client::ClientOptions;
use device_pubsub::prelude::*;
use device_pubsub::provider::{ConnectionParams, ProtocolPorts, StaticConfigProvider};
use device_pubsub::transport::mqtt::{MqttSettings, MqttTransport};
use device_pubsub::transport::{ChannelHandle, SendOptions, TransportError};
use std::sync::Arc;
use std::time::Duration;

fn refused_params() -> ConnectionParams {
    ConnectionParams {
        host: "127.0.0.1".to_string(),
        vhost: None,
        principal: "sensor-9".to_string(),
        secret: "secret".to_string(),
        tls: false,
        ports: ProtocolPorts {
            mqtt: Some(1),
            ..ProtocolPorts::default()
        },
    }
}

fn quick_transport() -> MqttTransport {
    MqttTransport::new(MqttSettings {
        connack_timeout: Duration::from_secs(2),
        ..MqttSettings::default()
    })
}

#[tokio::test]
async fn test_client_reports_refused_broker_as_connection_error() {
    let client = Client::builder(Credentials::device("sensor-9", "secret"))
        .provider(Arc::new(StaticConfigProvider::new(refused_params())))
        .options(ClientOptions {
            reconnect: ReconnectPolicy::manual(),
            ..Default::default()
        })
        .start(quick_transport())
        .await
        .unwrap();

    assert_eq!(client.protocol(), Protocol::PubSub);
    let result = client.connect().await;

    assert!(matches!(result, Err(ClientError::Connection(_))));
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_publish_on_unknown_channel_is_refused() {
    let transport = quick_transport();

    let result = transport
        .publish(
            ChannelHandle(42),
            "sensor-9/data",
            bytes::Bytes::from_static(b"{}"),
            &SendOptions::default(),
        )
        .await;

    assert!(matches!(result, Err(TransportError::UnknownHandle(_))));
}

#[tokio::test]
async fn test_publish_while_broker_unreachable_is_cached() {
    let client = Client::builder(Credentials::device("sensor-9", "secret"))
        .provider(Arc::new(StaticConfigProvider::new(refused_params())))
        .options(ClientOptions {
            reconnect: ReconnectPolicy::manual(),
            ..Default::default()
        })
        .start(quick_transport())
        .await
        .unwrap();
    let _ = client.connect().await;

    let outcome = client
        .publish("data", serde_json::json!({"v": 1}), PublishOptions::new())
        .await
        .unwrap();

    assert_eq!(outcome, PublishOutcome::Cached);
    assert_eq!(client.cached_messages().await.unwrap(), 1);
}
