//! Configuration endpoint tests against a mock HTTP server

use device_pubsub::prelude::*;
use device_pubsub::provider::{HttpConfigProvider, ProviderError};
use device_pubsub::testing::MockTransport;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn provider_for(server: &MockServer) -> HttpConfigProvider {
    HttpConfigProvider::new(&server.uri(), Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn test_resolves_connection_params() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/connection"))
        .and(body_partial_json(json!({
            "kind": "device",
            "id": "thermostat-42",
            "secret": "s3cr3t"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "host": "broker.example.com",
            "vhost": "devices",
            "username": "thermostat-42@tenant",
            "password": "broker-pass",
            "tls": true,
            "ports": {"amqp": 5671, "mqtt": 8883}
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let params = provider_for(&mock_server)
        .resolve(&Credentials::device("thermostat-42", "s3cr3t"))
        .await
        .unwrap();

    assert_eq!(params.host, "broker.example.com");
    assert_eq!(params.vhost.as_deref(), Some("devices"));
    assert_eq!(params.principal, "thermostat-42@tenant");
    assert_eq!(params.secret, "broker-pass");
    assert!(params.tls);
    assert_eq!(params.port(Protocol::Queue), 5671);
    assert_eq!(params.port(Protocol::PubSub), 8883);
    assert_eq!(params.port(Protocol::Frame), 15673, "Unlisted port uses the TLS default");
}

#[tokio::test]
async fn test_missing_broker_credentials_fall_back_to_device_credentials() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/connection"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"host": "broker.local"})))
        .mount(&mock_server)
        .await;

    let params = provider_for(&mock_server)
        .resolve(&Credentials::client("dashboard", "app-secret"))
        .await
        .unwrap();

    assert_eq!(params.principal, "dashboard");
    assert_eq!(params.secret, "app-secret");
    assert!(!params.tls);
    assert_eq!(params.port(Protocol::Queue), 5672);
}

#[tokio::test]
async fn test_unauthorized_is_rejected() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/connection"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad credentials"))
        .mount(&mock_server)
        .await;

    let result = provider_for(&mock_server)
        .resolve(&Credentials::device("thermostat-42", "wrong"))
        .await;

    let err = result.unwrap_err();
    assert!(matches!(err, ProviderError::Rejected(_)));
    assert!(err.is_fatal());
}

#[tokio::test]
async fn test_server_error_is_unreachable() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/connection"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&mock_server)
        .await;

    let result = provider_for(&mock_server)
        .resolve(&Credentials::device("thermostat-42", "s3cr3t"))
        .await;

    let err = result.unwrap_err();
    assert!(matches!(err, ProviderError::Unreachable(_)));
    assert!(!err.is_fatal());
}

#[tokio::test]
async fn test_garbage_body_is_invalid_response() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/connection"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
        .mount(&mock_server)
        .await;

    let result = provider_for(&mock_server)
        .resolve(&Credentials::device("thermostat-42", "s3cr3t"))
        .await;

    assert!(matches!(result, Err(ProviderError::InvalidResponse(_))));
}

#[tokio::test]
async fn test_missing_secret_never_reaches_the_endpoint() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&mock_server)
        .await;

    let result = provider_for(&mock_server)
        .resolve(&Credentials::device("thermostat-42", ""))
        .await;

    assert!(matches!(result, Err(ProviderError::InvalidCredentials(_))));
}

#[tokio::test]
async fn test_client_connect_with_rejected_credentials_fails_without_retry() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/connection"))
        .respond_with(ResponseTemplate::new(403).set_body_string("device disabled"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let transport = MockTransport::new(Protocol::Queue);
    let client = Client::builder(Credentials::device("thermostat-42", "s3cr3t"))
        .provider(Arc::new(provider_for(&mock_server)))
        .start(transport.clone())
        .await
        .unwrap();

    let result = client.connect().await;

    assert!(matches!(result, Err(ClientError::Configuration(_))));
    assert_eq!(transport.open_attempts().await, 0);
    assert_eq!(client.state(), ConnectionState::Disconnected);
}
