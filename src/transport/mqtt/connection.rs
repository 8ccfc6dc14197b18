//! Pure MQTT option building
//!
//! Turns resolved [`ConnectionParams`] plus adapter settings into rumqttc
//! options. No I/O happens here.

use crate::provider::ConnectionParams;
use crate::transport::{Protocol, TransportError};
use rumqttc::v5::MqttOptions;
use rumqttc::Transport as RumqttcTransport;
use std::time::Duration;

/// Adapter tuning that does not come from the configuration endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttSettings {
    pub keep_alive: Duration,
    /// Largest packet accepted from the broker
    pub max_packet_size: u32,
    /// How long `open` waits for ConnAck
    pub connack_timeout: Duration,
    /// Capacity of the rumqttc request queue
    pub request_capacity: usize,
    /// How long a confirmed publish waits for its PubAck
    pub confirm_timeout: Duration,
    pub clean_start: bool,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_secs(60),
            max_packet_size: 256 * 1024,
            connack_timeout: Duration::from_secs(10),
            request_capacity: 10,
            confirm_timeout: Duration::from_secs(10),
            clean_start: true,
        }
    }
}

/// Unique client id per connection attempt so a lingering session on the
/// broker never kicks the new one off
pub fn build_client_id(principal: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{principal}-{}", &suffix[..12])
}

pub fn configure_mqtt_options(
    client_id: &str,
    params: &ConnectionParams,
    settings: &MqttSettings,
) -> Result<MqttOptions, TransportError> {
    let host = params.host.trim();
    if host.is_empty() {
        return Err(TransportError::ConnectionFailed(
            "broker host is empty".to_string(),
        ));
    }
    if host.contains("://") || host.contains('/') {
        return Err(TransportError::ConnectionFailed(format!(
            "broker host '{host}' must be a bare hostname"
        )));
    }

    let port = params.port(Protocol::PubSub);
    let mut mqtt_options = MqttOptions::new(client_id, host, port);

    if params.tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    mqtt_options.set_credentials(params.principal.as_str(), params.secret.as_str());
    mqtt_options.set_keep_alive(settings.keep_alive);
    mqtt_options.set_max_packet_size(Some(settings.max_packet_size));
    mqtt_options.set_clean_start(settings.clean_start);

    Ok(mqtt_options)
}
