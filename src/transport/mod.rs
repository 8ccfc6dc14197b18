//! Transport capability consumed by the client engine
//!
//! A transport knows how to open a broker connection, open channels on it,
//! subscribe, publish and settle deliveries. Everything that happens
//! asynchronously on its side (errors, closes, inbound messages) is reported
//! through the [`TransportEvent`] sink handed to [`Transport::open`], tagged
//! with the handle it concerns so the engine can ignore events from
//! connections it has already torn down.

use crate::provider::ConnectionParams;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod mqtt;

/// Wire protocol family, which decides address dialect and API-origin detection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Message-queue style (AMQP)
    #[serde(alias = "amqp")]
    Queue,
    /// Lightweight pub/sub (MQTT)
    #[serde(alias = "mqtt")]
    PubSub,
    /// Text-frame messaging (STOMP)
    #[serde(alias = "stomp")]
    Frame,
}

impl Protocol {
    pub fn separator(self) -> char {
        match self {
            Protocol::PubSub => '/',
            Protocol::Queue | Protocol::Frame => '.',
        }
    }

    pub fn default_port(self, tls: bool) -> u16 {
        match (self, tls) {
            (Protocol::Queue, false) => 5672,
            (Protocol::Queue, true) => 5671,
            (Protocol::PubSub, false) => 1883,
            (Protocol::PubSub, true) => 8883,
            (Protocol::Frame, false) => 15674,
            (Protocol::Frame, true) => 15673,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Protocol::Queue => "amqp",
            Protocol::PubSub => "mqtt",
            Protocol::Frame => "stomp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Protocol {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "amqp" | "queue" => Ok(Protocol::Queue),
            "mqtt" | "pubsub" => Ok(Protocol::PubSub),
            "stomp" | "frame" => Ok(Protocol::Frame),
            other => Err(TransportError::UnsupportedProtocol(other.to_string())),
        }
    }
}

/// Live broker connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(pub u64);

/// Channel opened on a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelHandle(pub u64);

/// Proof of a live subscription; meaningful only to the transport that issued it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub channel: ChannelHandle,
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubscribeOptions {
    /// Transport acknowledges on delivery
    pub auto_ack: bool,
    pub prefetch: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SendOptions {
    /// Wait for a publisher confirm where the transport supports one
    #[serde(default)]
    pub confirm: bool,
    #[serde(default)]
    pub persistent: bool,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Outcome of a publish the transport accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryResult {
    /// Handed to the broker; no confirmation available
    Sent,
    /// Broker confirmed receipt
    Confirmed,
    /// Broker refused the message
    Rejected(String),
}

impl DeliveryResult {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryResult::Sent | DeliveryResult::Confirmed)
    }
}

/// Inbound message as handed up by a transport
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub subscription: SubscriptionHandle,
    pub address: String,
    pub payload: Bytes,
    pub headers: HashMap<String, String>,
    pub delivery_tag: Option<u64>,
    pub redelivered: bool,
}

/// Asynchronous notifications from a transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    ConnectionError {
        connection: ConnectionHandle,
        reason: String,
    },
    ConnectionClosed {
        connection: ConnectionHandle,
    },
    ChannelError {
        channel: ChannelHandle,
        reason: String,
    },
    ChannelClosed {
        channel: ChannelHandle,
    },
    Delivery(Delivery),
}

pub type EventSink = mpsc::UnboundedSender<TransportEvent>;

/// Transport errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Connection closed")]
    Closed,
    #[error("Channel failed: {0}")]
    ChannelFailed(String),
    #[error("Subscription failed: {0}")]
    SubscriptionFailed(String),
    #[error("Publishing failed: {0}")]
    PublishFailed(String),
    #[error("Acknowledgement failed: {0}")]
    AckFailed(String),
    #[error("Unknown handle: {0}")]
    UnknownHandle(String),
    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),
}

/// Wire transport capability
///
/// One implementation per protocol family. Implementations must not call back
/// into the client; the engine awaits these methods from its own task.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    fn protocol(&self) -> Protocol;

    async fn open(
        &self,
        params: &ConnectionParams,
        events: EventSink,
    ) -> Result<ConnectionHandle, TransportError>;

    async fn close(&self, connection: ConnectionHandle) -> Result<(), TransportError>;

    async fn open_channel(
        &self,
        connection: ConnectionHandle,
        name: &str,
    ) -> Result<ChannelHandle, TransportError>;

    async fn close_channel(&self, channel: ChannelHandle) -> Result<(), TransportError>;

    async fn subscribe(
        &self,
        channel: ChannelHandle,
        address: &str,
        options: &SubscribeOptions,
    ) -> Result<SubscriptionHandle, TransportError>;

    async fn unsubscribe(&self, subscription: &SubscriptionHandle) -> Result<(), TransportError>;

    async fn publish(
        &self,
        channel: ChannelHandle,
        address: &str,
        payload: Bytes,
        options: &SendOptions,
    ) -> Result<DeliveryResult, TransportError>;

    async fn ack(
        &self,
        channel: ChannelHandle,
        delivery_tag: u64,
        all_up_to: bool,
    ) -> Result<(), TransportError>;

    async fn nack(
        &self,
        channel: ChannelHandle,
        delivery_tag: u64,
        all_up_to: bool,
        requeue: bool,
    ) -> Result<(), TransportError>;
}
