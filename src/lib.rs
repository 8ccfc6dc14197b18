//! Device Pub/Sub - client core for IoT devices on a message broker
//!
//! Devices and application clients publish to and listen on logical channels
//! and streams. The client resolves its broker connection parameters from a
//! configuration endpoint, keeps the connection alive across failures, and
//! buffers publications while offline.
//!
//! # Overview
//!
//! - [`client`] - the serialized engine, listener registry, publish cache and
//!   reconnect state machine behind the [`Client`] handle
//! - [`provider`] - credentials and connection parameter resolution
//! - [`transport`] - the wire transport capability plus an MQTT adapter
//! - [`routing`] - routing address construction and parsing
//! - [`gate`] - loop and API-origin suppression for inbound messages
//! - [`codec`] - payload encoding
//! - [`config`] - TOML configuration loading
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use device_pubsub::prelude::*;
//! use device_pubsub::testing::{MockConfigProvider, MockTransport};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn run() -> ClientResult<()> {
//! let client = Client::builder(Credentials::device("deviceId", "secret"))
//!     .provider(Arc::new(MockConfigProvider::new()))
//!     .start(MockTransport::default())
//!     .await?;
//!
//! client.connect().await?;
//! client
//!     .publish("data", json!({"some": "json"}), PublishOptions::new())
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod ack;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod gate;
pub mod message;
pub mod observability;
pub mod provider;
pub mod routing;
pub mod testing;
pub mod transport;

pub use ack::AckMode;
pub use client::{
    BindOutcome, CacheOptions, Client, ClientBuilder, ClientEvent, ClientOptions, ConnectOutcome,
    ConnectionState, ListenerInfo, ListenerOptions, PublishOptions, PublishOutcome,
    ReconnectPolicy,
};
pub use codec::{Codec, JsonCodec, Payload};
pub use config::{ConfigError, SdkConfig};
pub use error::{ClientError, ClientResult};
pub use gate::GateOptions;
pub use message::ReceivedMessage;
pub use provider::{ConfigProvider, ConnectionParams, Credentials, HttpConfigProvider};
pub use routing::Target;
pub use transport::{Protocol, Transport};

/// Everything an application typically needs
pub mod prelude {
    pub use crate::ack::AckMode;
    pub use crate::client::{
        BindOutcome, CacheOptions, Client, ClientEvent, ConnectOutcome, ConnectionState,
        ListenerOptions, PublishOptions, PublishOutcome, ReconnectPolicy,
    };
    pub use crate::error::{ClientError, ClientResult};
    pub use crate::message::ReceivedMessage;
    pub use crate::provider::{ConfigProvider, Credentials};
    pub use crate::routing::Target;
    pub use crate::transport::{Protocol, Transport};
}
