//! Pub/sub-style transport over MQTT v5
//!
//! The module is split the same way as the rest of the crate's I/O code:
//!
//! - [`connection`] - pure option building from resolved connection parameters
//! - [`message_handler`] - pure event routing and topic filter matching
//! - [`client`] - the impure [`MqttTransport`] that drives rumqttc
//!
//! # Usage
//!
//! ```rust,no_run
//! use device_pubsub::prelude::*;
//! use device_pubsub::transport::mqtt::MqttTransport;
//! use std::sync::Arc;
//!
//! # async fn run(provider: Arc<dyn ConfigProvider>) -> ClientResult<()> {
//! let client = Client::builder(Credentials::device("thermostat-42", "s3cr3t"))
//!     .provider(provider)
//!     .start(MqttTransport::default())
//!     .await?;
//! client.connect().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::MqttTransport;
pub use connection::MqttSettings;
pub use message_handler::{EventRoute, MessageHandler};
