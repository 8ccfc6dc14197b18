//! Inbound messages handed to listener callbacks

use crate::codec::Payload;
use crate::error::{ClientError, ClientResult};
use crate::transport::{ChannelHandle, Transport, TransportError};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Settlement data for deliveries that need an explicit ack
#[derive(Clone)]
pub(crate) struct Settlement {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) channel: ChannelHandle,
    pub(crate) delivery_tag: u64,
    pub(crate) all_up_to: bool,
    pub(crate) requeue: bool,
    pub(crate) settled: Arc<AtomicBool>,
}

impl Settlement {
    pub(crate) async fn ack(&self) -> ClientResult<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self
            .transport
            .ack(self.channel, self.delivery_tag, self.all_up_to)
            .await;
        self.finish(result)
    }

    pub(crate) async fn nack(&self) -> ClientResult<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self
            .transport
            .nack(self.channel, self.delivery_tag, self.all_up_to, self.requeue)
            .await;
        self.finish(result)
    }

    /// A failed settlement leaves the delivery open for another attempt
    fn finish(&self, result: Result<(), TransportError>) -> ClientResult<()> {
        result.map_err(|e| {
            self.settled.store(false, Ordering::SeqCst);
            ClientError::Ack(e.to_string())
        })
    }
}

/// A decoded, gate-approved message
#[derive(Clone)]
pub struct ReceivedMessage {
    pub content: Payload,
    /// Publishing principal; empty for stream messages without a sender header
    pub sender: String,
    pub channel: String,
    pub topic: Option<String>,
    pub address: String,
    pub headers: HashMap<String, String>,
    pub from_api: bool,
    pub redelivered: bool,
    /// Name of the listener this message was delivered to
    pub listener: String,
    pub(crate) settlement: Option<Settlement>,
}

impl ReceivedMessage {
    /// Whether `ack`/`nack` must be called for this message
    pub fn needs_ack(&self) -> bool {
        self.settlement
            .as_ref()
            .is_some_and(|s| !s.settled.load(Ordering::SeqCst))
    }

    /// Positively acknowledge. A no-op when the listener does not use manual acks
    /// or the message was already settled.
    pub async fn ack(&self) -> ClientResult<()> {
        match &self.settlement {
            Some(settlement) => settlement.ack().await,
            None => {
                debug!(listener = %self.listener, "ack ignored, listener does not use manual acks");
                Ok(())
            }
        }
    }

    /// Negatively acknowledge, requeueing per the listener's options
    pub async fn nack(&self) -> ClientResult<()> {
        match &self.settlement {
            Some(settlement) => settlement.nack().await,
            None => {
                debug!(listener = %self.listener, "nack ignored, listener does not use manual acks");
                Ok(())
            }
        }
    }
}

impl fmt::Debug for ReceivedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceivedMessage")
            .field("content", &self.content)
            .field("sender", &self.sender)
            .field("channel", &self.channel)
            .field("topic", &self.topic)
            .field("address", &self.address)
            .field("from_api", &self.from_api)
            .field("redelivered", &self.redelivered)
            .field("listener", &self.listener)
            .field("needs_ack", &self.needs_ack())
            .finish()
    }
}
