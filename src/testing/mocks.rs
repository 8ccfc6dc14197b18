//! Mock implementations for testing
//!
//! Provides a scriptable in-memory [`Transport`] and a [`ConfigProvider`]
//! so the client engine can be exercised without a broker or a
//! configuration endpoint.

use crate::provider::{ConfigProvider, ConnectionParams, Credentials, ProtocolPorts, ProviderError};
use crate::transport::{
    ChannelHandle, ConnectionHandle, Delivery, DeliveryResult, EventSink, Protocol,
    SendOptions, SubscribeOptions, SubscriptionHandle, Transport, TransportError, TransportEvent,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// A publish the mock transport accepted or refused
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedPublish {
    pub channel: ChannelHandle,
    pub address: String,
    pub payload: Bytes,
    pub options: SendOptions,
}

impl RecordedPublish {
    pub fn body_json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.payload).ok()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedSubscribe {
    pub subscription: SubscriptionHandle,
    pub address: String,
    pub options: SubscribeOptions,
}

/// Ack or nack issued through the mock transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedSettlement {
    Ack {
        channel: ChannelHandle,
        delivery_tag: u64,
        all_up_to: bool,
    },
    Nack {
        channel: ChannelHandle,
        delivery_tag: u64,
        all_up_to: bool,
        requeue: bool,
    },
}

#[derive(Debug, Default)]
struct MockState {
    next_handle: u64,
    next_delivery_tag: u64,
    sink: Option<EventSink>,
    connection: Option<ConnectionHandle>,
    opened_with: Vec<ConnectionParams>,
    closed: Vec<ConnectionHandle>,
    channels: Vec<(ChannelHandle, String)>,
    closed_channels: Vec<ChannelHandle>,
    subscriptions: Vec<RecordedSubscribe>,
    unsubscribed: Vec<SubscriptionHandle>,
    publishes: Vec<RecordedPublish>,
    settlements: Vec<RecordedSettlement>,
    publish_attempts: usize,
    open_attempts: usize,

    fail_opens: usize,
    fail_all_opens: bool,
    fail_subscribe: bool,
    fail_publish: bool,
    fail_publish_attempts: HashSet<usize>,
    fail_settle: bool,
    open_delay: Option<Duration>,
}

impl MockState {
    fn next_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }
}

/// In-memory transport recording every call made by the engine
#[derive(Debug, Clone)]
pub struct MockTransport {
    protocol: Protocol,
    state: Arc<Mutex<MockState>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new(Protocol::Queue)
    }
}

impl MockTransport {
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// Fail the next `count` calls to `open`
    pub async fn fail_next_opens(&self, count: usize) {
        self.state.lock().await.fail_opens = count;
    }

    /// Fail every call to `open` until switched off
    pub async fn set_open_failure(&self, fail: bool) {
        self.state.lock().await.fail_all_opens = fail;
    }

    pub async fn set_subscribe_failure(&self, fail: bool) {
        self.state.lock().await.fail_subscribe = fail;
    }

    pub async fn set_publish_failure(&self, fail: bool) {
        self.state.lock().await.fail_publish = fail;
    }

    /// Make every `open` take this long, so the in-flight attempt is observable
    pub async fn set_open_delay(&self, delay: Duration) {
        self.state.lock().await.open_delay = Some(delay);
    }

    /// Fail `ack` and `nack` until switched off; failed settlements are not recorded
    pub async fn set_settle_failure(&self, fail: bool) {
        self.state.lock().await.fail_settle = fail;
    }

    /// Fail the publish attempt with this 1-based ordinal
    pub async fn fail_publish_attempt(&self, ordinal: usize) {
        self.state.lock().await.fail_publish_attempts.insert(ordinal);
    }

    pub async fn open_count(&self) -> usize {
        self.state.lock().await.opened_with.len()
    }

    /// Calls to `open`, failed ones included
    pub async fn open_attempts(&self) -> usize {
        self.state.lock().await.open_attempts
    }

    pub async fn opened_with(&self) -> Vec<ConnectionParams> {
        self.state.lock().await.opened_with.clone()
    }

    pub async fn close_count(&self) -> usize {
        self.state.lock().await.closed.len()
    }

    pub async fn current_connection(&self) -> Option<ConnectionHandle> {
        self.state.lock().await.connection
    }

    pub async fn channels(&self) -> Vec<(ChannelHandle, String)> {
        self.state.lock().await.channels.clone()
    }

    pub async fn closed_channels(&self) -> Vec<ChannelHandle> {
        self.state.lock().await.closed_channels.clone()
    }

    pub async fn subscriptions(&self) -> Vec<RecordedSubscribe> {
        self.state.lock().await.subscriptions.clone()
    }

    pub async fn unsubscribed(&self) -> Vec<SubscriptionHandle> {
        self.state.lock().await.unsubscribed.clone()
    }

    /// Publishes that the transport accepted, in order
    pub async fn publishes(&self) -> Vec<RecordedPublish> {
        self.state.lock().await.publishes.clone()
    }

    pub async fn publish_attempts(&self) -> usize {
        self.state.lock().await.publish_attempts
    }

    pub async fn settlements(&self) -> Vec<RecordedSettlement> {
        self.state.lock().await.settlements.clone()
    }

    /// Most recent subscription made on an address
    pub async fn subscription_for(&self, address: &str) -> Option<SubscriptionHandle> {
        self.state
            .lock()
            .await
            .subscriptions
            .iter()
            .rev()
            .find(|s| s.address == address)
            .map(|s| s.subscription.clone())
    }

    /// Broker closed the current connection
    pub async fn drop_connection(&self) -> bool {
        let state = self.state.lock().await;
        match (&state.sink, state.connection) {
            (Some(sink), Some(connection)) => sink
                .send(TransportEvent::ConnectionClosed { connection })
                .is_ok(),
            _ => false,
        }
    }

    /// Current connection failed with an error
    pub async fn fail_connection(&self, reason: &str) -> bool {
        let state = self.state.lock().await;
        match (&state.sink, state.connection) {
            (Some(sink), Some(connection)) => sink
                .send(TransportEvent::ConnectionError {
                    connection,
                    reason: reason.to_string(),
                })
                .is_ok(),
            _ => false,
        }
    }

    pub async fn emit(&self, event: TransportEvent) -> bool {
        let state = self.state.lock().await;
        state
            .sink
            .as_ref()
            .is_some_and(|sink| sink.send(event).is_ok())
    }

    /// Deliver a message on the latest subscription to `subscribed_address`.
    /// Returns the delivery tag, or `None` when nothing is subscribed there.
    pub async fn deliver(
        &self,
        subscribed_address: &str,
        address: &str,
        payload: impl Into<Bytes>,
        headers: HashMap<String, String>,
    ) -> Option<u64> {
        let subscription = self.subscription_for(subscribed_address).await?;
        let delivery_tag = {
            let mut state = self.state.lock().await;
            state.next_delivery_tag += 1;
            state.next_delivery_tag
        };
        let delivery = Delivery {
            subscription,
            address: address.to_string(),
            payload: payload.into(),
            headers,
            delivery_tag: Some(delivery_tag),
            redelivered: false,
        };
        self.emit(TransportEvent::Delivery(delivery))
            .await
            .then_some(delivery_tag)
    }

    pub async fn clear_history(&self) {
        let mut state = self.state.lock().await;
        state.opened_with.clear();
        state.closed.clear();
        state.channels.clear();
        state.closed_channels.clear();
        state.subscriptions.clear();
        state.unsubscribed.clear();
        state.publishes.clear();
        state.settlements.clear();
        state.publish_attempts = 0;
        state.open_attempts = 0;
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    async fn open(
        &self,
        params: &ConnectionParams,
        events: EventSink,
    ) -> Result<ConnectionHandle, TransportError> {
        let open_delay = self.state.lock().await.open_delay;
        if let Some(delay) = open_delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().await;
        state.open_attempts += 1;
        if state.fail_all_opens {
            return Err(TransportError::ConnectionFailed(format!(
                "{} refused connection",
                params.host
            )));
        }
        if state.fail_opens > 0 {
            state.fail_opens -= 1;
            return Err(TransportError::ConnectionFailed(format!(
                "{} unreachable",
                params.host
            )));
        }

        let connection = ConnectionHandle(state.next_handle());
        state.opened_with.push(params.clone());
        state.connection = Some(connection);
        state.sink = Some(events);
        Ok(connection)
    }

    async fn close(&self, connection: ConnectionHandle) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        state.closed.push(connection);
        if state.connection == Some(connection) {
            state.connection = None;
        }
        Ok(())
    }

    async fn open_channel(
        &self,
        connection: ConnectionHandle,
        name: &str,
    ) -> Result<ChannelHandle, TransportError> {
        let mut state = self.state.lock().await;
        if state.connection != Some(connection) {
            return Err(TransportError::Closed);
        }
        let channel = ChannelHandle(state.next_handle());
        state.channels.push((channel, name.to_string()));
        Ok(channel)
    }

    async fn close_channel(&self, channel: ChannelHandle) -> Result<(), TransportError> {
        self.state.lock().await.closed_channels.push(channel);
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: ChannelHandle,
        address: &str,
        options: &SubscribeOptions,
    ) -> Result<SubscriptionHandle, TransportError> {
        let mut state = self.state.lock().await;
        if state.fail_subscribe {
            return Err(TransportError::SubscriptionFailed(format!(
                "access refused to {address}"
            )));
        }
        let subscription = SubscriptionHandle {
            channel,
            id: format!("sub-{}", state.next_handle()),
        };
        state.subscriptions.push(RecordedSubscribe {
            subscription: subscription.clone(),
            address: address.to_string(),
            options: *options,
        });
        Ok(subscription)
    }

    async fn unsubscribe(&self, subscription: &SubscriptionHandle) -> Result<(), TransportError> {
        self.state
            .lock()
            .await
            .unsubscribed
            .push(subscription.clone());
        Ok(())
    }

    async fn publish(
        &self,
        channel: ChannelHandle,
        address: &str,
        payload: Bytes,
        options: &SendOptions,
    ) -> Result<DeliveryResult, TransportError> {
        let mut state = self.state.lock().await;
        state.publish_attempts += 1;
        let attempt = state.publish_attempts;
        if state.fail_publish || state.fail_publish_attempts.contains(&attempt) {
            return Err(TransportError::PublishFailed(format!(
                "publish #{attempt} to {address} refused"
            )));
        }
        state.publishes.push(RecordedPublish {
            channel,
            address: address.to_string(),
            payload,
            options: options.clone(),
        });
        Ok(if options.confirm {
            DeliveryResult::Confirmed
        } else {
            DeliveryResult::Sent
        })
    }

    async fn ack(
        &self,
        channel: ChannelHandle,
        delivery_tag: u64,
        all_up_to: bool,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        if state.fail_settle {
            return Err(TransportError::AckFailed("injected failure".to_string()));
        }
        state.settlements.push(RecordedSettlement::Ack {
            channel,
            delivery_tag,
            all_up_to,
        });
        Ok(())
    }

    async fn nack(
        &self,
        channel: ChannelHandle,
        delivery_tag: u64,
        all_up_to: bool,
        requeue: bool,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        if state.fail_settle {
            return Err(TransportError::AckFailed("injected failure".to_string()));
        }
        state.settlements.push(RecordedSettlement::Nack {
            channel,
            delivery_tag,
            all_up_to,
            requeue,
        });
        Ok(())
    }
}

/// Connection parameters pointing at a fake broker
pub fn mock_connection_params(principal: &str, secret: &str) -> ConnectionParams {
    ConnectionParams {
        host: "broker.test".to_string(),
        vhost: Some("devices".to_string()),
        principal: principal.to_string(),
        secret: secret.to_string(),
        tls: false,
        ports: ProtocolPorts::default(),
    }
}

/// Config provider that counts calls and can be told to fail
#[derive(Debug, Clone, Default)]
pub struct MockConfigProvider {
    calls: Arc<AtomicUsize>,
    failure: Option<ProviderError>,
}

impl MockConfigProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure(error: ProviderError) -> Self {
        Self {
            failure: Some(error),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConfigProvider for MockConfigProvider {
    async fn resolve(&self, credentials: &Credentials) -> Result<ConnectionParams, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        Ok(mock_connection_params(
            credentials.principal(),
            credentials.secret(),
        ))
    }
}
