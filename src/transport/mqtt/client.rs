//! rumqttc-backed [`Transport`] implementation
//!
//! Each `open` creates a fresh rumqttc client and spawns a task that drives
//! its event loop. The task reports ConnAck back to `open`, forwards inbound
//! publishes to every matching subscription, resolves confirmed publishes on
//! their PubAck, and stops on the first event loop error after reporting it.
//! Reconnection belongs to the client engine, never to rumqttc.
//!
//! MQTT has no channels; channel handles are bookkeeping that group
//! subscriptions so they can be dropped together.

use super::connection::{build_client_id, configure_mqtt_options, MqttSettings};
use super::message_handler::{EventRoute, MessageHandler};
use crate::provider::ConnectionParams;
use crate::transport::{
    ChannelHandle, ConnectionHandle, Delivery, DeliveryResult, EventSink, Protocol, SendOptions,
    SubscribeOptions, SubscriptionHandle, Transport, TransportError, TransportEvent,
};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::PublishProperties;
use rumqttc::v5::mqttbytes::{valid_topic, QoS};
use rumqttc::v5::{AsyncClient, EventLoop};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Pause before retrying a publish against a full request queue
const REQUEST_RETRY_INTERVAL: std::time::Duration = std::time::Duration::from_millis(10);

#[derive(Debug, Clone)]
struct SubscriptionRecord {
    handle: SubscriptionHandle,
    filter: String,
}

type SharedSubscriptions = Arc<Mutex<Vec<SubscriptionRecord>>>;

type ConfirmWaiter = oneshot::Sender<Result<(), String>>;

/// Pairs publish requests with the packet ids rumqttc assigns them.
///
/// rumqttc writes publishes in request order and reports each one as
/// `Outgoing::Publish(pkid)`, so the front of `written` always belongs to the
/// next such event. Requests must be queued while holding the tracker lock.
#[derive(Default)]
struct PublishTracker {
    written: VecDeque<Option<ConfirmWaiter>>,
    awaiting_ack: HashMap<u16, ConfirmWaiter>,
    closed: bool,
}

impl PublishTracker {
    fn on_written(&mut self, packet_id: u16) {
        match self.written.pop_front() {
            Some(Some(waiter)) if packet_id == 0 => {
                let _ = waiter.send(Ok(()));
            }
            Some(Some(waiter)) => {
                self.awaiting_ack.insert(packet_id, waiter);
            }
            Some(None) => {}
            None => debug!(packet_id, "Publish written without a tracked request"),
        }
    }

    fn on_acknowledged(&mut self, packet_id: u16, rejection: Option<String>) {
        if let Some(waiter) = self.awaiting_ack.remove(&packet_id) {
            let _ = waiter.send(rejection.map_or(Ok(()), Err));
        }
    }

    /// Dropping the waiters tells every pending publisher the link is gone
    fn close(&mut self) {
        self.closed = true;
        self.written.clear();
        self.awaiting_ack.clear();
    }
}

type SharedTracker = Arc<Mutex<PublishTracker>>;

struct MqttConnection {
    client: AsyncClient,
    subscriptions: SharedSubscriptions,
    publishes: SharedTracker,
    shutdown_tx: watch::Sender<bool>,
    event_loop_handle: JoinHandle<()>,
}

/// MQTT v5 transport
pub struct MqttTransport {
    settings: MqttSettings,
    next_handle: AtomicU64,
    connections: Mutex<HashMap<ConnectionHandle, MqttConnection>>,
    channels: Mutex<HashMap<ChannelHandle, ConnectionHandle>>,
}

impl MqttTransport {
    pub fn new(settings: MqttSettings) -> Self {
        Self {
            settings,
            next_handle: AtomicU64::new(1),
            connections: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn allocate(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    async fn connection_for(
        &self,
        channel: ChannelHandle,
    ) -> Result<(ConnectionHandle, AsyncClient, SharedSubscriptions), TransportError> {
        let connection = *self
            .channels
            .lock()
            .await
            .get(&channel)
            .ok_or_else(|| TransportError::UnknownHandle(format!("channel {}", channel.0)))?;
        let connections = self.connections.lock().await;
        let entry = connections.get(&connection).ok_or(TransportError::Closed)?;
        Ok((connection, entry.client.clone(), entry.subscriptions.clone()))
    }

    async fn tracker_for(&self, channel: ChannelHandle) -> Result<SharedTracker, TransportError> {
        let (connection, _, _) = self.connection_for(channel).await?;
        let connections = self.connections.lock().await;
        let entry = connections.get(&connection).ok_or(TransportError::Closed)?;
        Ok(entry.publishes.clone())
    }

    /// Hand a publish to rumqttc and record it with the tracker in one step
    #[allow(clippy::too_many_arguments)]
    async fn enqueue_publish(
        client: &AsyncClient,
        publishes: &SharedTracker,
        address: &str,
        qos: QoS,
        payload: Bytes,
        properties: Option<PublishProperties>,
        waiter: Option<ConfirmWaiter>,
        deadline: Instant,
    ) -> Result<(), TransportError> {
        if !valid_topic(address) {
            return Err(TransportError::PublishFailed(format!(
                "invalid topic '{address}'"
            )));
        }
        let mut waiter = waiter;
        loop {
            {
                let mut tracker = publishes.lock().await;
                if tracker.closed {
                    return Err(TransportError::Closed);
                }
                let queued = match &properties {
                    Some(properties) => client.try_publish_with_properties(
                        address,
                        qos,
                        false,
                        payload.clone(),
                        properties.clone(),
                    ),
                    None => client.try_publish(address, qos, false, payload.clone()),
                };
                if queued.is_ok() {
                    tracker.written.push_back(waiter.take());
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(TransportError::PublishFailed(
                    "request queue stayed full".to_string(),
                ));
            }
            tokio::time::sleep(REQUEST_RETRY_INTERVAL).await;
        }
    }

    /// Wait for the PubAck of a confirmed publish until the deadline
    async fn wait_for_publish_confirmation(
        confirmation: oneshot::Receiver<Result<(), String>>,
        deadline: Instant,
    ) -> Result<DeliveryResult, TransportError> {
        match tokio::time::timeout_at(deadline, confirmation).await {
            Ok(Ok(Ok(()))) => Ok(DeliveryResult::Confirmed),
            Ok(Ok(Err(reason))) => Ok(DeliveryResult::Rejected(reason)),
            Ok(Err(_)) => Err(TransportError::PublishFailed(
                "connection lost before PubAck".to_string(),
            )),
            Err(_) => Err(TransportError::PublishFailed(
                "PubAck timeout - broker did not confirm the publish".to_string(),
            )),
        }
    }

    /// Wait for ConnAck, or the loop's first error, within the timeout
    async fn wait_for_connection_confirmation(
        connack_rx: oneshot::Receiver<Result<(), String>>,
        timeout: std::time::Duration,
    ) -> Result<(), TransportError> {
        match tokio::time::timeout(timeout, connack_rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(TransportError::ConnectionFailed(reason)),
            Ok(Err(_)) => Err(TransportError::ConnectionFailed(
                "event loop stopped before ConnAck".to_string(),
            )),
            Err(_) => Err(TransportError::ConnectionFailed(
                "ConnAck timeout - no connection confirmation received".to_string(),
            )),
        }
    }

    async fn run_event_loop(
        connection: ConnectionHandle,
        mut event_loop: EventLoop,
        subscriptions: SharedSubscriptions,
        publishes: SharedTracker,
        sink: EventSink,
        mut connack_tx: Option<oneshot::Sender<Result<(), String>>>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    debug!(connection = connection.0, "MQTT event loop shutdown requested");
                    break;
                }
                polled = event_loop.poll() => match polled {
                    Ok(event) => match MessageHandler::route_mqtt_event(&event) {
                        EventRoute::ConnectionAcknowledged => {
                            if let Some(tx) = connack_tx.take() {
                                let _ = tx.send(Ok(()));
                            }
                        }
                        EventRoute::MessageReceived { topic, payload, headers, duplicate } => {
                            Self::forward_message(&subscriptions, &sink, &topic, payload, headers, duplicate).await;
                        }
                        EventRoute::Disconnected => {
                            warn!(connection = connection.0, "MQTT broker sent DISCONNECT");
                            let _ = sink.send(TransportEvent::ConnectionClosed { connection });
                            break;
                        }
                        EventRoute::SubscriptionConfirmed { packet_id } => {
                            debug!(target: "mqtt_transport", packet_id, "Subscription confirmed");
                        }
                        EventRoute::PublishWritten { packet_id } => {
                            publishes.lock().await.on_written(packet_id);
                        }
                        EventRoute::PublishAcknowledged { packet_id, rejection } => {
                            publishes.lock().await.on_acknowledged(packet_id, rejection);
                        }
                        EventRoute::InfrastructureEvent(event) => {
                            debug!(target: "mqtt_transport", "MQTT event: {}", event);
                        }
                        EventRoute::OutgoingEvent => {}
                    },
                    Err(e) => {
                        let reason = e.to_string();
                        match connack_tx.take() {
                            Some(tx) => {
                                let _ = tx.send(Err(reason));
                            }
                            None => {
                                error!(connection = connection.0, "MQTT event loop error: {}", reason);
                                let _ = sink.send(TransportEvent::ConnectionError { connection, reason });
                            }
                        }
                        break;
                    }
                }
            }
        }
        publishes.lock().await.close();
        debug!(connection = connection.0, "MQTT event loop stopped");
    }

    async fn forward_message(
        subscriptions: &SharedSubscriptions,
        sink: &EventSink,
        topic: &str,
        payload: Bytes,
        headers: HashMap<String, String>,
        duplicate: bool,
    ) {
        let matching: Vec<SubscriptionHandle> = subscriptions
            .lock()
            .await
            .iter()
            .filter(|record| MessageHandler::topic_matches(&record.filter, topic))
            .map(|record| record.handle.clone())
            .collect();

        if matching.is_empty() {
            debug!(target: "mqtt_transport", topic, "No subscription for inbound message");
            return;
        }

        for subscription in matching {
            let delivery = Delivery {
                subscription,
                address: topic.to_string(),
                payload: payload.clone(),
                headers: headers.clone(),
                delivery_tag: None,
                redelivered: duplicate,
            };
            if sink.send(TransportEvent::Delivery(delivery)).is_err() {
                debug!("Event sink closed, dropping inbound message");
                return;
            }
        }
    }
}

impl Default for MqttTransport {
    fn default() -> Self {
        Self::new(MqttSettings::default())
    }
}

#[async_trait]
impl Transport for MqttTransport {
    fn protocol(&self) -> Protocol {
        Protocol::PubSub
    }

    async fn open(
        &self,
        params: &ConnectionParams,
        events: EventSink,
    ) -> Result<ConnectionHandle, TransportError> {
        let client_id = build_client_id(&params.principal);
        let mqtt_options = configure_mqtt_options(&client_id, params, &self.settings)?;
        let (client, event_loop) = AsyncClient::new(mqtt_options, self.settings.request_capacity);

        let connection = ConnectionHandle(self.allocate());
        let subscriptions: SharedSubscriptions = Arc::new(Mutex::new(Vec::new()));
        let publishes: SharedTracker = Arc::new(Mutex::new(PublishTracker::default()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (connack_tx, connack_rx) = oneshot::channel();

        let event_loop_handle = tokio::spawn(Self::run_event_loop(
            connection,
            event_loop,
            subscriptions.clone(),
            publishes.clone(),
            events,
            Some(connack_tx),
            shutdown_rx,
        ));

        if let Err(e) =
            Self::wait_for_connection_confirmation(connack_rx, self.settings.connack_timeout).await
        {
            let _ = shutdown_tx.send(true);
            event_loop_handle.abort();
            return Err(e);
        }

        info!(
            connection = connection.0,
            host = %params.host,
            port = params.port(Protocol::PubSub),
            client_id = %client_id,
            "MQTT connection established"
        );

        self.connections.lock().await.insert(
            connection,
            MqttConnection {
                client,
                subscriptions,
                publishes,
                shutdown_tx,
                event_loop_handle,
            },
        );
        Ok(connection)
    }

    async fn close(&self, connection: ConnectionHandle) -> Result<(), TransportError> {
        let entry = self
            .connections
            .lock()
            .await
            .remove(&connection)
            .ok_or_else(|| TransportError::UnknownHandle(format!("connection {}", connection.0)))?;
        self.channels
            .lock()
            .await
            .retain(|_, owner| *owner != connection);

        // a dead event loop cannot flush DISCONNECT; ignore that failure
        if !entry.event_loop_handle.is_finished() {
            if let Err(e) = entry.client.disconnect().await {
                debug!(error = %e, "MQTT disconnect request failed");
            }
        }
        let _ = entry.shutdown_tx.send(true);
        debug!(connection = connection.0, "MQTT connection closed");
        Ok(())
    }

    async fn open_channel(
        &self,
        connection: ConnectionHandle,
        name: &str,
    ) -> Result<ChannelHandle, TransportError> {
        if !self.connections.lock().await.contains_key(&connection) {
            return Err(TransportError::Closed);
        }
        let channel = ChannelHandle(self.allocate());
        self.channels.lock().await.insert(channel, connection);
        debug!(channel = channel.0, name, "Opened MQTT channel");
        Ok(channel)
    }

    async fn close_channel(&self, channel: ChannelHandle) -> Result<(), TransportError> {
        let orphaned: Vec<SubscriptionHandle> = match self.connection_for(channel).await {
            Ok((_, _, subscriptions)) => subscriptions
                .lock()
                .await
                .iter()
                .filter(|record| record.handle.channel == channel)
                .map(|record| record.handle.clone())
                .collect(),
            Err(TransportError::Closed) => Vec::new(),
            Err(e) => return Err(e),
        };
        for subscription in orphaned {
            self.unsubscribe(&subscription).await?;
        }
        self.channels.lock().await.remove(&channel);
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: ChannelHandle,
        address: &str,
        _options: &SubscribeOptions,
    ) -> Result<SubscriptionHandle, TransportError> {
        let (_, client, subscriptions) = self.connection_for(channel).await?;
        client
            .subscribe(address, QoS::AtLeastOnce)
            .await
            .map_err(|e| TransportError::SubscriptionFailed(e.to_string()))?;

        let handle = SubscriptionHandle {
            channel,
            id: uuid::Uuid::new_v4().to_string(),
        };
        subscriptions.lock().await.push(SubscriptionRecord {
            handle: handle.clone(),
            filter: address.to_string(),
        });
        debug!(target: "mqtt_transport", filter = address, "Subscribed");
        Ok(handle)
    }

    async fn unsubscribe(&self, subscription: &SubscriptionHandle) -> Result<(), TransportError> {
        let (_, client, subscriptions) = self.connection_for(subscription.channel).await?;

        let filter = {
            let mut records = subscriptions.lock().await;
            let Some(index) = records.iter().position(|r| &r.handle == subscription) else {
                return Err(TransportError::UnknownHandle(format!(
                    "subscription {}",
                    subscription.id
                )));
            };
            let removed = records.remove(index);
            // other listeners may share the filter
            if records.iter().any(|r| r.filter == removed.filter) {
                None
            } else {
                Some(removed.filter)
            }
        };

        if let Some(filter) = filter {
            client
                .unsubscribe(filter.as_str())
                .await
                .map_err(|e| TransportError::SubscriptionFailed(e.to_string()))?;
        }
        Ok(())
    }

    async fn publish(
        &self,
        channel: ChannelHandle,
        address: &str,
        payload: Bytes,
        options: &SendOptions,
    ) -> Result<DeliveryResult, TransportError> {
        let (_, client, _) = self.connection_for(channel).await?;
        let publishes = self.tracker_for(channel).await?;
        let qos = MessageHandler::determine_qos_level(options.confirm, options.persistent);
        let properties = MessageHandler::headers_to_properties(&options.headers);
        let deadline = Instant::now() + self.settings.confirm_timeout;

        // QoS 0 has no PubAck to wait for
        let (waiter, confirmation) = if options.confirm && qos != QoS::AtMostOnce {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        Self::enqueue_publish(
            &client, &publishes, address, qos, payload, properties, waiter, deadline,
        )
        .await?;

        match confirmation {
            Some(confirmation) => {
                Self::wait_for_publish_confirmation(confirmation, deadline).await
            }
            None => Ok(DeliveryResult::Sent),
        }
    }

    // rumqttc acknowledges QoS 1 deliveries itself, so there is nothing to settle
    async fn ack(
        &self,
        _channel: ChannelHandle,
        _delivery_tag: u64,
        _all_up_to: bool,
    ) -> Result<(), TransportError> {
        Ok(())
    }

    async fn nack(
        &self,
        _channel: ChannelHandle,
        delivery_tag: u64,
        _all_up_to: bool,
        _requeue: bool,
    ) -> Result<(), TransportError> {
        debug!(delivery_tag, "MQTT has no negative acknowledgement, ignoring nack");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProtocolPorts;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn unreachable_params() -> ConnectionParams {
        ConnectionParams {
            host: "127.0.0.1".to_string(),
            vhost: None,
            principal: "dev-1".to_string(),
            secret: "secret".to_string(),
            tls: false,
            ports: ProtocolPorts {
                mqtt: Some(1),
                ..ProtocolPorts::default()
            },
        }
    }

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_success() {
        let (tx, rx) = oneshot::channel();
        tx.send(Ok(())).unwrap();
        let result =
            MqttTransport::wait_for_connection_confirmation(rx, Duration::from_millis(100)).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_error() {
        let (tx, rx) = oneshot::channel();
        tx.send(Err("refused".to_string())).unwrap();
        let result =
            MqttTransport::wait_for_connection_confirmation(rx, Duration::from_millis(100)).await;
        assert_eq!(result, Err(TransportError::ConnectionFailed("refused".to_string())));
    }

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_timeout() {
        let (_tx, rx) = oneshot::channel::<Result<(), String>>();
        let result =
            MqttTransport::wait_for_connection_confirmation(rx, Duration::from_millis(10)).await;
        assert!(matches!(result, Err(TransportError::ConnectionFailed(msg)) if msg.contains("timeout")));
    }

    #[tokio::test]
    async fn test_tracker_pairs_writes_with_requests_in_order() {
        let mut tracker = PublishTracker::default();
        let (first_tx, first_rx) = oneshot::channel();
        let (second_tx, second_rx) = oneshot::channel();
        tracker.written.push_back(Some(first_tx));
        tracker.written.push_back(None);
        tracker.written.push_back(Some(second_tx));

        tracker.on_written(1);
        tracker.on_written(0);
        tracker.on_written(2);
        assert!(tracker.written.is_empty());
        assert_eq!(tracker.awaiting_ack.len(), 2);

        tracker.on_acknowledged(2, Some("QuotaExceeded".to_string()));
        tracker.on_acknowledged(1, None);
        assert_eq!(first_rx.await.unwrap(), Ok(()));
        assert_eq!(second_rx.await.unwrap(), Err("QuotaExceeded".to_string()));
    }

    #[tokio::test]
    async fn test_tracker_close_fails_pending_confirmations() {
        let mut tracker = PublishTracker::default();
        let (queued_tx, queued_rx) = oneshot::channel();
        let (written_tx, written_rx) = oneshot::channel();
        tracker.written.push_back(Some(written_tx));
        tracker.on_written(5);
        tracker.written.push_back(Some(queued_tx));

        tracker.close();

        assert!(tracker.closed);
        let deadline = Instant::now() + Duration::from_secs(1);
        for rx in [queued_rx, written_rx] {
            let result = MqttTransport::wait_for_publish_confirmation(rx, deadline).await;
            assert!(matches!(result, Err(TransportError::PublishFailed(msg)) if msg.contains("lost")));
        }
    }

    #[tokio::test]
    async fn test_publish_confirmation_outcomes() {
        let deadline = Instant::now() + Duration::from_millis(50);

        let (tx, rx) = oneshot::channel();
        tx.send(Ok(())).unwrap();
        assert_eq!(
            MqttTransport::wait_for_publish_confirmation(rx, deadline).await,
            Ok(DeliveryResult::Confirmed)
        );

        let (tx, rx) = oneshot::channel();
        tx.send(Err("NotAuthorized".to_string())).unwrap();
        assert_eq!(
            MqttTransport::wait_for_publish_confirmation(rx, deadline).await,
            Ok(DeliveryResult::Rejected("NotAuthorized".to_string()))
        );

        let (_tx, rx) = oneshot::channel::<Result<(), String>>();
        let result = MqttTransport::wait_for_publish_confirmation(rx, deadline).await;
        assert!(matches!(result, Err(TransportError::PublishFailed(msg)) if msg.contains("timeout")));
    }

    #[tokio::test]
    async fn test_closed_tracker_refuses_publish() {
        let (client, _event_loop) = AsyncClient::new(
            rumqttc::v5::MqttOptions::new("dev-1", "127.0.0.1", 1),
            4,
        );
        let publishes: SharedTracker = Arc::new(Mutex::new(PublishTracker::default()));
        publishes.lock().await.close();

        let result = MqttTransport::enqueue_publish(
            &client,
            &publishes,
            "dev-1/data",
            QoS::AtLeastOnce,
            Bytes::from_static(b"{}"),
            None,
            None,
            Instant::now() + Duration::from_secs(1),
        )
        .await;

        assert_eq!(result, Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn test_invalid_topic_is_refused_before_queueing() {
        let (client, _event_loop) = AsyncClient::new(
            rumqttc::v5::MqttOptions::new("dev-1", "127.0.0.1", 1),
            4,
        );
        let publishes: SharedTracker = Arc::new(Mutex::new(PublishTracker::default()));

        let result = MqttTransport::enqueue_publish(
            &client,
            &publishes,
            "dev-1/+/data",
            QoS::AtMostOnce,
            Bytes::new(),
            None,
            None,
            Instant::now() + Duration::from_secs(1),
        )
        .await;

        assert!(matches!(result, Err(TransportError::PublishFailed(_))));
        assert!(publishes.lock().await.written.is_empty());
    }

    #[tokio::test]
    async fn test_queued_publish_is_tracked() {
        let (client, _event_loop) = AsyncClient::new(
            rumqttc::v5::MqttOptions::new("dev-1", "127.0.0.1", 1),
            4,
        );
        let publishes: SharedTracker = Arc::new(Mutex::new(PublishTracker::default()));
        let (tx, _rx) = oneshot::channel();

        MqttTransport::enqueue_publish(
            &client,
            &publishes,
            "dev-1/data",
            QoS::AtLeastOnce,
            Bytes::from_static(b"{}"),
            None,
            Some(tx),
            Instant::now() + Duration::from_secs(1),
        )
        .await
        .unwrap();

        let tracker = publishes.lock().await;
        assert_eq!(tracker.written.len(), 1);
        assert!(tracker.written[0].is_some());
    }

    #[tokio::test]
    async fn test_open_fails_without_broker() {
        let transport = MqttTransport::new(MqttSettings {
            connack_timeout: Duration::from_secs(2),
            ..MqttSettings::default()
        });
        let (sink, _events) = mpsc::unbounded_channel();

        let result = transport.open(&unreachable_params(), sink).await;
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
        assert!(transport.connections.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_operations_on_unknown_handles() {
        let transport = MqttTransport::default();
        assert_eq!(transport.protocol(), Protocol::PubSub);

        assert!(matches!(
            transport.open_channel(ConnectionHandle(7), "inbox").await,
            Err(TransportError::Closed)
        ));
        assert!(matches!(
            transport
                .publish(ChannelHandle(3), "dev-1/data", Bytes::new(), &SendOptions::default())
                .await,
            Err(TransportError::UnknownHandle(_))
        ));
        assert!(matches!(
            transport.close(ConnectionHandle(7)).await,
            Err(TransportError::UnknownHandle(_))
        ));
    }

    #[tokio::test]
    async fn test_forward_message_fans_out_to_matching_filters() {
        let subscriptions: SharedSubscriptions = Arc::new(Mutex::new(vec![
            SubscriptionRecord {
                handle: SubscriptionHandle {
                    channel: ChannelHandle(1),
                    id: "exact".to_string(),
                },
                filter: "dev-1/inbox".to_string(),
            },
            SubscriptionRecord {
                handle: SubscriptionHandle {
                    channel: ChannelHandle(2),
                    id: "wildcard".to_string(),
                },
                filter: "dev-1/#".to_string(),
            },
            SubscriptionRecord {
                handle: SubscriptionHandle {
                    channel: ChannelHandle(3),
                    id: "other".to_string(),
                },
                filter: "dev-2/inbox".to_string(),
            },
        ]));
        let (sink, mut events) = mpsc::unbounded_channel();

        MqttTransport::forward_message(
            &subscriptions,
            &sink,
            "dev-1/inbox",
            Bytes::from("hi"),
            HashMap::new(),
            false,
        )
        .await;

        let mut ids = Vec::new();
        while let Ok(TransportEvent::Delivery(delivery)) = events.try_recv() {
            assert_eq!(delivery.address, "dev-1/inbox");
            ids.push(delivery.subscription.id);
        }
        assert_eq!(ids, vec!["exact".to_string(), "wildcard".to_string()]);
    }
}
