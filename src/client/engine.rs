//! Serialized engine task
//!
//! One task owns the connection state, the listener registry and the publish
//! cache. It reacts to exactly one input at a time: an application command,
//! a transport event, or the reconnect timer. Nothing here is shared, so no
//! locking is needed and no two transitions ever interleave.

use super::cache::{CacheOptions, PublishCache};
use super::connection::{ConnectionEvent, ConnectionManager, ReconnectionDecision};
use super::events::{ClientEvent, LogLevel};
use super::registry::{ListenerCallback, ListenerOptions, ListenerRegistry, LiveBinding};
use super::{BindOutcome, ConnectOutcome, ListenerInfo, PublishOptions, PublishOutcome};
use crate::codec::{Codec, Payload, CONTENT_TYPE_HEADER};
use crate::error::{ClientError, ClientResult};
use crate::gate::{is_api_origin, MessageGate};
use crate::message::{ReceivedMessage, Settlement};
use crate::provider::ParamsCache;
use crate::routing::{
    parse_address, parse_stream_address, RoutingKeyResolver, Target, SENDER_HEADER,
};
use crate::transport::{
    ChannelHandle, ConnectionHandle, Delivery, EventSink, Protocol, Transport, TransportEvent,
};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

/// Name of the channel shared by all publishes
pub(crate) const PUBLISH_CHANNEL: &str = "publish";

type Reply<T> = oneshot::Sender<ClientResult<T>>;

pub(crate) enum Command {
    Connect(Reply<ConnectOutcome>),
    Disconnect(Reply<()>),
    AddListener {
        target: Target,
        options: ListenerOptions,
        callback: ListenerCallback,
        reply: Reply<String>,
    },
    RemoveListener {
        name: String,
        reply: Reply<()>,
    },
    Bind {
        name: String,
        reply: Reply<BindOutcome>,
    },
    Publish {
        target: Target,
        payload: Payload,
        options: PublishOptions,
        reply: Reply<PublishOutcome>,
    },
    Flush(Reply<usize>),
    CachedCount(Reply<usize>),
    Listeners(Reply<Vec<ListenerInfo>>),
    ResetParams(Reply<()>),
    Shutdown(Reply<()>),
}

pub(crate) struct Engine {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) protocol: Protocol,
    pub(crate) params: ParamsCache,
    pub(crate) resolver: RoutingKeyResolver,
    pub(crate) codec: Arc<dyn Codec>,
    pub(crate) manager: ConnectionManager,
    pub(crate) registry: ListenerRegistry,
    pub(crate) cache: PublishCache,
    pub(crate) cache_options: CacheOptions,
    pub(crate) connection: Option<ConnectionHandle>,
    pub(crate) publish_channel: Option<ChannelHandle>,
    pub(crate) events: broadcast::Sender<ClientEvent>,
    pub(crate) sink: EventSink,
}

impl Engine {
    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        info!(
            principal = %self.resolver.principal(),
            protocol = %self.protocol,
            "Client engine started"
        );

        let mut shutdown = None;
        loop {
            let retry_at = self.manager.retry_deadline();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown(reply)) => {
                        shutdown = Some((reply, self.disconnect().await));
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("All client handles dropped");
                        if let Err(e) = self.disconnect().await {
                            warn!(error = %e, "Disconnect during shutdown failed");
                        }
                        break;
                    }
                },
                Some(event) = transport_events.recv() => self.handle_transport_event(event).await,
                _ = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    self.handle_retry_timer().await;
                }
            }
        }

        self.cache.persist_or_warn().await;
        info!("Client engine stopped");
        if let Some((reply, result)) = shutdown {
            let _ = reply.send(result);
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(reply) => {
                let result = self.connect().await;
                let _ = reply.send(result);
            }
            Command::Disconnect(reply) => {
                let result = self.disconnect().await;
                let _ = reply.send(result);
            }
            Command::AddListener {
                target,
                options,
                callback,
                reply,
            } => {
                let result = self.add_listener(target, options, callback).await;
                let _ = reply.send(result);
            }
            Command::RemoveListener { name, reply } => {
                let result = self.remove_listener(&name).await;
                let _ = reply.send(result);
            }
            Command::Bind { name, reply } => {
                let result = self.bind(&name).await;
                let _ = reply.send(result);
            }
            Command::Publish {
                target,
                payload,
                options,
                reply,
            } => {
                let result = self.publish(target, payload, options).await;
                let _ = reply.send(result);
            }
            Command::Flush(reply) => {
                self.flush_cache().await;
                let _ = reply.send(Ok(self.cache.len()));
            }
            Command::CachedCount(reply) => {
                let _ = reply.send(Ok(self.cache.len()));
            }
            Command::Listeners(reply) => {
                let _ = reply.send(Ok(self.listener_infos()));
            }
            Command::ResetParams(reply) => {
                self.params.reset();
                debug!("Connection parameters will be re-resolved on next connect");
                let _ = reply.send(Ok(()));
            }
            // handled in the run loop
            Command::Shutdown(reply) => {
                let _ = reply.send(Ok(()));
            }
        }
    }

    fn emit(&self, event: ClientEvent) {
        // no receivers is fine
        let _ = self.events.send(event);
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Debug => debug!("{}", message),
            LogLevel::Info => info!("{}", message),
            LogLevel::Warn => warn!("{}", message),
            LogLevel::Error => error!("{}", message),
        }
        self.emit(ClientEvent::log(level, message));
    }

    fn report_error(&self, context: &str, err: &ClientError) {
        let message = err.sanitized();
        self.log(LogLevel::Error, format!("{context}: {message}"));
        self.emit(ClientEvent::error(message));
    }

    fn current_connection(&self) -> Option<ConnectionHandle> {
        self.connection.filter(|_| self.manager.is_connected())
    }

    // -- connection lifecycle --

    async fn connect(&mut self) -> ClientResult<ConnectOutcome> {
        if self.manager.is_connected() {
            debug!("connect() while already connected");
            return Ok(ConnectOutcome::AlreadyConnected);
        }

        if self.manager.cancel_retry() {
            debug!("Explicit connect supersedes pending retry");
        }
        self.manager.reset_attempts();
        self.manager.transition(ConnectionEvent::ConnectRequested);

        let span = crate::connection_span!(principal = %self.resolver.principal(), attempt = 0);
        match self.establish().instrument(span).await {
            Ok(()) => Ok(ConnectOutcome::Connected),
            Err(err) => match self.handle_attempt_failure(&err) {
                Some(ReconnectionDecision::Proceed { attempt, delay }) => {
                    Ok(ConnectOutcome::RetryScheduled { attempt, delay })
                }
                _ => Err(err),
            },
        }
    }

    /// Resolve params, open the transport and publish channel, then rebind and replay
    async fn establish(&mut self) -> ClientResult<()> {
        let params = self.params.get().await?;

        let connection = self
            .transport
            .open(&params, self.sink.clone())
            .await
            .map_err(|e| ClientError::connection(e.to_string()))?;

        let publish_channel = match self.transport.open_channel(connection, PUBLISH_CHANNEL).await {
            Ok(channel) => channel,
            Err(e) => {
                if let Err(close_err) = self.transport.close(connection).await {
                    debug!(error = %close_err, "Close after failed channel open");
                }
                return Err(ClientError::connection(format!(
                    "cannot open publish channel: {e}"
                )));
            }
        };

        self.connection = Some(connection);
        self.publish_channel = Some(publish_channel);
        self.manager.transition(ConnectionEvent::AttemptSucceeded);
        self.emit(ClientEvent::Connect);

        self.bind_all().await;
        self.flush_cache().await;
        Ok(())
    }

    fn handle_attempt_failure(&mut self, err: &ClientError) -> Option<ReconnectionDecision> {
        self.report_error("Connection attempt failed", err);

        if !err.is_retryable() {
            self.manager
                .transition(ConnectionEvent::AttemptFailed { will_retry: false });
            return None;
        }

        let decision = self.manager.schedule_retry();
        match decision {
            ReconnectionDecision::Proceed { .. } => {
                self.manager
                    .transition(ConnectionEvent::AttemptFailed { will_retry: true });
            }
            ReconnectionDecision::AbortDisabled => {
                self.manager
                    .transition(ConnectionEvent::AttemptFailed { will_retry: false });
            }
            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                self.log(
                    LogLevel::Error,
                    format!(
                        "Giving up after {} reconnection attempts",
                        self.manager.attempts()
                    ),
                );
                self.manager.transition(ConnectionEvent::RetriesExhausted);
            }
        }
        Some(decision)
    }

    async fn handle_retry_timer(&mut self) {
        self.manager.cancel_retry();
        if self.manager.is_connected() {
            return;
        }

        self.manager.transition(ConnectionEvent::RetryTimerFired);
        let attempt = self.manager.attempts();
        debug!(attempt, "Reconnect timer fired");
        let span = crate::connection_span!(principal = %self.resolver.principal(), attempt);
        if let Err(err) = self.establish().instrument(span).await {
            self.handle_attempt_failure(&err);
        }
    }

    async fn disconnect(&mut self) -> ClientResult<()> {
        if self.manager.cancel_retry() {
            debug!("Cancelled pending reconnect");
        }
        self.manager.reset_attempts();

        let Some(connection) = self.connection.take() else {
            self.manager.transition(ConnectionEvent::DisconnectRequested);
            return Ok(());
        };

        for name in self.registry.names() {
            if let Some(binding) = self.registry.clear_live(&name) {
                self.release_binding(&name, binding).await;
                self.emit(ClientEvent::ChannelClose { listener: name });
            }
        }

        if let Some(channel) = self.publish_channel.take() {
            if let Err(e) = self.transport.close_channel(channel).await {
                debug!(error = %e, "Closing publish channel failed");
            }
        }

        let closed = self.transport.close(connection).await;
        self.manager.transition(ConnectionEvent::DisconnectRequested);
        self.emit(ClientEvent::Disconnect);

        if let Err(e) = closed {
            warn!(error = %e, "Transport close reported an error, connection dropped anyway");
        }
        info!("Disconnected");
        Ok(())
    }

    async fn handle_connection_lost(&mut self, reason: Option<String>) {
        let Some(connection) = self.connection.take() else {
            return;
        };
        self.publish_channel = None;

        match &reason {
            Some(reason) => {
                let err = ClientError::connection(reason.clone());
                self.report_error("Transport error", &err);
            }
            None => self.log(LogLevel::Warn, "Transport connection closed"),
        }

        for name in self.registry.clear_all_live() {
            self.emit(ClientEvent::ChannelClose { listener: name });
        }

        if let Err(e) = self.transport.close(connection).await {
            debug!(error = %e, "Releasing lost connection failed");
        }

        self.manager.reset_attempts();
        self.manager.transition(ConnectionEvent::TransportLost);
        self.emit(ClientEvent::Disconnect);
        self.manager.schedule_retry();
    }

    async fn handle_channel_lost(&mut self, channel: ChannelHandle) {
        if self.publish_channel == Some(channel) {
            debug!("Publish channel closed, reopening on next publish");
            self.publish_channel = None;
            return;
        }

        for name in self.registry.clear_channel(channel) {
            warn!(listener = %name, "Listener channel closed, will rebind on next connect");
            self.emit(ClientEvent::ChannelClose { listener: name });
        }
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::ConnectionError { connection, reason } => {
                if self.connection == Some(connection) {
                    self.handle_connection_lost(Some(reason)).await;
                } else {
                    debug!(?connection, %reason, "Ignoring error from stale connection");
                }
            }
            TransportEvent::ConnectionClosed { connection } => {
                if self.connection == Some(connection) {
                    self.handle_connection_lost(None).await;
                } else {
                    debug!(?connection, "Ignoring close of stale connection");
                }
            }
            TransportEvent::ChannelError { channel, reason } => {
                self.log(LogLevel::Warn, format!("Channel error: {reason}"));
                self.emit(ClientEvent::error(reason));
                self.handle_channel_lost(channel).await;
            }
            TransportEvent::ChannelClosed { channel } => {
                self.handle_channel_lost(channel).await;
            }
            TransportEvent::Delivery(delivery) => self.dispatch(delivery).await,
        }
    }

    // -- listeners --

    async fn add_listener(
        &mut self,
        target: Target,
        options: ListenerOptions,
        callback: ListenerCallback,
    ) -> ClientResult<String> {
        let address = self.resolver.resolve(
            &target,
            options.topic.as_deref(),
            options.routing_key.as_deref(),
        )?;
        let name = self.registry.add(target, address, options, callback);

        // entry stays registered even if this bind fails; the next connect retries it
        self.bind(&name).await?;
        Ok(name)
    }

    async fn remove_listener(&mut self, name: &str) -> ClientResult<()> {
        if !self.registry.contains(name) {
            return Err(ClientError::ListenerNotFound(name.to_string()));
        }

        if let Some(binding) = self.registry.clear_live(name) {
            self.release_binding(name, binding).await;
            self.emit(ClientEvent::ChannelClose {
                listener: name.to_string(),
            });
        }

        self.registry.remove(name);
        info!(listener = %name, "Listener removed");
        Ok(())
    }

    async fn release_binding(&self, name: &str, binding: LiveBinding) {
        if let Err(e) = self.transport.unsubscribe(&binding.subscription).await {
            warn!(listener = %name, error = %e, "Unsubscribe failed");
        }
        if let Err(e) = self.transport.close_channel(binding.channel).await {
            debug!(listener = %name, error = %e, "Closing listener channel failed");
        }
    }

    async fn bind(&mut self, name: &str) -> ClientResult<BindOutcome> {
        let entry = self
            .registry
            .get(name)
            .ok_or_else(|| ClientError::ListenerNotFound(name.to_string()))?;

        if entry.is_bound() {
            warn!(listener = %name, "Listener already bound, not subscribing again");
            return Ok(BindOutcome::AlreadyBound);
        }

        let Some(connection) = self.current_connection() else {
            debug!(listener = %name, "Not connected, bind deferred until connect");
            return Ok(BindOutcome::Deferred);
        };

        let address = entry.address().to_string();
        let subscribe_options = entry.options().subscribe_options();

        let channel = self
            .transport
            .open_channel(connection, name)
            .await
            .map_err(|e| ClientError::subscription(name, e.to_string()))?;

        let subscription = match self
            .transport
            .subscribe(channel, &address, &subscribe_options)
            .await
        {
            Ok(subscription) => subscription,
            Err(e) => {
                if let Err(close_err) = self.transport.close_channel(channel).await {
                    debug!(listener = %name, error = %close_err, "Closing channel after failed subscribe");
                }
                return Err(ClientError::subscription(name, e.to_string()));
            }
        };

        self.registry.set_live(
            name,
            LiveBinding {
                channel,
                subscription,
            },
        );
        info!(listener = %name, address = %address, "Listener bound");
        self.emit(ClientEvent::ChannelOpen {
            listener: name.to_string(),
        });
        Ok(BindOutcome::Bound)
    }

    async fn bind_all(&mut self) {
        for name in self.registry.names() {
            if let Err(err) = self.bind(&name).await {
                self.report_error("Listener rebind failed", &err);
            }
        }
    }

    fn listener_infos(&self) -> Vec<ListenerInfo> {
        self.registry
            .names()
            .iter()
            .filter_map(|name| self.registry.get(name))
            .map(|entry| ListenerInfo {
                name: entry.name().to_string(),
                target: entry.target().clone(),
                address: entry.address().to_string(),
                bound: entry.is_bound(),
            })
            .collect()
    }

    async fn dispatch(&mut self, delivery: Delivery) {
        let Some(entry) = self.registry.find_by_subscription(&delivery.subscription) else {
            debug!(address = %delivery.address, "Dropping delivery for unbound subscription");
            return;
        };
        let listener = entry.name().to_string();
        let target = entry.target().clone();
        let options = entry.options().clone();
        let callback = entry.callback().clone();

        let settlement = match (options.ack_mode.requires_explicit_ack(), delivery.delivery_tag) {
            (true, Some(delivery_tag)) => Some(Settlement {
                transport: self.transport.clone(),
                channel: delivery.subscription.channel,
                delivery_tag,
                all_up_to: options.all_up_to,
                requeue: options.requeue,
                settled: Arc::new(AtomicBool::new(false)),
            }),
            _ => None,
        };

        let parsed = match &target {
            Target::Channel(_) => parse_address(self.protocol, &delivery.address),
            Target::Stream(stream) => {
                parse_stream_address(self.protocol, stream, &delivery.address)
            }
        };
        let mut routing = match parsed {
            Ok(routing) => routing,
            Err(e) => {
                let err = ClientError::MalformedMessage(e.to_string());
                self.log(
                    LogLevel::Warn,
                    format!("Dropping message on listener {listener}: {err}"),
                );
                if let Some(settlement) = settlement {
                    let discard = Settlement {
                        requeue: false,
                        ..settlement
                    };
                    if let Err(e) = discard.nack().await {
                        warn!(listener = %listener, error = %e, "Nack of malformed message failed");
                    }
                }
                return;
            }
        };

        if routing.sender.is_empty() {
            if let Some(sender) = delivery.headers.get(SENDER_HEADER) {
                routing.sender = sender.clone();
            }
        }

        let from_api = is_api_origin(self.protocol, &delivery.headers, &routing);
        let verdict = MessageGate::new(self.resolver.principal(), options.gate)
            .evaluate(&routing.sender, from_api);
        if !verdict.is_accepted() {
            debug!(listener = %listener, sender = %routing.sender, ?verdict, "Message filtered");
            if let Some(settlement) = settlement {
                if let Err(e) = settlement.ack().await {
                    warn!(listener = %listener, error = %e, "Ack of filtered message failed");
                }
            }
            return;
        }

        let message = ReceivedMessage {
            content: self.codec.decode_tagged(
                &delivery.payload,
                delivery.headers.get(CONTENT_TYPE_HEADER).map(String::as_str),
            ),
            sender: routing.sender,
            channel: routing.channel,
            topic: routing.topic,
            address: delivery.address,
            headers: delivery.headers,
            from_api,
            redelivered: delivery.redelivered,
            listener: listener.clone(),
            settlement,
        };

        let panicked = {
            let _span = crate::listener_span!(listener = %listener).entered();
            std::panic::catch_unwind(AssertUnwindSafe(|| callback(message))).is_err()
        };
        if panicked {
            self.log(
                LogLevel::Error,
                format!("Listener {listener} callback panicked"),
            );
        }
    }

    // -- publishing --

    async fn publish(
        &mut self,
        target: Target,
        payload: Payload,
        options: PublishOptions,
    ) -> ClientResult<PublishOutcome> {
        let address = self.resolver.resolve(
            &target,
            options.topic.as_deref(),
            options.routing_key.as_deref(),
        )?;
        let body = self.codec.encode(&payload)?;
        let mut send_options = options.send_options();
        send_options
            .headers
            .entry(CONTENT_TYPE_HEADER.to_string())
            .or_insert_with(|| payload.content_type().to_string());
        if matches!(target, Target::Stream(_)) {
            send_options
                .headers
                .entry(SENDER_HEADER.to_string())
                .or_insert_with(|| self.resolver.principal().to_string());
        }

        if !self.manager.is_connected() {
            if !self.cache_options.enabled {
                return Err(ClientError::NotConnected {
                    state: self.manager.state(),
                });
            }
            self.cache.enqueue(target, address, body, send_options);
            self.cache.persist_or_warn().await;
            return Ok(PublishOutcome::Cached);
        }

        // anything already buffered must go out first
        let route_through_cache = self.cache_options.enabled
            && (self.cache_options.cache_while_connected || !self.cache.is_empty());
        if route_through_cache {
            let id = self.cache.enqueue(target, address, body, send_options);
            self.cache.persist_or_warn().await;
            self.flush_cache().await;
            return Ok(if self.cache.contains(id) {
                PublishOutcome::Cached
            } else {
                PublishOutcome::Delivered
            });
        }

        let channel = self.ensure_publish_channel().await?;
        match self
            .transport
            .publish(channel, &address, body, &send_options)
            .await
        {
            Ok(result) if result.is_delivered() => {
                debug!(address = %address, ?result, "Published");
                Ok(PublishOutcome::Delivered)
            }
            Ok(result) => Err(ClientError::publish(format!("{address}: {result:?}"))),
            Err(e) => Err(ClientError::publish(e.to_string())),
        }
    }

    async fn ensure_publish_channel(&mut self) -> ClientResult<ChannelHandle> {
        if let Some(channel) = self.publish_channel {
            return Ok(channel);
        }
        let connection = self.current_connection().ok_or(ClientError::NotConnected {
            state: self.manager.state(),
        })?;
        let channel = self
            .transport
            .open_channel(connection, PUBLISH_CHANNEL)
            .await
            .map_err(|e| ClientError::publish(e.to_string()))?;
        self.publish_channel = Some(channel);
        Ok(channel)
    }

    /// Replay buffered publications oldest first, stopping at the first failure
    async fn flush_cache(&mut self) {
        if self.cache.is_empty() {
            return;
        }
        if !self.cache.try_begin_flush() {
            debug!("Cache flush already in progress");
            return;
        }

        let snapshot = self.cache.snapshot();
        let total = snapshot.len();
        let mut delivered = 0;

        for entry in snapshot {
            let channel = match self.ensure_publish_channel().await {
                Ok(channel) => channel,
                Err(err) => {
                    debug!(error = %err, "Stopping cache flush");
                    break;
                }
            };

            match self
                .transport
                .publish(channel, &entry.address, entry.payload.clone(), &entry.options)
                .await
            {
                Ok(result) if result.is_delivered() => {
                    self.cache.remove(entry.id);
                    self.cache.persist_or_warn().await;
                    delivered += 1;
                }
                Ok(result) => {
                    self.log(
                        LogLevel::Warn,
                        format!(
                            "Cached message to {} not accepted ({result:?}), keeping {} queued",
                            entry.address,
                            self.cache.len()
                        ),
                    );
                    break;
                }
                Err(e) => {
                    self.report_error(
                        "Cache replay failed",
                        &ClientError::publish(format!("{}: {e}", entry.address)),
                    );
                    break;
                }
            }
        }

        self.cache.end_flush();
        info!(delivered, total, remaining = self.cache.len(), "Cache flush finished");
    }
}
