//! Client engine and the handle applications hold
//!
//! [`Client`] is a cheap, cloneable handle. Every call is forwarded to a single
//! engine task that owns the connection state, the listener registry and the
//! publish cache, so operations are applied one at a time in the order they
//! were issued. When the last handle is dropped the engine disconnects and
//! stops.
//!
//! ```no_run
//! use device_pubsub::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn run(transport: impl Transport, provider: Arc<dyn ConfigProvider>) -> ClientResult<()> {
//! let client = Client::builder(Credentials::device("thermostat-42", "s3cr3t"))
//!     .provider(provider)
//!     .start(transport)
//!     .await?;
//!
//! client
//!     .on_message("inbox", ListenerOptions::new(), |message| {
//!         println!("{} says {:?}", message.sender, message.content);
//!     })
//!     .await?;
//!
//! client.connect().await?;
//! client
//!     .publish("data", serde_json::json!({"some": "json"}), PublishOptions::new())
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod connection;
mod engine;
pub mod events;
pub mod registry;

pub use cache::{CacheOptions, CacheStore, CacheStoreError, CachedMessage, FileCacheStore, PublishCache};
pub use connection::{
    ConnectionEvent, ConnectionManager, ConnectionState, ReconnectPolicy, ReconnectionDecision,
};
pub use events::{ClientEvent, LogLevel};
pub use registry::{ListenerCallback, ListenerEntry, ListenerOptions, ListenerRegistry, LiveBinding};

use crate::codec::{Codec, JsonCodec, Payload};
use crate::error::{ClientError, ClientResult};
use crate::message::ReceivedMessage;
use crate::provider::{ConfigProvider, Credentials, ParamsCache};
use crate::routing::{RoutingKeyResolver, Target};
use crate::transport::{Protocol, SendOptions, Transport};
use engine::{Command, Engine};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::info;

/// Engine construction options
#[derive(Debug, Clone, PartialEq)]
pub struct ClientOptions {
    pub reconnect: ReconnectPolicy,
    pub cache: CacheOptions,
    /// Capacity of the lifecycle event broadcast
    pub event_capacity: usize,
    /// Capacity of the command queue between handles and the engine
    pub command_capacity: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            cache: CacheOptions::default(),
            event_capacity: 256,
            command_capacity: 64,
        }
    }
}

/// Per-publish options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    pub topic: Option<String>,
    /// Publish to this exact address instead of the resolved one
    pub routing_key: Option<String>,
    pub confirm: bool,
    pub persistent: bool,
    pub headers: HashMap<String, String>,
}

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    pub fn confirm(mut self, confirm: bool) -> Self {
        self.confirm = confirm;
        self
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub(crate) fn send_options(&self) -> SendOptions {
        SendOptions {
            confirm: self.confirm,
            persistent: self.persistent,
            headers: self.headers.clone(),
        }
    }
}

/// Result of a successful `connect()`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    AlreadyConnected,
    /// The attempt failed transiently and auto-reconnect will try again
    RetryScheduled { attempt: u32, delay: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Accepted by the transport
    Delivered,
    /// Buffered for replay on the next connect
    Cached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    Bound,
    /// Already had a live subscription; nothing was sent
    AlreadyBound,
    /// Not connected; will bind on the next connect
    Deferred,
}

/// Read-only view of a registered listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerInfo {
    pub name: String,
    pub target: Target,
    pub address: String,
    pub bound: bool,
}

/// Builder for [`Client`]
pub struct ClientBuilder {
    credentials: Credentials,
    provider: Option<Arc<dyn ConfigProvider>>,
    options: ClientOptions,
    codec: Arc<dyn Codec>,
    store: Option<Arc<dyn CacheStore>>,
}

impl ClientBuilder {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            provider: None,
            options: ClientOptions::default(),
            codec: Arc::new(JsonCodec),
            store: None,
        }
    }

    pub fn provider(mut self, provider: Arc<dyn ConfigProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.options.reconnect = policy;
        self
    }

    pub fn cache(mut self, cache: CacheOptions) -> Self {
        self.options.cache = cache;
        self
    }

    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// Persist the publish cache; its snapshot is restored on start
    pub fn cache_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Spawn the engine on the current tokio runtime
    pub async fn start<T: Transport>(self, transport: T) -> ClientResult<Client> {
        self.start_shared(Arc::new(transport)).await
    }

    pub async fn start_shared(self, transport: Arc<dyn Transport>) -> ClientResult<Client> {
        let provider = self
            .provider
            .ok_or_else(|| ClientError::configuration("no configuration provider set"))?;
        self.credentials.validate()?;
        self.options
            .reconnect
            .validate()
            .map_err(ClientError::configuration)?;

        let mut cache = match self.store {
            Some(store) => PublishCache::with_store(store),
            None => PublishCache::new(),
        };
        cache
            .restore()
            .await
            .map_err(|e| ClientError::Persistence(e.to_string()))?;

        let protocol = transport.protocol();
        let principal = self.credentials.principal().to_string();
        let (manager, state) = ConnectionManager::new(self.options.reconnect.clone());
        let (events, _) = broadcast::channel(self.options.event_capacity.max(1));
        let (commands_tx, commands_rx) = mpsc::channel(self.options.command_capacity.max(1));
        let (sink, transport_events) = mpsc::unbounded_channel();

        let engine = Engine {
            transport,
            protocol,
            params: ParamsCache::new(provider, self.credentials),
            resolver: RoutingKeyResolver::new(protocol, principal.clone()),
            codec: self.codec,
            manager,
            registry: ListenerRegistry::new(),
            cache,
            cache_options: self.options.cache,
            connection: None,
            publish_channel: None,
            events: events.clone(),
            sink,
        };
        tokio::spawn(engine.run(commands_rx, transport_events));
        info!(principal = %principal, protocol = %protocol, "Client started");

        Ok(Client {
            commands: commands_tx,
            state,
            events,
            principal: principal.into(),
            protocol,
        })
    }
}

/// Handle to a running client engine
#[derive(Clone)]
pub struct Client {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    events: broadcast::Sender<ClientEvent>,
    principal: Arc<str>,
    protocol: Protocol,
}

impl Client {
    pub fn builder(credentials: Credentials) -> ClientBuilder {
        ClientBuilder::new(credentials)
    }

    async fn request<R>(&self, build: impl FnOnce(oneshot::Sender<ClientResult<R>>) -> Command) -> ClientResult<R> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| ClientError::Closed)?;
        response.await.map_err(|_| ClientError::Closed)?
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Subscribe to lifecycle events from this point on
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Connect, rebind every listener and replay the publish cache.
    ///
    /// Configuration errors are always returned. Transport failures are
    /// returned when auto-reconnect is off; otherwise a retry is scheduled and
    /// reported as [`ConnectOutcome::RetryScheduled`].
    pub async fn connect(&self) -> ClientResult<ConnectOutcome> {
        self.request(Command::Connect).await
    }

    /// Close every subscription and the transport. Succeeds when already disconnected.
    pub async fn disconnect(&self) -> ClientResult<()> {
        self.request(Command::Disconnect).await
    }

    /// Listen on one of this client's channels; returns the listener name
    pub async fn on_message<F>(
        &self,
        channel: impl Into<String>,
        options: ListenerOptions,
        callback: F,
    ) -> ClientResult<String>
    where
        F: Fn(ReceivedMessage) + Send + Sync + 'static,
    {
        self.add_listener(Target::channel(channel), options, Arc::new(callback))
            .await
    }

    /// Listen on a named stream; returns the listener name
    pub async fn on_stream<F>(
        &self,
        stream: impl Into<String>,
        options: ListenerOptions,
        callback: F,
    ) -> ClientResult<String>
    where
        F: Fn(ReceivedMessage) + Send + Sync + 'static,
    {
        self.add_listener(Target::stream(stream), options, Arc::new(callback))
            .await
    }

    /// Register a listener. When connected it is bound immediately; a bind
    /// failure is returned but the listener stays registered and is retried on
    /// the next connect.
    pub async fn add_listener(
        &self,
        target: Target,
        options: ListenerOptions,
        callback: ListenerCallback,
    ) -> ClientResult<String> {
        self.request(|reply| Command::AddListener {
            target,
            options,
            callback,
            reply,
        })
        .await
    }

    pub async fn remove_listener(&self, name: impl Into<String>) -> ClientResult<()> {
        let name = name.into();
        self.request(|reply| Command::RemoveListener { name, reply })
            .await
    }

    /// Bind a registered listener now; a no-op when it is already bound
    pub async fn bind(&self, name: impl Into<String>) -> ClientResult<BindOutcome> {
        let name = name.into();
        self.request(|reply| Command::Bind { name, reply }).await
    }

    pub async fn listeners(&self) -> ClientResult<Vec<ListenerInfo>> {
        self.request(Command::Listeners).await
    }

    /// Publish to one of this client's channels
    pub async fn publish(
        &self,
        channel: impl Into<String>,
        payload: impl Into<Payload>,
        options: PublishOptions,
    ) -> ClientResult<PublishOutcome> {
        self.publish_to(Target::channel(channel), payload.into(), options)
            .await
    }

    /// Publish to a named stream
    pub async fn publish_to_stream(
        &self,
        stream: impl Into<String>,
        payload: impl Into<Payload>,
        options: PublishOptions,
    ) -> ClientResult<PublishOutcome> {
        self.publish_to(Target::stream(stream), payload.into(), options)
            .await
    }

    pub async fn publish_to(
        &self,
        target: Target,
        payload: Payload,
        options: PublishOptions,
    ) -> ClientResult<PublishOutcome> {
        self.request(|reply| Command::Publish {
            target,
            payload,
            options,
            reply,
        })
        .await
    }

    /// Number of publications waiting in the cache
    pub async fn cached_messages(&self) -> ClientResult<usize> {
        self.request(Command::CachedCount).await
    }

    /// Replay the cache now; returns how many entries remain
    pub async fn flush(&self) -> ClientResult<usize> {
        self.request(Command::Flush).await
    }

    /// Forget memoized connection parameters so the next connect re-resolves them
    pub async fn reset_connection_params(&self) -> ClientResult<()> {
        self.request(Command::ResetParams).await
    }

    /// Disconnect and stop the engine; other handles get `ClientError::Closed`
    pub async fn shutdown(self) -> ClientResult<()> {
        self.request(Command::Shutdown).await
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("principal", &self.principal)
            .field("protocol", &self.protocol)
            .field("state", &self.state())
            .finish()
    }
}
