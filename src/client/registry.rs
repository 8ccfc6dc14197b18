//! Desired-state table of named listeners
//!
//! Entries outlive any particular connection. The live binding (channel plus
//! subscription handle) is only present while the current transport
//! connection holds a subscription for the entry; the engine clears it when
//! that channel or connection goes away and rebinds on the next connect.

use crate::ack::AckMode;
use crate::gate::GateOptions;
use crate::message::ReceivedMessage;
use crate::routing::Target;
use crate::transport::{ChannelHandle, SubscribeOptions, SubscriptionHandle};
use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Listener callback; runs on the engine task and must not block
pub type ListenerCallback = Arc<dyn Fn(ReceivedMessage) + Send + Sync>;

/// Per-listener subscription options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListenerOptions {
    pub topic: Option<String>,
    /// Subscribe to this exact address instead of the resolved one
    pub routing_key: Option<String>,
    pub ack_mode: AckMode,
    /// Acks settle every outstanding delivery up to this one
    pub all_up_to: bool,
    /// Nacked deliveries are requeued
    pub requeue: bool,
    pub gate: GateOptions,
    pub prefetch: Option<u16>,
}

impl ListenerOptions {
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

    pub fn ack_mode(mut self, ack_mode: AckMode) -> Self {
        self.ack_mode = ack_mode;
        self
    }

    pub fn all_up_to(mut self, all_up_to: bool) -> Self {
        self.all_up_to = all_up_to;
        self
    }

    pub fn requeue(mut self, requeue: bool) -> Self {
        self.requeue = requeue;
        self
    }

    pub fn discard_mine(mut self, discard: bool) -> Self {
        self.gate.discard_mine = discard;
        self
    }

    pub fn discard_from_api(mut self, discard: bool) -> Self {
        self.gate.discard_from_api = discard;
        self
    }

    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = Some(prefetch);
        self
    }

    pub(crate) fn subscribe_options(&self) -> SubscribeOptions {
        SubscribeOptions {
            auto_ack: self.ack_mode.transport_auto_ack(),
            prefetch: self.prefetch,
        }
    }
}

/// Live subscription held for an entry on the current connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveBinding {
    pub channel: ChannelHandle,
    pub subscription: SubscriptionHandle,
}

pub struct ListenerEntry {
    name: String,
    target: Target,
    address: String,
    options: ListenerOptions,
    callback: ListenerCallback,
    live: Option<LiveBinding>,
}

impl ListenerEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Resolved subscription address
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn options(&self) -> &ListenerOptions {
        &self.options
    }

    pub fn callback(&self) -> &ListenerCallback {
        &self.callback
    }

    pub fn live(&self) -> Option<&LiveBinding> {
        self.live.as_ref()
    }

    pub fn is_bound(&self) -> bool {
        self.live.is_some()
    }
}

impl fmt::Debug for ListenerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerEntry")
            .field("name", &self.name)
            .field("target", &self.target)
            .field("address", &self.address)
            .field("options", &self.options)
            .field("live", &self.live)
            .finish()
    }
}

/// Registry of listeners in registration order
#[derive(Debug, Default)]
pub struct ListenerRegistry {
    entries: Vec<ListenerEntry>,
    sequence: u64,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a new unbound entry and return its generated name
    pub fn add(
        &mut self,
        target: Target,
        address: String,
        options: ListenerOptions,
        callback: ListenerCallback,
    ) -> String {
        let name = format!("{}-{}", Utc::now().timestamp_millis(), self.sequence);
        self.sequence += 1;
        debug!(listener = %name, address = %address, "Registered listener");
        self.entries.push(ListenerEntry {
            name: name.clone(),
            target,
            address,
            options,
            callback,
            live: None,
        });
        name
    }

    pub fn get(&self, name: &str) -> Option<&ListenerEntry> {
        self.entries.iter().find(|entry| entry.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Snapshot of names in registration order
    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn bound_count(&self) -> usize {
        self.entries.iter().filter(|entry| entry.is_bound()).count()
    }

    pub fn remove(&mut self, name: &str) -> Option<ListenerEntry> {
        let index = self.entries.iter().position(|entry| entry.name == name)?;
        Some(self.entries.remove(index))
    }

    /// Record a live binding; false if the entry vanished
    pub fn set_live(&mut self, name: &str, binding: LiveBinding) -> bool {
        match self.entries.iter_mut().find(|entry| entry.name == name) {
            Some(entry) => {
                entry.live = Some(binding);
                true
            }
            None => false,
        }
    }

    pub fn clear_live(&mut self, name: &str) -> Option<LiveBinding> {
        self.entries
            .iter_mut()
            .find(|entry| entry.name == name)
            .and_then(|entry| entry.live.take())
    }

    /// Drop every live binding, returning the names that had one
    pub fn clear_all_live(&mut self) -> Vec<String> {
        self.entries
            .iter_mut()
            .filter_map(|entry| entry.live.take().map(|_| entry.name.clone()))
            .collect()
    }

    /// Drop bindings that lived on a channel, returning the affected names
    pub fn clear_channel(&mut self, channel: ChannelHandle) -> Vec<String> {
        self.entries
            .iter_mut()
            .filter(|entry| {
                entry
                    .live
                    .as_ref()
                    .is_some_and(|binding| binding.channel == channel)
            })
            .map(|entry| {
                entry.live = None;
                entry.name.clone()
            })
            .collect()
    }

    /// Entry currently bound to a subscription
    pub fn find_by_subscription(&self, subscription: &SubscriptionHandle) -> Option<&ListenerEntry> {
        self.entries.iter().find(|entry| {
            entry
                .live
                .as_ref()
                .is_some_and(|binding| &binding.subscription == subscription)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn noop() -> ListenerCallback {
        Arc::new(|_message| {})
    }

    fn binding(channel: u64, id: &str) -> LiveBinding {
        LiveBinding {
            channel: ChannelHandle(channel),
            subscription: SubscriptionHandle {
                channel: ChannelHandle(channel),
                id: id.to_string(),
            },
        }
    }

    #[test]
    fn test_add_generates_unique_names_in_order() {
        let mut registry = ListenerRegistry::new();
        let a = registry.add(
            Target::channel("inbox"),
            "dev-1.inbox".to_string(),
            ListenerOptions::new(),
            noop(),
        );
        let b = registry.add(
            Target::channel("inbox"),
            "dev-1.inbox".to_string(),
            ListenerOptions::new(),
            noop(),
        );

        assert_ne!(a, b);
        assert_eq!(registry.names(), vec![a.clone(), b]);
        assert!(!registry.get(&a).unwrap().is_bound());
    }

    #[test]
    fn test_live_binding_lifecycle() {
        let mut registry = ListenerRegistry::new();
        let name = registry.add(
            Target::channel("inbox"),
            "dev-1.inbox".to_string(),
            ListenerOptions::new(),
            noop(),
        );

        assert!(registry.set_live(&name, binding(1, "sub-1")));
        assert_eq!(registry.bound_count(), 1);

        let subscription = SubscriptionHandle {
            channel: ChannelHandle(1),
            id: "sub-1".to_string(),
        };
        assert_eq!(registry.find_by_subscription(&subscription).unwrap().name(), name);

        assert_eq!(registry.clear_channel(ChannelHandle(2)), Vec::<String>::new());
        assert_eq!(registry.clear_channel(ChannelHandle(1)), vec![name.clone()]);
        assert!(registry.find_by_subscription(&subscription).is_none());
        assert!(registry.contains(&name));
    }

    #[test]
    fn test_clear_all_live_keeps_entries() {
        let mut registry = ListenerRegistry::new();
        let a = registry.add(Target::channel("a"), "d.a".into(), ListenerOptions::new(), noop());
        let b = registry.add(Target::channel("b"), "d.b".into(), ListenerOptions::new(), noop());
        registry.set_live(&a, binding(1, "sa"));

        assert_eq!(registry.clear_all_live(), vec![a]);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.bound_count(), 0);
        assert!(registry.contains(&b));
    }

    #[test]
    fn test_remove_unknown_name() {
        let mut registry = ListenerRegistry::new();
        assert!(registry.remove("missing").is_none());
        assert!(!registry.set_live("missing", binding(1, "x")));
    }

    #[test]
    fn test_options_builder() {
        let options = ListenerOptions::new()
            .topic("alerts")
            .ack_mode(AckMode::Auto)
            .discard_mine(true)
            .prefetch(10);
        assert_eq!(options.topic.as_deref(), Some("alerts"));
        assert!(options.gate.discard_mine);
        assert!(!options.gate.discard_from_api);
        assert_eq!(
            options.subscribe_options(),
            SubscribeOptions {
                auto_ack: true,
                prefetch: Some(10)
            }
        );
    }

    proptest! {
        #[test]
        fn prop_names_stay_unique_and_ordered(ops in prop::collection::vec(any::<bool>(), 1..40)) {
            let mut registry = ListenerRegistry::new();
            let mut expected: Vec<String> = Vec::new();
            for add in ops {
                if add || expected.is_empty() {
                    let name = registry.add(
                        Target::channel("c"),
                        "d.c".to_string(),
                        ListenerOptions::new(),
                        noop(),
                    );
                    prop_assert!(!expected.contains(&name));
                    expected.push(name);
                } else {
                    let victim = expected.remove(0);
                    prop_assert!(registry.remove(&victim).is_some());
                }
            }
            prop_assert_eq!(registry.names(), expected);
        }
    }
}
