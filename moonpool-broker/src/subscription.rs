//! Self-managed subscription tracking.
//!
//! With an auto-delete input queue, every binding vanishes together with the
//! queue when the session owning it is rebuilt. [`SubscriptionRegistry`]
//! remembers which message types are subscribed so the bindings can be
//! replayed onto each freshly declared queue.

use dashmap::DashMap;

use crate::broker::BrokerChannel;
use crate::error::BrokerResult;
use crate::topic::MessageType;

/// A message type bound to a queue under a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Subscribed message type.
    pub message_type: MessageType,
    /// Routing topic resolved for the type.
    pub topic: String,
    /// Queue receiving the messages.
    pub queue: String,
}

/// Concurrent set of active subscriptions keyed by message type.
///
/// Safe for simultaneous add/remove from any number of workers while a
/// replay reads a snapshot.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: DashMap<MessageType, Subscription>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a subscription. Returns false if the type was already tracked.
    pub fn add(&self, subscription: Subscription) -> bool {
        self.entries
            .insert(subscription.message_type.clone(), subscription)
            .is_none()
    }

    /// Stop tracking a type. Unknown types are ignored.
    pub fn remove(&self, message_type: &MessageType) -> Option<Subscription> {
        self.entries.remove(message_type).map(|(_, subscription)| subscription)
    }

    /// Whether a type is tracked.
    pub fn contains(&self, message_type: &MessageType) -> bool {
        self.entries.contains_key(message_type)
    }

    /// Number of tracked subscriptions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All tracked subscriptions, ordered by message type.
    pub fn snapshot(&self) -> Vec<Subscription> {
        let mut subscriptions: Vec<Subscription> = self
            .entries
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        subscriptions.sort_by(|a, b| a.message_type.cmp(&b.message_type));
        subscriptions
    }

    /// Bind every tracked subscription on `channel`. Returns how many were bound.
    pub async fn replay(&self, channel: &dyn BrokerChannel, exchange: &str) -> BrokerResult<usize> {
        let subscriptions = self.snapshot();
        for subscription in &subscriptions {
            tracing::debug!(
                "replaying binding {} -> {} on channel {}",
                subscription.topic,
                subscription.queue,
                channel.id()
            );
            channel
                .queue_bind(&subscription.queue, exchange, &subscription.topic)
                .await?;
        }
        Ok(subscriptions.len())
    }
}
