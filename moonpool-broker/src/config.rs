//! Configuration structures for transport behavior.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{TransportError, TransportResult};

/// Default name of the topic exchange all messages are published to.
pub const DEFAULT_EXCHANGE_NAME: &str = "moonpool.topics";

/// Configuration for exchange/queue topology and consumer behavior.
///
/// Applied once when the transport is constructed. Missing fields fall back
/// to [`TransportConfig::default`] when deserialized.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Topic exchange used for both point-to-point and multicast routing
    pub exchange_name: String,

    /// Declare the exchange whenever queues are declared
    pub declare_exchange: bool,

    /// Bind each declared queue to the exchange under its own name
    pub bind_default_topic: bool,

    /// Maximum number of unacknowledged deliveries per channel
    pub prefetch_count: u16,

    /// Use an ephemeral input queue whose bindings the transport tracks itself.
    ///
    /// When false, bindings live on the broker and subscribe/unsubscribe
    /// are one-shot operations.
    pub auto_delete_input_queue: bool,

    /// How long `receive` waits for a delivery before reporting "no message"
    pub receive_backoff: Duration,

    /// Attach mirroring arguments to queue declarations
    pub mirrored_queues: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            exchange_name: DEFAULT_EXCHANGE_NAME.to_string(),
            declare_exchange: true,
            bind_default_topic: true,
            prefetch_count: 50,
            auto_delete_input_queue: false,
            receive_backoff: Duration::from_millis(500),
            mirrored_queues: true,
        }
    }
}

impl TransportConfig {
    /// Use the given exchange instead of [`DEFAULT_EXCHANGE_NAME`].
    pub fn with_exchange_name(mut self, exchange_name: impl Into<String>) -> Self {
        self.exchange_name = exchange_name.into();
        self
    }

    /// Assume the exchange already exists and never declare it.
    pub fn without_exchange_declaration(mut self) -> Self {
        self.declare_exchange = false;
        self
    }

    /// Do not bind queues to the exchange under their own name.
    pub fn without_default_binding(mut self) -> Self {
        self.bind_default_topic = false;
        self
    }

    /// Set the channel prefetch (QoS) limit.
    pub fn with_prefetch(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }

    /// Switch between ephemeral (self-managed bindings) and durable input queues.
    pub fn with_auto_delete_input_queue(mut self, auto_delete: bool) -> Self {
        self.auto_delete_input_queue = auto_delete;
        self
    }

    /// Set the bounded wait used by `receive`.
    pub fn with_receive_backoff(mut self, backoff: Duration) -> Self {
        self.receive_backoff = backoff;
        self
    }

    /// Declare queues without mirroring arguments.
    pub fn without_mirroring(mut self) -> Self {
        self.mirrored_queues = false;
        self
    }

    /// Create a configuration for a single local broker.
    pub fn local_development() -> Self {
        Self {
            prefetch_count: 10,
            receive_backoff: Duration::from_millis(50),
            mirrored_queues: false,
            ..Self::default()
        }
    }

    /// Create a configuration for an ephemeral worker queue.
    pub fn ephemeral() -> Self {
        Self {
            auto_delete_input_queue: true,
            ..Self::default()
        }
    }

    /// Load a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> TransportResult<Self> {
        serde_json::from_str(json).map_err(|err| {
            TransportError::Configuration(format!("invalid transport config: {}", err))
        })
    }
}
