//! Broker client seam.
//!
//! The transport never speaks the broker's wire protocol itself. It drives a
//! broker client through the [`BrokerConnection`] and [`BrokerChannel`]
//! traits and obtains connections from a [`ConnectionManager`], which owns
//! the physical link and its reconnect policy.
//!
//! # Ownership
//!
//! ```text
//! ┌────────────────────┐   get_connection()   ┌──────────────────┐
//! │ ConnectionManager  ├─────────────────────►│ BrokerConnection │
//! │ (reconnect policy) │◄─────────────────────┤ (shared)         │
//! └────────────────────┘    report_error()    └────────┬─────────┘
//!                                                      │ create_channel()
//!                                                      ▼
//!                                             ┌──────────────────┐
//!                                             │ BrokerChannel    │
//!                                             │ (never shared    │
//!                                             │  across workers) │
//!                                             └──────────────────┘
//! ```
//!
//! [`memory::InMemoryBroker`] implements the seam for tests and local
//! development. With the `transport_lapin` feature, `amqp` implements it over
//! a real AMQP 0-9-1 broker.

pub mod memory;

#[cfg(feature = "transport_lapin")]
pub mod amqp;

#[cfg(test)]
pub(crate) mod recording;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{BrokerResult, TransportError};

/// A value in the broker's header table.
///
/// Brokers hand back text headers as raw bytes, so a value set as
/// [`HeaderValue::Text`] may come back as [`HeaderValue::Bytes`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    /// UTF-8 text.
    Text(String),
    /// Opaque bytes (usually UTF-8 encoded text).
    Bytes(Vec<u8>),
    /// Boolean flag.
    Bool(bool),
    /// Signed integer.
    Int(i64),
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderValue::Text(text) => f.write_str(text),
            HeaderValue::Bytes(bytes) => f.write_str(&String::from_utf8_lossy(bytes)),
            HeaderValue::Bool(value) => write!(f, "{}", value),
            HeaderValue::Int(value) => write!(f, "{}", value),
        }
    }
}

/// Header table attached to broker messages and declarations.
pub type BrokerHeaders = BTreeMap<String, HeaderValue>;

/// Broker-level persistence of a published message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Kept in memory only; lost on broker restart.
    Transient,
    /// Written to disk by the broker.
    #[default]
    Persistent,
}

/// Broker message properties derived from logical headers at send time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BasicProperties {
    /// Broker message identifier.
    pub message_id: Option<String>,
    /// Reply-to address.
    pub reply_to: Option<String>,
    /// Per-message expiration in milliseconds.
    pub expiration_ms: Option<u64>,
    /// Persistence of the message.
    pub delivery_mode: DeliveryMode,
    /// Wire header table.
    pub headers: BrokerHeaders,
}

/// Routing algorithm of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Exact routing-key match.
    Direct,
    /// Routes to every bound queue.
    Fanout,
    /// Dot-separated patterns with `*` and `#` wildcards.
    Topic,
}

/// Queue declaration parameters. Declaring the same queue twice is idempotent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDeclaration {
    /// Queue name.
    pub name: String,
    /// Survives broker restarts.
    pub durable: bool,
    /// Deleted once its last consumer goes away.
    pub auto_delete: bool,
    /// Extra broker arguments (mirroring policy and similar).
    pub arguments: BrokerHeaders,
}

impl QueueDeclaration {
    /// Durable, non-auto-delete queue with no arguments.
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            auto_delete: false,
            arguments: BrokerHeaders::new(),
        }
    }
}

/// A message handed to a consumer or returned by a single fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Channel-scoped tag used to acknowledge this delivery.
    pub delivery_tag: u64,
    /// Exchange the message was published to.
    pub exchange: String,
    /// Routing key the message was published with.
    pub routing_key: String,
    /// Whether the broker delivered this message before.
    pub redelivered: bool,
    /// Broker properties.
    pub properties: BasicProperties,
    /// Payload.
    pub body: Vec<u8>,
}

/// A consumer subscription on a channel.
///
/// The stream ends (`recv` yields `None`) when the broker closes the channel.
#[derive(Debug)]
pub struct Consumer {
    /// Broker-assigned consumer tag.
    pub tag: String,
    /// Deliveries pushed by the broker.
    pub deliveries: mpsc::UnboundedReceiver<Delivery>,
}

/// A physical link to the broker, shared read-only across workers.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Open a new channel on this connection.
    async fn create_channel(&self) -> BrokerResult<Arc<dyn BrokerChannel>>;

    /// Whether the connection is still usable.
    fn is_open(&self) -> bool;
}

/// A logical channel multiplexed over a connection.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Connection-scoped channel number.
    fn id(&self) -> u64;

    /// Whether the channel is still usable.
    fn is_open(&self) -> bool;

    /// Put the channel in transactional mode.
    async fn tx_select(&self) -> BrokerResult<()>;

    /// Commit buffered publishes and acknowledgments.
    async fn tx_commit(&self) -> BrokerResult<()>;

    /// Discard buffered publishes and acknowledgments.
    async fn tx_rollback(&self) -> BrokerResult<()>;

    /// Limit the number of unacknowledged deliveries on this channel.
    async fn basic_qos(&self, prefetch_count: u16) -> BrokerResult<()>;

    /// Declare an exchange (idempotent).
    async fn exchange_declare(&self, name: &str, kind: ExchangeKind) -> BrokerResult<()>;

    /// Declare a queue (idempotent).
    async fn queue_declare(&self, declaration: &QueueDeclaration) -> BrokerResult<()>;

    /// Bind a queue to an exchange under a routing key.
    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> BrokerResult<()>;

    /// Remove a binding. Removing a missing binding is not an error.
    async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> BrokerResult<()>;

    /// Drop all ready messages from a queue, returning how many were removed.
    async fn queue_purge(&self, queue: &str) -> BrokerResult<u32>;

    /// Publish a message.
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
        body: Vec<u8>,
    ) -> BrokerResult<()>;

    /// Start consuming from a queue.
    async fn basic_consume(&self, queue: &str) -> BrokerResult<Consumer>;

    /// Fetch a single message without subscribing.
    async fn basic_get(&self, queue: &str, auto_ack: bool) -> BrokerResult<Option<Delivery>>;

    /// Positively acknowledge a delivery.
    async fn basic_ack(&self, delivery_tag: u64) -> BrokerResult<()>;

    /// Negatively acknowledge a delivery.
    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()>;

    /// Close the channel. Unacknowledged deliveries return to their queues.
    async fn close(&self) -> BrokerResult<()>;
}

/// Owner of the physical connection and its reconnect policy.
///
/// The transport only creates channels. Every connection-level failure is
/// forwarded here so the manager can decide whether to replace the link.
#[async_trait]
pub trait ConnectionManager: Send + Sync {
    /// Current connection, possibly blocking while one is (re)established.
    async fn get_connection(&self) -> BrokerResult<Arc<dyn BrokerConnection>>;

    /// Classify a failure and discard the connection if it is broken.
    fn report_error(&self, error: &TransportError);
}
