//! # Moonpool Broker
//!
//! Transactional message transport over a topic-routed broker.
//!
//! This crate provides:
//! - **BrokerTransport**: send/receive coupled to an explicit unit of work,
//!   publish/subscribe by message type, queue administration
//! - **Sessions**: one transactional channel per worker, rebuilt when the
//!   broker closes it
//! - **Header codec**: logical headers to broker properties (id, reply
//!   address, expiration, persistence)
//! - **Topic resolution**: ordered resolver chain with a canonical type-name fallback
//! - **In-memory broker**: a complete topic broker for tests and local development
//! - **AMQP client** (`transport_lapin` feature): the same seam over `lapin`
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      BrokerTransport                        │
//! │  send / receive / publish / subscribe / purge / create_queue│
//! ├───────────────┬──────────────────┬──────────────────────────┤
//! │ SessionPool   │ SubscriptionReg. │ TopicNames + HeaderCodec │
//! │ (per worker)  │ (self-managed)   │                          │
//! ├───────────────┴──────────────────┴──────────────────────────┤
//! │   BrokerConnection / BrokerChannel / ConnectionManager      │
//! │        (broker client seam, InMemoryBroker for tests)       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use moonpool_broker::{
//!     BrokerTransport, InMemoryBroker, InMemoryConnectionManager, OutgoingMessage,
//!     TransactionContext, TransportConfig, WorkerId,
//! };
//!
//! let manager = Arc::new(InMemoryConnectionManager::new(InMemoryBroker::new()));
//! let transport = BrokerTransport::new(manager, "orders", TransportConfig::default());
//! transport.initialize().await?;
//!
//! let tx = TransactionContext::new(WorkerId::current_thread());
//! if let Some(message) = transport.receive(&tx).await? {
//!     transport.send("billing", OutgoingMessage::new(message.body), Some(&tx)).await?;
//! }
//! tx.commit().await?;
//! ```

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

// =============================================================================
// Modules
// =============================================================================

/// Error types for broker and transport operations.
pub mod error;

/// Transport configuration.
pub mod config;

/// Broker client seam and the in-memory broker.
pub mod broker;

/// Logical header names and property derivation.
pub mod headers;

/// Message types and topic resolution.
pub mod topic;

/// Self-managed subscription tracking.
pub mod subscription;

/// Explicit unit-of-work transaction.
pub mod transaction;

/// Worker sessions and the session pool.
pub mod session;

/// Outgoing and incoming messages.
pub mod message;

/// The transport itself.
pub mod transport;

mod topology;

// =============================================================================
// Public API Re-exports
// =============================================================================

// Error exports
pub use error::{BrokerError, BrokerResult, TransportError, TransportResult};

// Config exports
pub use config::{DEFAULT_EXCHANGE_NAME, TransportConfig};

// Broker exports
pub use broker::memory::{BrokerStats, InMemoryBroker, InMemoryConnectionManager};
#[cfg(feature = "transport_lapin")]
pub use broker::amqp::LapinConnectionManager;
pub use broker::{
    BasicProperties, BrokerChannel, BrokerConnection, ConnectionManager, Delivery, DeliveryMode,
    HeaderValue,
};

// Messaging exports
pub use headers::Headers;
pub use message::{IncomingMessage, OutgoingMessage, UNKNOWN_MESSAGE_ID};
pub use subscription::{Subscription, SubscriptionRegistry};
pub use topic::{MessageType, TopicNames, TopicResolver};
pub use topology::MIRRORING_ARGUMENT;

// Session and transaction exports
pub use session::{ChannelSession, NextDelivery, SessionPool, WorkerId};
pub use transaction::{TransactionContext, TransactionState};
pub use transport::BrokerTransport;
