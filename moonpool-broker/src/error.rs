//! Error types for the broker transport.

use thiserror::Error;

/// Errors reported by a broker client (connection or channel level).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// The physical connection to the broker is gone.
    #[error("connection closed")]
    ConnectionClosed,

    /// The channel was closed by the broker or by the client.
    #[error("channel closed")]
    ChannelClosed,

    /// A queue or exchange referenced by the operation does not exist.
    #[error("{kind} not found: {name}")]
    NotFound {
        /// Kind of entity ("queue" or "exchange").
        kind: &'static str,
        /// Name of the missing entity.
        name: String,
    },

    /// A redeclaration conflicted with the existing entity.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// Any other protocol-level failure.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl BrokerError {
    /// Whether this failure means the channel or connection is unusable.
    pub fn is_connection_level(&self) -> bool {
        matches!(self, BrokerError::ConnectionClosed | BrokerError::ChannelClosed)
    }
}

/// Result type for broker client operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Errors surfaced by the transport to its caller.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Broker operation failed.
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Rejected input that can never succeed, such as a non-positive TTL.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A header value could not be parsed.
    #[error("invalid value {value:?} for header {header}: {reason}")]
    Format {
        /// Header key.
        header: String,
        /// Offending value.
        value: String,
        /// Why parsing failed.
        reason: String,
    },

    /// The transport has been disposed.
    #[error("transport disposed")]
    Disposed,

    /// A transaction hook failed for a reason other than the broker.
    #[error("transaction hook failed: {0}")]
    Hook(String),
}

impl TransportError {
    /// Whether the error came from a broken channel or connection.
    pub fn is_connection_level(&self) -> bool {
        matches!(self, TransportError::Broker(err) if err.is_connection_level())
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
