//! Transport-level messages.

use crate::broker::Delivery;
use crate::headers::{self, Headers};

/// Message id reported when neither the broker nor the headers carry one.
pub const UNKNOWN_MESSAGE_ID: &str = "<unknown>";

/// A message handed to `send`.
///
/// Broker properties (id, reply address, expiration, persistence) are
/// derived from the headers at send time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutgoingMessage {
    /// Logical headers.
    pub headers: Headers,
    /// Payload.
    pub body: Vec<u8>,
}

impl OutgoingMessage {
    /// Message with a payload and no headers.
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            headers: Headers::new(),
            body: body.into(),
        }
    }

    /// Add or replace a header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// A message returned by `receive`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    /// Resolved message id, or [`UNKNOWN_MESSAGE_ID`].
    pub message_id: String,
    /// Decoded logical headers.
    pub headers: Headers,
    /// Payload.
    pub body: Vec<u8>,
    /// Whether the broker delivered this message before.
    pub redelivered: bool,
}

impl IncomingMessage {
    /// Decode a broker delivery.
    ///
    /// The id from the headers wins over the broker property. Both being
    /// present and different is logged, never rejected.
    pub fn from_delivery(delivery: Delivery) -> Self {
        let headers = headers::decode_headers(&delivery.properties.headers);
        let header_id = headers.get(headers::MESSAGE_ID).cloned();
        let broker_id = delivery.properties.message_id;

        if let (Some(header_id), Some(broker_id)) = (&header_id, &broker_id) {
            if header_id != broker_id {
                tracing::warn!(
                    "message id mismatch on delivery {}: header says {}, broker says {}",
                    delivery.delivery_tag,
                    header_id,
                    broker_id
                );
            }
        }

        Self {
            message_id: header_id
                .or(broker_id)
                .unwrap_or_else(|| UNKNOWN_MESSAGE_ID.to_string()),
            headers,
            body: delivery.body,
            redelivered: delivery.redelivered,
        }
    }
}
