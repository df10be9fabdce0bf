//! Header codec.
//!
//! Logical headers are always strings. On the wire the broker client hands
//! text back as raw bytes, so text is encoded to UTF-8 bytes on the way out
//! and bytes are decoded back to text on the way in. A handful of well-known
//! headers also drive broker message properties (see [`derive_properties`]).

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::broker::{BasicProperties, BrokerHeaders, DeliveryMode, HeaderValue};
use crate::error::{TransportError, TransportResult};

/// Logical header map: string keys to string values.
pub type Headers = BTreeMap<String, String>;

/// Unique message identifier.
pub const MESSAGE_ID: &str = "msg-id";

/// Address replies should be sent to.
pub const RETURN_ADDRESS: &str = "return-address";

/// Time-to-live as `[-][d.]hh:mm:ss[.fraction]`.
pub const TIME_TO_BE_RECEIVED: &str = "time-to-be-received";

/// Internal override of message persistence (`"true"` or `"false"`).
pub const DURABLE: &str = "x-transport-durable";

/// Decode a wire header value: bytes become UTF-8 text, the rest pass through.
pub fn decode_value(value: HeaderValue) -> HeaderValue {
    match value {
        HeaderValue::Bytes(bytes) => match String::from_utf8(bytes) {
            Ok(text) => HeaderValue::Text(text),
            Err(err) => {
                HeaderValue::Text(String::from_utf8_lossy(err.as_bytes()).into_owned())
            }
        },
        other => other,
    }
}

/// Encode a header value for the wire: text becomes UTF-8 bytes, the rest pass through.
pub fn encode_value(value: HeaderValue) -> HeaderValue {
    match value {
        HeaderValue::Text(text) => HeaderValue::Bytes(text.into_bytes()),
        other => other,
    }
}

/// Convert a wire header table to logical headers.
pub fn decode_headers(headers: &BrokerHeaders) -> Headers {
    headers
        .iter()
        .map(|(key, value)| (key.clone(), decode_value(value.clone()).to_string()))
        .collect()
}

/// Convert logical headers to a wire header table.
pub fn encode_headers(headers: &Headers) -> BrokerHeaders {
    headers
        .iter()
        .map(|(key, value)| (key.clone(), encode_value(HeaderValue::Text(value.clone()))))
        .collect()
}

/// Derive broker properties from logical headers.
///
/// Evaluated in order: message id, return address, time-to-live, durability
/// override. A fresh message id is generated when none is given. The header
/// table itself is encoded into the returned properties.
///
/// # Errors
///
/// - [`TransportError::Format`] for an unparseable time-to-live or durability flag
/// - [`TransportError::Configuration`] for a zero or negative time-to-live
pub fn derive_properties(headers: &Headers) -> TransportResult<BasicProperties> {
    let mut properties = BasicProperties::default();

    if let Some(message_id) = headers.get(MESSAGE_ID) {
        properties.message_id = Some(message_id.clone());
    }

    if let Some(return_address) = headers.get(RETURN_ADDRESS) {
        properties.reply_to = Some(return_address.clone());
    }

    if let Some(ttl) = headers.get(TIME_TO_BE_RECEIVED) {
        let millis = parse_time_span(ttl).map_err(|reason| TransportError::Format {
            header: TIME_TO_BE_RECEIVED.to_string(),
            value: ttl.clone(),
            reason,
        })?;
        if millis <= 0 {
            return Err(TransportError::Configuration(format!(
                "{} must be positive, got {:?}",
                TIME_TO_BE_RECEIVED, ttl
            )));
        }
        properties.expiration_ms = Some(millis.unsigned_abs());
    }

    if let Some(flag) = headers.get(DURABLE) {
        let durable = parse_bool(flag).ok_or_else(|| TransportError::Format {
            header: DURABLE.to_string(),
            value: flag.clone(),
            reason: "expected true or false".to_string(),
        })?;
        properties.delivery_mode = if durable {
            DeliveryMode::Persistent
        } else {
            DeliveryMode::Transient
        };
    }

    if properties.message_id.is_none() {
        properties.message_id = Some(Uuid::new_v4().to_string());
    }

    properties.headers = encode_headers(headers);
    Ok(properties)
}

fn parse_bool(text: &str) -> Option<bool> {
    let text = text.trim();
    if text.eq_ignore_ascii_case("true") {
        Some(true)
    } else if text.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

/// Parse `[-]d`, `[-][d.]hh:mm` or `[-][d.]hh:mm:ss[.fraction]` into signed milliseconds.
///
/// Fractions finer than a millisecond are truncated.
pub fn parse_time_span(text: &str) -> Result<i64, String> {
    let trimmed = text.trim();
    let (negative, body) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed),
    };
    if body.is_empty() {
        return Err("empty duration".to_string());
    }

    let parts: Vec<&str> = body.split(':').collect();
    let (days, hours, minutes, seconds) = match parts.as_slice() {
        [days] => (parse_number(days)?, 0, 0, None),
        [head, minutes] => {
            let (days, hours) = split_days(head)?;
            (days, hours, parse_number(minutes)?, None)
        }
        [head, minutes, seconds] => {
            let (days, hours) = split_days(head)?;
            (days, hours, parse_number(minutes)?, Some(*seconds))
        }
        _ => return Err("expected [d.]hh:mm:ss".to_string()),
    };

    let (seconds, fraction_ms) = match seconds {
        Some(seconds) => match seconds.split_once('.') {
            Some((whole, fraction)) => (parse_number(whole)?, parse_fraction(fraction)?),
            None => (parse_number(seconds)?, 0),
        },
        None => (0, 0),
    };

    if hours >= 24 || minutes >= 60 || seconds >= 60 {
        return Err("hours, minutes or seconds out of range".to_string());
    }

    let total = days
        .checked_mul(24)
        .and_then(|h| h.checked_add(hours))
        .and_then(|h| h.checked_mul(60))
        .and_then(|m| m.checked_add(minutes))
        .and_then(|m| m.checked_mul(60))
        .and_then(|s| s.checked_add(seconds))
        .and_then(|s| s.checked_mul(1000))
        .and_then(|ms| ms.checked_add(fraction_ms))
        .ok_or_else(|| "duration overflows".to_string())?;

    Ok(if negative { -total } else { total })
}

fn split_days(head: &str) -> Result<(i64, i64), String> {
    match head.split_once('.') {
        Some((days, hours)) => Ok((parse_number(days)?, parse_number(hours)?)),
        None => Ok((0, parse_number(head)?)),
    }
}

fn parse_number(text: &str) -> Result<i64, String> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("{:?} is not a number", text));
    }
    text.parse::<i64>().map_err(|err| err.to_string())
}

fn parse_fraction(text: &str) -> Result<i64, String> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("{:?} is not a fraction", text));
    }
    let millis: String = text.chars().chain("000".chars()).take(3).collect();
    parse_number(&millis)
}
