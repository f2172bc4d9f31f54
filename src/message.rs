// Copyright (c) 2025, The AMQP Messenger Authors
// MIT License
// All rights reserved.

//! # Message Carriers and Attribute Mapping
//!
//! This module defines the per-message data carriers that cross the
//! send/receive boundary and the mapping between the flat attribute map
//! used throughout the transport and the broker's property/header split.
//!
//! The main components are:
//! - `RawMessage`: an inbound broker message (payload, routing metadata, flat attributes)
//! - `ReceivedMessage`: a raw message plus the queue it was pulled from
//! - `AmqpStamp`: per-message routing key and broker attributes for publishing
//! - Attribute helpers: property split/merge and application-header filtering

use lapin::types::{AMQPValue, LongString, ShortString};
use lapin::BasicProperties;
use std::collections::BTreeMap;

/// Flat per-message attribute map keyed by wire names, in which AMQP
/// built-in properties (`delivery-mode`, `content-type`, ...) and user
/// headers coexist. Split into properties and a header table when
/// publishing, merged back when receiving.
pub type Attributes = BTreeMap<ShortString, AMQPValue>;

/// Attribute key for the message content type
pub const ATTRIBUTE_CONTENT_TYPE: &str = "content-type";
/// Attribute key for the persistence flag (2 = persistent)
pub const ATTRIBUTE_DELIVERY_MODE: &str = "delivery-mode";
/// Attribute key for the publish timestamp, seconds since the epoch
pub const ATTRIBUTE_TIMESTAMP: &str = "timestamp";
/// Attribute key for the message type; a user header by contract even
/// though it travels as the `type` broker property
pub const ATTRIBUTE_TYPE: &str = "type";

/// Broker built-in attribute names excluded when reconstructing application
/// headers on receive. `type` is deliberately absent: it carries the
/// application message name and must survive the filter.
pub const NON_APPLICATION_HEADERS: [&str; 12] = [
    "delivery-mode",
    "content-type",
    "content-encoding",
    "priority",
    "correlation-id",
    "reply-to",
    "expiration",
    "message-id",
    "timestamp",
    "user-id",
    "app-id",
    "cluster-id",
];

/// An inbound message exactly as the broker delivered it.
///
/// The attribute map is the flat union of broker properties and user
/// headers; use [`application_headers`] to recover the user-facing subset.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    /// Channel-scoped delivery tag used for ack/nack
    pub delivery_tag: u64,
    /// Name of the exchange the message was published to
    pub exchange: String,
    /// Routing key the message was published with
    pub routing_key: String,
    /// Whether the broker already delivered this message before
    pub redelivered: bool,
    /// Flat attribute map (properties plus user headers)
    pub attributes: Attributes,
    /// Opaque payload bytes
    pub body: Vec<u8>,
}

impl RawMessage {
    /// Creates a raw message with empty attributes.
    pub fn new(
        delivery_tag: u64,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            delivery_tag,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            redelivered: false,
            attributes: Attributes::new(),
            body: body.into(),
        }
    }

    /// Adds an attribute, returning self for chaining.
    pub fn with_attribute(mut self, key: &str, value: AMQPValue) -> Self {
        self.attributes.insert(ShortString::from(key), value);
        self
    }
}

/// Provenance marker: a raw message together with the name of the queue it
/// was consumed from. Required to later ack, nack or retry the message.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    /// The raw broker message
    pub message: RawMessage,
    /// Queue the message was pulled from
    pub queue_name: String,
}

impl ReceivedMessage {
    /// Creates a provenance marker for a message consumed from `queue_name`.
    pub fn new(message: RawMessage, queue_name: impl Into<String>) -> Self {
        Self {
            message,
            queue_name: queue_name.into(),
        }
    }
}

/// Per-message publish metadata: an optional routing key, broker attributes
/// and a retry flag.
///
/// Attributes set here have the lowest precedence when publishing: explicit
/// headers override them and the forced delivery-mode/timestamp defaults
/// only apply when neither source provides a value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AmqpStamp {
    routing_key: Option<String>,
    attributes: Attributes,
    is_retry_attempt: bool,
}

impl AmqpStamp {
    /// Creates an empty stamp.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the routing key used when publishing onto the main exchange.
    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    /// Adds a single broker attribute.
    pub fn with_attribute(mut self, key: &str, value: AMQPValue) -> Self {
        self.attributes.insert(ShortString::from(key), value);
        self
    }

    /// Creates a stamp from a received message, for republishing it.
    ///
    /// The message's own attributes are taken over, overridden by the
    /// attributes of `previous` when one is supplied. The routing key is
    /// the retry routing key when given, else the previous stamp's, else
    /// the one the message was originally published with. Supplying a
    /// retry routing key marks the stamp as a retry attempt, which routes
    /// the message back to its source queue through the default exchange.
    pub fn from_received(
        message: &RawMessage,
        previous: Option<&AmqpStamp>,
        retry_routing_key: Option<&str>,
    ) -> Self {
        let mut attributes = message.attributes.clone();
        if let Some(previous) = previous {
            attributes.extend(previous.attributes.clone());
        }

        let routing_key = retry_routing_key
            .map(str::to_owned)
            .or_else(|| previous.and_then(|p| p.routing_key.clone()))
            .unwrap_or_else(|| message.routing_key.clone());

        Self {
            routing_key: Some(routing_key),
            attributes,
            is_retry_attempt: retry_routing_key.is_some(),
        }
    }

    /// Creates a stamp carrying `attributes` merged over a previous stamp.
    ///
    /// The new attributes win on conflict; the routing key is inherited
    /// from the previous stamp.
    pub fn merged_attributes(attributes: Attributes, previous: Option<&AmqpStamp>) -> Self {
        let mut merged = previous.map(|p| p.attributes.clone()).unwrap_or_default();
        merged.extend(attributes);

        Self {
            routing_key: previous.and_then(|p| p.routing_key.clone()),
            attributes: merged,
            is_retry_attempt: false,
        }
    }

    /// The routing key, when one was set.
    pub fn routing_key(&self) -> Option<&str> {
        self.routing_key.as_deref()
    }

    /// The broker attributes carried by this stamp.
    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// Whether this stamp routes the message back to its source queue.
    pub fn is_retry_attempt(&self) -> bool {
        self.is_retry_attempt
    }

    /// Whether the stamp carries the given attribute.
    pub fn has_attribute(&self, key: &str) -> bool {
        self.attributes.contains_key(key)
    }
}

/// Splits a flat attribute map into broker properties plus a header table.
///
/// Keys matching AMQP built-in property names become properties; everything
/// else lands in the `headers` table. Values carried as strings are coerced
/// where the property demands a numeric type.
pub(crate) fn properties_from_attributes(attributes: &Attributes) -> BasicProperties {
    let mut properties = BasicProperties::default();
    let mut headers = BTreeMap::new();

    for (key, value) in attributes {
        match key.as_str() {
            "content-type" => {
                if let Some(text) = value_as_string(value) {
                    properties = properties.with_content_type(ShortString::from(text));
                }
            }
            "content-encoding" => {
                if let Some(text) = value_as_string(value) {
                    properties = properties.with_content_encoding(ShortString::from(text));
                }
            }
            "delivery-mode" => {
                if let Some(mode) = value_as_u8(value) {
                    properties = properties.with_delivery_mode(mode);
                }
            }
            "priority" => {
                if let Some(priority) = value_as_u8(value) {
                    properties = properties.with_priority(priority);
                }
            }
            "correlation-id" => {
                if let Some(text) = value_as_string(value) {
                    properties = properties.with_correlation_id(ShortString::from(text));
                }
            }
            "reply-to" => {
                if let Some(text) = value_as_string(value) {
                    properties = properties.with_reply_to(ShortString::from(text));
                }
            }
            "expiration" => {
                if let Some(text) = value_as_string(value) {
                    properties = properties.with_expiration(ShortString::from(text));
                }
            }
            "message-id" => {
                if let Some(text) = value_as_string(value) {
                    properties = properties.with_message_id(ShortString::from(text));
                }
            }
            "timestamp" => {
                if let Some(timestamp) = value_as_u64(value) {
                    properties = properties.with_timestamp(timestamp);
                }
            }
            "type" => {
                if let Some(text) = value_as_string(value) {
                    properties = properties.with_type(ShortString::from(text));
                }
            }
            "user-id" => {
                if let Some(text) = value_as_string(value) {
                    properties = properties.with_user_id(ShortString::from(text));
                }
            }
            "app-id" => {
                if let Some(text) = value_as_string(value) {
                    properties = properties.with_app_id(ShortString::from(text));
                }
            }
            "cluster-id" => {
                if let Some(text) = value_as_string(value) {
                    properties = properties.with_cluster_id(ShortString::from(text));
                }
            }
            _ => {
                headers.insert(key.clone(), value.clone());
            }
        }
    }

    if !headers.is_empty() {
        properties = properties.with_headers(lapin::types::FieldTable::from(headers));
    }

    properties
}

/// Merges broker properties and the header table back into one flat
/// attribute map, the inverse of [`properties_from_attributes`].
pub(crate) fn attributes_from_properties(properties: &BasicProperties) -> Attributes {
    let mut attributes = Attributes::new();

    if let Some(value) = properties.content_type() {
        insert_text(&mut attributes, "content-type", value.as_str());
    }
    if let Some(value) = properties.content_encoding() {
        insert_text(&mut attributes, "content-encoding", value.as_str());
    }
    if let Some(mode) = properties.delivery_mode() {
        attributes.insert(
            ShortString::from("delivery-mode"),
            AMQPValue::ShortShortUInt(*mode),
        );
    }
    if let Some(priority) = properties.priority() {
        attributes.insert(
            ShortString::from("priority"),
            AMQPValue::ShortShortUInt(*priority),
        );
    }
    if let Some(value) = properties.correlation_id() {
        insert_text(&mut attributes, "correlation-id", value.as_str());
    }
    if let Some(value) = properties.reply_to() {
        insert_text(&mut attributes, "reply-to", value.as_str());
    }
    if let Some(value) = properties.expiration() {
        insert_text(&mut attributes, "expiration", value.as_str());
    }
    if let Some(value) = properties.message_id() {
        insert_text(&mut attributes, "message-id", value.as_str());
    }
    if let Some(timestamp) = properties.timestamp() {
        attributes.insert(
            ShortString::from("timestamp"),
            AMQPValue::Timestamp(*timestamp),
        );
    }
    if let Some(value) = properties.kind() {
        insert_text(&mut attributes, "type", value.as_str());
    }
    if let Some(value) = properties.user_id() {
        insert_text(&mut attributes, "user-id", value.as_str());
    }
    if let Some(value) = properties.app_id() {
        insert_text(&mut attributes, "app-id", value.as_str());
    }
    if let Some(value) = properties.cluster_id() {
        insert_text(&mut attributes, "cluster-id", value.as_str());
    }
    if let Some(headers) = properties.headers() {
        for (key, value) in headers.inner() {
            attributes.insert(key.clone(), value.clone());
        }
    }

    attributes
}

/// Reconstructs the application headers of a received message: the flat
/// attribute map minus the broker built-ins, values stringified. Non-scalar
/// values (tables, arrays) are omitted.
pub fn application_headers(attributes: &Attributes) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();

    for (key, value) in attributes {
        if NON_APPLICATION_HEADERS.contains(&key.as_str()) {
            continue;
        }
        if let Some(text) = value_as_string(value) {
            headers.insert(key.as_str().to_owned(), text);
        }
    }

    headers
}

fn insert_text(attributes: &mut Attributes, key: &str, value: &str) {
    attributes.insert(
        ShortString::from(key),
        AMQPValue::LongString(LongString::from(value)),
    );
}

/// Best-effort scalar-to-string conversion of an attribute value.
pub(crate) fn value_as_string(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(text) => {
            Some(String::from_utf8_lossy(text.as_bytes()).into_owned())
        }
        AMQPValue::ShortString(text) => Some(text.as_str().to_owned()),
        AMQPValue::Boolean(value) => Some(value.to_string()),
        AMQPValue::ShortShortInt(value) => Some(value.to_string()),
        AMQPValue::ShortShortUInt(value) => Some(value.to_string()),
        AMQPValue::ShortInt(value) => Some(value.to_string()),
        AMQPValue::ShortUInt(value) => Some(value.to_string()),
        AMQPValue::LongInt(value) => Some(value.to_string()),
        AMQPValue::LongUInt(value) => Some(value.to_string()),
        AMQPValue::LongLongInt(value) => Some(value.to_string()),
        AMQPValue::Timestamp(value) => Some(value.to_string()),
        AMQPValue::Float(value) => Some(value.to_string()),
        AMQPValue::Double(value) => Some(value.to_string()),
        _ => None,
    }
}

/// Reads an attribute value as a signed 64-bit integer, accepting numeric
/// strings the way DSN-sourced options arrive.
pub(crate) fn value_as_i64(value: &AMQPValue) -> Option<i64> {
    match value {
        AMQPValue::ShortShortInt(value) => Some(i64::from(*value)),
        AMQPValue::ShortShortUInt(value) => Some(i64::from(*value)),
        AMQPValue::ShortInt(value) => Some(i64::from(*value)),
        AMQPValue::ShortUInt(value) => Some(i64::from(*value)),
        AMQPValue::LongInt(value) => Some(i64::from(*value)),
        AMQPValue::LongUInt(value) => Some(i64::from(*value)),
        AMQPValue::LongLongInt(value) => Some(*value),
        AMQPValue::Timestamp(value) => i64::try_from(*value).ok(),
        AMQPValue::LongString(text) => std::str::from_utf8(text.as_bytes())
            .ok()
            .and_then(|text| text.trim().parse().ok()),
        AMQPValue::ShortString(text) => text.as_str().trim().parse().ok(),
        _ => None,
    }
}

fn value_as_u8(value: &AMQPValue) -> Option<u8> {
    value_as_i64(value).and_then(|value| u8::try_from(value).ok())
}

fn value_as_u64(value: &AMQPValue) -> Option<u64> {
    value_as_i64(value).and_then(|value| u64::try_from(value).ok())
}

/// Human-readable name of an attribute value's type, for error messages.
pub(crate) fn value_type_name(value: &AMQPValue) -> &'static str {
    match value {
        AMQPValue::Boolean(_) => "boolean",
        AMQPValue::ShortShortInt(_)
        | AMQPValue::ShortShortUInt(_)
        | AMQPValue::ShortInt(_)
        | AMQPValue::ShortUInt(_)
        | AMQPValue::LongInt(_)
        | AMQPValue::LongUInt(_)
        | AMQPValue::LongLongInt(_) => "integer",
        AMQPValue::Float(_) | AMQPValue::Double(_) => "float",
        AMQPValue::DecimalValue(_) => "decimal",
        AMQPValue::ShortString(_) | AMQPValue::LongString(_) => "string",
        AMQPValue::FieldArray(_) => "array",
        AMQPValue::Timestamp(_) => "timestamp",
        AMQPValue::FieldTable(_) => "table",
        AMQPValue::ByteArray(_) => "byte array",
        AMQPValue::Void => "null",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(value: &str) -> AMQPValue {
        AMQPValue::LongString(LongString::from(value))
    }

    #[test]
    fn stamp_from_received_takes_the_message_routing_key() {
        let message = RawMessage::new(1, "messenger", "orders", b"{}".to_vec());

        let stamp = AmqpStamp::from_received(&message, None, None);

        assert_eq!(stamp.routing_key(), Some("orders"));
        assert!(!stamp.is_retry_attempt());
    }

    #[test]
    fn stamp_from_received_prefers_the_previous_stamp_routing_key() {
        let message = RawMessage::new(1, "messenger", "orders", b"{}".to_vec());
        let previous = AmqpStamp::new().with_routing_key("invoices");

        let stamp = AmqpStamp::from_received(&message, Some(&previous), None);

        assert_eq!(stamp.routing_key(), Some("invoices"));
    }

    #[test]
    fn stamp_from_received_marks_retries_and_uses_the_retry_key() {
        let message = RawMessage::new(1, "messenger", "orders", b"{}".to_vec());
        let previous = AmqpStamp::new().with_routing_key("invoices");

        let stamp = AmqpStamp::from_received(&message, Some(&previous), Some("queue_0"));

        assert_eq!(stamp.routing_key(), Some("queue_0"));
        assert!(stamp.is_retry_attempt());
    }

    #[test]
    fn stamp_from_received_lets_the_previous_stamp_override_attributes() {
        let message = RawMessage::new(1, "messenger", "", b"{}".to_vec())
            .with_attribute("priority", AMQPValue::ShortShortUInt(1))
            .with_attribute("app-id", text("app"));
        let previous = AmqpStamp::new().with_attribute("priority", AMQPValue::ShortShortUInt(9));

        let stamp = AmqpStamp::from_received(&message, Some(&previous), None);

        assert_eq!(
            stamp.attributes().get("priority"),
            Some(&AMQPValue::ShortShortUInt(9))
        );
        assert_eq!(stamp.attributes().get("app-id"), Some(&text("app")));
    }

    #[test]
    fn merged_attributes_win_over_the_previous_stamp() {
        let previous = AmqpStamp::new()
            .with_routing_key("orders")
            .with_attribute("priority", AMQPValue::ShortShortUInt(1))
            .with_attribute("app-id", text("app"));

        let mut fresh = Attributes::new();
        fresh.insert(
            ShortString::from("priority"),
            AMQPValue::ShortShortUInt(255),
        );
        let stamp = AmqpStamp::merged_attributes(fresh, Some(&previous));

        assert_eq!(stamp.routing_key(), Some("orders"));
        assert_eq!(
            stamp.attributes().get("priority"),
            Some(&AMQPValue::ShortShortUInt(255))
        );
        assert_eq!(stamp.attributes().get("app-id"), Some(&text("app")));
        assert!(!stamp.is_retry_attempt());
    }

    #[test]
    fn application_headers_drop_broker_builtins_but_keep_type() {
        let mut attributes = Attributes::new();
        attributes.insert(
            ShortString::from("delivery-mode"),
            AMQPValue::ShortShortUInt(2),
        );
        attributes.insert(ShortString::from("priority"), AMQPValue::ShortShortUInt(5));
        attributes.insert(ShortString::from("type"), text("App\\Message"));
        attributes.insert(ShortString::from("x-custom"), text("yes"));

        let headers = application_headers(&attributes);

        assert_eq!(headers.len(), 2);
        assert_eq!(headers.get("type").map(String::as_str), Some("App\\Message"));
        assert_eq!(headers.get("x-custom").map(String::as_str), Some("yes"));
    }

    #[test]
    fn properties_split_known_keys_and_keep_the_rest_as_headers() {
        let mut attributes = Attributes::new();
        attributes.insert(ShortString::from("content-type"), text("application/json"));
        attributes.insert(
            ShortString::from("delivery-mode"),
            AMQPValue::ShortShortUInt(2),
        );
        attributes.insert(ShortString::from("type"), text("App\\Message"));
        attributes.insert(ShortString::from("x-custom"), text("yes"));

        let properties = properties_from_attributes(&attributes);

        assert_eq!(
            properties.content_type().as_ref().map(|v| v.as_str()),
            Some("application/json")
        );
        assert_eq!(*properties.delivery_mode(), Some(2));
        assert_eq!(
            properties.kind().as_ref().map(|v| v.as_str()),
            Some("App\\Message")
        );
        let headers = properties.headers().as_ref().expect("headers table");
        assert_eq!(headers.inner().get("x-custom"), Some(&text("yes")));
        assert!(headers.inner().get("content-type").is_none());
    }

    #[test]
    fn properties_coerce_numeric_strings() {
        let mut attributes = Attributes::new();
        attributes.insert(ShortString::from("delivery-mode"), text("2"));
        attributes.insert(ShortString::from("timestamp"), text("1699999999"));

        let properties = properties_from_attributes(&attributes);

        assert_eq!(*properties.delivery_mode(), Some(2));
        assert_eq!(*properties.timestamp(), Some(1_699_999_999));
    }

    #[test]
    fn attributes_round_trip_through_properties() {
        let mut attributes = Attributes::new();
        attributes.insert(ShortString::from("content-type"), text("application/json"));
        attributes.insert(
            ShortString::from("delivery-mode"),
            AMQPValue::ShortShortUInt(2),
        );
        attributes.insert(ShortString::from("type"), text("App\\Message"));
        attributes.insert(ShortString::from("x-custom"), text("yes"));

        let rebuilt = attributes_from_properties(&properties_from_attributes(&attributes));

        assert_eq!(rebuilt, attributes);
    }

    #[test]
    fn integer_coercion_accepts_numeric_strings_only() {
        assert_eq!(value_as_i64(&text("255")), Some(255));
        assert_eq!(value_as_i64(&AMQPValue::LongInt(42)), Some(42));
        assert_eq!(value_as_i64(&text("not-a-number")), None);
        assert_eq!(value_type_name(&text("oops")), "string");
        assert_eq!(value_type_name(&AMQPValue::Boolean(true)), "boolean");
    }
}
