// Copyright (c) 2025, The AMQP Messenger Authors
// MIT License
// All rights reserved.

//! # Error Types for the AMQP Transport
//!
//! This module defines the error taxonomy of the crate. Configuration
//! problems are reported as [`ConfigurationError`] and can only occur while
//! building a transport; broker-side failures are wrapped into
//! [`TransportError`]; payload decoding failures are [`DecodingError`]; the
//! crate-level [`Error`] unifies them for the boundary layer.

use thiserror::Error;

/// Underlying cause of a broker failure, kept as a boxed error so both the
/// lapin backend and test backends can produce it.
pub type BoxedCause = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Represents errors raised while building the transport configuration.
///
/// Every variant is a construction-time fault: the caller must fix the DSN
/// or the options, retrying the same input can never succeed.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    /// The connection DSN could not be parsed as a URL
    #[error("invalid connection DSN \"{dsn}\"")]
    InvalidDsn {
        dsn: String,
        #[source]
        source: url::ParseError,
    },

    /// The DSN scheme is neither `amqp` nor `amqps`
    #[error("unsupported DSN scheme \"{scheme}\", expected \"amqp\" or \"amqps\"")]
    UnsupportedScheme { scheme: String },

    /// A query-string key could not be parsed as a bracketed option path
    #[error("malformed option key \"{key}\" in the DSN query string")]
    MalformedQueryKey { key: String },

    /// An option name that the transport does not know
    #[error("unknown option \"{option}\"")]
    UnknownOption { option: String },

    /// An option value that could not be coerced to the expected type
    #[error("invalid value \"{value}\" for option \"{option}\"")]
    InvalidOptionValue { option: String, value: String },

    /// TLS options and the DSN scheme must be present together
    #[error("TLS options require the \"amqps\" scheme and the \"amqps\" scheme requires TLS options")]
    TlsMismatch,

    /// An exchange type outside direct/fanout/topic
    #[error("invalid exchange type \"{kind}\" for {exchange}, expected \"direct\", \"fanout\" or \"topic\"")]
    InvalidExchangeKind { exchange: String, kind: String },

    /// A queue argument that must be an integer carried something else
    #[error("integer expected for queue argument \"{key}\", \"{value_type}\" given")]
    IntegerArgument {
        key: String,
        value_type: &'static str,
    },

    /// The event-loop wait window must be strictly positive
    #[error("expected \"run_timeout\" to be greater than zero, got {value}")]
    InvalidRunTimeout { value: f64 },
}

/// Represents errors that occur while talking to the broker.
///
/// Each variant names the operation that failed and wraps the underlying
/// cause. None of these are retried internally; they surface to the caller
/// of the operation that triggered them.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Error establishing the network link to the broker
    #[error("failure to connect to the broker")]
    Connect(#[source] BoxedCause),

    /// Error opening a channel on an established link
    #[error("failure to open a channel")]
    OpenChannel(#[source] BoxedCause),

    /// Error applying the prefetch quality-of-service setting
    #[error("failure to configure channel QoS")]
    Qos(#[source] BoxedCause),

    /// Error declaring an exchange with the given name
    #[error("failure to declare exchange \"{name}\"")]
    DeclareExchange {
        name: String,
        #[source]
        source: BoxedCause,
    },

    /// Error declaring a queue with the given name
    #[error("failure to declare queue \"{name}\"")]
    DeclareQueue {
        name: String,
        #[source]
        source: BoxedCause,
    },

    /// Error binding a queue to an exchange
    #[error("failure to bind queue \"{queue}\" to exchange \"{exchange}\"")]
    BindQueue {
        queue: String,
        exchange: String,
        #[source]
        source: BoxedCause,
    },

    /// Error publishing a message to an exchange
    #[error("failure to publish to exchange \"{exchange}\"")]
    Publish {
        exchange: String,
        #[source]
        source: BoxedCause,
    },

    /// Error registering a consumer on a queue
    #[error("failure to start a consumer on queue \"{queue}\"")]
    Consume {
        queue: String,
        #[source]
        source: BoxedCause,
    },

    /// Error cancelling a consumer
    #[error("failure to cancel consumer \"{tag}\"")]
    Cancel {
        tag: String,
        #[source]
        source: BoxedCause,
    },

    /// Error acknowledging a message
    #[error("failure to ack message")]
    Ack(#[source] BoxedCause),

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    Nack(#[source] BoxedCause),

    /// A broker operation was attempted before the channel existed
    #[error("the channel is not open")]
    NotConnected,
}

/// Represents a failure to decode a received payload into an application
/// message. Produced by [`Serializer`](crate::serializer::Serializer)
/// implementations.
#[derive(Error, Debug)]
#[error("failure to decode message: {message}")]
pub struct DecodingError {
    message: String,
    #[source]
    source: Option<BoxedCause>,
}

impl DecodingError {
    /// Creates a decoding error from a plain description.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a decoding error wrapping the underlying parser failure.
    pub fn with_source(message: impl Into<String>, source: BoxedCause) -> Self {
        Self {
            message: message.into(),
            source: Some(source),
        }
    }
}

/// Crate-level error for the send/receive boundary.
///
/// The lower layers return the specific types; operations that can fail in
/// more than one way (decoding plus broker access, for instance) return
/// this enum instead.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration construction failed
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// A broker operation failed
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A received payload could not be decoded
    #[error(transparent)]
    Decoding(#[from] DecodingError),

    /// A payload could not be encoded for publishing
    #[error("failure to encode message: {0}")]
    Encoding(String),

    /// The envelope was not produced by this transport, so it cannot be
    /// acknowledged or rejected through it
    #[error("no received message found on the envelope")]
    MissingReceivedMessage,
}
