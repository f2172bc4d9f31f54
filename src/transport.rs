// Copyright (c) 2025, The AMQP Messenger Authors
// MIT License
// All rights reserved.

//! # Transport
//!
//! The user-facing facade. An [`AmqpTransport`] pairs a
//! [`Connection`](crate::connection::Connection) with a serializer and
//! exposes the whole lifecycle of a message queue transport: send,
//! bounded-poll get, ack/reject, explicit topology setup and queue
//! depth counting.

use crate::connection::Connection;
use crate::envelope::Envelope;
use crate::errors::{ConfigurationError, Error};
use crate::options::TransportOptions;
use crate::serializer::Serializer;
use crate::{receiver, sender};

/// An AMQP transport for one message type, bound to one broker
/// connection.
pub struct AmqpTransport<S: Serializer> {
    connection: Connection,
    serializer: S,
}

impl<S: Serializer> AmqpTransport<S> {
    /// Pairs an existing connection with a serializer.
    pub fn new(connection: Connection, serializer: S) -> Self {
        Self {
            connection,
            serializer,
        }
    }

    /// Builds a transport from a DSN merged with structured options. The
    /// broker is not contacted until the first operation.
    ///
    /// # Parameters
    ///
    /// * `dsn` - connection string with the `amqp` or `amqps` scheme
    /// * `options` - structured options the DSN overrides
    /// * `serializer` - message codec used by `send` and `get`
    ///
    /// # Returns
    ///
    /// * `Ok(AmqpTransport)` - a lazily connecting transport
    /// * `Err(ConfigurationError)` - invalid DSN or options
    pub fn from_dsn(
        dsn: &str,
        options: TransportOptions,
        serializer: S,
    ) -> Result<Self, ConfigurationError> {
        Ok(Self::new(Connection::from_dsn(dsn, options)?, serializer))
    }

    /// The connection backing this transport.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Encodes and publishes an envelope, honoring its delay, stamp and
    /// redelivery metadata.
    pub async fn send(&mut self, envelope: &Envelope<S::Message>) -> Result<(), Error> {
        sender::send(&mut self.connection, &self.serializer, envelope).await
    }

    /// Fetches and decodes whatever arrives within one run-timeout
    /// window, across every configured queue. An empty batch means
    /// nothing arrived in time.
    pub async fn get(&mut self) -> Result<Vec<Envelope<S::Message>>, Error> {
        receiver::get(&mut self.connection, &self.serializer).await
    }

    /// Like [`AmqpTransport::get`], but restricted to the given queues.
    /// Consumers started for queues a previous call listed are cancelled
    /// when the queue disappears from `queue_names`.
    pub async fn get_from_queues(
        &mut self,
        queue_names: &[&str],
    ) -> Result<Vec<Envelope<S::Message>>, Error> {
        receiver::get_from_queues(&mut self.connection, &self.serializer, queue_names).await
    }

    /// Acknowledges a received envelope.
    pub async fn ack(&self, envelope: &Envelope<S::Message>) -> Result<(), Error> {
        receiver::ack(&self.connection, envelope).await
    }

    /// Rejects a received envelope without requeueing it.
    pub async fn reject(&self, envelope: &Envelope<S::Message>) -> Result<(), Error> {
        receiver::reject(&self.connection, envelope).await
    }

    /// Declares the exchanges, queues and bindings this transport runs
    /// on. Useful on deploy; normally setup happens automatically before
    /// each broker operation.
    pub async fn setup(&mut self) -> Result<(), Error> {
        Ok(self.connection.setup().await?)
    }

    /// Sums the ready-message counts of all configured queues.
    pub async fn message_count(&mut self) -> Result<u64, Error> {
        Ok(self.connection.message_count().await?)
    }
}
