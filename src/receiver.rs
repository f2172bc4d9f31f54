// Copyright (c) 2025, The AMQP Messenger Authors
// MIT License
// All rights reserved.

//! # Receiver
//!
//! Inbound boundary: pulls raw messages from a
//! [`Connection`](crate::connection::Connection), decodes them and wraps
//! the result in an envelope carrying the provenance needed to settle it.

use crate::connection::Connection;
use crate::envelope::Envelope;
use crate::errors::Error;
use crate::message::{application_headers, ReceivedMessage};
use crate::serializer::Serializer;

/// Fetches and decodes whatever one poll window produced, across every
/// configured queue. An empty batch means nothing arrived in time.
pub(crate) async fn get<S: Serializer>(
    connection: &mut Connection,
    serializer: &S,
) -> Result<Vec<Envelope<S::Message>>, Error> {
    let batch = connection.get().await?;
    decode_batch(connection, serializer, batch).await
}

/// Like [`get`], but restricted to the given queues. Consumer changes
/// accumulate across calls; see
/// [`Connection::get_from_queues`](crate::connection::Connection::get_from_queues).
pub(crate) async fn get_from_queues<S: Serializer>(
    connection: &mut Connection,
    serializer: &S,
    queue_names: &[&str],
) -> Result<Vec<Envelope<S::Message>>, Error> {
    let batch = connection.get_from_queues(queue_names).await?;
    decode_batch(connection, serializer, batch).await
}

/// Decodes a drained batch into envelopes carrying their received message
/// as provenance, which [`ack`] and [`reject`] later require.
///
/// A message that fails to decode is rejected on the broker before the
/// decoding error is surfaced, so it does not stay unacked forever.
async fn decode_batch<S: Serializer>(
    connection: &Connection,
    serializer: &S,
    batch: Vec<ReceivedMessage>,
) -> Result<Vec<Envelope<S::Message>>, Error> {
    let mut envelopes = Vec::with_capacity(batch.len());
    for received in batch {
        let headers = application_headers(&received.message.attributes);
        match serializer.decode(&received.message.body, &headers) {
            Ok(message) => envelopes.push(Envelope::new(message).with_received(received)),
            Err(err) => {
                connection.nack(&received).await?;
                return Err(Error::Decoding(err));
            }
        }
    }
    Ok(envelopes)
}

/// Acknowledges the received message the envelope was decoded from.
pub(crate) async fn ack<M>(connection: &Connection, envelope: &Envelope<M>) -> Result<(), Error> {
    let received = envelope.received().ok_or(Error::MissingReceivedMessage)?;
    connection.ack(received).await?;
    Ok(())
}

/// Rejects the received message the envelope was decoded from, without
/// requeueing it.
pub(crate) async fn reject<M>(
    connection: &Connection,
    envelope: &Envelope<M>,
) -> Result<(), Error> {
    let received = envelope.received().ok_or(Error::MissingReceivedMessage)?;
    connection.nack(received).await?;
    Ok(())
}
