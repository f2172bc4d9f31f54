// Copyright (c) 2025, The AMQP Messenger Authors
// MIT License
// All rights reserved.

//! # Sender
//!
//! Outbound boundary: encodes an envelope and publishes it through a
//! [`Connection`](crate::connection::Connection), deriving the publish
//! stamp from the envelope's metadata.

use crate::connection::Connection;
use crate::envelope::Envelope;
use crate::errors::Error;
use crate::message::{AmqpStamp, Attributes, ATTRIBUTE_CONTENT_TYPE};
use crate::serializer::{Serializer, HEADER_CONTENT_TYPE};
use lapin::types::AMQPValue;

/// Encodes and publishes one envelope.
///
/// The serializer's `Content-Type` header moves into the broker's
/// content-type attribute instead of travelling as a plain header; a
/// stamp that already carries the attribute wins. An envelope with
/// receive provenance that is marked as a redelivery gets its stamp
/// rebuilt from the received message, keyed to its source queue, which
/// routes the publish through the matching retry queue.
pub(crate) async fn send<S: Serializer>(
    connection: &mut Connection,
    serializer: &S,
    envelope: &Envelope<S::Message>,
) -> Result<(), Error> {
    let mut encoded = serializer.encode(envelope.message())?;

    let mut stamp = envelope.stamp().cloned();
    if let Some(content_type) = encoded.headers.remove(HEADER_CONTENT_TYPE) {
        let already_stamped = stamp
            .as_ref()
            .is_some_and(|stamp| stamp.has_attribute(ATTRIBUTE_CONTENT_TYPE));
        if !already_stamped {
            stamp = Some(AmqpStamp::merged_attributes(
                Attributes::from([(
                    ATTRIBUTE_CONTENT_TYPE.into(),
                    AMQPValue::LongString(content_type.into()),
                )]),
                stamp.as_ref(),
            ));
        }
    }

    if let Some(received) = envelope.received() {
        let retry_routing_key = envelope
            .is_redelivery()
            .then(|| received.queue_name.as_str());
        stamp = Some(AmqpStamp::from_received(
            &received.message,
            stamp.as_ref(),
            retry_routing_key,
        ));
    }

    connection
        .publish(
            &encoded.body,
            &encoded.headers,
            envelope.delay_ms(),
            stamp.as_ref(),
        )
        .await?;
    Ok(())
}
