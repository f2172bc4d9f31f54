// Copyright (c) 2025, The AMQP Messenger Authors
// MIT License
// All rights reserved.

//! # Envelope
//!
//! A message together with its transport metadata: an optional delivery
//! delay, an optional routing stamp, and - on the receive side - the raw
//! broker message the envelope was decoded from. Re-sending a received
//! envelope marked as a redelivery is what turns a send into a retry.

use std::time::Duration;

use crate::message::{AmqpStamp, ReceivedMessage};

/// An application message wrapped with transport metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<M> {
    message: M,
    delay_ms: u64,
    stamp: Option<AmqpStamp>,
    received: Option<ReceivedMessage>,
    is_redelivery: bool,
}

impl<M> Envelope<M> {
    /// Wraps a message with no delay, no stamp and no provenance.
    pub fn new(message: M) -> Self {
        Self {
            message,
            delay_ms: 0,
            stamp: None,
            received: None,
            is_redelivery: false,
        }
    }

    /// Defers delivery by `delay`, rounded down to whole milliseconds.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_ms = delay.as_millis() as u64;
        self
    }

    /// Attaches a routing stamp controlling routing key and attributes.
    pub fn with_stamp(mut self, stamp: AmqpStamp) -> Self {
        self.stamp = Some(stamp);
        self
    }

    pub(crate) fn with_received(mut self, received: ReceivedMessage) -> Self {
        self.received = Some(received);
        self
    }

    /// Marks the next send as a redelivery. A redelivered envelope with
    /// provenance is routed through a retry queue that dead-letters
    /// straight back into its source queue, with the configured delay.
    pub fn with_redelivery(mut self) -> Self {
        self.is_redelivery = true;
        self
    }

    /// The wrapped message.
    pub fn message(&self) -> &M {
        &self.message
    }

    /// Unwraps the message, dropping the metadata.
    pub fn into_message(self) -> M {
        self.message
    }

    /// Delivery delay in milliseconds; zero means immediate.
    pub fn delay_ms(&self) -> u64 {
        self.delay_ms
    }

    /// The routing stamp, if any.
    pub fn stamp(&self) -> Option<&AmqpStamp> {
        self.stamp.as_ref()
    }

    /// The raw broker message this envelope was decoded from. Present on
    /// envelopes produced by `get`, required by `ack` and `reject`.
    pub fn received(&self) -> Option<&ReceivedMessage> {
        self.received.as_ref()
    }

    /// Whether this envelope is being re-sent after a handling failure.
    pub fn is_redelivery(&self) -> bool {
        self.is_redelivery
    }
}
