// Copyright (c) 2025, The AMQP Messenger Authors
// MIT License
// All rights reserved.

//! # Subscriptions
//!
//! Consumer bookkeeping and delivery buffering. Deliveries from every
//! consumed queue funnel through one unbounded FIFO channel, so messages
//! are handed out in arrival order and each is handed out exactly once,
//! no matter how many queues feed the buffer.
//!
//! The [`Subscriptions`] registry reconciles the set of active consumers
//! against the set of queues a `get` call wants: missing queues gain a
//! consumer, consumers for queues no longer wanted are cancelled.

use std::time::Duration;

use crate::channel::AmqpChannel;
use crate::errors::TransportError;
use crate::message::{RawMessage, ReceivedMessage};
use indexmap::IndexMap;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::debug;

/// Cloneable handle a broker consumer pushes deliveries through. Each
/// sink stamps its deliveries with the queue they were consumed from.
#[derive(Debug, Clone)]
pub struct DeliverySink {
    queue_name: String,
    tx: mpsc::UnboundedSender<ReceivedMessage>,
}

impl DeliverySink {
    /// Buffers one delivery. A send can only fail after the buffer was
    /// dropped, and the unacked message is redelivered in that case.
    pub fn deliver(&self, message: RawMessage) {
        let _ = self
            .tx
            .send(ReceivedMessage::new(message, self.queue_name.clone()));
    }
}

/// FIFO buffer between broker consumers and `get`.
#[derive(Debug)]
pub(crate) struct DeliveryBuffer {
    tx: mpsc::UnboundedSender<ReceivedMessage>,
    rx: mpsc::UnboundedReceiver<ReceivedMessage>,
}

impl DeliveryBuffer {
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    /// Creates a sink that feeds this buffer with deliveries from
    /// `queue_name`.
    pub(crate) fn sink(&self, queue_name: &str) -> DeliverySink {
        DeliverySink {
            queue_name: queue_name.to_string(),
            tx: self.tx.clone(),
        }
    }

    /// Collects deliveries for up to `window`, then returns everything
    /// buffered, oldest first. An empty batch means the window elapsed
    /// without a delivery arriving.
    pub(crate) async fn drain(&mut self, window: Duration) -> Vec<ReceivedMessage> {
        let deadline = Instant::now() + window;
        let mut drained = Vec::new();
        loop {
            match timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(message)) => drained.push(message),
                Ok(None) | Err(_) => return drained,
            }
        }
    }
}

/// Registry of active consumers, keyed by queue name.
#[derive(Debug, Default)]
pub(crate) struct Subscriptions {
    active: IndexMap<String, String>,
}

impl Subscriptions {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Aligns active consumers with `desired`: queues without a consumer
    /// get one feeding `buffer`, consumers for queues not in `desired`
    /// are cancelled. Already-aligned queues are left untouched, so calls
    /// with a stable queue set are cheap.
    pub(crate) async fn reconcile(
        &mut self,
        channel: &dyn AmqpChannel,
        desired: &[&str],
        buffer: &DeliveryBuffer,
    ) -> Result<(), TransportError> {
        for queue in desired.iter().copied() {
            if self.active.contains_key(queue) {
                continue;
            }
            debug!(queue, "subscribing queue consumer");
            let tag = channel.consume(queue, buffer.sink(queue)).await?;
            self.active.insert(queue.to_string(), tag);
        }

        let stale: Vec<String> = self
            .active
            .keys()
            .filter(|queue| !desired.contains(&queue.as_str()))
            .cloned()
            .collect();
        for queue in stale {
            if let Some(tag) = self.active.shift_remove(&queue) {
                debug!(queue = %queue, tag = %tag, "cancelling stale consumer");
                channel.cancel(&tag).await?;
            }
        }

        Ok(())
    }
}
