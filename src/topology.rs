// Copyright (c) 2025, The AMQP Messenger Authors
// MIT License
// All rights reserved.

//! # Topology Management
//!
//! This module declares the exchange-and-queue fabric the transport rides
//! on: the main exchange, every configured queue with its bindings, and
//! the delay exchange. Installation order matters - queues bind to the
//! main exchange, so it is declared first; the delay exchange comes last
//! because nothing binds to it until a delayed message materializes its
//! queue.

use crate::channel::{AmqpChannel, ExchangeFlags, QueueFlags};
use crate::config::{Config, ExchangeConfig, QueueConfig};
use crate::errors::TransportError;
use crate::message::Attributes;
use tracing::debug;

/// Declares the whole static topology: main exchange, configured queues
/// with their bindings, then the delay exchange.
///
/// # Parameters
///
/// * `channel` - channel the declarations are issued on
/// * `config` - validated transport configuration
///
/// # Returns
///
/// * `Ok(())` on success or `TransportError` on the first failed declaration
pub(crate) async fn setup(channel: &dyn AmqpChannel, config: &Config) -> Result<(), TransportError> {
    debug!("installing topology for exchange: {}", config.exchange.name);

    declare_exchange(channel, &config.exchange).await?;
    for (name, queue) in &config.queues {
        setup_queue(channel, config, name, queue).await?;
    }
    declare_exchange(channel, &config.delay.exchange).await?;

    debug!("topology installed");
    Ok(())
}

/// Declares one exchange from its configuration.
pub(crate) async fn declare_exchange(
    channel: &dyn AmqpChannel,
    exchange: &ExchangeConfig,
) -> Result<(), TransportError> {
    channel
        .declare_exchange(
            &exchange.name,
            exchange.kind,
            ExchangeFlags {
                passive: exchange.passive,
                durable: exchange.durable,
                auto_delete: exchange.auto_delete,
            },
            &exchange.arguments,
        )
        .await
}

/// Declares one queue and binds it to the main exchange under each of its
/// binding keys.
async fn setup_queue(
    channel: &dyn AmqpChannel,
    config: &Config,
    name: &str,
    queue: &QueueConfig,
) -> Result<(), TransportError> {
    channel
        .declare_queue(
            name,
            QueueFlags {
                passive: queue.passive,
                durable: queue.durable,
                exclusive: queue.exclusive,
                auto_delete: queue.auto_delete,
            },
            &queue.arguments,
        )
        .await?;

    for binding_key in &queue.binding_keys {
        channel
            .bind_queue(
                name,
                &config.exchange.name,
                binding_key,
                &queue.binding_arguments,
            )
            .await?;
    }

    Ok(())
}

/// Sums the ready-message counts of every configured queue, using passive
/// declarations so no queue is created as a side effect.
pub(crate) async fn count_messages(
    channel: &dyn AmqpChannel,
    config: &Config,
) -> Result<u64, TransportError> {
    let mut total = 0u64;
    for name in config.queues.keys() {
        let info = channel
            .declare_queue(
                name,
                QueueFlags {
                    passive: true,
                    ..QueueFlags::default()
                },
                &Attributes::new(),
            )
            .await?;
        total += u64::from(info.message_count);
    }
    Ok(total)
}
