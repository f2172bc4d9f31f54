// Copyright (c) 2025, The AMQP Messenger Authors
// MIT License
// All rights reserved.

//! # Delay Routing
//!
//! Deferred delivery without broker plugins: each (delay, routing key,
//! retry) combination gets its own short-lived queue bound to the delay
//! exchange under the queue's own name. Messages published there sit
//! until the per-queue TTL expires and are then dead-lettered onward.
//!
//! The dead-letter target distinguishes first-time delays from retries: a
//! delayed message re-enters the main exchange and fans out to every
//! bound queue, while a retried message goes through the broker's default
//! exchange straight back to the single queue it failed on.

use crate::channel::{AmqpChannel, QueueFlags};
use crate::config::Config;
use crate::errors::TransportError;
use crate::message::Attributes;
use lapin::types::AMQPValue;
use tracing::debug;

/// Header selecting the exchange expired messages are dead-lettered to
pub(crate) const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Header selecting the routing key expired messages are dead-lettered with
pub(crate) const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Header holding the per-queue message TTL
pub(crate) const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Header holding the queue expiry
pub(crate) const AMQP_HEADERS_EXPIRES: &str = "x-expires";

/// How long a delay queue outlives its own TTL before the broker drops
/// it. The margin keeps the queue alive while the broker dead-letters the
/// last messages.
pub(crate) const DELAY_QUEUE_EXPIRY_GRACE_MS: u64 = 10_000;

const PATTERN_DELAY: &str = "%delay%";
const PATTERN_EXCHANGE_NAME: &str = "%exchange_name%";
const PATTERN_ROUTING_KEY: &str = "%routing_key%";

/// Computes the name of the delay queue for one (delay, routing key,
/// retry) combination by substituting the configured pattern and
/// appending the `_delay` or `_retry` suffix.
pub(crate) fn delay_queue_name(
    config: &Config,
    delay_ms: u64,
    routing_key: &str,
    is_retry: bool,
) -> String {
    let suffix = if is_retry { "_retry" } else { "_delay" };
    let name = config
        .delay
        .queue_template
        .name_pattern
        .replace(PATTERN_DELAY, &delay_ms.to_string())
        .replace(PATTERN_EXCHANGE_NAME, &config.exchange.name)
        .replace(PATTERN_ROUTING_KEY, routing_key);
    format!("{name}{suffix}")
}

/// Declares and binds the delay queue for one combination, returning its
/// name for use as the publish routing key. Declaring an existing queue
/// with identical arguments is a broker no-op, so repeated publishes with
/// the same delay reuse the queue.
///
/// # Parameters
///
/// * `channel` - channel the declarations are issued on
/// * `config` - validated transport configuration
/// * `delay_ms` - how long the message should sit, in milliseconds
/// * `routing_key` - routing key the message re-enters routing with
/// * `is_retry` - whether the message is being retried on one queue
///   rather than delayed through the main exchange
pub(crate) async fn ensure_delay_queue(
    channel: &dyn AmqpChannel,
    config: &Config,
    delay_ms: u64,
    routing_key: Option<&str>,
    is_retry: bool,
) -> Result<String, TransportError> {
    let routing_key = routing_key.unwrap_or("");
    let queue_name = delay_queue_name(config, delay_ms, routing_key, is_retry);
    debug!(queue = %queue_name, delay_ms, is_retry, "materializing delay queue");

    let dead_letter_exchange = if is_retry {
        // The broker's default exchange routes by queue name, bringing
        // the message back to exactly the queue it failed on.
        ""
    } else {
        config.exchange.name.as_str()
    };

    let mut arguments = config.delay.queue_template.arguments.clone();
    arguments.insert(
        AMQP_HEADERS_MESSAGE_TTL.into(),
        AMQPValue::LongLongInt(delay_ms as i64),
    );
    arguments.insert(
        AMQP_HEADERS_EXPIRES.into(),
        AMQPValue::LongLongInt((delay_ms + DELAY_QUEUE_EXPIRY_GRACE_MS) as i64),
    );
    arguments.insert(
        AMQP_HEADERS_DEAD_LETTER_EXCHANGE.into(),
        AMQPValue::LongString(dead_letter_exchange.into()),
    );
    arguments.insert(
        AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY.into(),
        AMQPValue::LongString(routing_key.into()),
    );

    channel
        .declare_queue(
            &queue_name,
            QueueFlags {
                passive: config.delay.queue_template.passive,
                durable: config.delay.queue_template.durable,
                exclusive: config.delay.queue_template.exclusive,
                auto_delete: config.delay.queue_template.auto_delete,
            },
            &arguments,
        )
        .await?;
    channel
        .bind_queue(
            &queue_name,
            &config.delay.exchange.name,
            &queue_name,
            &Attributes::new(),
        )
        .await?;

    Ok(queue_name)
}
