// Copyright (c) 2025, The AMQP Messenger Authors
// MIT License
// All rights reserved.

//! # Connection
//!
//! The stateful heart of the transport. A [`Connection`] owns the
//! validated configuration, reaches the broker lazily on first use, and
//! exposes the operations the transport is built from: publish (plain,
//! delayed or retried), bounded-poll get, ack/nack and topology setup.
//!
//! Nothing connects at construction time; building a connection from a
//! DSN is side-effect free, so transports can be wired up in places where
//! the broker may not be reachable yet.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::channel::{AmqpChannel, AmqpClient, ConnectionFactory, LapinConnectionFactory};
use crate::config::Config;
use crate::delay;
use crate::errors::{ConfigurationError, TransportError};
use crate::message::{
    AmqpStamp, Attributes, ReceivedMessage, ATTRIBUTE_DELIVERY_MODE, ATTRIBUTE_TIMESTAMP,
};
use crate::options::TransportOptions;
use crate::subscription::{DeliveryBuffer, Subscriptions};
use crate::topology;
use lapin::types::AMQPValue;
use tracing::debug;

/// A lazily established broker connection with its channel, consumer
/// registry and delivery buffer.
pub struct Connection {
    config: Config,
    factory: Box<dyn ConnectionFactory>,
    client: Option<Box<dyn AmqpClient>>,
    channel: Option<Box<dyn AmqpChannel>>,
    subscriptions: Subscriptions,
    buffer: DeliveryBuffer,
}

impl Connection {
    /// Builds a connection from a DSN merged with structured options,
    /// using the default lapin-backed factory. No broker contact happens
    /// here.
    ///
    /// # Parameters
    ///
    /// * `dsn` - connection string with the `amqp` or `amqps` scheme
    /// * `options` - structured options the DSN overrides
    ///
    /// # Returns
    ///
    /// * `Ok(Connection)` - ready to use lazily
    /// * `Err(ConfigurationError)` - invalid DSN or options
    pub fn from_dsn(dsn: &str, options: TransportOptions) -> Result<Self, ConfigurationError> {
        let config = Config::from_dsn(dsn, options)?;
        Ok(Self::new(config))
    }

    /// Builds a connection from an already validated configuration, using
    /// the default lapin-backed factory.
    pub fn new(config: Config) -> Self {
        Self::with_factory(config, Box::new(LapinConnectionFactory))
    }

    /// Builds a connection over an explicit factory. This is the seam the
    /// tests use; production code goes through [`Connection::from_dsn`].
    pub fn with_factory(config: Config, factory: Box<dyn ConnectionFactory>) -> Self {
        Self {
            config,
            factory,
            client: None,
            channel: None,
            subscriptions: Subscriptions::new(),
            buffer: DeliveryBuffer::new(),
        }
    }

    /// The validated configuration this connection runs on.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Configured queue names, in declaration order.
    pub fn queue_names(&self) -> Vec<&str> {
        self.config.queue_names()
    }

    /// Declares the whole topology, connecting first if necessary. The
    /// declarations are broker-side idempotent; with auto-setup enabled
    /// the same pass also runs before every publish, get and message
    /// count, so externally deleted topology is repaired on the next
    /// operation.
    pub async fn setup(&mut self) -> Result<(), TransportError> {
        self.ensure_channel().await?;
        topology::setup(self.channel()?, &self.config).await
    }

    /// Publishes a message body.
    ///
    /// Attribute precedence follows the usual layering: stamp attributes
    /// first, explicit headers override them, and the forced
    /// delivery-mode/timestamp defaults fill in only when absent. With a
    /// non-zero delay the message detours through a freshly materialized
    /// delay queue instead of the main exchange.
    ///
    /// # Parameters
    ///
    /// * `body` - opaque payload bytes
    /// * `headers` - string headers travelling with the message
    /// * `delay_ms` - delivery delay in milliseconds, zero for immediate
    /// * `stamp` - optional routing key, attributes and retry marker
    pub async fn publish(
        &mut self,
        body: &[u8],
        headers: &BTreeMap<String, String>,
        delay_ms: u64,
        stamp: Option<&AmqpStamp>,
    ) -> Result<(), TransportError> {
        self.ensure_setup().await?;

        let routing_key = stamp
            .and_then(AmqpStamp::routing_key)
            .filter(|routing_key| !routing_key.is_empty())
            .or(self.config.exchange.default_publish_routing_key.as_deref());
        let attributes = publish_attributes(headers, stamp);
        let channel = self.channel()?;

        if delay_ms > 0 {
            let is_retry = stamp.is_some_and(AmqpStamp::is_retry_attempt);
            let queue_name =
                delay::ensure_delay_queue(channel, &self.config, delay_ms, routing_key, is_retry)
                    .await?;
            debug!(
                "publishing delayed message to queue: {} ({}ms)",
                queue_name, delay_ms
            );
            return channel
                .publish(&self.config.delay.exchange.name, &queue_name, body, &attributes)
                .await;
        }

        debug!(
            "publishing message to exchange: {}",
            self.config.exchange.name
        );
        channel
            .publish(
                &self.config.exchange.name,
                routing_key.unwrap_or(""),
                body,
                &attributes,
            )
            .await
    }

    /// Shorthand for [`Connection::get_from_queues`] over every configured
    /// queue.
    pub async fn get(&mut self) -> Result<Vec<ReceivedMessage>, TransportError> {
        let queue_names: Vec<String> = self.config.queues.keys().cloned().collect();
        let queue_names: Vec<&str> = queue_names.iter().map(String::as_str).collect();
        self.get_from_queues(&queue_names).await
    }

    /// Pulls messages from the given queues.
    ///
    /// Consumers are reconciled with `queue_names` first: queues without a
    /// consumer get one, consumers for queues no longer listed are
    /// cancelled, and those deltas accumulate across calls. The call then
    /// waits out one run-timeout window and returns everything buffered,
    /// oldest first. An empty batch means nothing arrived in time.
    pub async fn get_from_queues(
        &mut self,
        queue_names: &[&str],
    ) -> Result<Vec<ReceivedMessage>, TransportError> {
        self.ensure_setup().await?;

        let channel = self.channel.as_deref().ok_or(TransportError::NotConnected)?;
        self.subscriptions
            .reconcile(channel, queue_names, &self.buffer)
            .await?;

        Ok(self.buffer.drain(self.config.run_timeout).await)
    }

    /// Acknowledges a received message on the channel it arrived on.
    pub async fn ack(&self, received: &ReceivedMessage) -> Result<(), TransportError> {
        self.channel()?.ack(received.message.delivery_tag).await
    }

    /// Rejects a received message without requeueing it.
    pub async fn nack(&self, received: &ReceivedMessage) -> Result<(), TransportError> {
        self.channel()?.nack(received.message.delivery_tag).await
    }

    /// Sums the ready-message counts of all configured queues.
    pub async fn message_count(&mut self) -> Result<u64, TransportError> {
        self.ensure_setup().await?;
        topology::count_messages(self.channel()?, &self.config).await
    }

    fn channel(&self) -> Result<&dyn AmqpChannel, TransportError> {
        self.channel.as_deref().ok_or(TransportError::NotConnected)
    }

    async fn ensure_channel(&mut self) -> Result<(), TransportError> {
        if self.channel.is_some() {
            return Ok(());
        }
        if self.client.is_none() {
            let client = self.factory.connect(&self.config.client).await?;
            self.client = Some(client);
        }
        let client = self.client.as_deref().ok_or(TransportError::NotConnected)?;
        let channel = client.open_channel().await?;
        channel.set_qos(self.config.prefetch_count).await?;
        self.channel = Some(channel);
        Ok(())
    }

    async fn ensure_setup(&mut self) -> Result<(), TransportError> {
        self.ensure_channel().await?;
        if self.config.auto_setup {
            topology::setup(self.channel()?, &self.config).await?;
        }
        Ok(())
    }
}

/// Builds the flat attribute map for one publish: stamp attributes first,
/// explicit headers on top, then the forced defaults where nothing else
/// set them. Persistent delivery and a send timestamp are broker hygiene
/// the caller should not have to ask for.
fn publish_attributes(headers: &BTreeMap<String, String>, stamp: Option<&AmqpStamp>) -> Attributes {
    let mut attributes = stamp
        .map(|stamp| stamp.attributes().clone())
        .unwrap_or_default();
    for (key, value) in headers {
        attributes.insert(
            key.as_str().into(),
            AMQPValue::LongString(value.as_str().into()),
        );
    }
    attributes
        .entry(ATTRIBUTE_DELIVERY_MODE.into())
        .or_insert(AMQPValue::ShortShortUInt(2));
    attributes.entry(ATTRIBUTE_TIMESTAMP.into()).or_insert_with(|| {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default();
        AMQPValue::Timestamp(now)
    });
    attributes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{
        MockAmqpChannel, MockAmqpClient, MockConnectionFactory, QueueInfo,
    };
    use crate::message::RawMessage;
    use mockall::predicate::{always, eq};

    fn config_from(dsn: &str) -> Config {
        Config::from_dsn(dsn, TransportOptions::new()).unwrap()
    }

    /// Wires a prepared channel mock behind single-use client and factory
    /// mocks, verifying that connect and open_channel happen exactly once.
    /// The prefetch call made on every fresh channel is accepted here
    /// unless the test pinned its own expectation first.
    fn factory_for(mut channel: MockAmqpChannel) -> Box<dyn ConnectionFactory> {
        channel.expect_set_qos().returning(|_| Ok(()));
        let mut client = MockAmqpClient::new();
        client
            .expect_open_channel()
            .times(1)
            .return_once(move || Ok(Box::new(channel)));
        let mut factory = MockConnectionFactory::new();
        factory
            .expect_connect()
            .times(1)
            .return_once(move |_| Ok(Box::new(client)));
        Box::new(factory)
    }

    /// Expects `rounds` full topology passes for the default single-queue
    /// configuration. Every operation with auto-setup enabled and every
    /// explicit `setup` call is one round.
    fn expect_default_setup(channel: &mut MockAmqpChannel, rounds: usize) {
        channel
            .expect_declare_exchange()
            .times(rounds * 2)
            .returning(|_, _, _, _| Ok(()));
        channel
            .expect_declare_queue()
            .times(rounds)
            .returning(|_, _, _| Ok(QueueInfo::default()));
        channel
            .expect_bind_queue()
            .times(rounds)
            .returning(|_, _, _, _| Ok(()));
    }

    #[tokio::test]
    async fn construction_never_touches_the_broker() {
        let factory = MockConnectionFactory::new();
        let connection = Connection::with_factory(config_from("amqp://"), Box::new(factory));
        assert_eq!(connection.config().exchange_name(), "messenger");
    }

    #[tokio::test(start_paused = true)]
    async fn get_connects_and_applies_qos_once_but_sets_up_per_call() {
        let mut channel = MockAmqpChannel::new();
        expect_default_setup(&mut channel, 2);
        channel.expect_set_qos().with(eq(30)).times(1).returning(|_| Ok(()));
        channel
            .expect_consume()
            .times(1)
            .returning(|queue, _| Ok(format!("messenger-{queue}")));

        let mut connection = Connection::with_factory(
            config_from("amqp://localhost?prefetch_count=30"),
            factory_for(channel),
        );

        // The second call reuses connection, channel and consumer; only
        // the idempotent declarations run again.
        assert!(connection.get().await.unwrap().is_empty());
        assert!(connection.get().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn get_drains_the_buffer_in_arrival_order_exactly_once() {
        let mut channel = MockAmqpChannel::new();
        expect_default_setup(&mut channel, 2);
        channel.expect_consume().times(1).returning(|queue, sink| {
            for tag in 1..=3u64 {
                sink.deliver(RawMessage::new(tag, "messenger", "", vec![]));
            }
            Ok(format!("messenger-{queue}"))
        });

        let mut connection =
            Connection::with_factory(config_from("amqp://"), factory_for(channel));

        let batch = connection.get().await.unwrap();
        let tags: Vec<u64> = batch
            .iter()
            .map(|received| received.message.delivery_tag)
            .collect();
        assert_eq!(tags, vec![1, 2, 3]);
        assert!(batch.iter().all(|received| received.queue_name == "messenger"));
        assert!(connection.get().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_auto_setup_skips_topology_declarations() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_consume()
            .times(1)
            .returning(|queue, _| Ok(format!("messenger-{queue}")));

        let mut connection = Connection::with_factory(
            config_from("amqp://localhost?auto_setup=false"),
            factory_for(channel),
        );

        assert!(connection.get().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sequential_gets_reconcile_the_consumer_set_as_cumulative_deltas() {
        let mut channel = MockAmqpChannel::new();
        let mut sequence = mockall::Sequence::new();
        for queue in ["queue_0", "queue_1", "queue_2"] {
            channel
                .expect_consume()
                .with(eq(queue), always())
                .times(1)
                .in_sequence(&mut sequence)
                .returning(|queue, _| Ok(format!("messenger-{queue}")));
        }
        channel
            .expect_cancel()
            .with(eq("messenger-queue_1"))
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_| Ok(()));

        let mut connection = Connection::with_factory(
            config_from("amqp://localhost?auto_setup=false"),
            factory_for(channel),
        );

        let first = connection
            .get_from_queues(&["queue_0", "queue_1"])
            .await
            .unwrap();
        assert!(first.is_empty());
        // Only the delta is applied: consume queue_2 and cancel queue_1.
        let second = connection
            .get_from_queues(&["queue_0", "queue_2"])
            .await
            .unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn explicit_setup_declares_topology_even_when_auto_setup_is_off() {
        let mut channel = MockAmqpChannel::new();
        expect_default_setup(&mut channel, 1);

        let mut connection = Connection::with_factory(
            config_from("amqp://localhost?auto_setup=false"),
            factory_for(channel),
        );

        connection.setup().await.unwrap();
    }

    #[tokio::test]
    async fn repeated_setup_reissues_the_idempotent_declarations() {
        let mut channel = MockAmqpChannel::new();
        expect_default_setup(&mut channel, 2);

        let mut connection =
            Connection::with_factory(config_from("amqp://"), factory_for(channel));

        connection.setup().await.unwrap();
        connection.setup().await.unwrap();
    }

    #[tokio::test]
    async fn auto_setup_reinstalls_the_topology_before_each_publish() {
        let mut channel = MockAmqpChannel::new();
        expect_default_setup(&mut channel, 2);
        channel.expect_publish().times(2).returning(|_, _, _, _| Ok(()));

        let mut connection =
            Connection::with_factory(config_from("amqp://"), factory_for(channel));

        connection.publish(b"{}", &BTreeMap::new(), 0, None).await.unwrap();
        connection.publish(b"{}", &BTreeMap::new(), 0, None).await.unwrap();
    }

    #[tokio::test]
    async fn publish_fills_delivery_mode_and_timestamp_only_when_absent() {
        let mut channel = MockAmqpChannel::new();
        expect_default_setup(&mut channel, 1);
        channel
            .expect_publish()
            .withf(|exchange, routing_key, body, attributes| {
                exchange == "messenger"
                    && routing_key.is_empty()
                    && body == b"payload"
                    && attributes.get(ATTRIBUTE_DELIVERY_MODE)
                        == Some(&AMQPValue::ShortShortUInt(2))
                    && matches!(attributes.get(ATTRIBUTE_TIMESTAMP), Some(AMQPValue::Timestamp(_)))
                    && attributes.get("X-Token") == Some(&AMQPValue::LongString("secret".into()))
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let mut connection =
            Connection::with_factory(config_from("amqp://"), factory_for(channel));

        let headers = BTreeMap::from([("X-Token".to_string(), "secret".to_string())]);
        connection.publish(b"payload", &headers, 0, None).await.unwrap();
    }

    #[tokio::test]
    async fn headers_override_stamp_attributes_and_defaults_fill_the_gaps() {
        let mut channel = MockAmqpChannel::new();
        expect_default_setup(&mut channel, 1);
        channel
            .expect_publish()
            .withf(|_, routing_key, _, attributes| {
                routing_key == "high"
                    && attributes.get(ATTRIBUTE_DELIVERY_MODE)
                        == Some(&AMQPValue::ShortShortUInt(1))
                    && attributes.get("app-id") == Some(&AMQPValue::LongString("gateway".into()))
                    && attributes.get("X-Token") == Some(&AMQPValue::LongString("fresh".into()))
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let mut connection =
            Connection::with_factory(config_from("amqp://"), factory_for(channel));

        // The stamp's stale X-Token must lose to the header; its untouched
        // delivery-mode survives the forced default.
        let stamp = AmqpStamp::new()
            .with_routing_key("high")
            .with_attribute(ATTRIBUTE_DELIVERY_MODE, AMQPValue::ShortShortUInt(1))
            .with_attribute("app-id", AMQPValue::LongString("gateway".into()))
            .with_attribute("X-Token", AMQPValue::LongString("stale".into()));
        let headers = BTreeMap::from([("X-Token".to_string(), "fresh".to_string())]);
        connection
            .publish(b"{}", &headers, 0, Some(&stamp))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn publish_falls_back_to_the_default_publish_routing_key() {
        let mut channel = MockAmqpChannel::new();
        expect_default_setup(&mut channel, 2);
        channel
            .expect_publish()
            .withf(|_, routing_key, _, _| routing_key == "normal")
            .times(2)
            .returning(|_, _, _, _| Ok(()));

        let mut connection = Connection::with_factory(
            config_from("amqp://localhost?exchange[default_publish_routing_key]=normal"),
            factory_for(channel),
        );

        connection
            .publish(b"{}", &BTreeMap::new(), 0, None)
            .await
            .unwrap();
        // An empty stamped routing key does not shadow the default.
        let stamp = AmqpStamp::new().with_routing_key("");
        connection
            .publish(b"{}", &BTreeMap::new(), 0, Some(&stamp))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn delayed_publish_detours_through_the_delay_exchange() {
        let mut channel = MockAmqpChannel::new();
        expect_default_setup(&mut channel, 1);
        channel
            .expect_declare_queue()
            .with(eq("delay_messenger__5000_delay"), always(), always())
            .times(1)
            .returning(|_, _, _| Ok(QueueInfo::default()));
        channel
            .expect_bind_queue()
            .with(
                eq("delay_messenger__5000_delay"),
                eq("delays"),
                eq("delay_messenger__5000_delay"),
                eq(Attributes::new()),
            )
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        channel
            .expect_publish()
            .withf(|exchange, routing_key, _, _| {
                exchange == "delays" && routing_key == "delay_messenger__5000_delay"
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let mut connection =
            Connection::with_factory(config_from("amqp://"), factory_for(channel));

        connection
            .publish(b"{}", &BTreeMap::new(), 5000, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn retry_publish_uses_the_retry_queue_for_its_source_queue() {
        let mut channel = MockAmqpChannel::new();
        expect_default_setup(&mut channel, 1);
        channel
            .expect_declare_queue()
            .withf(|name, _, arguments| {
                name == "delay_messenger_queue_0_5000_retry"
                    && arguments.get("x-dead-letter-exchange")
                        == Some(&AMQPValue::LongString("".into()))
                    && arguments.get("x-dead-letter-routing-key")
                        == Some(&AMQPValue::LongString("queue_0".into()))
            })
            .times(1)
            .returning(|_, _, _| Ok(QueueInfo::default()));
        channel
            .expect_bind_queue()
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        channel
            .expect_publish()
            .withf(|exchange, routing_key, _, _| {
                exchange == "delays" && routing_key == "delay_messenger_queue_0_5000_retry"
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let mut connection =
            Connection::with_factory(config_from("amqp://"), factory_for(channel));

        let received = RawMessage::new(9, "messenger", "", b"{}".to_vec());
        let stamp = AmqpStamp::from_received(&received, None, Some("queue_0"));
        connection
            .publish(b"{}", &BTreeMap::new(), 5000, Some(&stamp))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn ack_and_nack_target_the_delivery_tag() {
        let mut channel = MockAmqpChannel::new();
        expect_default_setup(&mut channel, 1);
        channel.expect_ack().with(eq(42u64)).times(1).returning(|_| Ok(()));
        channel.expect_nack().with(eq(43u64)).times(1).returning(|_| Ok(()));

        let mut connection =
            Connection::with_factory(config_from("amqp://"), factory_for(channel));
        connection.setup().await.unwrap();

        let first = ReceivedMessage::new(RawMessage::new(42, "messenger", "", vec![]), "messenger");
        let second =
            ReceivedMessage::new(RawMessage::new(43, "messenger", "", vec![]), "messenger");
        connection.ack(&first).await.unwrap();
        connection.nack(&second).await.unwrap();
    }

    #[tokio::test]
    async fn ack_without_a_channel_is_a_local_error() {
        let connection =
            Connection::with_factory(config_from("amqp://"), Box::new(MockConnectionFactory::new()));

        let received = ReceivedMessage::new(RawMessage::new(1, "messenger", "", vec![]), "messenger");
        let err = connection.ack(&received).await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }

    #[tokio::test]
    async fn message_count_sums_the_configured_queues() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_declare_exchange()
            .times(2)
            .returning(|_, _, _, _| Ok(()));
        channel
            .expect_declare_queue()
            .withf(|_, flags, _| !flags.passive)
            .times(2)
            .returning(|_, _, _| Ok(QueueInfo::default()));
        channel
            .expect_bind_queue()
            .times(2)
            .returning(|_, _, _, _| Ok(()));
        channel
            .expect_declare_queue()
            .withf(|name, flags, _| name == "q1" && flags.passive)
            .times(1)
            .returning(|_, _, _| Ok(QueueInfo { message_count: 10 }));
        channel
            .expect_declare_queue()
            .withf(|name, flags, _| name == "q2" && flags.passive)
            .times(1)
            .returning(|_, _, _| Ok(QueueInfo { message_count: 25 }));

        let mut connection = Connection::with_factory(
            config_from("amqp://localhost?queues[q1]&queues[q2]"),
            factory_for(channel),
        );

        assert_eq!(connection.message_count().await.unwrap(), 35);
    }
}
