// Copyright (c) 2025, The AMQP Messenger Authors
// MIT License
// All rights reserved.

//! # Broker Channel
//!
//! This module is the seam between the transport and the AMQP client
//! library. The [`ConnectionFactory`], [`AmqpClient`] and [`AmqpChannel`]
//! traits carry exactly the operations the transport needs, so everything
//! above them can be exercised against mocks; the lapin-backed
//! implementations at the bottom are the only code that talks to a real
//! broker.
//!
//! Consumers are registered with client-generated tags and feed deliveries
//! into a [`DeliverySink`] from the client library's delivery callback, so
//! buffering and consumption order stay under the transport's control.

use std::collections::HashMap;

use crate::config::{ClientConfig, ExchangeKind, TlsConfig};
use crate::errors::TransportError;
use crate::message::{
    attributes_from_properties, properties_from_attributes, Attributes, RawMessage,
};
use crate::subscription::DeliverySink;
use async_trait::async_trait;
use lapin::message::DeliveryResult;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::tcp::{OwnedIdentity, OwnedTLSConfig};
use lapin::types::FieldTable;
use lapin::ConnectionProperties;
use tokio::sync::Mutex;
use tracing::{debug, error};
use uuid::Uuid;

/// Flags applied when declaring an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExchangeFlags {
    pub passive: bool,
    pub durable: bool,
    pub auto_delete: bool,
}

/// Flags applied when declaring a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueFlags {
    pub passive: bool,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

/// Broker-reported state of a declared queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueInfo {
    /// Number of messages ready in the queue at declaration time.
    pub message_count: u32,
}

/// Opens client connections from a validated endpoint configuration.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Establishes a broker connection.
    async fn connect(&self, config: &ClientConfig) -> Result<Box<dyn AmqpClient>, TransportError>;
}

/// An established broker connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpClient: Send + Sync {
    /// Opens a channel on this connection.
    async fn open_channel(&self) -> Result<Box<dyn AmqpChannel>, TransportError>;
}

/// One broker channel, carrying every operation the transport performs.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    /// Declares an exchange.
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        flags: ExchangeFlags,
        arguments: &Attributes,
    ) -> Result<(), TransportError>;

    /// Declares a queue and reports its broker-side state.
    async fn declare_queue(
        &self,
        name: &str,
        flags: QueueFlags,
        arguments: &Attributes,
    ) -> Result<QueueInfo, TransportError>;

    /// Binds a queue to an exchange under a routing key.
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: &Attributes,
    ) -> Result<(), TransportError>;

    /// Publishes a message body with the given attributes.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        attributes: &Attributes,
    ) -> Result<(), TransportError>;

    /// Applies a per-consumer prefetch limit to the channel.
    async fn set_qos(&self, prefetch_count: u16) -> Result<(), TransportError>;

    /// Starts consuming `queue` into `sink` and returns the consumer tag.
    async fn consume(&self, queue: &str, sink: DeliverySink) -> Result<String, TransportError>;

    /// Cancels the consumer registered under `tag`.
    async fn cancel(&self, tag: &str) -> Result<(), TransportError>;

    /// Acknowledges a delivery.
    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError>;

    /// Rejects a delivery without requeueing it.
    async fn nack(&self, delivery_tag: u64) -> Result<(), TransportError>;
}

/// Default factory producing lapin-backed connections.
#[derive(Debug, Default)]
pub struct LapinConnectionFactory;

#[async_trait]
impl ConnectionFactory for LapinConnectionFactory {
    async fn connect(&self, config: &ClientConfig) -> Result<Box<dyn AmqpClient>, TransportError> {
        debug!(
            host = %config.host,
            port = config.port,
            vhost = %config.vhost,
            "creating amqp connection..."
        );
        let uri = config.amqp_uri();
        let properties = ConnectionProperties::default()
            .with_connection_name(format!("amqp-messenger-{}", Uuid::new_v4()).into());

        let connection = match &config.tls {
            Some(tls) => {
                let tls_config = owned_tls_config(tls)?;
                lapin::Connection::connect_with_config(&uri, properties, tls_config).await
            }
            None => lapin::Connection::connect(&uri, properties).await,
        };

        match connection {
            Ok(connection) => {
                debug!("amqp connected");
                Ok(Box::new(LapinClient { connection }))
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(TransportError::Connect(Box::new(err)))
            }
        }
    }
}

/// Builds the TLS config from file paths. The CA bundle travels as PEM
/// text, the client identity as PKCS#12 bytes with its passphrase.
fn owned_tls_config(tls: &TlsConfig) -> Result<OwnedTLSConfig, TransportError> {
    let cert_chain = match &tls.cafile {
        Some(path) => match std::fs::read_to_string(path) {
            Ok(pem) => Some(pem),
            Err(err) => {
                error!(error = err.to_string(), path = %path, "failure to read CA bundle");
                return Err(TransportError::Connect(Box::new(err)));
            }
        },
        None => None,
    };
    let identity = match &tls.local_cert {
        Some(path) => match std::fs::read(path) {
            Ok(der) => Some(OwnedIdentity {
                der,
                password: tls.passphrase.clone().unwrap_or_default(),
            }),
            Err(err) => {
                error!(
                    error = err.to_string(),
                    path = %path,
                    "failure to read client certificate"
                );
                return Err(TransportError::Connect(Box::new(err)));
            }
        },
        None => None,
    };
    Ok(OwnedTLSConfig {
        identity,
        cert_chain,
    })
}

struct LapinClient {
    connection: lapin::Connection,
}

#[async_trait]
impl AmqpClient for LapinClient {
    async fn open_channel(&self) -> Result<Box<dyn AmqpChannel>, TransportError> {
        debug!("creating amqp channel...");
        match self.connection.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(Box::new(LapinChannel {
                    channel,
                    consumers: Mutex::new(HashMap::new()),
                }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(TransportError::OpenChannel(Box::new(err)))
            }
        }
    }
}

struct LapinChannel {
    channel: lapin::Channel,
    /// Live consumers by tag; dropping one stops its delegate task.
    consumers: Mutex<HashMap<String, lapin::Consumer>>,
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        flags: ExchangeFlags,
        arguments: &Attributes,
    ) -> Result<(), TransportError> {
        debug!(exchange = name, kind = kind.as_str(), "declaring exchange");
        match self
            .channel
            .exchange_declare(
                name,
                lapin_exchange_kind(kind),
                ExchangeDeclareOptions {
                    passive: flags.passive,
                    durable: flags.durable,
                    auto_delete: flags.auto_delete,
                    internal: false,
                    nowait: false,
                },
                FieldTable::from(arguments.clone()),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    exchange = name,
                    "failure to declare exchange"
                );
                Err(TransportError::DeclareExchange {
                    name: name.to_string(),
                    source: Box::new(err),
                })
            }
            _ => Ok(()),
        }
    }

    async fn declare_queue(
        &self,
        name: &str,
        flags: QueueFlags,
        arguments: &Attributes,
    ) -> Result<QueueInfo, TransportError> {
        debug!(queue = name, "declaring queue");
        match self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: flags.passive,
                    durable: flags.durable,
                    exclusive: flags.exclusive,
                    auto_delete: flags.auto_delete,
                    nowait: false,
                },
                FieldTable::from(arguments.clone()),
            )
            .await
        {
            Ok(queue) => Ok(QueueInfo {
                message_count: queue.message_count(),
            }),
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue = name,
                    "failure to declare queue"
                );
                Err(TransportError::DeclareQueue {
                    name: name.to_string(),
                    source: Box::new(err),
                })
            }
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: &Attributes,
    ) -> Result<(), TransportError> {
        debug!(queue, exchange, routing_key, "binding queue");
        match self
            .channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::from(arguments.clone()),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue, exchange, "failure to bind queue"
                );
                Err(TransportError::BindQueue {
                    queue: queue.to_string(),
                    exchange: exchange.to_string(),
                    source: Box::new(err),
                })
            }
            _ => Ok(()),
        }
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        attributes: &Attributes,
    ) -> Result<(), TransportError> {
        let properties = properties_from_attributes(attributes);
        match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                properties,
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    exchange, routing_key, "failure to publish message"
                );
                Err(TransportError::Publish {
                    exchange: exchange.to_string(),
                    source: Box::new(err),
                })
            }
            _ => Ok(()),
        }
    }

    async fn set_qos(&self, prefetch_count: u16) -> Result<(), TransportError> {
        match self
            .channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "failure to configure qos");
                Err(TransportError::Qos(Box::new(err)))
            }
            _ => Ok(()),
        }
    }

    async fn consume(&self, queue: &str, sink: DeliverySink) -> Result<String, TransportError> {
        let tag = format!("messenger-{}", Uuid::new_v4());
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
        {
            Ok(consumer) => consumer,
            Err(err) => {
                error!(error = err.to_string(), queue, "failure to start consumer");
                return Err(TransportError::Consume {
                    queue: queue.to_string(),
                    source: Box::new(err),
                });
            }
        };

        consumer.set_delegate(move |delivery: DeliveryResult| {
            let sink = sink.clone();
            async move {
                match delivery {
                    Ok(Some(delivery)) => {
                        sink.deliver(RawMessage {
                            delivery_tag: delivery.delivery_tag,
                            exchange: delivery.exchange.to_string(),
                            routing_key: delivery.routing_key.to_string(),
                            redelivered: delivery.redelivered,
                            attributes: attributes_from_properties(&delivery.properties),
                            body: delivery.data,
                        });
                    }
                    // The consumer was cancelled; nothing left to forward.
                    Ok(None) => {}
                    Err(err) => {
                        error!(error = err.to_string(), "delivery stream failed");
                    }
                }
            }
        });

        debug!(queue, tag = %tag, "consumer registered");
        self.consumers.lock().await.insert(tag.clone(), consumer);
        Ok(tag)
    }

    async fn cancel(&self, tag: &str) -> Result<(), TransportError> {
        match self
            .channel
            .basic_cancel(tag, BasicCancelOptions::default())
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), tag, "failure to cancel consumer");
                Err(TransportError::Cancel {
                    tag: tag.to_string(),
                    source: Box::new(err),
                })
            }
            _ => {
                debug!(tag, "consumer cancelled");
                self.consumers.lock().await.remove(tag);
                Ok(())
            }
        }
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        match self
            .channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "failure to ack message");
                Err(TransportError::Ack(Box::new(err)))
            }
            _ => Ok(()),
        }
    }

    async fn nack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        match self
            .channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue: false,
                },
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "failure to nack message");
                Err(TransportError::Nack(Box::new(err)))
            }
            _ => Ok(()),
        }
    }
}

fn lapin_exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
    }
}
