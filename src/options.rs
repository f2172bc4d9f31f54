// Copyright (c) 2025, The AMQP Messenger Authors
// MIT License
// All rights reserved.

//! # Transport Options
//!
//! This module defines the structured-options side of configuration: every
//! field is optional and unvalidated. Options are merged with DSN-derived
//! values (the DSN wins) and then validated in one pass by
//! [`Config::from_dsn`](crate::config::Config::from_dsn).
//!
//! Exchange types are carried as plain strings here on purpose: validation
//! happens when the configuration is built, so a bad type reaches the same
//! error path whether it came from a DSN or from these builders.

use crate::message::Attributes;
use indexmap::IndexMap;
use lapin::types::AMQPValue;

/// Unvalidated transport options, the structured counterpart of the DSN.
#[derive(Debug, Clone, Default)]
pub struct TransportOptions {
    pub(crate) host: Option<String>,
    pub(crate) port: Option<u16>,
    pub(crate) user: Option<String>,
    pub(crate) password: Option<String>,
    pub(crate) vhost: Option<String>,
    pub(crate) heartbeat: Option<f64>,
    pub(crate) connection_timeout: Option<f64>,
    pub(crate) read_write_timeout: Option<f64>,
    pub(crate) tcp_nodelay: Option<bool>,
    pub(crate) tls: Option<TlsOptions>,
    pub(crate) exchange: ExchangeOptions,
    pub(crate) delay: DelayOptions,
    pub(crate) queues: IndexMap<String, QueueOptions>,
    pub(crate) prefetch_count: Option<u16>,
    pub(crate) auto_setup: Option<bool>,
    pub(crate) run_timeout: Option<f64>,
}

impl TransportOptions {
    /// Creates empty options; every unset field falls back to its default
    /// when the configuration is built.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the broker host name.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Sets the broker port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Sets the user name used to authenticate.
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Sets the password used to authenticate.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Sets the virtual host.
    pub fn vhost(mut self, vhost: impl Into<String>) -> Self {
        self.vhost = Some(vhost.into());
        self
    }

    /// Sets the heartbeat interval in seconds.
    pub fn heartbeat(mut self, seconds: f64) -> Self {
        self.heartbeat = Some(seconds);
        self
    }

    /// Sets the connection timeout in seconds.
    pub fn connection_timeout(mut self, seconds: f64) -> Self {
        self.connection_timeout = Some(seconds);
        self
    }

    /// Sets the read/write timeout in seconds.
    pub fn read_write_timeout(mut self, seconds: f64) -> Self {
        self.read_write_timeout = Some(seconds);
        self
    }

    /// Enables or disables TCP_NODELAY on the broker socket.
    pub fn tcp_nodelay(mut self, enabled: bool) -> Self {
        self.tcp_nodelay = Some(enabled);
        self
    }

    /// Sets the TLS options; their presence requires the `amqps` scheme.
    pub fn tls(mut self, tls: TlsOptions) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Sets the main exchange options.
    pub fn exchange(mut self, exchange: ExchangeOptions) -> Self {
        self.exchange = exchange;
        self
    }

    /// Sets the delay exchange and delay queue template options.
    pub fn delay(mut self, delay: DelayOptions) -> Self {
        self.delay = delay;
        self
    }

    /// Adds a queue with its options. Queue order is preserved.
    pub fn queue(mut self, name: impl Into<String>, options: QueueOptions) -> Self {
        self.queues.insert(name.into(), options);
        self
    }

    /// Sets the channel prefetch count.
    pub fn prefetch_count(mut self, count: u16) -> Self {
        self.prefetch_count = Some(count);
        self
    }

    /// Enables or disables automatic topology setup before broker use.
    pub fn auto_setup(mut self, enabled: bool) -> Self {
        self.auto_setup = Some(enabled);
        self
    }

    /// Sets the bounded wait window of `get`, in seconds.
    pub fn run_timeout(mut self, seconds: f64) -> Self {
        self.run_timeout = Some(seconds);
        self
    }
}

/// TLS options. The lapin connector applies the CA bundle and client
/// identity; the remaining fields are carried for DSN compatibility with
/// TLS providers that support them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TlsOptions {
    pub(crate) peer_name: Option<String>,
    pub(crate) verify_peer: Option<bool>,
    pub(crate) verify_peer_name: Option<bool>,
    pub(crate) cafile: Option<String>,
    pub(crate) capath: Option<String>,
    pub(crate) local_cert: Option<String>,
    pub(crate) local_pk: Option<String>,
    pub(crate) passphrase: Option<String>,
    pub(crate) ciphers: Option<String>,
    pub(crate) peer_fingerprint: Vec<String>,
}

impl TlsOptions {
    /// Creates empty TLS options. Passing even an empty set to
    /// [`TransportOptions::tls`] marks the connection as TLS.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the expected peer name.
    pub fn peer_name(mut self, name: impl Into<String>) -> Self {
        self.peer_name = Some(name.into());
        self
    }

    /// Enables or disables peer certificate verification.
    pub fn verify_peer(mut self, verify: bool) -> Self {
        self.verify_peer = Some(verify);
        self
    }

    /// Enables or disables peer name verification.
    pub fn verify_peer_name(mut self, verify: bool) -> Self {
        self.verify_peer_name = Some(verify);
        self
    }

    /// Sets the CA bundle file path.
    pub fn cafile(mut self, path: impl Into<String>) -> Self {
        self.cafile = Some(path.into());
        self
    }

    /// Sets the CA directory path.
    pub fn capath(mut self, path: impl Into<String>) -> Self {
        self.capath = Some(path.into());
        self
    }

    /// Sets the client certificate path (PKCS#12).
    pub fn local_cert(mut self, path: impl Into<String>) -> Self {
        self.local_cert = Some(path.into());
        self
    }

    /// Sets the client private key path.
    pub fn local_pk(mut self, path: impl Into<String>) -> Self {
        self.local_pk = Some(path.into());
        self
    }

    /// Sets the passphrase protecting the client certificate.
    pub fn passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }

    /// Sets the accepted cipher list.
    pub fn ciphers(mut self, ciphers: impl Into<String>) -> Self {
        self.ciphers = Some(ciphers.into());
        self
    }

    /// Adds an accepted peer certificate fingerprint.
    pub fn peer_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.peer_fingerprint.push(fingerprint.into());
        self
    }
}

/// Options for the main exchange.
#[derive(Debug, Clone, Default)]
pub struct ExchangeOptions {
    pub(crate) name: Option<String>,
    pub(crate) kind: Option<String>,
    pub(crate) passive: Option<bool>,
    pub(crate) durable: Option<bool>,
    pub(crate) auto_delete: Option<bool>,
    pub(crate) default_publish_routing_key: Option<String>,
    pub(crate) arguments: Attributes,
}

impl ExchangeOptions {
    /// Creates empty exchange options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the exchange name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the exchange type: "direct", "fanout" or "topic".
    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    /// Sets the passive flag (check existence without creating).
    pub fn passive(mut self, passive: bool) -> Self {
        self.passive = Some(passive);
        self
    }

    /// Sets the durable flag.
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = Some(durable);
        self
    }

    /// Sets the auto-delete flag.
    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = Some(auto_delete);
        self
    }

    /// Sets the routing key used for publishes without an explicit one.
    pub fn default_publish_routing_key(mut self, key: impl Into<String>) -> Self {
        self.default_publish_routing_key = Some(key.into());
        self
    }

    /// Adds a declare argument.
    pub fn argument(mut self, key: &str, value: AMQPValue) -> Self {
        self.arguments.insert(key.into(), value);
        self
    }
}

/// Options for one configured queue.
#[derive(Debug, Clone, Default)]
pub struct QueueOptions {
    pub(crate) passive: Option<bool>,
    pub(crate) durable: Option<bool>,
    pub(crate) exclusive: Option<bool>,
    pub(crate) auto_delete: Option<bool>,
    pub(crate) binding_keys: Option<Vec<String>>,
    pub(crate) binding_arguments: Attributes,
    pub(crate) arguments: Attributes,
}

impl QueueOptions {
    /// Creates empty queue options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the passive flag.
    pub fn passive(mut self, passive: bool) -> Self {
        self.passive = Some(passive);
        self
    }

    /// Sets the durable flag.
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = Some(durable);
        self
    }

    /// Sets the exclusive flag.
    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = Some(exclusive);
        self
    }

    /// Sets the auto-delete flag.
    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = Some(auto_delete);
        self
    }

    /// Adds a binding key. Queues without any use the empty-string key.
    pub fn binding_key(mut self, key: impl Into<String>) -> Self {
        self.binding_keys.get_or_insert_with(Vec::new).push(key.into());
        self
    }

    /// Adds an argument applied to every binding of this queue.
    pub fn binding_argument(mut self, key: &str, value: AMQPValue) -> Self {
        self.binding_arguments.insert(key.into(), value);
        self
    }

    /// Adds a declare argument. Integer-only keys (x-delay, x-expires,
    /// x-max-length, x-max-length-bytes, x-max-priority, x-message-ttl)
    /// are coerced and validated when the configuration is built.
    pub fn argument(mut self, key: &str, value: AMQPValue) -> Self {
        self.arguments.insert(key.into(), value);
        self
    }
}

/// Options for the delay exchange and the delay queue template.
#[derive(Debug, Clone, Default)]
pub struct DelayOptions {
    pub(crate) exchange: DelayExchangeOptions,
    pub(crate) queue_template: DelayQueueOptions,
}

impl DelayOptions {
    /// Creates empty delay options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the delay exchange options.
    pub fn exchange(mut self, exchange: DelayExchangeOptions) -> Self {
        self.exchange = exchange;
        self
    }

    /// Sets the delay queue template options.
    pub fn queue_template(mut self, template: DelayQueueOptions) -> Self {
        self.queue_template = template;
        self
    }

    /// Compatibility alias for the delay exchange name.
    pub fn exchange_name(mut self, name: impl Into<String>) -> Self {
        self.exchange.name = Some(name.into());
        self
    }

    /// Compatibility alias for the delay queue name pattern.
    pub fn queue_name_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.queue_template.name_pattern = Some(pattern.into());
        self
    }
}

/// Options for the delay exchange.
#[derive(Debug, Clone, Default)]
pub struct DelayExchangeOptions {
    pub(crate) name: Option<String>,
    pub(crate) kind: Option<String>,
    pub(crate) passive: Option<bool>,
    pub(crate) durable: Option<bool>,
    pub(crate) auto_delete: Option<bool>,
    pub(crate) arguments: Attributes,
}

impl DelayExchangeOptions {
    /// Creates empty delay exchange options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the delay exchange name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the delay exchange type: "direct", "fanout" or "topic".
    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    /// Sets the passive flag.
    pub fn passive(mut self, passive: bool) -> Self {
        self.passive = Some(passive);
        self
    }

    /// Sets the durable flag.
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = Some(durable);
        self
    }

    /// Sets the auto-delete flag.
    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = Some(auto_delete);
        self
    }

    /// Adds a declare argument.
    pub fn argument(mut self, key: &str, value: AMQPValue) -> Self {
        self.arguments.insert(key.into(), value);
        self
    }
}

/// Options for the per-delay queue template.
#[derive(Debug, Clone, Default)]
pub struct DelayQueueOptions {
    pub(crate) name_pattern: Option<String>,
    pub(crate) passive: Option<bool>,
    pub(crate) durable: Option<bool>,
    pub(crate) exclusive: Option<bool>,
    pub(crate) auto_delete: Option<bool>,
    pub(crate) arguments: Attributes,
}

impl DelayQueueOptions {
    /// Creates empty delay queue template options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the queue name pattern; `%delay%`, `%exchange_name%` and
    /// `%routing_key%` are substituted per publish.
    pub fn name_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.name_pattern = Some(pattern.into());
        self
    }

    /// Sets the passive flag.
    pub fn passive(mut self, passive: bool) -> Self {
        self.passive = Some(passive);
        self
    }

    /// Sets the durable flag.
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = Some(durable);
        self
    }

    /// Sets the exclusive flag.
    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = Some(exclusive);
        self
    }

    /// Sets the auto-delete flag.
    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = Some(auto_delete);
        self
    }

    /// Adds a declare argument merged into every delay queue declaration.
    pub fn argument(mut self, key: &str, value: AMQPValue) -> Self {
        self.arguments.insert(key.into(), value);
        self
    }
}
