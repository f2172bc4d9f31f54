// Copyright (c) 2025, The AMQP Messenger Authors
// MIT License
// All rights reserved.

mod delay;
mod dsn;
mod receiver;
mod sender;
mod topology;

pub mod channel;
pub mod config;
pub mod connection;
pub mod envelope;
pub mod errors;
pub mod message;
pub mod options;
pub mod serializer;
pub mod subscription;
pub mod transport;
