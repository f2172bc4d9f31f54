// Copyright (c) 2025, The AMQP Messenger Authors
// MIT License
// All rights reserved.

//! # Serialization
//!
//! The boundary between application messages and wire payloads. A
//! [`Serializer`] turns a message into an opaque body plus string headers
//! and back; the transport never inspects the body. [`JsonSerializer`]
//! covers the common case of one serde-modelled message type per queue.

use std::collections::BTreeMap;
use std::marker::PhantomData;

use crate::errors::{DecodingError, Error};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Header carrying the payload's MIME type.
pub const HEADER_CONTENT_TYPE: &str = "Content-Type";
/// Header carrying the application-level message type.
pub const HEADER_TYPE: &str = "type";

/// A message encoded for the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    /// Opaque payload bytes.
    pub body: Vec<u8>,
    /// String headers published alongside the body and handed back to
    /// [`Serializer::decode`] on the receive side.
    pub headers: BTreeMap<String, String>,
}

/// Encodes and decodes application messages.
pub trait Serializer: Send + Sync {
    /// The application message type this serializer handles.
    type Message;

    /// Encodes a message into a body and headers.
    fn encode(&self, message: &Self::Message) -> Result<Encoded, Error>;

    /// Decodes a received body using the application-relevant headers.
    fn decode(
        &self,
        body: &[u8],
        headers: &BTreeMap<String, String>,
    ) -> Result<Self::Message, DecodingError>;
}

/// JSON serializer for a single serde-modelled message type.
#[derive(Debug)]
pub struct JsonSerializer<M> {
    marker: PhantomData<fn() -> M>,
}

impl<M> JsonSerializer<M> {
    /// Creates the serializer.
    pub fn new() -> Self {
        Self {
            marker: PhantomData,
        }
    }
}

impl<M> Default for JsonSerializer<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> Serializer for JsonSerializer<M>
where
    M: Serialize + DeserializeOwned + Send + Sync,
{
    type Message = M;

    fn encode(&self, message: &M) -> Result<Encoded, Error> {
        let body = match serde_json::to_vec(message) {
            Ok(body) => body,
            Err(err) => return Err(Error::Encoding(err.to_string())),
        };
        let mut headers = BTreeMap::new();
        headers.insert(
            HEADER_CONTENT_TYPE.to_string(),
            "application/json".to_string(),
        );
        headers.insert(
            HEADER_TYPE.to_string(),
            std::any::type_name::<M>().to_string(),
        );
        Ok(Encoded { body, headers })
    }

    fn decode(
        &self,
        body: &[u8],
        _headers: &BTreeMap<String, String>,
    ) -> Result<M, DecodingError> {
        serde_json::from_slice(body)
            .map_err(|err| DecodingError::with_source("invalid JSON payload", Box::new(err)))
    }
}
