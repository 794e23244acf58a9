// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Values
//!
//! This module defines the two message values that cross the runtime:
//! `InboundMessage`, an immutable snapshot of one broker delivery handed to a
//! handler, and `OutboundMessage`, a builder-style value produced by handlers
//! and published when the enclosing transaction commits.

use crate::errors::AmqpError;
use lapin::protocol::basic::AMQPProperties;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use tracing::error;

/// Content type attached to JSON payloads
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// An immutable message delivered by the broker.
///
/// Constructed by the reader once the routing key resolved to a registration;
/// ownership of the acknowledgment handle travels separately with the task so
/// the message itself stays a plain value.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    queue: String,
    exchange: String,
    routing_key: String,
    delivery_tag: u64,
    redelivered: bool,
    properties: AMQPProperties,
    body: Vec<u8>,
}

impl InboundMessage {
    pub(crate) fn new(
        queue: &str,
        exchange: String,
        routing_key: String,
        delivery_tag: u64,
        redelivered: bool,
        properties: AMQPProperties,
        body: Vec<u8>,
    ) -> Self {
        InboundMessage {
            queue: queue.to_owned(),
            exchange,
            routing_key,
            delivery_tag,
            redelivered,
            properties,
            body,
        }
    }

    /// The queue this message was consumed from.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// The exchange that routed this message.
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// The routing key the broker matched.
    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Broker-assigned handle identifying this specific delivery.
    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Whether the broker already delivered this message before.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// Raw AMQP properties of the delivery.
    pub fn properties(&self) -> &AMQPProperties {
        &self.properties
    }

    /// Raw payload bytes.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The message id property, when the publisher set one.
    pub fn message_id(&self) -> Option<String> {
        self.properties.message_id().as_ref().map(|id| id.to_string())
    }

    /// The `type` property, when the publisher set one.
    pub fn kind(&self) -> Option<String> {
        self.properties.kind().as_ref().map(|kind| kind.to_string())
    }

    /// The publish timestamp property, seconds since the epoch.
    pub fn timestamp(&self) -> Option<u64> {
        *self.properties.timestamp()
    }

    /// The payload as UTF-8 text, when it is valid UTF-8.
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    /// Deserializes the payload as JSON.
    pub fn decode<T>(&self) -> Result<T, AmqpError>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(&self.body).map_err(|err| {
            error!(error = err.to_string(), "failure to parse message payload");
            AmqpError::ParsePayloadError
        })
    }
}

/// A message produced by a handler, published at commit time.
///
/// The exchange defaults to the publisher's configured exchange; handlers only
/// override it for messages that must leave through another exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    routing_key: String,
    body: Vec<u8>,
    exchange: Option<String>,
    kind: Option<String>,
    content_type: Option<String>,
    headers: BTreeMap<String, String>,
}

impl OutboundMessage {
    /// Creates a new outbound message with the given routing key and payload.
    pub fn new(routing_key: &str, body: impl Into<Vec<u8>>) -> Self {
        OutboundMessage {
            routing_key: routing_key.to_owned(),
            body: body.into(),
            exchange: None,
            kind: None,
            content_type: None,
            headers: BTreeMap::default(),
        }
    }

    /// Creates an outbound message with a JSON-serialized payload.
    pub fn json<T>(routing_key: &str, payload: &T) -> Result<Self, AmqpError>
    where
        T: Serialize,
    {
        let body = serde_json::to_vec(payload).map_err(|err| {
            error!(error = err.to_string(), "failure to serialize payload");
            AmqpError::ParsePayloadError
        })?;

        Ok(Self::new(routing_key, body).content_type(JSON_CONTENT_TYPE))
    }

    /// Overrides the exchange this message is published to.
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange = Some(exchange.to_owned());
        self
    }

    /// Sets the AMQP `type` property.
    pub fn kind(mut self, kind: &str) -> Self {
        self.kind = Some(kind.to_owned());
        self
    }

    /// Sets the content type property.
    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_owned());
        self
    }

    /// Adds one string header.
    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_owned(), value.to_owned());
        self
    }

    pub fn routing_key_ref(&self) -> &str {
        &self.routing_key
    }

    pub fn body_ref(&self) -> &[u8] {
        &self.body
    }

    pub(crate) fn exchange_override(&self) -> Option<&str> {
        self.exchange.as_deref()
    }

    pub(crate) fn kind_ref(&self) -> Option<&str> {
        self.kind.as_deref()
    }

    pub(crate) fn content_type_ref(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub(crate) fn headers_ref(&self) -> &BTreeMap<String, String> {
        &self.headers
    }
}
