// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! This module provides the deferred publish path the transaction commit runs
//! through. Workers never touch the consume channel: every outbound message
//! leaves via an `AmqpPublisher` bound to its own channel, with trace context
//! propagated in the message headers.

use crate::{errors::AmqpError, message::OutboundMessage, otel::AmqpTracePropagator};
use async_trait::async_trait;
use lapin::{
    options::BasicPublishOptions,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel,
};
use opentelemetry::{global, Context};
use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};
use tracing::error;
use uuid::Uuid;

/// Publish seam of the transaction commit path.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Publish: Send + Sync {
    async fn publish(&self, ctx: &Context, message: &OutboundMessage) -> Result<(), AmqpError>;
}

/// Publisher over a dedicated channel.
///
/// The channel outlives consume-channel rotations, so a worker committing a
/// transaction never races the reader's channel swap.
pub struct AmqpPublisher {
    channel: Arc<Channel>,
    exchange: String,
}

impl AmqpPublisher {
    /// Creates a new publisher bound to the given channel and default
    /// exchange.
    ///
    /// # Returns
    /// An Arc-wrapped publisher for thread-safe sharing across workers
    pub fn new(channel: Arc<Channel>, exchange: &str) -> Arc<AmqpPublisher> {
        Arc::new(AmqpPublisher {
            channel,
            exchange: exchange.to_owned(),
        })
    }
}

#[async_trait]
impl Publish for AmqpPublisher {
    /// Publishes one message to its exchange with the given routing key.
    ///
    /// The trace context is injected into the message headers, alongside the
    /// message's own string headers. Each message gets a generated message id
    /// and the publish timestamp.
    async fn publish(&self, ctx: &Context, message: &OutboundMessage) -> Result<(), AmqpError> {
        let mut btree = BTreeMap::<ShortString, AMQPValue>::default();

        global::get_text_map_propagator(|propagator| {
            propagator.inject_context(ctx, &mut AmqpTracePropagator::new(&mut btree))
        });

        for (key, value) in message.headers_ref() {
            btree.insert(
                ShortString::from(key.as_str()),
                AMQPValue::LongString(LongString::from(value.as_str())),
            );
        }

        let mut properties = BasicProperties::default()
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_timestamp(epoch_secs())
            .with_headers(FieldTable::from(btree));

        if let Some(content_type) = message.content_type_ref() {
            properties = properties.with_content_type(ShortString::from(content_type));
        }

        if let Some(kind) = message.kind_ref() {
            properties = properties.with_type(ShortString::from(kind));
        }

        let exchange = message.exchange_override().unwrap_or(&self.exchange);

        match self
            .channel
            .basic_publish(
                exchange,
                message.routing_key_ref(),
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                message.body_ref(),
                properties,
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    routing_key = message.routing_key_ref(),
                    "error publishing message"
                );
                Err(AmqpError::PublishingError)
            }
            _ => Ok(()),
        }
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}
