// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Installation
//!
//! This module declares the broker-side topology the registry implies: the
//! configured exchange, every registered queue (with its error queue, when
//! one is attached) and the queue-to-exchange bindings. Installation runs on
//! every fresh consume channel, at startup and again on each rotation, so
//! all declarations are idempotent.

use crate::{errors::AmqpError, queue::QueueDefinition, registry::HandlerRegistry};
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable, LongString, ShortString},
    Channel, ExchangeKind,
};
use std::collections::BTreeMap;
use tracing::{debug, error};

/// Constant for the header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";

/// Installs exchange, queues and bindings for a registry on one channel.
pub struct Topology<'tp> {
    channel: &'tp Channel,
    exchange: &'tp str,
    registry: &'tp HandlerRegistry,
}

impl<'tp> Topology<'tp> {
    pub fn new(channel: &'tp Channel, exchange: &'tp str, registry: &'tp HandlerRegistry) -> Self {
        Topology {
            channel,
            exchange,
            registry,
        }
    }

    /// Installs the topology to the broker.
    ///
    /// This method performs the following operations in order:
    /// 1. Declares the configured exchange (unless it is a broker builtin)
    /// 2. Declares all registered queues and their error queues
    /// 3. Binds each queue to the exchange under its routing-key pattern
    pub async fn install(&self) -> Result<(), AmqpError> {
        self.install_exchange().await?;
        self.install_queues().await?;
        self.bind_queues().await
    }

    async fn install_exchange(&self) -> Result<(), AmqpError> {
        // amq.* exchanges and the default exchange already exist on the broker
        if self.exchange.is_empty() || self.exchange.starts_with("amq.") {
            return Ok(());
        }

        debug!("creating exchange: {}", self.exchange);

        match self
            .channel
            .exchange_declare(
                self.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = self.exchange,
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(self.exchange.to_owned()))
            }
            _ => {
                debug!("exchange: {} was created", self.exchange);
                Ok(())
            }
        }
    }

    async fn install_queues(&self) -> Result<(), AmqpError> {
        for def in self.registry.queues() {
            debug!("creating queue: {}", def.name());

            let mut queue_args = BTreeMap::new();

            if def.error_queue().is_some() {
                self.declare_error_queue(def, &mut queue_args).await?;
            }

            match self
                .channel
                .queue_declare(
                    def.name(),
                    declare_options(def),
                    FieldTable::from(queue_args),
                )
                .await
            {
                Err(err) => {
                    error!(error = err.to_string(), name = def.name(), "failure to declare queue");
                    Err(AmqpError::DeclareQueueError(def.name().to_owned()))
                }
                _ => {
                    debug!("queue: {} was created", def.name());
                    Ok(())
                }
            }?;
        }

        Ok(())
    }

    /// Declares the error queue and wires the main queue's dead-letter
    /// arguments at it, so rejected messages land there without a requeue.
    async fn declare_error_queue(
        &self,
        def: &QueueDefinition,
        queue_args: &mut BTreeMap<ShortString, AMQPValue>,
    ) -> Result<(), AmqpError> {
        let error_queue = match def.error_queue() {
            Some(name) => name.to_owned(),
            None => return Ok(()),
        };

        match self
            .channel
            .queue_declare(&error_queue, declare_options(def), FieldTable::default())
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "failure to declare error queue");
                Err(AmqpError::DeclareQueueError(error_queue))
            }
            _ => {
                queue_args.insert(
                    ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
                    AMQPValue::LongString(LongString::from("")),
                );
                queue_args.insert(
                    ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
                    AMQPValue::LongString(LongString::from(error_queue)),
                );
                Ok(())
            }
        }
    }

    async fn bind_queues(&self) -> Result<(), AmqpError> {
        // binding to the default exchange is implicit
        if self.exchange.is_empty() {
            return Ok(());
        }

        for registration in self.registry.registrations() {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                registration.queue().name(),
                self.exchange,
                registration.routing_key()
            );

            match self
                .channel
                .queue_bind(
                    registration.queue().name(),
                    self.exchange,
                    registration.routing_key(),
                    QueueBindOptions { nowait: false },
                    FieldTable::default(),
                )
                .await
            {
                Err(err) => {
                    error!(error = err.to_string(), "error to bind queue to exchange");

                    Err(AmqpError::BindingExchangeToQueueError(
                        self.exchange.to_owned(),
                        registration.queue().name().to_owned(),
                    ))
                }
                _ => Ok(()),
            }?;
        }

        Ok(())
    }
}

fn declare_options(def: &QueueDefinition) -> QueueDeclareOptions {
    QueueDeclareOptions {
        passive: false,
        durable: def.durable,
        exclusive: def.exclusive,
        auto_delete: def.delete,
        nowait: false,
    }
}
