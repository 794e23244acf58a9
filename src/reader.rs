// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Reader
//!
//! The single point of contact with the broker for inbound traffic. The
//! reader owns the consume channel on the shared connection and drives one
//! event loop: it receives deliveries from every registered queue, resolves
//! each routing key against the registry, and hands matched messages to the
//! task queue as bound tasks. Every `channel_life_time` it rotates the
//! channel: a fresh channel is declared and swapped in, and closing the old
//! one makes the broker requeue whatever was still unacknowledged on it,
//! which is how held failures come back as redeliveries.
//!
//! The loop never waits unboundedly: it multiplexes deliveries, the rotation
//! timer, the wakeup notifier and the stop flag, so a stop request is honored
//! within one poll cycle.

use crate::{
    channel::new_amqp_channel,
    config::AmqpConfig,
    errors::AmqpError,
    message::InboundMessage,
    notify::Notifier,
    registry::HandlerRegistry,
    task::{Task, TaskQueue},
    topology::Topology,
};
use futures_util::{
    stream::{select_all, SelectAll},
    StreamExt,
};
use lapin::{
    message::Delivery,
    options::{BasicConsumeOptions, BasicQosOptions, BasicRejectOptions},
    types::FieldTable,
    Channel, Connection, Consumer,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Cloneable control surface of a reader.
///
/// The reader itself moves onto its own task; whoever bootstrapped it keeps a
/// handle to stop it, wake its loop, or observe whether it is polling.
#[derive(Clone)]
pub struct ReaderHandle {
    stop: watch::Sender<bool>,
    notifier: Notifier,
    running: Arc<AtomicBool>,
}

impl ReaderHandle {
    /// Requests loop exit. Idempotent; wakes the loop so the request is
    /// honored within one poll cycle.
    pub fn stop(&self) {
        info!("stopping message reader");
        self.stop.send_replace(true);
        self.notifier.wake();
    }

    /// Wakes the loop without stopping it.
    pub fn wake(&self) {
        self.notifier.wake();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Owns the consume side of the broker connection.
pub struct MessageReader {
    connection: Arc<Connection>,
    config: AmqpConfig,
    registry: Arc<HandlerRegistry>,
    tasks: Arc<TaskQueue>,
    notifier: Notifier,
    running: Arc<AtomicBool>,
    stop: watch::Sender<bool>,
}

impl MessageReader {
    pub fn new(
        connection: Arc<Connection>,
        config: AmqpConfig,
        registry: Arc<HandlerRegistry>,
        tasks: Arc<TaskQueue>,
    ) -> Self {
        let (stop, _) = watch::channel(false);
        MessageReader {
            connection,
            config,
            registry,
            tasks,
            notifier: Notifier::new(),
            running: Arc::new(AtomicBool::new(false)),
            stop,
        }
    }

    /// The registry this reader resolves deliveries against.
    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Control surface for the task that owns this reader.
    pub fn handle(&self) -> ReaderHandle {
        ReaderHandle {
            stop: self.stop.clone(),
            notifier: self.notifier.clone(),
            running: self.running.clone(),
        }
    }

    /// Opens the consume channel, installs the topology and runs the event
    /// loop until a stop request or a connection-level failure.
    ///
    /// Blocking; intended to run on a dedicated task. The consume channel is
    /// closed on exit, the connection is left to its owner.
    pub async fn start(&mut self) -> Result<(), AmqpError> {
        if self.registry.is_empty() {
            error!("no handlers registered, nothing to consume");
            return Err(AmqpError::ConfigurationError("handler registry".to_owned()));
        }

        let channel = self.open_channel().await?;
        let consumers = self.consume_on(&channel).await?;

        self.running.store(true, Ordering::SeqCst);
        info!(
            queues = self.registry.queues().len(),
            "message reader started"
        );

        let result = self.run(channel, consumers).await;

        self.running.store(false, Ordering::SeqCst);
        info!("message reader stopped");
        result
    }

    async fn run(
        &mut self,
        mut channel: Arc<Channel>,
        mut consumers: SelectAll<Consumer>,
    ) -> Result<(), AmqpError> {
        let mut stop = self.stop.subscribe();
        let notifier = self.notifier.clone();
        let period = self.config.channel_life_time();
        let mut rotation = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        rotation.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let result = loop {
            if *stop.borrow() {
                break Ok(());
            }

            tokio::select! {
                _ = stop.changed() => {}
                _ = notifier.notified() => {}
                _ = rotation.tick() => {
                    if let Err(err) = self.rotate(&mut channel, &mut consumers).await {
                        error!(error = err.to_string(), "failure to rotate channel");
                        break Err(err);
                    }
                }
                delivery = consumers.next() => match delivery {
                    Some(Ok(delivery)) => self.dispatch(delivery).await,
                    Some(Err(err)) => {
                        error!(error = err.to_string(), "broker i/o failure while consuming");
                        break Err(AmqpError::ConsumerError(err.to_string()));
                    }
                    None => {
                        error!("consumer stream ended unexpectedly");
                        break Err(AmqpError::ChannelError);
                    }
                }
            }
        };

        if let Err(err) = channel.close(200, "reader exit").await {
            debug!(error = err.to_string(), "failure to close consume channel on exit");
        }

        result
    }

    /// Swaps the consume channel for a fresh one.
    ///
    /// The new channel is fully declared and consuming before the old one is
    /// closed, so no delivery window is lost. Closing the old channel makes
    /// the broker requeue every delivery whose ack was still pending there,
    /// and those messages come back on the new channel.
    async fn rotate(
        &self,
        channel: &mut Arc<Channel>,
        consumers: &mut SelectAll<Consumer>,
    ) -> Result<(), AmqpError> {
        debug!("rotating consume channel");

        let fresh = self.open_channel().await?;
        let fresh_consumers = self.consume_on(&fresh).await?;

        let stale = std::mem::replace(channel, fresh);
        *consumers = fresh_consumers;

        if let Err(err) = stale.close(200, "channel rotation").await {
            warn!(error = err.to_string(), "failure to close the stale channel");
        }

        info!("consume channel rotated");
        Ok(())
    }

    async fn open_channel(&self) -> Result<Arc<Channel>, AmqpError> {
        let channel = new_amqp_channel(&self.connection).await?;

        channel
            .basic_qos(self.config.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to configure channel qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })?;

        Topology::new(&channel, &self.config.exchange, &self.registry)
            .install()
            .await?;

        Ok(channel)
    }

    async fn consume_on(&self, channel: &Channel) -> Result<SelectAll<Consumer>, AmqpError> {
        let mut consumers = Vec::with_capacity(self.registry.queues().len());

        for queue in self.registry.queues() {
            let consumer = channel
                .basic_consume(
                    queue.name(),
                    queue.name(),
                    BasicConsumeOptions {
                        no_local: false,
                        no_ack: false,
                        exclusive: false,
                        nowait: false,
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|err| {
                    error!(
                        error = err.to_string(),
                        queue = queue.name(),
                        "error to create the consumer"
                    );
                    AmqpError::BindingConsumerError(queue.name().to_owned())
                })?;

            consumers.push(consumer);
        }

        Ok(select_all(consumers))
    }

    /// Resolves one delivery and hands it to the task queue.
    ///
    /// Failures here are per-message and never tear the loop down.
    async fn dispatch(&self, delivery: Delivery) {
        let routing_key = delivery.routing_key.to_string();

        let Some(registration) = self.registry.lookup(&routing_key) else {
            warn!(routing_key, "no handler for routing key, rejecting message");
            if let Err(err) = delivery
                .acker
                .reject(BasicRejectOptions { requeue: false })
                .await
            {
                error!(error = err.to_string(), "failure to reject unrouted message");
            }
            return;
        };

        let message = InboundMessage::new(
            registration.queue().name(),
            delivery.exchange.to_string(),
            routing_key.clone(),
            delivery.delivery_tag,
            delivery.redelivered,
            delivery.properties,
            delivery.data,
        );

        debug!(
            routing_key,
            delivery_tag = message.delivery_tag(),
            "received message"
        );

        let task = Task::new(registration.handler(), message, Box::new(delivery.acker));

        if let Err(task) = self.tasks.push(task, self.config.push_timeout()).await {
            warn!(routing_key, "task queue saturated, releasing message");
            if let Err(err) = task.requeue().await {
                error!(error = err.to_string(), "failure to release message");
            }
        }
    }
}
