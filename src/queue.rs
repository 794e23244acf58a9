// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! This module provides the builder for declaring the queues that handlers
//! consume from. A definition can carry an error queue: the broker-side sink
//! that rejected (non-requeued) messages are dead-lettered into.

/// Definition of a queue with its declaration parameters.
///
/// This struct implements the builder pattern to create and configure queue
/// definitions. The same definition is re-declared on every channel rotation,
/// so every option here must be idempotent on the broker side.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) error_queue: Option<String>,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    ///
    /// By default the queue is non-durable, non-exclusive and is not
    /// auto-deleted, and no error queue is attached.
    ///
    /// # Parameters
    /// * `name` - The name of the queue
    ///
    /// # Returns
    /// A new queue definition with default settings
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: false,
            delete: false,
            exclusive: false,
            error_queue: None,
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Attaches an error queue named `<name>.error`.
    ///
    /// The main queue is declared with dead-letter arguments pointing at it,
    /// so a message rejected without requeue is routed there by the broker.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn with_error_queue(mut self) -> Self {
        self.error_queue = Some(format!("{}.error", self.name));
        self
    }

    /// The queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The attached error queue name, when one was requested.
    pub fn error_queue(&self) -> Option<&str> {
        self.error_queue.as_deref()
    }
}
