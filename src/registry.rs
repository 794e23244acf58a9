// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Handler Registration and Routing
//!
//! This module provides the handler contract and the registry that maps
//! routing-key patterns to queues and handlers. The registry is populated once
//! at startup through the builder and is read-only afterwards: the reader
//! resolves every delivery against it, and the topology installer derives the
//! queues and bindings to declare from it.

use crate::{errors::AmqpError, message::InboundMessage, message::OutboundMessage, queue::QueueDefinition};
use async_trait::async_trait;
use std::{collections::HashSet, sync::Arc};

/// Contract of a message handler.
///
/// One invocation receives one inbound message and returns the (possibly
/// empty) responses to publish with the enclosing transaction. Handlers run on
/// worker tasks and must not block indefinitely.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, message: &InboundMessage) -> Result<Vec<OutboundMessage>, AmqpError>;
}

/// One declared route: a routing-key pattern bound to a queue and a handler.
#[derive(Clone)]
pub struct Registration {
    routing_key: String,
    queue: QueueDefinition,
    handler: Arc<dyn Handler>,
}

impl Registration {
    /// The routing-key pattern this registration listens on.
    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// The queue this registration consumes from.
    pub fn queue(&self) -> &QueueDefinition {
        &self.queue
    }

    /// The handler invoked for matching messages.
    pub fn handler(&self) -> Arc<dyn Handler> {
        self.handler.clone()
    }
}

/// Registry of all declared routes.
///
/// Constructed at startup and handed to the runtime by reference; there is no
/// process-global registry. Lookup resolves in declaration order, first match
/// wins.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    entries: Vec<Registration>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        HandlerRegistry::default()
    }

    /// Declares a route, chaining builder style.
    ///
    /// The pattern follows AMQP topic semantics: `*` matches exactly one word,
    /// `#` matches zero or more words, anything else matches literally.
    ///
    /// # Parameters
    /// * `routing_key` - Pattern this route listens on
    /// * `queue` - Queue to declare and consume from
    /// * `handler` - Handler invoked for matching messages
    ///
    /// # Returns
    /// Self for method chaining
    pub fn declare(
        mut self,
        routing_key: &str,
        queue: QueueDefinition,
        handler: Arc<dyn Handler>,
    ) -> Self {
        self.entries.push(Registration {
            routing_key: routing_key.to_owned(),
            queue,
            handler,
        });
        self
    }

    /// Resolves a routing key to its registration.
    pub fn lookup(&self, routing_key: &str) -> Option<&Registration> {
        self.entries
            .iter()
            .find(|entry| routing_key_matches(&entry.routing_key, routing_key))
    }

    /// All declared routes, in declaration order.
    pub fn registrations(&self) -> &[Registration] {
        &self.entries
    }

    /// The distinct queues declared across all routes.
    ///
    /// Several patterns may share one queue; topology installation and
    /// consumer setup must see it once.
    pub fn queues(&self) -> Vec<&QueueDefinition> {
        let mut seen = HashSet::new();
        self.entries
            .iter()
            .map(|entry| &entry.queue)
            .filter(|queue| seen.insert(queue.name().to_owned()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Matches a routing key against an AMQP topic pattern.
pub(crate) fn routing_key_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    words_match(&pattern, &key)
}

fn words_match(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.first() {
        None => key.is_empty(),
        Some(&"#") => {
            // '#' swallows zero words, or one word and stays in place
            words_match(&pattern[1..], key)
                || (!key.is_empty() && words_match(pattern, &key[1..]))
        }
        Some(&"*") => !key.is_empty() && words_match(&pattern[1..], &key[1..]),
        Some(word) => key.first() == Some(word) && words_match(&pattern[1..], &key[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopHandler;

    #[async_trait]
    impl Handler for NoopHandler {
        async fn handle(
            &self,
            _message: &InboundMessage,
        ) -> Result<Vec<OutboundMessage>, AmqpError> {
            Ok(vec![])
        }
    }

    fn registry_with(patterns: &[&str]) -> HandlerRegistry {
        patterns.iter().fold(HandlerRegistry::new(), |reg, pattern| {
            reg.declare(
                pattern,
                QueueDefinition::new(&format!("queue.{pattern}")),
                Arc::new(NoopHandler),
            )
        })
    }

    #[test]
    fn literal_patterns_match_exactly() {
        assert!(routing_key_matches("test.routing", "test.routing"));
        assert!(!routing_key_matches("test.routing", "test.routing.extra"));
        assert!(!routing_key_matches("test.routing", "test"));
    }

    #[test]
    fn star_matches_exactly_one_word() {
        assert!(routing_key_matches("orders.*", "orders.created"));
        assert!(!routing_key_matches("orders.*", "orders"));
        assert!(!routing_key_matches("orders.*", "orders.created.eu"));
        assert!(routing_key_matches("*.created", "orders.created"));
    }

    #[test]
    fn hash_matches_zero_or_more_words() {
        assert!(routing_key_matches("#", "anything.at.all"));
        assert!(routing_key_matches("orders.#", "orders"));
        assert!(routing_key_matches("orders.#", "orders.created.eu"));
        assert!(routing_key_matches("orders.#.eu", "orders.created.eu"));
        assert!(!routing_key_matches("orders.#.eu", "orders.created.us"));
    }

    #[test]
    fn lookup_resolves_in_declaration_order() {
        let registry = registry_with(&["orders.#", "orders.created"]);

        let hit = registry.lookup("orders.created").unwrap();
        assert_eq!("orders.#", hit.routing_key());
    }

    #[test]
    fn lookup_misses_return_none() {
        let registry = registry_with(&["orders.created"]);
        assert!(registry.lookup("billing.created").is_none());
    }

    #[test]
    fn queues_are_deduplicated_by_name() {
        let shared = QueueDefinition::new("shared.queue");
        let registry = HandlerRegistry::new()
            .declare("a.#", shared.clone(), Arc::new(NoopHandler))
            .declare("b.#", shared, Arc::new(NoopHandler));

        assert_eq!(2, registry.len());
        assert_eq!(1, registry.queues().len());
    }
}
