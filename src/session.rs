// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Sessions and the Transaction Boundary
//!
//! This module implements the transactional semantics one handler invocation
//! runs under. A `Session` accumulates the responses a handler produces; the
//! `Transaction` is the explicit begin/commit/abort value that owns the
//! acknowledgment of the inbound message. Commit publishes every accumulated
//! message and only then acknowledges the inbound one; after a failed publish
//! the message is never acknowledged, so the broker keeps the at-least-once
//! guarantee. Abort discards the session and applies the configured
//! disposition to the inbound message.

use crate::{errors::AmqpError, message::OutboundMessage, publisher::Publish};
use async_trait::async_trait;
use lapin::{
    acker::Acker,
    options::{BasicAckOptions, BasicNackOptions},
};
use opentelemetry::Context;
use serde::Deserialize;
use std::{str::FromStr, sync::Arc};
use tracing::{debug, error};

/// Seam over the broker acknowledgment of one delivery.
///
/// The reader hands the concrete lapin acker to the task; the transaction only
/// sees this trait, which keeps the commit/abort paths testable without a
/// broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AckHandle: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;
    async fn reject(&self, requeue: bool) -> Result<(), AmqpError>;
}

#[async_trait]
impl AckHandle for Acker {
    async fn ack(&self) -> Result<(), AmqpError> {
        Acker::ack(self, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to ack message");
                AmqpError::AckMessageError
            })
    }

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        Acker::nack(
            self,
            BasicNackOptions {
                multiple: false,
                requeue,
            },
        )
        .await
        .map_err(|err| {
            error!(error = err.to_string(), "error to nack message");
            AmqpError::NackMessageError
        })
    }
}

/// Disposition applied to the inbound message when a transaction aborts.
///
/// The broker-side outcome of a failure is deployment policy, so it is a
/// configurable collaborator rather than hard-coded logic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectMode {
    /// Leave the message unacknowledged. The broker requeues it when the
    /// delivery channel closes, which the reader's channel rotation
    /// guarantees within one rotation period.
    #[default]
    Hold,
    /// Reject without requeue; the broker dead-letters the message into the
    /// queue's error queue when one is bound.
    DeadLetter,
    /// Reject with requeue for immediate redelivery.
    Requeue,
}

impl FromStr for RejectMode {
    type Err = AmqpError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "hold" => Ok(RejectMode::Hold),
            "dead-letter" => Ok(RejectMode::DeadLetter),
            "requeue" => Ok(RejectMode::Requeue),
            _ => Err(AmqpError::ConfigurationError("reject mode".to_owned())),
        }
    }
}

/// Per-invocation accumulator for outbound messages.
///
/// `send` has no broker-visible effect; the messages only leave when the
/// enclosing transaction commits. A session serves exactly one handler
/// invocation and is consumed by the commit.
#[derive(Default)]
pub struct Session {
    messages: Vec<OutboundMessage>,
}

impl Session {
    pub fn new() -> Self {
        Session::default()
    }

    /// Queues one message for publication at commit time.
    pub fn send(&mut self, message: OutboundMessage) {
        self.messages.push(message);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn into_messages(self) -> Vec<OutboundMessage> {
        self.messages
    }
}

/// Explicit transaction boundary of one handler invocation.
///
/// Begun before the handler runs, then consumed by exactly one of `commit` or
/// `abort`, so the inbound message can never be acknowledged twice.
pub struct Transaction {
    publisher: Arc<dyn Publish>,
    ack: Box<dyn AckHandle>,
    mode: RejectMode,
    ctx: Context,
}

impl Transaction {
    pub fn begin(
        publisher: Arc<dyn Publish>,
        ack: Box<dyn AckHandle>,
        mode: RejectMode,
        ctx: Context,
    ) -> Self {
        Transaction {
            publisher,
            ack,
            mode,
            ctx,
        }
    }

    /// Publishes the session's messages, then acknowledges the inbound one.
    ///
    /// A publish failure aborts: the disposition is applied and the error is
    /// returned without acknowledging, so the broker redelivers. Messages
    /// already published before the failure stay published (at-least-once).
    pub async fn commit(self, session: Session) -> Result<(), AmqpError> {
        for message in session.into_messages() {
            if let Err(err) = self.publisher.publish(&self.ctx, &message).await {
                error!(
                    error = err.to_string(),
                    routing_key = message.routing_key_ref(),
                    "failure to publish response, aborting transaction"
                );
                self.dispose().await?;
                return Err(err);
            }
        }

        self.ack.ack().await
    }

    /// Discards the session and applies the abort disposition.
    pub async fn abort(self, session: Session) -> Result<(), AmqpError> {
        if !session.is_empty() {
            debug!(discarded = session.len(), "discarding responses on abort");
        }
        drop(session);
        self.dispose().await
    }

    async fn dispose(&self) -> Result<(), AmqpError> {
        match self.mode {
            RejectMode::Hold => Ok(()),
            RejectMode::DeadLetter => self.ack.reject(false).await,
            RejectMode::Requeue => self.ack.reject(true).await,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records acknowledgment calls for assertions without a broker.
    #[derive(Default)]
    pub(crate) struct RecordingAck {
        pub acked: Arc<AtomicUsize>,
        pub rejected: Arc<AtomicUsize>,
        pub requeued: Arc<AtomicUsize>,
    }

    impl RecordingAck {
        pub(crate) fn new() -> (Self, Arc<AtomicUsize>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
            let ack = RecordingAck::default();
            (
                RecordingAck {
                    acked: ack.acked.clone(),
                    rejected: ack.rejected.clone(),
                    requeued: ack.requeued.clone(),
                },
                ack.acked,
                ack.rejected,
                ack.requeued,
            )
        }
    }

    #[async_trait]
    impl AckHandle for RecordingAck {
        async fn ack(&self) -> Result<(), AmqpError> {
            self.acked.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
            if requeue {
                self.requeued.fetch_add(1, Ordering::SeqCst);
            } else {
                self.rejected.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }
}
