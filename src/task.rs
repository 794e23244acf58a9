// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Tasks and the Bounded Task Queue
//!
//! This module bridges the reader loop to the worker pool. A `Task` binds a
//! resolved handler to one inbound message together with the acknowledgment
//! handle of its delivery; the `TaskQueue` is the bounded, thread-safe FIFO
//! the reader pushes into and the workers pop from. Both ends wait with a
//! bound: the reader is never stalled past its push timeout, and a worker's
//! pop timeout is what lets it observe a stop request promptly.

use crate::{message::InboundMessage, registry::Handler, session::AckHandle};
use std::{sync::Arc, time::Duration};
use tokio::sync::{
    mpsc::{self, error::SendTimeoutError},
    Mutex,
};

/// One unit of work: a resolved handler bound to one inbound message.
///
/// Created by the reader on a successful routing lookup, consumed exactly
/// once by one worker. The acknowledgment handle travels with the task, so
/// terminal disposition of the message belongs to whoever holds it.
pub struct Task {
    handler: Arc<dyn Handler>,
    message: InboundMessage,
    ack: Box<dyn AckHandle>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

impl Task {
    pub(crate) fn new(
        handler: Arc<dyn Handler>,
        message: InboundMessage,
        ack: Box<dyn AckHandle>,
    ) -> Self {
        Task {
            handler,
            message,
            ack,
        }
    }

    pub fn message(&self) -> &InboundMessage {
        &self.message
    }

    pub(crate) fn into_parts(self) -> (Arc<dyn Handler>, InboundMessage, Box<dyn AckHandle>) {
        (self.handler, self.message, self.ack)
    }

    /// Releases the message back to the broker for later redelivery.
    ///
    /// Used when the task queue is saturated: the reader gives the message up
    /// instead of buffering unboundedly.
    pub(crate) async fn requeue(self) -> Result<(), crate::errors::AmqpError> {
        self.ack.reject(true).await
    }
}

/// Bounded handoff buffer between the reader and the worker pool.
///
/// Push happens from the single reader task, pop from N workers; no task is
/// ever delivered to two workers.
pub struct TaskQueue {
    tx: mpsc::Sender<Task>,
    rx: Mutex<mpsc::Receiver<Task>>,
}

impl TaskQueue {
    /// Creates a queue holding at most `capacity` pending tasks.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        TaskQueue {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Enqueues a task, waiting at most `wait` for room.
    ///
    /// On timeout the task is handed back so the caller can release its
    /// message to the broker.
    pub async fn push(&self, task: Task, wait: Duration) -> Result<(), Task> {
        match self.tx.send_timeout(task, wait).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(task)) => Err(task),
            Err(SendTimeoutError::Closed(task)) => Err(task),
        }
    }

    /// Dequeues one task, waiting at most `wait` for one to arrive.
    pub async fn pop(&self, wait: Duration) -> Option<Task> {
        tokio::time::timeout(wait, async { self.rx.lock().await.recv().await })
            .await
            .ok()
            .flatten()
    }

    /// Number of tasks currently queued.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AmqpError;
    use crate::message::OutboundMessage;
    use crate::registry::Handler;
    use crate::session::test_support::RecordingAck;
    use async_trait::async_trait;
    use lapin::protocol::basic::AMQPProperties;

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

    fn task(tag: u64) -> Task {
        let (ack, _, _, _) = RecordingAck::new();
        Task::new(
            Arc::new(NoopHandler),
            InboundMessage::new(
                "test.queue",
                "amq.topic".to_owned(),
                "test.routing".to_owned(),
                tag,
                false,
                AMQPProperties::default(),
                b"blarf".to_vec(),
            ),
            Box::new(ack),
        )
    }

    #[tokio::test]
    async fn push_then_pop_round_trips_in_order() {
        let queue = TaskQueue::new(4);

        queue.push(task(1), Duration::from_millis(10)).await.unwrap();
        queue.push(task(2), Duration::from_millis(10)).await.unwrap();
        assert_eq!(2, queue.len());

        let first = queue.pop(Duration::from_millis(10)).await.unwrap();
        assert_eq!(1, first.message().delivery_tag());
        let second = queue.pop(Duration::from_millis(10)).await.unwrap();
        assert_eq!(2, second.message().delivery_tag());
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn pop_times_out_on_an_empty_queue() {
        let queue = TaskQueue::new(4);
        assert!(queue.pop(Duration::from_secs(5)).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn push_hands_the_task_back_when_saturated() {
        let queue = TaskQueue::new(1);

        queue.push(task(1), Duration::from_millis(10)).await.unwrap();

        let rejected = queue.push(task(2), Duration::from_millis(50)).await;
        let returned = rejected.expect_err("saturated queue must hand the task back");
        assert_eq!(2, returned.message().delivery_tag());
        assert_eq!(1, queue.len());
    }

    #[tokio::test]
    async fn requeue_releases_through_the_ack_handle() {
        let (ack, _, _, requeued) = RecordingAck::new();
        let task = Task::new(
            Arc::new(NoopHandler),
            InboundMessage::new(
                "test.queue",
                "amq.topic".to_owned(),
                "test.routing".to_owned(),
                9,
                false,
                AMQPProperties::default(),
                vec![],
            ),
            Box::new(ack),
        );

        task.requeue().await.unwrap();
        assert_eq!(1, requeued.load(std::sync::atomic::Ordering::SeqCst));
    }
}
