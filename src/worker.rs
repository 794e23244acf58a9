// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Worker Pool
//!
//! A worker executes exactly one task at a time under the transaction
//! boundary of [`crate::session`]. Failures are isolated per message: a
//! handler error (or panic) aborts that task's transaction and the worker
//! moves on, and anything escaping the per-task boundary is caught at the
//! loop level so a worker task never dies to one bad message.

use crate::{
    config::AmqpConfig,
    errors::AmqpError,
    otel,
    publisher::Publish,
    session::{RejectMode, Session, Transaction},
    task::{Task, TaskQueue},
};
use futures_util::future::FutureExt;
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use std::{
    borrow::Cow,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// One worker of the pool.
///
/// A plain value holding its queue, publish path and lifecycle flag; the run
/// loop itself is a free function launched on a dedicated task by `start`.
/// State machine: not-started, running, stopped (terminal); a stopped worker
/// is never restarted.
pub struct Worker {
    id: usize,
    tasks: Arc<TaskQueue>,
    publisher: Arc<dyn Publish>,
    reject_mode: RejectMode,
    timeout: Duration,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn new(
        id: usize,
        tasks: Arc<TaskQueue>,
        publisher: Arc<dyn Publish>,
        config: &AmqpConfig,
    ) -> Self {
        Worker {
            id,
            tasks,
            publisher,
            reject_mode: config.reject_mode,
            timeout: config.worker_timeout(),
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    /// Launches the run loop. Calling `start` twice is a no-op.
    pub fn start(&mut self) {
        if self.handle.is_some() {
            return;
        }

        info!(worker = self.id, "starting worker");
        self.running.store(true, Ordering::SeqCst);

        let id = self.id;
        let tasks = self.tasks.clone();
        let publisher = self.publisher.clone();
        let reject_mode = self.reject_mode;
        let timeout = self.timeout;
        let running = self.running.clone();

        self.handle = Some(tokio::spawn(run(
            id, tasks, publisher, reject_mode, timeout, running,
        )));
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Requests the loop to stop and waits for it to exit.
    ///
    /// Returns only once the in-flight task, when there is one, completed its
    /// commit or abort, so no task is left half-processed. Idempotent, and safe
    /// on a worker that never started.
    pub async fn stop(&mut self) {
        info!(worker = self.id, "stopping worker");
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.handle.take() {
            if handle.await.is_err() {
                error!(worker = self.id, "worker task ended abnormally");
            }
        }
    }
}

async fn run(
    id: usize,
    tasks: Arc<TaskQueue>,
    publisher: Arc<dyn Publish>,
    reject_mode: RejectMode,
    timeout: Duration,
    running: Arc<AtomicBool>,
) {
    let tracer = global::tracer("amqp worker");

    while running.load(Ordering::SeqCst) {
        // the bounded wait exists so this loop re-reads the stop flag
        let Some(task) = tasks.pop(timeout).await else {
            continue;
        };

        if let Err(err) = process(task, publisher.clone(), reject_mode, &tracer).await {
            error!(
                worker = id,
                error = err.to_string(),
                "unhandled error, prevented from crashing the worker"
            );
        }
    }

    info!(worker = id, "worker stopped");
}

/// Runs one task under its transaction.
///
/// Handler errors and panics are terminal for the message, not for the
/// worker: the transaction aborts and `Ok` is returned. The `Err` path is
/// reserved for failures of the failure handling itself, which the run loop
/// logs and survives.
async fn process(
    task: Task,
    publisher: Arc<dyn Publish>,
    reject_mode: RejectMode,
    tracer: &opentelemetry::global::BoxedTracer,
) -> Result<(), AmqpError> {
    let (handler, message, ack) = task.into_parts();

    let span_name = message
        .kind()
        .unwrap_or_else(|| message.routing_key().to_owned());
    let (ctx, mut span) = otel::new_span(message.properties(), tracer, &span_name);

    let transaction = Transaction::begin(publisher, ack, reject_mode, ctx);
    let mut session = Session::new();

    let outcome = AssertUnwindSafe(handler.handle(&message)).catch_unwind().await;

    match outcome {
        Ok(Ok(responses)) => {
            for response in responses {
                session.send(response);
            }

            match transaction.commit(session).await {
                Ok(()) => {
                    span.set_status(Status::Ok);
                    Ok(())
                }
                Err(err) => {
                    // commit already applied the abort disposition
                    span.record_error(&err);
                    span.set_status(Status::Error {
                        description: Cow::from("failure to commit"),
                    });
                    error!(
                        routing_key = message.routing_key(),
                        delivery_tag = message.delivery_tag(),
                        error = err.to_string(),
                        "error while committing message transaction"
                    );
                    Ok(())
                }
            }
        }
        Ok(Err(err)) => {
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("handler failed"),
            });
            error!(
                routing_key = message.routing_key(),
                delivery_tag = message.delivery_tag(),
                error = err.to_string(),
                "error while processing message"
            );
            transaction.abort(session).await
        }
        Err(panic) => {
            let reason = panic_message(&panic);
            span.set_status(Status::Error {
                description: Cow::from("handler panicked"),
            });
            error!(
                routing_key = message.routing_key(),
                delivery_tag = message.delivery_tag(),
                reason,
                "handler panicked while processing message"
            );
            transaction.abort(session).await
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(text) = panic.downcast_ref::<&str>() {
        text
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{InboundMessage, OutboundMessage};
    use crate::registry::Handler;
    use crate::session::test_support::RecordingAck;
    use async_trait::async_trait;
    use lapin::protocol::basic::AMQPProperties;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use tokio::time::sleep;

    struct RecordingPublisher {
        published: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Publish for RecordingPublisher {
        async fn publish(
            &self,
            _ctx: &opentelemetry::Context,
            _message: &OutboundMessage,
        ) -> Result<(), AmqpError> {
            self.published.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Appends every received body to a shared observation list.
    struct ObservingHandler {
        observed: Arc<Mutex<Vec<String>>>,
        responses: usize,
        delay: Duration,
    }

    #[async_trait]
    impl Handler for ObservingHandler {
        async fn handle(
            &self,
            message: &InboundMessage,
        ) -> Result<Vec<OutboundMessage>, AmqpError> {
            sleep(self.delay).await;
            self.observed
                .lock()
                .unwrap()
                .push(message.text().unwrap_or_default().to_owned());
            Ok((0..self.responses)
                .map(|n| OutboundMessage::new("test.response", format!("r{n}").into_bytes()))
                .collect())
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl Handler for FailingHandler {
        async fn handle(
            &self,
            _message: &InboundMessage,
        ) -> Result<Vec<OutboundMessage>, AmqpError> {
            Err(AmqpError::HandlerError("provoked".to_owned()))
        }
    }

    struct PanickingHandler;

    #[async_trait]
    impl Handler for PanickingHandler {
        async fn handle(
            &self,
            _message: &InboundMessage,
        ) -> Result<Vec<OutboundMessage>, AmqpError> {
            panic!("boom");
        }
    }

    fn test_config() -> AmqpConfig {
        AmqpConfig {
            worker_timeout_ms: 20,
            reject_mode: RejectMode::DeadLetter,
            ..AmqpConfig::default()
        }
    }

    fn message(body: &[u8], tag: u64) -> InboundMessage {
        InboundMessage::new(
            "test.queue",
            "amq.topic".to_owned(),
            "test.routing".to_owned(),
            tag,
            false,
            AMQPProperties::default(),
            body.to_vec(),
        )
    }

    fn publisher_pair() -> (Arc<dyn Publish>, Arc<AtomicUsize>) {
        let published = Arc::new(AtomicUsize::new(0));
        (
            Arc::new(RecordingPublisher {
                published: published.clone(),
            }),
            published,
        )
    }

    async fn drain(queue: &TaskQueue) {
        for _ in 0..100 {
            if queue.is_empty() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        // one more beat for the in-flight task to finish
        sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn commits_successful_tasks_and_publishes_responses() {
        let tasks = Arc::new(TaskQueue::new(8));
        let (publisher, published) = publisher_pair();
        let observed = Arc::new(Mutex::new(Vec::new()));
        let (ack, acked, _, _) = RecordingAck::new();

        let handler = Arc::new(ObservingHandler {
            observed: observed.clone(),
            responses: 2,
            delay: Duration::ZERO,
        });
        tasks
            .push(
                Task::new(handler, message(b"blarf", 1), Box::new(ack)),
                Duration::from_millis(10),
            )
            .await
            .ok()
            .unwrap();

        let mut worker = Worker::new(0, tasks.clone(), publisher, &test_config());
        worker.start();
        drain(&tasks).await;
        worker.stop().await;

        assert_eq!(vec!["blarf".to_owned()], *observed.lock().unwrap());
        assert_eq!(2, published.load(Ordering::SeqCst));
        assert_eq!(1, acked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn a_failing_message_does_not_stop_the_next_one() {
        let tasks = Arc::new(TaskQueue::new(8));
        let (publisher, _) = publisher_pair();
        let observed = Arc::new(Mutex::new(Vec::new()));

        let (failing_ack, failed_acked, rejected, _) = RecordingAck::new();
        tasks
            .push(
                Task::new(Arc::new(FailingHandler), message(b"bad", 1), Box::new(failing_ack)),
                Duration::from_millis(10),
            )
            .await
            .ok()
            .unwrap();

        let (good_ack, acked, _, _) = RecordingAck::new();
        let handler = Arc::new(ObservingHandler {
            observed: observed.clone(),
            responses: 0,
            delay: Duration::ZERO,
        });
        tasks
            .push(
                Task::new(handler, message(b"good", 2), Box::new(good_ack)),
                Duration::from_millis(10),
            )
            .await
            .ok()
            .unwrap();

        let mut worker = Worker::new(0, tasks.clone(), publisher, &test_config());
        worker.start();
        drain(&tasks).await;
        worker.stop().await;

        assert_eq!(vec!["good".to_owned()], *observed.lock().unwrap());
        assert_eq!(0, failed_acked.load(Ordering::SeqCst));
        assert_eq!(1, rejected.load(Ordering::SeqCst));
        assert_eq!(1, acked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn a_panicking_handler_is_contained() {
        let tasks = Arc::new(TaskQueue::new(8));
        let (publisher, _) = publisher_pair();

        let (panic_ack, _, rejected, _) = RecordingAck::new();
        tasks
            .push(
                Task::new(Arc::new(PanickingHandler), message(b"bad", 1), Box::new(panic_ack)),
                Duration::from_millis(10),
            )
            .await
            .ok()
            .unwrap();

        let mut worker = Worker::new(0, tasks.clone(), publisher, &test_config());
        worker.start();
        drain(&tasks).await;

        assert!(worker.is_running());
        worker.stop().await;
        assert_eq!(1, rejected.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn stop_waits_for_the_in_flight_task() {
        let tasks = Arc::new(TaskQueue::new(8));
        let (publisher, _) = publisher_pair();
        let observed = Arc::new(Mutex::new(Vec::new()));
        let (ack, acked, _, _) = RecordingAck::new();

        let handler = Arc::new(ObservingHandler {
            observed: observed.clone(),
            responses: 0,
            delay: Duration::from_millis(200),
        });
        tasks
            .push(
                Task::new(handler, message(b"slow", 1), Box::new(ack)),
                Duration::from_millis(10),
            )
            .await
            .ok()
            .unwrap();

        let mut worker = Worker::new(0, tasks.clone(), publisher, &test_config());
        worker.start();

        // give the worker a beat to pick the task up, then stop mid-handling
        sleep(Duration::from_millis(50)).await;
        worker.stop().await;

        assert_eq!(1, observed.lock().unwrap().len());
        assert_eq!(1, acked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_safe_without_start() {
        let tasks = Arc::new(TaskQueue::new(2));
        let (publisher, _) = publisher_pair();

        let mut never_started = Worker::new(0, tasks.clone(), publisher.clone(), &test_config());
        never_started.stop().await;

        let mut worker = Worker::new(1, tasks, publisher, &test_config());
        worker.start();
        worker.stop().await;
        worker.stop().await;
        assert!(!worker.is_running());
    }
}
