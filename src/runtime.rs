// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Runtime Assembly and Shutdown
//!
//! Wires the pieces together: one connection, one publisher channel, the
//! bounded task queue, the reader on its own task and the worker pool. Also
//! owns the orderly shutdown sequence: reader first, then the workers, and
//! only after every worker drained is the connection closed, so nothing acks
//! or publishes through a torn-down connection.

use crate::{
    channel::{new_amqp_channel, new_amqp_connection},
    config::AmqpConfig,
    errors::AmqpError,
    publisher::{AmqpPublisher, Publish},
    reader::{MessageReader, ReaderHandle},
    registry::HandlerRegistry,
    task::TaskQueue,
    worker::Worker,
};
use lapin::Connection;
use std::{sync::Arc, time::Duration};
use tokio::{task::JoinHandle, time::sleep};
use tracing::{debug, error, info, warn};

/// A bootstrapped consumption runtime.
pub struct AmqpRuntime {
    connection: Arc<Connection>,
    registry: Arc<HandlerRegistry>,
    reader: ReaderHandle,
    reader_task: Option<JoinHandle<Result<(), AmqpError>>>,
    workers: Vec<Worker>,
    tasks: Arc<TaskQueue>,
}

impl AmqpRuntime {
    /// Connects and starts the reader and the worker pool.
    ///
    /// Returns once the reader reports its loop is live and polling; a reader
    /// that dies during startup surfaces its error here.
    pub async fn bootstrap(
        config: AmqpConfig,
        registry: HandlerRegistry,
    ) -> Result<Self, AmqpError> {
        let registry = Arc::new(registry);
        let connection = new_amqp_connection(&config).await?;

        let publish_channel = new_amqp_channel(&connection).await?;
        let publisher: Arc<dyn Publish> = AmqpPublisher::new(publish_channel, &config.exchange);

        let tasks = Arc::new(TaskQueue::new(config.queue_capacity));

        let mut reader = MessageReader::new(
            connection.clone(),
            config.clone(),
            registry.clone(),
            tasks.clone(),
        );
        let handle = reader.handle();
        let mut reader_task = tokio::spawn(async move { reader.start().await });

        // wait for the loop to come up before starting workers
        for _ in 0..200 {
            if handle.is_running() {
                break;
            }
            if reader_task.is_finished() {
                return Err(match reader_task.await {
                    Ok(Ok(())) => AmqpError::InternalError,
                    Ok(Err(err)) => err,
                    Err(_) => AmqpError::InternalError,
                });
            }
            sleep(Duration::from_millis(25)).await;
        }
        if !handle.is_running() {
            error!("reader did not start up");
            reader_task.abort();
            return Err(AmqpError::InternalError);
        }

        let mut workers = Vec::with_capacity(config.workers);
        for id in 0..config.workers {
            let mut worker = Worker::new(id, tasks.clone(), publisher.clone(), &config);
            worker.start();
            workers.push(worker);
        }

        info!(workers = workers.len(), "runtime bootstrapped");

        Ok(AmqpRuntime {
            connection,
            registry,
            reader: handle,
            reader_task: Some(reader_task),
            workers,
            tasks,
        })
    }

    /// Control surface of the reader loop.
    pub fn reader(&self) -> &ReaderHandle {
        &self.reader
    }

    /// The registry this runtime dispatches against.
    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// The task queue, exposed so shutdown logic and tests can observe drain.
    pub fn tasks(&self) -> Arc<TaskQueue> {
        self.tasks.clone()
    }

    /// Stops everything in order and closes the connection.
    ///
    /// Idempotent; broker errors during teardown are logged and ignored.
    pub async fn shutdown(&mut self) {
        self.reader.stop();

        if let Some(task) = self.reader_task.take() {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(error = err.to_string(), "reader exited with an error")
                }
                Err(_) => error!("reader task ended abnormally"),
            }
        }

        for worker in &mut self.workers {
            worker.stop().await;
        }

        if let Err(err) = self.connection.close(200, "terminating").await {
            debug!(
                error = err.to_string(),
                "failure to close the connection on shutdown"
            );
        }
    }
}

/// Bootstraps the runtime and serves until the process is signaled.
///
/// On SIGTERM or SIGINT the runtime logs the received signal and shuts down
/// in order before returning.
pub async fn serve(config: AmqpConfig, registry: HandlerRegistry) -> Result<(), AmqpError> {
    let mut runtime = AmqpRuntime::bootstrap(config, registry).await?;

    let signal = shutdown_signal().await?;
    info!("Received signal {}, terminating.", signal);

    runtime.shutdown().await;
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<i32, AmqpError> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate()).map_err(|err| {
        error!(error = err.to_string(), "failure to install SIGTERM handler");
        AmqpError::InternalError
    })?;
    let mut int = signal(SignalKind::interrupt()).map_err(|err| {
        error!(error = err.to_string(), "failure to install SIGINT handler");
        AmqpError::InternalError
    })?;

    tokio::select! {
        _ = term.recv() => Ok(15),
        _ = int.recv() => Ok(2),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<i32, AmqpError> {
    tokio::signal::ctrl_c().await.map_err(|err| {
        error!(error = err.to_string(), "failure to install ctrl-c handler");
        AmqpError::InternalError
    })?;
    Ok(2)
}
