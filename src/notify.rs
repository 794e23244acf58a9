// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Reader Wakeup
//!
//! A small cross-task notification primitive: anything holding a clone can
//! wake the reader loop out of its bounded poll so it reacts promptly to stop
//! requests and external events instead of waiting out the poll interval.

use std::sync::Arc;
use tokio::sync::Notify;

/// Wakes the reader loop from any task or thread.
///
/// A wake issued while the loop is busy is stored and consumed by the next
/// wait, so wakeups are never lost.
#[derive(Clone, Default)]
pub struct Notifier {
    inner: Arc<Notify>,
}

impl Notifier {
    pub fn new() -> Self {
        Notifier::default()
    }

    pub fn wake(&self) {
        self.inner.notify_one();
    }

    pub(crate) async fn notified(&self) {
        self.inner.notified().await;
    }
}
