//! Per-batch execution events
//!
//! The bridge reports every batch it runs to an [`ExecutionObserver`] passed
//! in by the caller. There is no process-wide registry; a [`ThreadTracker`]
//! is just one observer that remembers which worker threads showed up.

use crate::backend::Method;
use dashmap::DashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::ThreadId;
use std::time::Duration;

/// One batch processed by the distance function
#[derive(Debug, Clone)]
pub struct BatchEvent {
    /// Backend that computed the batch
    pub method: Method,
    /// Rows in the batch
    pub rows: usize,
    /// Rows whose output is null because an input was null
    pub nulls: usize,
    /// Thread that ran the batch
    pub thread: ThreadId,
    /// Time spent in the backend
    pub elapsed: Duration,
}

/// Receiver of per-batch events
pub trait ExecutionObserver: Send + Sync {
    /// Called once per batch, after the backend returned
    fn on_batch(&self, event: &BatchEvent);
}

impl<F> ExecutionObserver for F
where
    F: Fn(&BatchEvent) + Send + Sync,
{
    fn on_batch(&self, event: &BatchEvent) {
        self(event);
    }
}

/// Observer that ignores every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ExecutionObserver for NoopObserver {
    fn on_batch(&self, _event: &BatchEvent) {}
}

/// Records distinct worker threads plus batch and row totals
#[derive(Debug, Default)]
pub struct ThreadTracker {
    threads: DashSet<ThreadId>,
    batches: AtomicU64,
    rows: AtomicU64,
}

impl ThreadTracker {
    /// Create an empty tracker
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct threads that ran at least one batch
    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// Distinct threads seen so far
    #[must_use]
    pub fn threads(&self) -> Vec<ThreadId> {
        self.threads.iter().map(|t| *t).collect()
    }

    /// Batches observed
    #[must_use]
    pub fn batch_count(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    /// Rows observed
    #[must_use]
    pub fn row_count(&self) -> u64 {
        self.rows.load(Ordering::Relaxed)
    }
}

impl ExecutionObserver for ThreadTracker {
    fn on_batch(&self, event: &BatchEvent) {
        self.threads.insert(event.thread);
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.rows.fetch_add(event.rows as u64, Ordering::Relaxed);
    }
}
