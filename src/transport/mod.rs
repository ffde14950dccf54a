//! Transport channel abstraction.
//!
//! The sync coordinator hands batches to a [`TransportChannel`] and gets the
//! remote merge verdicts back; everything about framing, transport security,
//! and remote invocation lives behind this seam. Channel failures surface as
//! [`crate::Error::Transient`] so the coordinator's backoff logic treats them
//! uniformly.

use crate::merge::MergeEngine;
use crate::models::{BatchReport, OriginId, QueueEntry};
use crate::{Error, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Delivery seam between an origin's sync coordinator and the merge side.
pub trait TransportChannel: Send + Sync {
    /// Delivers a batch and returns the per-token merge verdicts.
    ///
    /// Delivery is at-least-once: a batch may arrive more than once after a
    /// lost acknowledgement, and the merge side absorbs the replay.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Transient`] for channel failures worth
    /// retrying.
    fn deliver(&self, origin: &OriginId, entries: Vec<QueueEntry>) -> Result<BatchReport>;
}

/// Loopback channel that merges directly into a local engine.
///
/// The production shape for single-host deployments, and the reference
/// channel the integration tests run against.
pub struct InMemoryTransport {
    engine: Arc<MergeEngine>,
}

impl InMemoryTransport {
    /// Creates a loopback channel over the given merge engine.
    #[must_use]
    pub fn new(engine: Arc<MergeEngine>) -> Self {
        Self { engine }
    }
}

impl TransportChannel for InMemoryTransport {
    fn deliver(&self, origin: &OriginId, entries: Vec<QueueEntry>) -> Result<BatchReport> {
        self.engine.stage_and_merge(origin, entries)
    }
}

/// Channel wrapper that fails a fixed number of deliveries first.
///
/// Failure-injection aid for exercising retry and backoff paths.
pub struct FlakyTransport<T> {
    inner: T,
    remaining_failures: AtomicU32,
    attempts: AtomicU32,
}

impl<T: TransportChannel> FlakyTransport<T> {
    /// Wraps a channel; the first `failures` deliveries return a transient
    /// error before anything reaches the inner channel.
    #[must_use]
    pub const fn new(inner: T, failures: u32) -> Self {
        Self {
            inner,
            remaining_failures: AtomicU32::new(failures),
            attempts: AtomicU32::new(0),
        }
    }

    /// Total delivery attempts observed, failed ones included.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl<T: TransportChannel> TransportChannel for FlakyTransport<T> {
    fn deliver(&self, origin: &OriginId, entries: Vec<QueueEntry>) -> Result<BatchReport> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.remaining_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.remaining_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::Transient {
                operation: "transport_deliver".to_string(),
                cause: format!("injected failure, {} more to go", remaining - 1),
            });
        }
        self.inner.deliver(origin, entries)
    }
}
