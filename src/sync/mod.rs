//! Per-origin sync coordinator.
//!
//! Drives one origin's queue through a sync session: drain a batch, deliver
//! it over the transport channel, then acknowledge queue entries strictly
//! according to the verdicts that come back. Scheduling lives outside this
//! crate; callers invoke [`SyncCoordinator::sync_once`] manually or from
//! their own timer.

use crate::audit::{AuditEntry, AuditLog, AuditOperation, AuditOutcome};
use crate::config::RetryConfig;
use crate::models::{BatchReport, MergeOutcome, OriginId};
use crate::queue::LocalQueueStore;
use crate::transport::TransportChannel;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::instrument;

/// What started a sync session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncTrigger {
    /// Explicit user or API request.
    Manual,
    /// External scheduler tick.
    Scheduled,
}

/// Coordinator lifecycle state, observable between sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// No session in progress.
    Idle,
    /// Draining the next batch from the local queue.
    Batching,
    /// Batch handed to the transport channel.
    Transmitting,
    /// Applying verdicts to the local queue.
    AwaitingCommit,
    /// Waiting out a backoff delay after a transient delivery failure.
    RetryBackoff,
}

/// Outcome of one sync session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Origin the session ran for.
    pub origin: String,
    /// Batches delivered.
    pub batches: usize,
    /// Total delivery attempts, failed ones included.
    pub attempts: u32,
    /// Queue entries acknowledged on terminal verdicts.
    pub acknowledged: usize,
    /// Stale entries retained for another delivery.
    pub stale_retained: usize,
    /// Stale entries that exhausted their retries and were archived.
    pub stale_archived: usize,
    /// Entries left queued behind pending conflicts.
    pub left_queued: usize,
    /// `true` if delivery failures exhausted the retry budget and the
    /// remaining queue was left intact for a later session.
    pub deferred: bool,
    /// Aggregated merge verdicts across the session's batches.
    pub merge: BatchReport,
}

impl SyncReport {
    /// Returns a human-readable summary.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "batches: {}, attempts: {}, acknowledged: {}, stale retained: {}, \
             stale archived: {}, left queued: {}, deferred: {}; {}",
            self.batches,
            self.attempts,
            self.acknowledged,
            self.stale_retained,
            self.stale_archived,
            self.left_queued,
            self.deferred,
            self.merge.summary()
        )
    }
}

/// Per-origin sync state machine.
///
/// One coordinator owns one origin's queue. Sessions are serialized; a
/// second `sync_once` while one is in flight is rejected rather than
/// interleaved.
pub struct SyncCoordinator {
    origin: OriginId,
    queue: Arc<LocalQueueStore>,
    transport: Arc<dyn TransportChannel>,
    audit: Arc<AuditLog>,
    retry: RetryConfig,
    batch_size: usize,
    stale_retry_limit: u32,
    state: Mutex<SyncState>,
}

impl SyncCoordinator {
    /// Creates a coordinator for one origin's queue.
    #[must_use]
    pub fn new(
        origin: OriginId,
        queue: Arc<LocalQueueStore>,
        transport: Arc<dyn TransportChannel>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            origin,
            queue,
            transport,
            audit,
            retry: RetryConfig::default(),
            batch_size: 64,
            stale_retry_limit: 3,
            state: Mutex::new(SyncState::Idle),
        }
    }

    /// Replaces the retry/backoff parameters.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the maximum entries per delivered batch.
    #[must_use]
    pub const fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Sets how many stale verdicts an entry survives before archival.
    #[must_use]
    pub const fn with_stale_retry_limit(mut self, limit: u32) -> Self {
        self.stale_retry_limit = limit;
        self
    }

    /// Current lifecycle state.
    ///
    /// # Errors
    ///
    /// Returns an error if the coordinator is unavailable.
    pub fn state(&self) -> Result<SyncState> {
        Ok(*self.lock_state()?)
    }

    /// Runs one sync session to completion.
    ///
    /// Batches are drained and delivered until the queue is exhausted or no
    /// further progress is possible (everything left is pending a conflict).
    /// Transient delivery failures back off exponentially; once the retry
    /// budget is spent the session defers, leaving the remaining queue
    /// intact for a later trigger.
    ///
    /// # Errors
    ///
    /// Returns an error for queue or transport failures that are not
    /// retryable, and [`Error::InvalidInput`] if a session is already in
    /// flight.
    #[instrument(skip(self), fields(origin = %self.origin))]
    pub fn sync_once(&self, trigger: SyncTrigger) -> Result<SyncReport> {
        self.enter_session()?;
        let result = self.run_session(trigger);
        self.set_state(SyncState::Idle)?;
        result
    }

    fn run_session(&self, trigger: SyncTrigger) -> Result<SyncReport> {
        let mut report = SyncReport {
            origin: self.origin.to_string(),
            ..SyncReport::default()
        };
        metrics::counter!("memsync_sync_sessions_total", "trigger" => match trigger {
            SyncTrigger::Manual => "manual",
            SyncTrigger::Scheduled => "scheduled",
        })
        .increment(1);

        loop {
            self.set_state(SyncState::Batching)?;
            let entries = self.queue.drain(self.batch_size)?;
            if entries.is_empty() {
                break;
            }
            let drained = entries.len();

            self.set_state(SyncState::Transmitting)?;
            let Some(batch_report) = self.deliver_with_backoff(entries, &mut report)? else {
                report.deferred = true;
                metrics::counter!("memsync_sync_deferred_total").increment(1);
                break;
            };
            report.batches += 1;

            self.set_state(SyncState::AwaitingCommit)?;
            let progressed = self.apply_verdicts(&batch_report, &mut report)?;
            for verdict in batch_report.verdicts {
                report.merge.record(verdict);
            }

            if drained < self.batch_size || !progressed {
                break;
            }
        }

        self.audit.append(
            AuditEntry::new(AuditOperation::Sync, self.origin.as_str())
                .with_outcome(if report.deferred {
                    AuditOutcome::Failure
                } else {
                    AuditOutcome::Success
                })
                .with_note(report.summary()),
        )?;
        tracing::info!(origin = %self.origin, "{}", report.summary());
        Ok(report)
    }

    /// Delivers one batch, backing off between transient failures.
    /// Returns `None` once the retry budget is exhausted.
    fn deliver_with_backoff(
        &self,
        entries: Vec<crate::models::QueueEntry>,
        report: &mut SyncReport,
    ) -> Result<Option<BatchReport>> {
        for attempt in 0..=self.retry.max_retries {
            report.attempts += 1;
            match self.transport.deliver(&self.origin, entries.clone()) {
                Ok(batch_report) => return Ok(Some(batch_report)),
                Err(err) if err.is_transient() && attempt < self.retry.max_retries => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    tracing::warn!(
                        origin = %self.origin,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient delivery failure; backing off"
                    );
                    self.set_state(SyncState::RetryBackoff)?;
                    std::thread::sleep(delay);
                    self.set_state(SyncState::Transmitting)?;
                },
                Err(err) if err.is_transient() => {
                    tracing::warn!(origin = %self.origin, error = %err, "Retry budget exhausted; sync deferred");
                    return Ok(None);
                },
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }

    /// Acknowledges queue entries per verdict. Returns `true` if any entry
    /// left the queue, so the session loop can tell progress from spinning
    /// on pending conflicts.
    fn apply_verdicts(&self, batch: &BatchReport, report: &mut SyncReport) -> Result<bool> {
        let mut progressed = false;
        for verdict in &batch.verdicts {
            match verdict.outcome {
                MergeOutcome::Stale => {
                    let seen = self.queue.record_stale(&verdict.idempotency_key)?;
                    if seen >= self.stale_retry_limit {
                        self.queue.acknowledge(&verdict.idempotency_key)?;
                        self.audit.append(
                            AuditEntry::new(AuditOperation::StaleArchived, self.origin.as_str())
                                .with_token(verdict.token_id.clone())
                                .with_key(verdict.idempotency_key.clone())
                                .with_note(format!("archived after {seen} stale deliveries")),
                        )?;
                        report.stale_archived += 1;
                        progressed = true;
                    } else {
                        report.stale_retained += 1;
                    }
                },
                MergeOutcome::ManualPending => {
                    report.left_queued += 1;
                },
                _ => {
                    self.queue.acknowledge(&verdict.idempotency_key)?;
                    report.acknowledged += 1;
                    progressed = true;
                },
            }
        }
        Ok(progressed)
    }

    fn enter_session(&self) -> Result<()> {
        let mut state = self.lock_state()?;
        if *state != SyncState::Idle {
            return Err(Error::InvalidInput(format!(
                "sync already in progress for '{}'",
                self.origin
            )));
        }
        *state = SyncState::Batching;
        Ok(())
    }

    fn set_state(&self, next: SyncState) -> Result<()> {
        *self.lock_state()? = next;
        Ok(())
    }

    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, SyncState>> {
        self.state.lock().map_err(|_| Error::OperationFailed {
            operation: "sync_state_lock".to_string(),
            cause: "sync state mutex poisoned".to_string(),
        })
    }
}
