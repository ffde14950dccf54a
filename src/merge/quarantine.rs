//! Quarantine staging for incoming batches.
//!
//! A staged batch is invisible to canonical-store readers until the merge
//! engine commits its decisions; `abort` discards all staged state with no
//! side effects other than an audit entry recording the abort and its cause.
//! Batches from different origins may stage concurrently.

use crate::audit::{AuditEntry, AuditLog, AuditOperation, AuditOutcome};
use crate::models::{BatchId, BatchState, OriginId, QuarantineBatch, QueueEntry};
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Staging area for uncommitted incoming batches.
pub struct QuarantineStore {
    batches: Mutex<HashMap<BatchId, QuarantineBatch>>,
    audit: Arc<AuditLog>,
}

impl QuarantineStore {
    /// Creates an empty quarantine store sharing the given audit log.
    #[must_use]
    pub fn new(audit: Arc<AuditLog>) -> Self {
        Self {
            batches: Mutex::new(HashMap::new()),
            audit,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<BatchId, QuarantineBatch>>> {
        self.batches.lock().map_err(|_| Error::OperationFailed {
            operation: "quarantine_lock".to_string(),
            cause: "quarantine mutex poisoned".to_string(),
        })
    }

    /// Stages an incoming batch, returning its id.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    pub fn stage(&self, origin: OriginId, entries: Vec<QueueEntry>) -> Result<BatchId> {
        let batch = QuarantineBatch::new(origin, entries);
        let batch_id = batch.batch_id.clone();
        tracing::debug!(batch = %batch_id, entries = batch.len(), "Batch staged");
        self.lock()?.insert(batch_id.clone(), batch);
        Ok(batch_id)
    }

    /// Returns a snapshot of a staged batch.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the batch is unknown.
    pub fn snapshot(&self, batch_id: &BatchId) -> Result<QuarantineBatch> {
        self.lock()?
            .get(batch_id)
            .cloned()
            .ok_or_else(|| Error::InvalidInput(format!("unknown batch '{batch_id}'")))
    }

    /// Advances a staged batch's lifecycle state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the batch is unknown.
    pub fn set_state(&self, batch_id: &BatchId, state: BatchState) -> Result<()> {
        let mut batches = self.lock()?;
        let batch = batches
            .get_mut(batch_id)
            .ok_or_else(|| Error::InvalidInput(format!("unknown batch '{batch_id}'")))?;
        batch.state = state;
        Ok(())
    }

    /// Removes a fully merged batch from quarantine.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the batch is unknown.
    pub fn finish(&self, batch_id: &BatchId) -> Result<QuarantineBatch> {
        let mut batch = self
            .lock()?
            .remove(batch_id)
            .ok_or_else(|| Error::InvalidInput(format!("unknown batch '{batch_id}'")))?;
        batch.state = BatchState::Committed;
        Ok(batch)
    }

    /// Discards a staged batch, auditing the abort and its cause.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the batch is unknown.
    pub fn abort(&self, batch_id: &BatchId, cause: &str) -> Result<()> {
        let batch = self
            .lock()?
            .remove(batch_id)
            .ok_or_else(|| Error::InvalidInput(format!("unknown batch '{batch_id}'")))?;
        tracing::warn!(batch = %batch_id, cause, "Batch aborted");
        self.audit.append(
            AuditEntry::new(AuditOperation::BatchAborted, batch.origin.to_string())
                .with_outcome(AuditOutcome::Failure)
                .with_note(format!("batch '{batch_id}' aborted: {cause}")),
        )?;
        Ok(())
    }

    /// Number of currently staged batches.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    pub fn staged_len(&self) -> Result<usize> {
        Ok(self.lock()?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MemoryToken, TokenContent};

    fn entries(n: usize) -> Vec<QueueEntry> {
        (0..n)
            .map(|i| {
                QueueEntry::new(MemoryToken::new(
                    format!("tok-{i}").as_str(),
                    TokenContent::new("note"),
                    "dev-1",
                ))
            })
            .collect()
    }

    #[test]
    fn test_stage_snapshot_finish() {
        let store = QuarantineStore::new(Arc::new(AuditLog::new()));
        let batch_id = store.stage(OriginId::from("dev-1"), entries(3)).unwrap();

        let snapshot = store.snapshot(&batch_id).unwrap();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot.state, BatchState::Received);

        store.set_state(&batch_id, BatchState::Merging).unwrap();
        let finished = store.finish(&batch_id).unwrap();
        assert_eq!(finished.state, BatchState::Committed);
        assert_eq!(store.staged_len().unwrap(), 0);
    }

    #[test]
    fn test_abort_audits_cause() {
        let audit = Arc::new(AuditLog::new());
        let store = QuarantineStore::new(Arc::clone(&audit));
        let batch_id = store.stage(OriginId::from("dev-1"), entries(1)).unwrap();

        store.abort(&batch_id, "transport checksum mismatch").unwrap();
        assert_eq!(store.staged_len().unwrap(), 0);

        let recent = audit.recent(1).unwrap();
        assert_eq!(recent[0].operation, AuditOperation::BatchAborted);
        assert!(recent[0]
            .note
            .as_deref()
            .unwrap()
            .contains("transport checksum mismatch"));
    }

    #[test]
    fn test_unknown_batch_is_invalid_input() {
        let store = QuarantineStore::new(Arc::new(AuditLog::new()));
        let missing = BatchId::generate();
        assert!(matches!(
            store.snapshot(&missing).unwrap_err(),
            Error::InvalidInput(_)
        ));
    }

    #[test]
    fn test_concurrent_origins_stage_independently() {
        let store = QuarantineStore::new(Arc::new(AuditLog::new()));
        let a = store.stage(OriginId::from("dev-a"), entries(2)).unwrap();
        let b = store.stage(OriginId::from("dev-b"), entries(2)).unwrap();
        assert_ne!(a, b);
        assert_eq!(store.staged_len().unwrap(), 2);
    }
}
