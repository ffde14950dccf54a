//! Top-level engine wiring queues, merge, sync, and archives together.
//!
//! [`MemsyncEngine`] is the one-stop entry point for embedders: register an
//! origin with its encryption key, enqueue tokens as they are captured, and
//! trigger sync sessions when the host's scheduler says so.

use crate::audit::{AuditEntry, AuditLog, AuditOperation};
use crate::config::MemsyncConfig;
use crate::io::{ArchiveService, ExportArchive, ExportFilter};
use crate::merge::{MergeEngine, QuarantineStore};
use crate::models::{
    BatchReport, ConflictDecision, ConflictRecord, MemoryToken, OriginId, TokenId,
};
use crate::queue::{LocalQueueStore, OriginKey};
use crate::storage::{CanonicalStore, InMemoryStore, SqliteStore};
use crate::sync::{SyncCoordinator, SyncReport, SyncTrigger};
use crate::transport::InMemoryTransport;
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::instrument;

struct OriginHandle {
    queue: Arc<LocalQueueStore>,
    coordinator: Arc<SyncCoordinator>,
}

/// Facade over the full sync and merge stack.
///
/// Holds one canonical store, one audit log, and one merge engine, plus a
/// per-origin queue and sync coordinator for every registered origin.
pub struct MemsyncEngine {
    config: MemsyncConfig,
    store: Arc<dyn CanonicalStore>,
    audit: Arc<AuditLog>,
    merge: Arc<MergeEngine>,
    archive: ArchiveService,
    origins: Mutex<HashMap<OriginId, OriginHandle>>,
}

impl MemsyncEngine {
    /// Opens a durable engine rooted at the configured data directory.
    ///
    /// Creates `canonical.db`, `audit.jsonl`, and a `queues/` directory
    /// under `config.data_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the data directory or its stores cannot be
    /// opened.
    pub fn open(config: MemsyncConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir).map_err(|e| Error::OperationFailed {
            operation: "create_data_dir".to_string(),
            cause: e.to_string(),
        })?;
        let store: Arc<dyn CanonicalStore> =
            Arc::new(SqliteStore::new(config.data_dir.join("canonical.db"))?);
        let audit = Arc::new(AuditLog::open(config.data_dir.join("audit.jsonl"))?);
        Ok(Self::assemble(config, store, audit))
    }

    /// Builds an engine over in-memory stores. Nothing survives drop;
    /// intended for tests and experiments.
    #[must_use]
    pub fn in_memory(config: MemsyncConfig) -> Self {
        Self::assemble(config, Arc::new(InMemoryStore::new()), Arc::new(AuditLog::new()))
    }

    fn assemble(
        config: MemsyncConfig,
        store: Arc<dyn CanonicalStore>,
        audit: Arc<AuditLog>,
    ) -> Self {
        let quarantine = Arc::new(QuarantineStore::new(Arc::clone(&audit)));
        let merge = Arc::new(
            MergeEngine::new(
                Arc::clone(&store),
                Arc::clone(&audit),
                quarantine,
                config.policy,
            )
            .with_commit_retry_limit(config.commit_retry_limit),
        );
        let archive = ArchiveService::new(
            Arc::clone(&store),
            Arc::clone(&merge),
            Arc::clone(&audit),
        );
        Self {
            config,
            store,
            audit,
            merge,
            archive,
            origins: Mutex::new(HashMap::new()),
        }
    }

    /// Registers an origin, opening its encrypted local queue.
    ///
    /// Reopening an existing queue requires the key it was written with;
    /// a wrong key fails with [`Error::EncryptionKeyUnavailable`].
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be opened or decrypted.
    #[instrument(skip(self, key), fields(origin = %origin))]
    pub fn register_origin(&self, origin: OriginId, key: &OriginKey) -> Result<()> {
        let queue_dir = self.config.data_dir.join("queues");
        std::fs::create_dir_all(&queue_dir).map_err(|e| Error::OperationFailed {
            operation: "create_queue_dir".to_string(),
            cause: e.to_string(),
        })?;
        let queue = Arc::new(LocalQueueStore::open(&queue_dir, origin.clone(), key)?);
        let coordinator = Arc::new(
            SyncCoordinator::new(
                origin.clone(),
                Arc::clone(&queue),
                Arc::new(InMemoryTransport::new(Arc::clone(&self.merge))),
                Arc::clone(&self.audit),
            )
            .with_retry(self.config.retry.clone())
            .with_batch_size(self.config.batch_size)
            .with_stale_retry_limit(self.config.stale_retry_limit),
        );
        self.lock_origins()?
            .insert(origin, OriginHandle { queue, coordinator });
        Ok(())
    }

    /// Enqueues a locally captured token for its origin.
    ///
    /// The entry is durable before this returns; a crash afterwards loses
    /// nothing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the token's origin is not
    /// registered, and propagates queue failures.
    pub fn enqueue(&self, token: MemoryToken) -> Result<()> {
        let origin = token.origin_id.clone();
        let handle = self.handle(&origin)?;
        let key = handle.queue.enqueue(token.clone())?;
        self.audit.append(
            AuditEntry::new(AuditOperation::Enqueue, origin.as_str())
                .with_token(token.id)
                .with_key(key),
        )?;
        Ok(())
    }

    /// Runs one sync session for an origin.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for an unregistered origin, plus
    /// everything [`SyncCoordinator::sync_once`] returns.
    pub fn sync(&self, origin: &OriginId, trigger: SyncTrigger) -> Result<SyncReport> {
        let handle = self.handle(origin)?;
        handle.coordinator.sync_once(trigger)
    }

    /// Runs one sync session for every registered origin.
    ///
    /// # Errors
    ///
    /// Stops at the first origin whose session fails outright; deferred
    /// sessions are not failures.
    pub fn sync_all(&self, trigger: SyncTrigger) -> Result<Vec<SyncReport>> {
        let coordinators: Vec<Arc<SyncCoordinator>> = self
            .lock_origins()?
            .values()
            .map(|h| Arc::clone(&h.coordinator))
            .collect();
        let mut reports = Vec::with_capacity(coordinators.len());
        for coordinator in coordinators {
            reports.push(coordinator.sync_once(trigger)?);
        }
        Ok(reports)
    }

    /// Number of entries waiting in an origin's queue.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for an unregistered origin.
    pub fn pending_len(&self, origin: &OriginId) -> Result<usize> {
        self.handle(origin)?.queue.pending_len()
    }

    /// Latest canonical token for an id.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn get(&self, id: &TokenId) -> Result<Option<MemoryToken>> {
        self.store.get(id)
    }

    /// Full version history for an id, oldest first.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn history(&self, id: &TokenId) -> Result<Vec<MemoryToken>> {
        self.store.history(id)
    }

    /// Conflicts awaiting manual resolution.
    ///
    /// # Errors
    ///
    /// Propagates merge-engine failures.
    pub fn pending_conflicts(&self) -> Result<Vec<ConflictRecord>> {
        self.merge.pending_conflicts()
    }

    /// Conflicts awaiting manual resolution that one origin raised, in
    /// detection order.
    ///
    /// # Errors
    ///
    /// Propagates merge-engine failures.
    pub fn conflicts_for(&self, origin: &OriginId) -> Result<Vec<ConflictRecord>> {
        self.merge.conflicts_for(origin)
    }

    /// Applies a manual decision to a pending conflict.
    ///
    /// # Errors
    ///
    /// Returns everything [`MergeEngine::resolve_conflict`] returns.
    pub fn resolve_conflict(
        &self,
        id: &TokenId,
        decision: ConflictDecision,
        actor: &str,
    ) -> Result<ConflictRecord> {
        self.merge.resolve_conflict(id, decision, actor)
    }

    /// Exports filtered canonical tokens as an archive.
    ///
    /// # Errors
    ///
    /// Returns everything [`ArchiveService::export`] returns.
    pub fn export(&self, filter: &ExportFilter) -> Result<ExportArchive> {
        self.archive.export(filter)
    }

    /// Exports filtered canonical tokens as JSON.
    ///
    /// # Errors
    ///
    /// Returns everything [`ArchiveService::export_json`] returns.
    pub fn export_json(&self, filter: &ExportFilter) -> Result<String> {
        self.archive.export_json(filter)
    }

    /// Imports an archive through the merge pipeline.
    ///
    /// # Errors
    ///
    /// Returns everything [`ArchiveService::import`] returns.
    pub fn import(&self, archive: &ExportArchive, actor: &str) -> Result<BatchReport> {
        self.archive.import(archive, actor)
    }

    /// Imports an archive from its JSON form.
    ///
    /// # Errors
    ///
    /// Returns everything [`ArchiveService::import_json`] returns.
    pub fn import_json(&self, json: &str, actor: &str) -> Result<BatchReport> {
        self.archive.import_json(json, actor)
    }

    /// The shared audit log.
    #[must_use]
    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    fn handle(&self, origin: &OriginId) -> Result<OriginHandle> {
        let origins = self.lock_origins()?;
        let handle = origins
            .get(origin)
            .ok_or_else(|| Error::InvalidInput(format!("origin '{origin}' is not registered")))?;
        Ok(OriginHandle {
            queue: Arc::clone(&handle.queue),
            coordinator: Arc::clone(&handle.coordinator),
        })
    }

    fn lock_origins(&self) -> Result<std::sync::MutexGuard<'_, HashMap<OriginId, OriginHandle>>> {
        self.origins.lock().map_err(|_| Error::OperationFailed {
            operation: "origin_registry_lock".to_string(),
            cause: "origin registry mutex poisoned".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TokenContent;

    fn engine(dir: &std::path::Path) -> MemsyncEngine {
        MemsyncEngine::open(MemsyncConfig::default().with_data_dir(dir)).unwrap()
    }

    #[test]
    fn test_enqueue_requires_registration() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let token = MemoryToken::new("tok-1", TokenContent::new("note"), "dev-1");
        assert!(matches!(
            engine.enqueue(token).unwrap_err(),
            Error::InvalidInput(_)
        ));
    }

    #[test]
    fn test_enqueue_sync_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let origin = OriginId::from("dev-1");
        engine.register_origin(origin.clone(), &OriginKey::generate()).unwrap();

        engine
            .enqueue(MemoryToken::new("tok-1", TokenContent::new("note"), "dev-1"))
            .unwrap();
        assert_eq!(engine.pending_len(&origin).unwrap(), 1);

        let report = engine.sync(&origin, SyncTrigger::Manual).unwrap();
        assert_eq!(report.merge.applied, 1);
        assert_eq!(engine.pending_len(&origin).unwrap(), 0);

        let stored = engine.get(&TokenId::from("tok-1")).unwrap().unwrap();
        assert_eq!(stored.content.text, "note");
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let origin = OriginId::from("dev-1");
        let key = OriginKey::generate();

        {
            let engine = engine(dir.path());
            engine.register_origin(origin.clone(), &key).unwrap();
            engine
                .enqueue(MemoryToken::new("tok-1", TokenContent::new("note"), "dev-1"))
                .unwrap();
            engine.sync(&origin, SyncTrigger::Manual).unwrap();
            engine
                .enqueue(MemoryToken::new("tok-2", TokenContent::new("queued"), "dev-1"))
                .unwrap();
        }

        let engine = engine(dir.path());
        engine.register_origin(origin.clone(), &key).unwrap();
        // Committed token restored, queued one still pending.
        assert!(engine.get(&TokenId::from("tok-1")).unwrap().is_some());
        assert_eq!(engine.pending_len(&origin).unwrap(), 1);

        let report = engine.sync(&origin, SyncTrigger::Manual).unwrap();
        assert_eq!(report.merge.applied, 1);
    }
}
