//! Merge engine: classification, conflict resolution, atomic commit.
//!
//! Consumes staged batches from quarantine and drives each incoming token to
//! a verdict: integrity check, idempotent-replay absorption, classification
//! against the canonical record, policy consultation for conflicts, then a
//! per-id atomic commit guarded by optimistic concurrency. A failure on one
//! token never aborts the rest of the batch.

pub mod policy;
pub mod quarantine;

pub use policy::{PolicyDecision, RelevanceScorer, ResolutionPolicy};
pub use quarantine::QuarantineStore;

use crate::audit::{AuditEntry, AuditLog, AuditOperation, AuditOutcome};
use crate::authz::{AllowAll, Authorizer, AuthzDecision};
use crate::models::{
    BatchId, BatchReport, BatchState, ConflictDecision, ConflictRecord, ConflictResolution,
    IdempotencyKey, MemoryToken, MergeOutcome, MergeVerdict, OriginId, QueueEntry, TokenId,
};
use crate::storage::CanonicalStore;
use crate::{Error, Result};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::instrument;

/// A raised conflict together with the incoming token it holds hostage,
/// kept so a manual `KeepIncoming` decision can still commit it.
struct PendingConflict {
    record: ConflictRecord,
    incoming: MemoryToken,
}

/// Merge engine over a canonical store.
///
/// Commits are serialized per token id; distinct ids proceed independently.
/// Atomicity is per id, not per batch.
pub struct MergeEngine {
    store: Arc<dyn CanonicalStore>,
    audit: Arc<AuditLog>,
    quarantine: Arc<QuarantineStore>,
    policy: ResolutionPolicy,
    authorizer: Arc<dyn Authorizer>,
    scorer: Option<Arc<dyn RelevanceScorer>>,
    commit_retry_limit: u32,
    id_locks: Mutex<HashMap<TokenId, Arc<Mutex<()>>>>,
    conflicts: Mutex<Vec<PendingConflict>>,
}

impl MergeEngine {
    /// Creates a merge engine with the default (allow-all) authorizer.
    #[must_use]
    pub fn new(
        store: Arc<dyn CanonicalStore>,
        audit: Arc<AuditLog>,
        quarantine: Arc<QuarantineStore>,
        policy: ResolutionPolicy,
    ) -> Self {
        Self {
            store,
            audit,
            quarantine,
            policy,
            authorizer: Arc::new(AllowAll),
            scorer: None,
            commit_retry_limit: 3,
            id_locks: Mutex::new(HashMap::new()),
            conflicts: Mutex::new(Vec::new()),
        }
    }

    /// Replaces the authorization collaborator.
    #[must_use]
    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    /// Attaches a relevance scorer for the relevance-weighted policy.
    #[must_use]
    pub fn with_scorer(mut self, scorer: Arc<dyn RelevanceScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    /// Bounds how many optimistic-concurrency retries a commit gets before
    /// the id is deferred to manual resolution.
    #[must_use]
    pub const fn with_commit_retry_limit(mut self, limit: u32) -> Self {
        self.commit_retry_limit = limit;
        self
    }

    /// Active resolution policy.
    #[must_use]
    pub const fn policy(&self) -> ResolutionPolicy {
        self.policy
    }

    /// Stages entries as a batch and merges it in one call.
    ///
    /// # Errors
    ///
    /// Returns an error if staging fails or the batch cannot be processed.
    pub fn stage_and_merge(
        &self,
        origin: &OriginId,
        entries: Vec<QueueEntry>,
    ) -> Result<BatchReport> {
        let batch_id = self.quarantine.stage(origin.clone(), entries)?;
        self.merge_batch(&batch_id)
    }

    /// Merges a staged batch, producing a per-token verdict report.
    ///
    /// Entries sharing an id and content hash collapse to the highest
    /// version before classification. Verdicts come back in batch order.
    ///
    /// # Errors
    ///
    /// Returns an error only for batch-level failures (unknown batch,
    /// unavailable stores); per-token failures become verdicts instead.
    #[instrument(skip(self), fields(batch = %batch_id))]
    pub fn merge_batch(&self, batch_id: &BatchId) -> Result<BatchReport> {
        self.quarantine.set_state(batch_id, BatchState::Validating)?;
        let batch = self.quarantine.snapshot(batch_id)?;
        let survivors = collapse_duplicates(&batch.entries);
        self.quarantine.set_state(batch_id, BatchState::Merging)?;

        let mut report = BatchReport::default();
        for (index, entry) in batch.entries.iter().enumerate() {
            let verdict = match survivors.get(&index) {
                Some(None) => self.process_entry(&batch.origin, entry),
                Some(Some(winner_key)) => Ok(MergeVerdict {
                    idempotency_key: entry.idempotency_key.clone(),
                    token_id: entry.token.id.clone(),
                    outcome: MergeOutcome::Duplicate,
                    note: Some(format!("collapsed into '{winner_key}'")),
                }),
                // collapse_duplicates covers every index
                None => continue,
            };
            let verdict = match verdict {
                Ok(verdict) => verdict,
                Err(err) => self.deferral_verdict(entry, &err),
            };
            metrics::counter!("memsync_merge_total", "outcome" => verdict.outcome.as_label())
                .increment(1);
            report.record(verdict);
        }

        self.quarantine.finish(batch_id)?;
        metrics::histogram!("memsync_merge_batch_size").record(report.total() as f64);
        tracing::info!(batch = %batch_id, origin = %batch.origin, "{}", report.summary());
        Ok(report)
    }

    /// Per-token failures degrade to a non-terminal verdict so the owning
    /// queue entry stays queued and the rest of the batch proceeds.
    fn deferral_verdict(&self, entry: &QueueEntry, err: &Error) -> MergeVerdict {
        tracing::warn!(
            token = %entry.token.id,
            error = %err,
            "Merge deferred; entry remains queued"
        );
        MergeVerdict {
            idempotency_key: entry.idempotency_key.clone(),
            token_id: entry.token.id.clone(),
            outcome: MergeOutcome::ManualPending,
            note: Some(format!("deferred: {err}")),
        }
    }

    fn process_entry(&self, origin: &OriginId, entry: &QueueEntry) -> Result<MergeVerdict> {
        let token = &entry.token;
        let key = &entry.idempotency_key;

        if let Err(err) = token.verify_hash() {
            self.audit.append(
                AuditEntry::new(AuditOperation::MergeReject, origin.as_str())
                    .with_token(token.id.clone())
                    .with_key(key.clone())
                    .with_outcome(AuditOutcome::Failure)
                    .with_note(err.to_string()),
            )?;
            return Ok(MergeVerdict {
                idempotency_key: key.clone(),
                token_id: token.id.clone(),
                outcome: MergeOutcome::Corrupt,
                note: Some(err.to_string()),
            });
        }

        // Idempotent replay: a committed operation for this key already
        // exists, so redelivery is absorbed without touching canonical
        // state or version numbers.
        if self.audit.is_committed(key)? {
            return Ok(MergeVerdict {
                idempotency_key: key.clone(),
                token_id: token.id.clone(),
                outcome: MergeOutcome::AlreadyApplied,
                note: None,
            });
        }

        let id_lock = self.id_lock(&token.id)?;
        let _guard = lock_or_fail(&id_lock, "merge_id_lock")?;

        let mut attempt: u32 = 0;
        loop {
            let result = match self.store.get(&token.id)? {
                None => self.commit_insert(origin, token, key),
                Some(canonical) => self.classify(origin, token, key, &canonical),
            };
            match result {
                Err(Error::VersionConflict { .. }) if attempt < self.commit_retry_limit => {
                    attempt += 1;
                    tracing::debug!(token = %token.id, attempt, "Commit lost optimistic race; re-evaluating");
                    continue;
                },
                Err(Error::VersionConflict { .. }) => {
                    let canonical = self.store.get(&token.id)?;
                    return self.raise_conflict(
                        origin,
                        token,
                        key,
                        canonical.as_ref(),
                        "commit retries exhausted against a moving canonical record",
                    );
                },
                other => return other,
            }
        }
    }

    /// Classifies an incoming token against the current canonical record.
    ///
    /// A `VersionConflict` from the guarded write propagates so the caller's
    /// retry loop can re-read and re-classify.
    fn classify(
        &self,
        origin: &OriginId,
        token: &MemoryToken,
        key: &IdempotencyKey,
        canonical: &MemoryToken,
    ) -> Result<MergeVerdict> {
        match token.version.cmp(&canonical.version) {
            Ordering::Less => {
                let note = format!(
                    "stale write: incoming version {} behind canonical {}",
                    token.version, canonical.version
                );
                self.audit.append(
                    AuditEntry::new(AuditOperation::MergeStale, origin.as_str())
                        .with_token(token.id.clone())
                        .with_key(key.clone())
                        .with_before_hash(&canonical.content_hash)
                        .with_note(&note),
                )?;
                Ok(MergeVerdict {
                    idempotency_key: key.clone(),
                    token_id: token.id.clone(),
                    outcome: MergeOutcome::Stale,
                    note: Some(note),
                })
            },
            Ordering::Greater if canonical.content_hash == token.content_hash => self
                .commit_replace(
                    origin,
                    token,
                    key,
                    canonical,
                    MergeOutcome::Superseded,
                    "newer version of identical content",
                ),
            Ordering::Greater => match self.policy.decide_newer(token, canonical) {
                PolicyDecision::KeepIncoming { note } => self.commit_replace(
                    origin,
                    token,
                    key,
                    canonical,
                    MergeOutcome::Superseded,
                    &note,
                ),
                PolicyDecision::KeepCanonical { note } => {
                    self.settle_for_canonical(origin, token, key, canonical, &note)
                },
                PolicyDecision::Manual => self.raise_conflict(
                    origin,
                    token,
                    key,
                    Some(canonical),
                    "policy defers newer versions to manual resolution",
                ),
            },
            Ordering::Equal => {
                if canonical.content_hash == token.content_hash {
                    self.audit.append(
                        AuditEntry::new(AuditOperation::MergeDuplicate, origin.as_str())
                            .with_token(token.id.clone())
                            .with_key(key.clone())
                            .with_before_hash(&canonical.content_hash)
                            .with_after_hash(&canonical.content_hash),
                    )?;
                    return Ok(MergeVerdict {
                        idempotency_key: key.clone(),
                        token_id: token.id.clone(),
                        outcome: MergeOutcome::Duplicate,
                        note: None,
                    });
                }
                let decision =
                    self.policy
                        .decide_collision(token, canonical, self.scorer.as_deref());
                match decision {
                    Ok(PolicyDecision::KeepIncoming { note }) => self.commit_replace(
                        origin,
                        token,
                        key,
                        canonical,
                        MergeOutcome::AutoMerged,
                        &note,
                    ),
                    Ok(PolicyDecision::KeepCanonical { note }) => {
                        self.settle_for_canonical(origin, token, key, canonical, &note)
                    },
                    Ok(PolicyDecision::Manual) => self.raise_conflict(
                        origin,
                        token,
                        key,
                        Some(canonical),
                        "policy defers concurrent writes to manual resolution",
                    ),
                    Err(err @ Error::PolicyUnavailable(_)) => {
                        self.raise_conflict(origin, token, key, Some(canonical), &err.to_string())
                    },
                    Err(err) => Err(err),
                }
            },
        }
    }

    /// Inserts a token with no canonical predecessor.
    fn commit_insert(
        &self,
        origin: &OriginId,
        token: &MemoryToken,
        key: &IdempotencyKey,
    ) -> Result<MergeVerdict> {
        if let Some(denied) = self.check_authorized(origin, token, key)? {
            return Ok(denied);
        }
        self.store.put(token, None)?;
        self.audit.append(
            AuditEntry::new(AuditOperation::MergeCommit, origin.as_str())
                .with_token(token.id.clone())
                .with_key(key.clone())
                .with_after_hash(&token.content_hash),
        )?;
        Ok(MergeVerdict {
            idempotency_key: key.clone(),
            token_id: token.id.clone(),
            outcome: MergeOutcome::Applied,
            note: None,
        })
    }

    /// Replaces the canonical record under its expected version.
    fn commit_replace(
        &self,
        origin: &OriginId,
        token: &MemoryToken,
        key: &IdempotencyKey,
        canonical: &MemoryToken,
        outcome: MergeOutcome,
        note: &str,
    ) -> Result<MergeVerdict> {
        if let Some(denied) = self.check_authorized(origin, token, key)? {
            return Ok(denied);
        }
        self.store.put(token, Some(canonical.version))?;
        self.audit.append(
            AuditEntry::new(AuditOperation::MergeCommit, origin.as_str())
                .with_token(token.id.clone())
                .with_key(key.clone())
                .with_before_hash(&canonical.content_hash)
                .with_after_hash(&token.content_hash)
                .with_note(note),
        )?;
        Ok(MergeVerdict {
            idempotency_key: key.clone(),
            token_id: token.id.clone(),
            outcome,
            note: Some(note.to_string()),
        })
    }

    /// Terminally absorbs an incoming token the policy decided against.
    ///
    /// Audited as a resolved conflict so redelivery of the losing write
    /// drains as already-applied.
    fn settle_for_canonical(
        &self,
        origin: &OriginId,
        token: &MemoryToken,
        key: &IdempotencyKey,
        canonical: &MemoryToken,
        note: &str,
    ) -> Result<MergeVerdict> {
        self.audit.append(
            AuditEntry::new(AuditOperation::ConflictResolved, origin.as_str())
                .with_token(token.id.clone())
                .with_key(key.clone())
                .with_before_hash(&canonical.content_hash)
                .with_after_hash(&canonical.content_hash)
                .with_note(note),
        )?;
        Ok(MergeVerdict {
            idempotency_key: key.clone(),
            token_id: token.id.clone(),
            outcome: MergeOutcome::CanonicalKept,
            note: Some(note.to_string()),
        })
    }

    /// Returns a denial verdict if the authorizer rejects the commit.
    fn check_authorized(
        &self,
        origin: &OriginId,
        token: &MemoryToken,
        key: &IdempotencyKey,
    ) -> Result<Option<MergeVerdict>> {
        if self.authorizer.authorize(origin.as_str(), "merge_commit", &token.id)
            == AuthzDecision::Allow
        {
            return Ok(None);
        }
        let note = format!("commit denied for '{}'", token.id);
        self.audit.append(
            AuditEntry::new(AuditOperation::MergeReject, origin.as_str())
                .with_token(token.id.clone())
                .with_key(key.clone())
                .with_outcome(AuditOutcome::Denied)
                .with_note(&note),
        )?;
        Ok(Some(MergeVerdict {
            idempotency_key: key.clone(),
            token_id: token.id.clone(),
            outcome: MergeOutcome::AuthorizationRejected,
            note: Some(note),
        }))
    }

    /// Registers a pending conflict for manual resolution.
    fn raise_conflict(
        &self,
        origin: &OriginId,
        token: &MemoryToken,
        key: &IdempotencyKey,
        canonical: Option<&MemoryToken>,
        cause: &str,
    ) -> Result<MergeVerdict> {
        let verdict = MergeVerdict {
            idempotency_key: key.clone(),
            token_id: token.id.clone(),
            outcome: MergeOutcome::ManualPending,
            note: Some(cause.to_string()),
        };

        let mut conflicts = self.lock_conflicts()?;
        // Redelivery while a conflict is already pending raises nothing new.
        if conflicts
            .iter()
            .any(|c| c.record.idempotency_key == *key && c.record.is_pending())
        {
            return Ok(verdict);
        }

        let record = ConflictRecord {
            id: token.id.clone(),
            incoming_version: token.version,
            canonical_version: canonical.map_or(0, |c| c.version),
            incoming_hash: token.content_hash.clone(),
            canonical_hash: canonical.map_or_else(String::new, |c| c.content_hash.clone()),
            origin: origin.clone(),
            idempotency_key: key.clone(),
            detected_at: crate::current_timestamp(),
            resolution: ConflictResolution::ManualPending,
        };
        conflicts.push(PendingConflict {
            record,
            incoming: token.clone(),
        });
        drop(conflicts);

        metrics::counter!("memsync_conflicts_raised_total").increment(1);
        self.audit.append(
            AuditEntry::new(AuditOperation::MergeConflict, origin.as_str())
                .with_token(token.id.clone())
                .with_key(key.clone())
                .with_before_hash(canonical.map_or("", |c| c.content_hash.as_str()))
                .with_after_hash(&token.content_hash)
                .with_note(cause),
        )?;
        Ok(verdict)
    }

    /// Returns every conflict still awaiting manual resolution.
    ///
    /// # Errors
    ///
    /// Returns an error if the conflict registry is unavailable.
    pub fn pending_conflicts(&self) -> Result<Vec<ConflictRecord>> {
        Ok(self
            .lock_conflicts()?
            .iter()
            .map(|c| c.record.clone())
            .collect())
    }

    /// Returns pending conflicts raised by one origin.
    ///
    /// # Errors
    ///
    /// Returns an error if the conflict registry is unavailable.
    pub fn conflicts_for(&self, origin: &OriginId) -> Result<Vec<ConflictRecord>> {
        Ok(self
            .lock_conflicts()?
            .iter()
            .filter(|c| c.record.origin == *origin)
            .map(|c| c.record.clone())
            .collect())
    }

    /// Applies a manual decision to the oldest pending conflict for an id.
    ///
    /// `KeepIncoming` commits the held incoming token over the current
    /// canonical record; `KeepCanonical` terminally rejects it. Either way
    /// the resolution is audited under the incoming write's idempotency key,
    /// so its still-queued entry drains as already-applied on the next sync.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if no conflict is pending for the id,
    /// [`Error::AuthorizationRejected`] if the authorizer denies a
    /// `KeepIncoming` commit, and propagates store errors if the chosen
    /// commit cannot be applied. A denied or failed commit leaves the
    /// conflict pending.
    #[instrument(skip(self), fields(token = %id))]
    pub fn resolve_conflict(
        &self,
        id: &TokenId,
        decision: ConflictDecision,
        actor: &str,
    ) -> Result<ConflictRecord> {
        let pending = {
            let mut conflicts = self.lock_conflicts()?;
            let position = conflicts
                .iter()
                .position(|c| c.record.id == *id && c.record.is_pending())
                .ok_or_else(|| {
                    Error::InvalidInput(format!("no pending conflict for '{id}'"))
                })?;
            conflicts.remove(position)
        };

        let id_lock = self.id_lock(id)?;
        let _guard = lock_or_fail(&id_lock, "merge_id_lock")?;

        let note = match decision {
            ConflictDecision::KeepIncoming => {
                let origin = pending.record.origin.clone();
                if self.authorizer.authorize(origin.as_str(), "merge_commit", id)
                    == AuthzDecision::Deny
                {
                    let key = pending.record.idempotency_key.clone();
                    // Denied commits leave the conflict on the books.
                    self.lock_conflicts()?.push(pending);
                    self.audit.append(
                        AuditEntry::new(AuditOperation::MergeReject, origin.as_str())
                            .with_token(id.clone())
                            .with_key(key)
                            .with_outcome(AuditOutcome::Denied)
                            .with_note(format!("commit denied for '{id}'")),
                    )?;
                    return Err(Error::AuthorizationRejected {
                        id: id.to_string(),
                        operation: "resolve_conflict".to_string(),
                    });
                }
                let current = self.store.get(id)?;
                let expected = current.as_ref().map(|c| c.version);
                if let Err(err) = self.store.put(&pending.incoming, expected) {
                    // Resolution failed: the conflict goes back on the books.
                    self.lock_conflicts()?.push(pending);
                    return Err(err);
                }
                format!(
                    "manual resolution kept incoming version {}",
                    pending.record.incoming_version
                )
            },
            ConflictDecision::KeepCanonical => format!(
                "manual resolution kept canonical version {}",
                pending.record.canonical_version
            ),
        };

        self.audit.append(
            AuditEntry::new(AuditOperation::ConflictResolved, actor)
                .with_token(id.clone())
                .with_key(pending.record.idempotency_key.clone())
                .with_before_hash(&pending.record.canonical_hash)
                .with_after_hash(match decision {
                    ConflictDecision::KeepIncoming => &pending.record.incoming_hash,
                    ConflictDecision::KeepCanonical => &pending.record.canonical_hash,
                })
                .with_note(&note),
        )?;
        metrics::counter!("memsync_conflicts_resolved_total").increment(1);

        let mut record = pending.record;
        record.resolution = ConflictResolution::ManualResolved;
        Ok(record)
    }

    fn id_lock(&self, id: &TokenId) -> Result<Arc<Mutex<()>>> {
        let mut locks = self.id_locks.lock().map_err(|_| Error::OperationFailed {
            operation: "merge_lock_table".to_string(),
            cause: "id lock table mutex poisoned".to_string(),
        })?;
        Ok(Arc::clone(
            locks.entry(id.clone()).or_insert_with(|| Arc::new(Mutex::new(()))),
        ))
    }

    fn lock_conflicts(&self) -> Result<MutexGuard<'_, Vec<PendingConflict>>> {
        self.conflicts.lock().map_err(|_| Error::OperationFailed {
            operation: "conflict_registry_lock".to_string(),
            cause: "conflict registry mutex poisoned".to_string(),
        })
    }
}

fn lock_or_fail<'a>(
    lock: &'a Mutex<()>,
    operation: &str,
) -> Result<MutexGuard<'a, ()>> {
    lock.lock().map_err(|_| Error::OperationFailed {
        operation: operation.to_string(),
        cause: "mutex poisoned".to_string(),
    })
}

/// Maps each entry index to `None` (survivor, process it) or
/// `Some(winner_key)` (collapsed away in favor of the winner).
///
/// Entries sharing an id and content hash are the same logical write
/// delivered at different versions; only the highest version is processed.
fn collapse_duplicates(
    entries: &[QueueEntry],
) -> HashMap<usize, Option<IdempotencyKey>> {
    let mut best: HashMap<(TokenId, String), usize> = HashMap::new();
    for (index, entry) in entries.iter().enumerate() {
        let group = (entry.token.id.clone(), entry.token.content_hash.clone());
        match best.get(&group) {
            Some(&winner) if entries[winner].token.version >= entry.token.version => {},
            _ => {
                best.insert(group, index);
            },
        }
    }

    let mut verdicts = HashMap::with_capacity(entries.len());
    for (index, entry) in entries.iter().enumerate() {
        let group = (entry.token.id.clone(), entry.token.content_hash.clone());
        let winner = best.get(&group).copied();
        if winner == Some(index) {
            verdicts.insert(index, None);
        } else {
            let key = winner.map(|w| entries[w].idempotency_key.clone());
            verdicts.insert(index, Some(key.unwrap_or_else(|| entry.idempotency_key.clone())));
        }
    }
    verdicts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::DenyList;
    use crate::models::TokenContent;
    use crate::storage::InMemoryStore;

    fn engine(policy: ResolutionPolicy) -> MergeEngine {
        let audit = Arc::new(AuditLog::new());
        MergeEngine::new(
            Arc::new(InMemoryStore::new()),
            Arc::clone(&audit),
            Arc::new(QuarantineStore::new(audit)),
            policy,
        )
    }

    fn token(id: &str, version: u64, text: &str) -> MemoryToken {
        MemoryToken::new(id, TokenContent::new(text), "dev-1").with_version(version)
    }

    fn entry(id: &str, version: u64, text: &str) -> QueueEntry {
        QueueEntry::new(token(id, version, text))
    }

    fn origin() -> OriginId {
        OriginId::from("dev-1")
    }

    /// Store whose guarded writes lose the optimistic race a set number of
    /// times before delegating to the wrapped store.
    struct ContendedStore {
        inner: InMemoryStore,
        failures_left: Mutex<u32>,
    }

    impl ContendedStore {
        fn failing(times: u32) -> Self {
            Self {
                inner: InMemoryStore::new(),
                failures_left: Mutex::new(times),
            }
        }
    }

    impl CanonicalStore for ContendedStore {
        fn get(&self, id: &TokenId) -> Result<Option<MemoryToken>> {
            self.inner.get(id)
        }

        fn get_version(&self, id: &TokenId, version: u64) -> Result<Option<MemoryToken>> {
            self.inner.get_version(id, version)
        }

        fn put(&self, token: &MemoryToken, expected_version: Option<u64>) -> Result<()> {
            let mut left = self.failures_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(Error::VersionConflict {
                    id: token.id.to_string(),
                    expected: expected_version.unwrap_or(0),
                    found: expected_version.unwrap_or(0) + 1,
                });
            }
            drop(left);
            self.inner.put(token, expected_version)
        }

        fn history(&self, id: &TokenId) -> Result<Vec<MemoryToken>> {
            self.inner.history(id)
        }

        fn list_ids(&self) -> Result<Vec<TokenId>> {
            self.inner.list_ids()
        }
    }

    #[test]
    fn test_new_token_is_applied() {
        let engine = engine(ResolutionPolicy::HashTiebreak);
        let report = engine
            .stage_and_merge(&origin(), vec![entry("tok-1", 1, "note")])
            .unwrap();

        assert_eq!(report.applied, 1);
        let stored = engine.store.get(&TokenId::from("tok-1")).unwrap().unwrap();
        assert_eq!(stored.version, 1);
    }

    #[test]
    fn test_replay_is_absorbed_without_state_change() {
        let engine = engine(ResolutionPolicy::HashTiebreak);
        let e = entry("tok-1", 1, "note");

        let first = engine.stage_and_merge(&origin(), vec![e.clone()]).unwrap();
        assert_eq!(first.applied, 1);
        let audit_len = engine.audit.len().unwrap();

        let second = engine.stage_and_merge(&origin(), vec![e]).unwrap();
        assert_eq!(second.already_applied, 1);
        assert!(second.is_noop());
        // Replay leaves no new commit entries behind.
        assert_eq!(engine.audit.len().unwrap(), audit_len);
    }

    #[test]
    fn test_newer_version_supersedes() {
        let engine = engine(ResolutionPolicy::HashTiebreak);
        engine
            .stage_and_merge(&origin(), vec![entry("tok-1", 1, "v1")])
            .unwrap();
        let report = engine
            .stage_and_merge(&origin(), vec![entry("tok-1", 2, "v2")])
            .unwrap();

        assert_eq!(report.superseded, 1);
        let stored = engine.store.get(&TokenId::from("tok-1")).unwrap().unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.content.text, "v2");
    }

    #[test]
    fn test_stale_version_is_rejected() {
        let engine = engine(ResolutionPolicy::HashTiebreak);
        engine
            .stage_and_merge(&origin(), vec![entry("tok-1", 3, "v3")])
            .unwrap();
        let report = engine
            .stage_and_merge(&origin(), vec![entry("tok-1", 2, "old")])
            .unwrap();

        assert_eq!(report.stale, 1);
        let stored = engine.store.get(&TokenId::from("tok-1")).unwrap().unwrap();
        assert_eq!(stored.version, 3);
        assert_eq!(stored.content.text, "v3");
    }

    #[test]
    fn test_identical_content_is_duplicate() {
        let engine = engine(ResolutionPolicy::HashTiebreak);
        engine
            .stage_and_merge(&origin(), vec![entry("tok-1", 1, "same")])
            .unwrap();

        // Different origin, same content hash at the same version.
        let other = QueueEntry::new(
            MemoryToken::new("tok-1", TokenContent::new("same"), "dev-2").with_version(1),
        );
        let report = engine
            .stage_and_merge(&OriginId::from("dev-2"), vec![other])
            .unwrap();
        assert_eq!(report.duplicate, 1);
    }

    #[test]
    fn test_identical_content_at_higher_version_supersedes() {
        let engine = engine(ResolutionPolicy::ManualOnly);
        engine
            .stage_and_merge(&origin(), vec![entry("tok-1", 1, "same")])
            .unwrap();

        // A pure version bump is not a conflict, even under manual-only.
        let bumped = QueueEntry::new(
            MemoryToken::new("tok-1", TokenContent::new("same"), "dev-2").with_version(3),
        );
        let report = engine
            .stage_and_merge(&OriginId::from("dev-2"), vec![bumped])
            .unwrap();
        assert_eq!(report.superseded, 1);
        assert!(engine.pending_conflicts().unwrap().is_empty());

        let stored = engine.store.get(&TokenId::from("tok-1")).unwrap().unwrap();
        assert_eq!(stored.version, 3);
    }

    #[test]
    fn test_collision_resolves_order_independently() {
        // Distinct origins so the writes carry distinct idempotency keys.
        let a = QueueEntry::new(
            MemoryToken::new("tok-1", TokenContent::new("writer alpha"), "dev-a")
                .with_version(2),
        );
        let b = QueueEntry::new(
            MemoryToken::new("tok-1", TokenContent::new("writer beta"), "dev-b")
                .with_version(2),
        );
        let expected_hash = a.token.content_hash.clone().max(b.token.content_hash.clone());

        for pair in [[a.clone(), b.clone()], [b, a]] {
            let engine = engine(ResolutionPolicy::HashTiebreak);
            for e in pair {
                engine.stage_and_merge(&origin(), vec![e]).unwrap();
            }
            let stored = engine.store.get(&TokenId::from("tok-1")).unwrap().unwrap();
            assert_eq!(stored.content_hash, expected_hash);
            assert_eq!(stored.version, 2);
            assert!(engine.pending_conflicts().unwrap().is_empty());
        }
    }

    #[test]
    fn test_manual_only_defers_and_keeps_entry_pending() {
        let engine = engine(ResolutionPolicy::ManualOnly);
        engine
            .stage_and_merge(&origin(), vec![entry("tok-1", 1, "v1")])
            .unwrap();
        let report = engine
            .stage_and_merge(&origin(), vec![entry("tok-1", 2, "v2")])
            .unwrap();

        assert_eq!(report.conflicted, 1);
        assert!(!report.verdicts[0].outcome.is_terminal());
        assert_eq!(engine.pending_conflicts().unwrap().len(), 1);
        // Canonical state untouched while pending.
        let stored = engine.store.get(&TokenId::from("tok-1")).unwrap().unwrap();
        assert_eq!(stored.version, 1);
    }

    #[test]
    fn test_redelivery_of_pending_conflict_raises_nothing_new() {
        let engine = engine(ResolutionPolicy::ManualOnly);
        engine
            .stage_and_merge(&origin(), vec![entry("tok-1", 1, "v1")])
            .unwrap();
        engine
            .stage_and_merge(&origin(), vec![entry("tok-1", 2, "v2")])
            .unwrap();
        engine
            .stage_and_merge(&origin(), vec![entry("tok-1", 2, "v2")])
            .unwrap();

        assert_eq!(engine.pending_conflicts().unwrap().len(), 1);
    }

    #[test]
    fn test_resolve_keep_incoming_commits_held_token() {
        let engine = engine(ResolutionPolicy::ManualOnly);
        let id = TokenId::from("tok-1");
        engine
            .stage_and_merge(&origin(), vec![entry("tok-1", 1, "v1")])
            .unwrap();
        engine
            .stage_and_merge(&origin(), vec![entry("tok-1", 2, "v2")])
            .unwrap();

        let record = engine
            .resolve_conflict(&id, ConflictDecision::KeepIncoming, "reviewer")
            .unwrap();
        assert_eq!(record.resolution, ConflictResolution::ManualResolved);

        let stored = engine.store.get(&id).unwrap().unwrap();
        assert_eq!(stored.version, 2);
        assert!(engine.pending_conflicts().unwrap().is_empty());

        // The queued incoming write now drains as already-applied.
        let report = engine
            .stage_and_merge(&origin(), vec![entry("tok-1", 2, "v2")])
            .unwrap();
        assert_eq!(report.already_applied, 1);
    }

    #[test]
    fn test_resolve_keep_canonical_rejects_incoming() {
        let engine = engine(ResolutionPolicy::ManualOnly);
        let id = TokenId::from("tok-1");
        engine
            .stage_and_merge(&origin(), vec![entry("tok-1", 1, "v1")])
            .unwrap();
        engine
            .stage_and_merge(&origin(), vec![entry("tok-1", 2, "v2")])
            .unwrap();

        engine
            .resolve_conflict(&id, ConflictDecision::KeepCanonical, "reviewer")
            .unwrap();

        let stored = engine.store.get(&id).unwrap().unwrap();
        assert_eq!(stored.version, 1);
        let report = engine
            .stage_and_merge(&origin(), vec![entry("tok-1", 2, "v2")])
            .unwrap();
        assert_eq!(report.already_applied, 1);
    }

    #[test]
    fn test_resolve_without_pending_conflict_is_invalid() {
        let engine = engine(ResolutionPolicy::HashTiebreak);
        let err = engine
            .resolve_conflict(&TokenId::from("tok-1"), ConflictDecision::KeepIncoming, "x")
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_corrupt_token_rejected_without_poisoning_batch() {
        let engine = engine(ResolutionPolicy::HashTiebreak);
        let mut bad = entry("tok-bad", 1, "tampered");
        bad.token.content_hash = "0".repeat(64);

        let report = engine
            .stage_and_merge(&origin(), vec![bad, entry("tok-ok", 1, "fine")])
            .unwrap();
        assert_eq!(report.rejected, 1);
        assert_eq!(report.applied, 1);
        assert!(engine.store.get(&TokenId::from("tok-bad")).unwrap().is_none());
        assert!(engine.store.get(&TokenId::from("tok-ok")).unwrap().is_some());
    }

    #[test]
    fn test_denied_token_is_isolated() {
        let audit = Arc::new(AuditLog::new());
        let engine = MergeEngine::new(
            Arc::new(InMemoryStore::new()),
            Arc::clone(&audit),
            Arc::new(QuarantineStore::new(audit)),
            ResolutionPolicy::HashTiebreak,
        )
        .with_authorizer(Arc::new(DenyList::new(vec![TokenId::from("blocked")])));

        let report = engine
            .stage_and_merge(
                &origin(),
                vec![entry("blocked", 1, "nope"), entry("tok-ok", 1, "fine")],
            )
            .unwrap();
        assert_eq!(report.rejected, 1);
        assert_eq!(report.applied, 1);
        assert!(engine.store.get(&TokenId::from("blocked")).unwrap().is_none());
    }

    #[test]
    fn test_denied_token_cannot_land_through_manual_resolution() {
        let id = TokenId::from("blocked");
        let store = Arc::new(InMemoryStore::new());
        store.put(&token("blocked", 1, "v1"), None).unwrap();

        let audit = Arc::new(AuditLog::new());
        let engine = MergeEngine::new(
            Arc::clone(&store) as Arc<dyn CanonicalStore>,
            Arc::clone(&audit),
            Arc::new(QuarantineStore::new(audit)),
            ResolutionPolicy::ManualOnly,
        )
        .with_authorizer(Arc::new(DenyList::new(vec![id.clone()])));

        let report = engine
            .stage_and_merge(&origin(), vec![entry("blocked", 2, "v2")])
            .unwrap();
        assert_eq!(report.conflicted, 1);

        let err = engine
            .resolve_conflict(&id, ConflictDecision::KeepIncoming, "reviewer")
            .unwrap_err();
        assert!(matches!(err, Error::AuthorizationRejected { .. }));

        // The denied commit never reached the store, and the conflict is
        // still open for an authorized resolution later.
        let stored = engine.store.get(&id).unwrap().unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(engine.pending_conflicts().unwrap().len(), 1);
    }

    #[test]
    fn test_commit_retries_through_transient_version_races() {
        let audit = Arc::new(AuditLog::new());
        let engine = MergeEngine::new(
            Arc::new(ContendedStore::failing(2)),
            Arc::clone(&audit),
            Arc::new(QuarantineStore::new(audit)),
            ResolutionPolicy::HashTiebreak,
        );

        let report = engine
            .stage_and_merge(&origin(), vec![entry("tok-1", 1, "note")])
            .unwrap();
        assert_eq!(report.applied, 1);
        let stored = engine.store.get(&TokenId::from("tok-1")).unwrap().unwrap();
        assert_eq!(stored.version, 1);
    }

    #[test]
    fn test_exhausted_commit_retries_defer_to_manual() {
        let audit = Arc::new(AuditLog::new());
        let engine = MergeEngine::new(
            Arc::new(ContendedStore::failing(u32::MAX)),
            Arc::clone(&audit),
            Arc::new(QuarantineStore::new(audit)),
            ResolutionPolicy::HashTiebreak,
        )
        .with_commit_retry_limit(2);

        let report = engine
            .stage_and_merge(&origin(), vec![entry("tok-1", 1, "note")])
            .unwrap();
        assert_eq!(report.conflicted, 1);
        assert!(!report.verdicts[0].outcome.is_terminal());
        assert_eq!(engine.pending_conflicts().unwrap().len(), 1);
        assert!(engine.store.get(&TokenId::from("tok-1")).unwrap().is_none());
    }

    #[test]
    fn test_collision_settled_for_canonical_reports_no_write() {
        let a = MemoryToken::new("tok-1", TokenContent::new("writer alpha"), "dev-a")
            .with_version(2);
        let b = MemoryToken::new("tok-1", TokenContent::new("writer beta"), "dev-b")
            .with_version(2);
        let (winner, loser) = if a.content_hash > b.content_hash { (a, b) } else { (b, a) };

        let engine = engine(ResolutionPolicy::HashTiebreak);
        engine
            .stage_and_merge(&origin(), vec![QueueEntry::new(winner.clone())])
            .unwrap();
        let report = engine
            .stage_and_merge(&origin(), vec![QueueEntry::new(loser)])
            .unwrap();

        assert_eq!(report.canonical_kept, 1);
        assert_eq!(report.superseded, 0);
        assert!(report.is_noop());
        let stored = engine.store.get(&TokenId::from("tok-1")).unwrap().unwrap();
        assert_eq!(stored.content_hash, winner.content_hash);
    }

    #[test]
    fn test_batch_collapse_keeps_highest_version_per_hash() {
        let engine = engine(ResolutionPolicy::HashTiebreak);
        // Same id and content delivered at versions 1 and 3.
        let report = engine
            .stage_and_merge(
                &origin(),
                vec![entry("tok-1", 1, "same text"), entry("tok-1", 3, "same text")],
            )
            .unwrap();

        assert_eq!(report.applied, 1);
        assert_eq!(report.duplicate, 1);
        let stored = engine.store.get(&TokenId::from("tok-1")).unwrap().unwrap();
        assert_eq!(stored.version, 3);
    }

    #[test]
    fn test_relevance_without_scores_goes_manual() {
        let engine = engine(ResolutionPolicy::RelevanceWeighted);
        engine
            .stage_and_merge(&origin(), vec![entry("tok-1", 1, "v1")])
            .unwrap();
        let concurrent = QueueEntry::new(
            MemoryToken::new("tok-1", TokenContent::new("other content"), "dev-2")
                .with_version(1),
        );
        let report = engine
            .stage_and_merge(&OriginId::from("dev-2"), vec![concurrent])
            .unwrap();

        assert_eq!(report.conflicted, 1);
        assert_eq!(engine.pending_conflicts().unwrap().len(), 1);
    }
}
