//! Append-only audit log.
//!
//! Every sync, merge decision, export, and import is recorded here with
//! before/after hashes, for compliance and replay debugging. Entries are
//! immutable once written and keyed by a monotonically increasing sequence
//! number; nothing in this core ever mutates or deletes them.
//!
//! The log doubles as the idempotency index: a committed operation for an
//! idempotency key is looked up here by the merge engine to absorb duplicate
//! delivery as `AlreadyApplied`.

use crate::models::{IdempotencyKey, TokenId};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Kind of operation being audited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    /// A token entered an origin's local queue.
    Enqueue,
    /// A sync session ran for an origin.
    Sync,
    /// A merge committed canonical state (insert, supersede, or auto-merge).
    MergeCommit,
    /// A merge confirmed an identical-content duplicate.
    MergeDuplicate,
    /// A merge rejected a stale write.
    MergeStale,
    /// A merge raised a conflict for manual resolution.
    MergeConflict,
    /// A merge rejected a token outright (corrupt or unauthorized).
    MergeReject,
    /// A pending conflict was resolved.
    ConflictResolved,
    /// A staged batch was aborted.
    BatchAborted,
    /// A filtered token set was exported.
    Export,
    /// An archive was imported.
    Import,
    /// A repeatedly stale queue entry was archived.
    StaleArchived,
}

impl AuditOperation {
    /// Returns `true` if an entry with this operation records a committed
    /// (or terminally resolved) write for its idempotency key.
    ///
    /// These are the operations the merge engine's replay check consults.
    /// Stale and outright rejections are deliberately excluded: redelivery
    /// re-evaluates them against current canonical state.
    #[must_use]
    pub const fn records_commit(self) -> bool {
        matches!(
            self,
            Self::MergeCommit | Self::MergeDuplicate | Self::ConflictResolved
        )
    }
}

/// Outcome of an audited operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    /// Operation succeeded.
    Success,
    /// Operation failed.
    Failure,
    /// Operation was denied by the authorization collaborator.
    Denied,
}

/// Audit log entry. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Monotonically increasing sequence number, assigned on append.
    #[serde(default)]
    pub seq: u64,
    /// Timestamp of the event.
    pub timestamp: DateTime<Utc>,
    /// Kind of operation.
    pub operation: AuditOperation,
    /// Actor or origin responsible for the operation.
    pub actor: String,
    /// Token id(s) affected.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub token_ids: Vec<TokenId>,
    /// Idempotency key of the write, when the operation concerns one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<IdempotencyKey>,
    /// Canonical content hash before the operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_hash: Option<String>,
    /// Canonical content hash after the operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_hash: Option<String>,
    /// Outcome.
    pub outcome: AuditOutcome,
    /// Free-form note (tie-break explanations, abort causes).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl AuditEntry {
    /// Creates a new entry for the current time.
    #[must_use]
    pub fn new(operation: AuditOperation, actor: impl Into<String>) -> Self {
        Self {
            seq: 0,
            timestamp: Utc::now(),
            operation,
            actor: actor.into(),
            token_ids: Vec::new(),
            idempotency_key: None,
            before_hash: None,
            after_hash: None,
            outcome: AuditOutcome::Success,
            note: None,
        }
    }

    /// Adds an affected token id.
    #[must_use]
    pub fn with_token(mut self, id: TokenId) -> Self {
        self.token_ids.push(id);
        self
    }

    /// Sets the idempotency key.
    #[must_use]
    pub fn with_key(mut self, key: IdempotencyKey) -> Self {
        self.idempotency_key = Some(key);
        self
    }

    /// Sets the before-hash.
    #[must_use]
    pub fn with_before_hash(mut self, hash: impl Into<String>) -> Self {
        self.before_hash = Some(hash.into());
        self
    }

    /// Sets the after-hash.
    #[must_use]
    pub fn with_after_hash(mut self, hash: impl Into<String>) -> Self {
        self.after_hash = Some(hash.into());
        self
    }

    /// Sets the outcome.
    #[must_use]
    pub const fn with_outcome(mut self, outcome: AuditOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    /// Sets the note.
    #[must_use]
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

struct AuditLogInner {
    entries: Vec<AuditEntry>,
    committed_keys: HashSet<IdempotencyKey>,
    next_seq: u64,
    sink: Option<File>,
}

/// Append-only audit log with an idempotency index.
///
/// Entries are held in memory and optionally mirrored to a JSONL file. When
/// opened on an existing file, the sequence counter and the committed-key
/// index are rebuilt from it, so replay detection survives process restart.
pub struct AuditLog {
    inner: Mutex<AuditLogInner>,
    path: Option<PathBuf>,
}

impl AuditLog {
    /// Creates an in-memory audit log.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(AuditLogInner {
                entries: Vec::new(),
                committed_keys: HashSet::new(),
                next_seq: 1,
                sink: None,
            }),
            path: None,
        }
    }

    /// Opens (or creates) a file-backed audit log.
    ///
    /// Existing entries are loaded to restore the sequence counter and the
    /// committed-key index.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or parsed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut entries = Vec::new();
        let mut committed_keys = HashSet::new();
        let mut next_seq = 1;

        if path.exists() {
            let file = File::open(&path).map_err(|e| Error::OperationFailed {
                operation: "open_audit_log".to_string(),
                cause: e.to_string(),
            })?;
            for line in BufReader::new(file).lines() {
                let line = line.map_err(|e| Error::OperationFailed {
                    operation: "read_audit_log".to_string(),
                    cause: e.to_string(),
                })?;
                if line.trim().is_empty() {
                    continue;
                }
                let entry: AuditEntry = serde_json::from_str(&line).map_err(|e| {
                    Error::OperationFailed {
                        operation: "parse_audit_log".to_string(),
                        cause: e.to_string(),
                    }
                })?;
                next_seq = next_seq.max(entry.seq + 1);
                if entry.operation.records_commit() {
                    if let Some(ref key) = entry.idempotency_key {
                        committed_keys.insert(key.clone());
                    }
                }
                entries.push(entry);
            }
        }

        let sink = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::OperationFailed {
                operation: "open_audit_log".to_string(),
                cause: e.to_string(),
            })?;

        Ok(Self {
            inner: Mutex::new(AuditLogInner {
                entries,
                committed_keys,
                next_seq,
                sink: Some(sink),
            }),
            path: Some(path),
        })
    }

    /// Returns the backing file path, if file-backed.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, AuditLogInner>> {
        self.inner.lock().map_err(|_| Error::OperationFailed {
            operation: "audit_lock".to_string(),
            cause: "audit log mutex poisoned".to_string(),
        })
    }

    /// Appends an entry, assigning its sequence number.
    ///
    /// # Errors
    ///
    /// Returns an error if the file sink cannot be written.
    pub fn append(&self, mut entry: AuditEntry) -> Result<u64> {
        let mut inner = self.lock()?;
        entry.seq = inner.next_seq;
        inner.next_seq += 1;

        if entry.operation.records_commit() {
            if let Some(ref key) = entry.idempotency_key {
                inner.committed_keys.insert(key.clone());
            }
        }

        if let Some(ref mut sink) = inner.sink {
            let line = serde_json::to_string(&entry).map_err(|e| Error::OperationFailed {
                operation: "serialize_audit_entry".to_string(),
                cause: e.to_string(),
            })?;
            writeln!(sink, "{line}").map_err(|e| Error::OperationFailed {
                operation: "write_audit_log".to_string(),
                cause: e.to_string(),
            })?;
        }

        let seq = entry.seq;
        inner.entries.push(entry);
        Ok(seq)
    }

    /// Returns `true` if a committed operation is recorded for the key.
    ///
    /// # Errors
    ///
    /// Returns an error if the log is unavailable.
    pub fn is_committed(&self, key: &IdempotencyKey) -> Result<bool> {
        Ok(self.lock()?.committed_keys.contains(key))
    }

    /// Returns the number of entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the log is unavailable.
    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.entries.len())
    }

    /// Returns `true` if the log is empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the log is unavailable.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Returns all entries affecting a token id, in sequence order.
    ///
    /// # Errors
    ///
    /// Returns an error if the log is unavailable.
    pub fn entries_for(&self, id: &TokenId) -> Result<Vec<AuditEntry>> {
        Ok(self
            .lock()?
            .entries
            .iter()
            .filter(|e| e.token_ids.contains(id))
            .cloned()
            .collect())
    }

    /// Returns the most recent entries, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the log is unavailable.
    pub fn recent(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        Ok(self
            .lock()?
            .entries
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}
