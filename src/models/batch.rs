//! Quarantine batches, merge verdicts, and per-batch reports.

use super::queue::{IdempotencyKey, QueueEntry};
use super::token::{OriginId, TokenId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a staged batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(String);

impl BatchId {
    /// Generates a fresh batch id.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a quarantined batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchState {
    /// Staged, not yet validated.
    Received,
    /// Hash and structural validation in progress.
    Validating,
    /// Merge classification and commit in progress.
    Merging,
    /// All entries reached a terminal classification and were applied.
    Committed,
    /// Discarded without side effects (other than the audit entry).
    Aborted,
}

/// An ordered sequence of incoming entries awaiting a merge decision.
///
/// Owned exclusively by the merge engine while processing; never partially
/// visible to canonical-store readers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantineBatch {
    /// Batch identifier.
    pub batch_id: BatchId,
    /// Origin the batch arrived from.
    pub origin: OriginId,
    /// Entries in delivery order.
    pub entries: Vec<QueueEntry>,
    /// Current lifecycle state.
    pub state: BatchState,
    /// When the batch was staged (Unix epoch seconds).
    pub received_at: u64,
}

impl QuarantineBatch {
    /// Creates a freshly received batch.
    #[must_use]
    pub fn new(origin: OriginId, entries: Vec<QueueEntry>) -> Self {
        Self {
            batch_id: BatchId::generate(),
            origin,
            entries,
            state: BatchState::Received,
            received_at: crate::current_timestamp(),
        }
    }

    /// Returns the number of entries in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the batch carries no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Terminal (or pending) classification of one incoming token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeOutcome {
    /// No canonical record existed; the token was inserted.
    Applied,
    /// The incoming token won a version-based conflict and replaced the
    /// canonical record.
    Superseded,
    /// A concurrent-write collision was resolved by the deterministic
    /// tie-break and the winner committed.
    AutoMerged,
    /// The policy decided against the incoming token; the canonical record
    /// stands unchanged and the incoming write is terminally absorbed.
    CanonicalKept,
    /// Canonical record carries the identical content hash at the same
    /// version; no-op, still recorded as a confirmed sync.
    Duplicate,
    /// A committed operation already exists for this idempotency key;
    /// replay absorbed as a no-op.
    AlreadyApplied,
    /// The incoming version is older than the canonical one; rejected.
    Stale,
    /// Conflict deferred to manual resolution. Not terminal.
    ManualPending,
    /// Declared hash did not reproduce from content; token rejected.
    Corrupt,
    /// The authorization collaborator denied the commit.
    AuthorizationRejected,
}

impl MergeOutcome {
    /// Returns `true` if the owning queue entry may be acknowledged.
    ///
    /// `ManualPending` keeps the entry queued until the conflict resolves;
    /// everything else is a confirmed commit or a permanent rejection.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::ManualPending)
    }

    /// Metrics label for this outcome.
    #[must_use]
    pub const fn as_label(self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Superseded => "superseded",
            Self::AutoMerged => "auto_merged",
            Self::CanonicalKept => "canonical_kept",
            Self::Duplicate => "duplicate",
            Self::AlreadyApplied => "already_applied",
            Self::Stale => "stale",
            Self::ManualPending => "manual_pending",
            Self::Corrupt => "corrupt",
            Self::AuthorizationRejected => "authorization_rejected",
        }
    }
}

/// Per-key verdict handed back to the sync coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeVerdict {
    /// The idempotency key the verdict applies to.
    pub idempotency_key: IdempotencyKey,
    /// The token id.
    pub token_id: TokenId,
    /// The classification.
    pub outcome: MergeOutcome,
    /// Human-readable note (tie-break explanations, rejection causes).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Structured outcome report for one processed batch.
///
/// Sync and import always report per-token outcomes rather than a single
/// pass/fail boolean, so partial success is observable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    /// Tokens inserted as new canonical records.
    pub applied: usize,
    /// Tokens that replaced the canonical record (version or tie-break wins).
    pub superseded: usize,
    /// Identical-content no-ops.
    pub duplicate: usize,
    /// Collisions settled in favor of the existing canonical record.
    pub canonical_kept: usize,
    /// Idempotent replays absorbed.
    pub already_applied: usize,
    /// Conflicts deferred to manual resolution.
    pub conflicted: usize,
    /// Stale writes rejected.
    pub stale: usize,
    /// Tokens rejected outright (corrupt or unauthorized).
    pub rejected: usize,
    /// Every per-key verdict, in batch order.
    pub verdicts: Vec<MergeVerdict>,
}

impl BatchReport {
    /// Records a verdict, updating the matching counter.
    pub fn record(&mut self, verdict: MergeVerdict) {
        match verdict.outcome {
            MergeOutcome::Applied => self.applied += 1,
            MergeOutcome::Superseded | MergeOutcome::AutoMerged => self.superseded += 1,
            MergeOutcome::Duplicate => self.duplicate += 1,
            MergeOutcome::CanonicalKept => self.canonical_kept += 1,
            MergeOutcome::AlreadyApplied => self.already_applied += 1,
            MergeOutcome::ManualPending => self.conflicted += 1,
            MergeOutcome::Stale => self.stale += 1,
            MergeOutcome::Corrupt | MergeOutcome::AuthorizationRejected => self.rejected += 1,
        }
        self.verdicts.push(verdict);
    }

    /// Total number of tokens the report covers.
    #[must_use]
    pub fn total(&self) -> usize {
        self.verdicts.len()
    }

    /// Returns `true` if nothing changed canonical state.
    #[must_use]
    pub const fn is_noop(&self) -> bool {
        self.applied == 0 && self.superseded == 0
    }

    /// Returns a human-readable summary.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "applied: {}, superseded: {}, duplicate: {}, canonical kept: {}, \
             already applied: {}, conflicted: {}, stale: {}, rejected: {}",
            self.applied,
            self.superseded,
            self.duplicate,
            self.canonical_kept,
            self.already_applied,
            self.conflicted,
            self.stale,
            self.rejected
        )
    }
}
