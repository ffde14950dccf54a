//! Conflict records and resolution decisions.

use super::queue::IdempotencyKey;
use super::token::{OriginId, TokenId};
use serde::{Deserialize, Serialize};

/// How a conflict was (or is waiting to be) resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictResolution {
    /// The automatic rule set kept the incoming token.
    AutoKeptIncoming,
    /// The automatic rule set kept the canonical token.
    AutoKeptCanonical,
    /// A deterministic tie-break merged the concurrent writes.
    AutoMerged,
    /// Awaiting a manual decision.
    ManualPending,
    /// A manual decision was applied.
    ManualResolved,
}

impl ConflictResolution {
    /// Returns `true` once the conflict no longer blocks its id.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::ManualPending)
    }
}

/// A manual decision for a pending conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictDecision {
    /// Commit the incoming token over the canonical one.
    KeepIncoming,
    /// Keep the canonical token; terminally reject the incoming one.
    KeepCanonical,
}

/// Record of two non-identical versions of the same logical token.
///
/// Created by the merge engine; archived into the audit log once resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    /// The contested token id.
    pub id: TokenId,
    /// Version carried by the incoming token.
    pub incoming_version: u64,
    /// Version currently in the canonical store.
    pub canonical_version: u64,
    /// Content hash of the incoming token.
    pub incoming_hash: String,
    /// Content hash of the canonical token.
    pub canonical_hash: String,
    /// Origin that delivered the incoming token.
    pub origin: OriginId,
    /// Idempotency key of the incoming write, so queued duplicates drain
    /// as already-applied once the conflict is resolved.
    pub idempotency_key: IdempotencyKey,
    /// Detection timestamp (Unix epoch seconds).
    pub detected_at: u64,
    /// Current resolution state.
    pub resolution: ConflictResolution,
}

impl ConflictRecord {
    /// Returns `true` while the conflict still blocks commits for its id.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(self.resolution, ConflictResolution::ManualPending)
    }
}
