//! Queue entry and idempotency key types.

use super::token::{MemoryToken, OriginId, TokenId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Deterministic identifier used to detect duplicate delivery.
///
/// Derived from `origin_id`, `id`, and `version`: the same logical write is
/// always keyed identically no matter how many times it crosses the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Derives the key for a token as written by an origin.
    #[must_use]
    pub fn derive(origin: &OriginId, id: &TokenId, version: u64) -> Self {
        Self(format!("{origin}:{id}@{version}"))
    }

    /// Derives the key for a token from its own fields.
    #[must_use]
    pub fn for_token(token: &MemoryToken) -> Self {
        Self::derive(&token.origin_id, &token.id, token.version)
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for IdempotencyKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A pending token in an origin's local queue.
///
/// Created on local capture; removed only after the owning sync coordinator
/// receives a terminal verdict (commit or permanent rejection) for its
/// idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// The queued token.
    pub token: MemoryToken,
    /// Duplicate-delivery detection key.
    pub idempotency_key: IdempotencyKey,
    /// When the entry was enqueued (Unix epoch seconds).
    pub enqueued_at: u64,
    /// Consecutive `Stale` verdicts seen for this entry.
    ///
    /// Used by the bounded retry-then-archive policy for entries the
    /// canonical store has already moved past.
    #[serde(default)]
    pub stale_deliveries: u32,
}

impl QueueEntry {
    /// Wraps a token for queuing.
    #[must_use]
    pub fn new(token: MemoryToken) -> Self {
        let idempotency_key = IdempotencyKey::for_token(&token);
        Self {
            token,
            idempotency_key,
            enqueued_at: crate::current_timestamp(),
            stale_deliveries: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TokenContent;

    #[test]
    fn test_key_is_deterministic() {
        let a = IdempotencyKey::derive(&OriginId::from("dev-1"), &TokenId::from("tok-9"), 4);
        let b = IdempotencyKey::derive(&OriginId::from("dev-1"), &TokenId::from("tok-9"), 4);
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "dev-1:tok-9@4");
    }

    #[test]
    fn test_key_distinguishes_versions_and_origins() {
        let origin = OriginId::from("dev-1");
        let id = TokenId::from("tok-9");
        let v4 = IdempotencyKey::derive(&origin, &id, 4);
        let v5 = IdempotencyKey::derive(&origin, &id, 5);
        let other = IdempotencyKey::derive(&OriginId::from("dev-2"), &id, 4);
        assert_ne!(v4, v5);
        assert_ne!(v4, other);
    }

    #[test]
    fn test_entry_carries_token_key() {
        let token = MemoryToken::new("tok-1", TokenContent::new("note"), "dev-1").with_version(3);
        let entry = QueueEntry::new(token);
        assert_eq!(entry.idempotency_key.as_str(), "dev-1:tok-1@3");
        assert_eq!(entry.stale_deliveries, 0);
    }
}
