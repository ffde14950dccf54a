//! Canonical store abstraction and backends.
//!
//! The canonical store is the authoritative keyed record store for memory
//! tokens. This core consumes it through [`CanonicalStore`]: keyed reads plus
//! a per-id transactional `put` with optimistic concurrency. Version history
//! is retained sufficient to answer `get_version(id, version)`.

mod memory;
mod sqlite;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

use crate::Result;
use crate::models::{MemoryToken, TokenId};

/// Keyed record store with per-id transactional write semantics.
///
/// `put` is the single mutation point: a record never observably passes
/// through an intermediate state, and a write that loses an optimistic race
/// fails with [`crate::Error::VersionConflict`] so the caller can re-evaluate
/// against the refreshed record.
pub trait CanonicalStore: Send + Sync {
    /// Returns the latest canonical token for an id.
    fn get(&self, id: &TokenId) -> Result<Option<MemoryToken>>;

    /// Returns the most recent historical token with the given version.
    fn get_version(&self, id: &TokenId, version: u64) -> Result<Option<MemoryToken>>;

    /// Writes a token, guarded by the version the writer expects to replace.
    ///
    /// `expected_version: None` asserts the id is absent (insert). An
    /// equal-version write is permitted when `token.version ==
    /// expected_version`: the deterministic concurrent-write tie-break
    /// replaces content in place without inventing a version the origins
    /// never produced.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::VersionConflict`] if the current version does
    /// not match `expected_version`, and [`crate::Error::InvalidInput`] if
    /// the write would decrease the version.
    fn put(&self, token: &MemoryToken, expected_version: Option<u64>) -> Result<()>;

    /// Returns the full version history for an id, oldest first.
    fn history(&self, id: &TokenId) -> Result<Vec<MemoryToken>>;

    /// Lists all canonical token ids.
    fn list_ids(&self) -> Result<Vec<TokenId>>;

    /// Returns the number of canonical records.
    fn count(&self) -> Result<usize> {
        Ok(self.list_ids()?.len())
    }
}

/// Validates a guarded write against the current record.
///
/// Shared by backends so optimistic-concurrency semantics cannot drift
/// between them.
pub(crate) fn check_put(
    token: &MemoryToken,
    current: Option<&MemoryToken>,
    expected_version: Option<u64>,
) -> Result<()> {
    let found = current.map_or(0, |t| t.version);
    let expected = expected_version.unwrap_or(0);

    let matches = match (current, expected_version) {
        (None, None) => true,
        (Some(cur), Some(exp)) => cur.version == exp,
        _ => false,
    };
    if !matches {
        return Err(crate::Error::VersionConflict {
            id: token.id.to_string(),
            expected,
            found,
        });
    }

    if token.version < expected {
        return Err(crate::Error::InvalidInput(format!(
            "token '{}' version {} would decrease below {}",
            token.id, token.version, expected
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::models::TokenContent;

    fn token(id: &str, version: u64, text: &str) -> MemoryToken {
        MemoryToken::new(id, TokenContent::new(text), "dev-1").with_version(version)
    }

    /// Contract tests run against every backend.
    fn store_contract(store: &dyn CanonicalStore) {
        let id = TokenId::from("tok-1");

        // Insert requires the id to be absent.
        store.put(&token("tok-1", 1, "v1"), None).unwrap();
        let err = store.put(&token("tok-1", 1, "v1b"), None).unwrap_err();
        assert!(matches!(err, Error::VersionConflict { found: 1, .. }));

        // Guarded update.
        store.put(&token("tok-1", 2, "v2"), Some(1)).unwrap();
        let latest = store.get(&id).unwrap().unwrap();
        assert_eq!(latest.version, 2);
        assert_eq!(latest.content.text, "v2");

        // Losing a race is a VersionConflict.
        let err = store.put(&token("tok-1", 3, "v3"), Some(1)).unwrap_err();
        assert!(matches!(
            err,
            Error::VersionConflict {
                expected: 1,
                found: 2,
                ..
            }
        ));

        // Equal-version tie-break replacement.
        store.put(&token("tok-1", 2, "v2-tiebreak"), Some(2)).unwrap();
        let latest = store.get(&id).unwrap().unwrap();
        assert_eq!(latest.version, 2);
        assert_eq!(latest.content.text, "v2-tiebreak");

        // History answers get_version.
        let v1 = store.get_version(&id, 1).unwrap().unwrap();
        assert_eq!(v1.content.text, "v1");
        let history = store.history(&id).unwrap();
        assert_eq!(history.len(), 3);
        assert!(store.get_version(&id, 9).unwrap().is_none());

        // Missing id.
        assert!(store.get(&TokenId::from("absent")).unwrap().is_none());
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_in_memory_store_contract() {
        store_contract(&InMemoryStore::new());
    }

    #[test]
    fn test_sqlite_store_contract() {
        store_contract(&SqliteStore::in_memory().unwrap());
    }
}
