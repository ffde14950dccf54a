//! In-memory canonical store backend.

use super::{CanonicalStore, check_put};
use crate::models::{MemoryToken, TokenId};
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::Mutex;

struct StoreInner {
    latest: HashMap<TokenId, MemoryToken>,
    /// Full write history per id, oldest first.
    history: HashMap<TokenId, Vec<MemoryToken>>,
}

/// In-memory canonical store, primarily for tests and embedded use.
pub struct InMemoryStore {
    inner: Mutex<StoreInner>,
}

impl InMemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                latest: HashMap::new(),
                history: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, StoreInner>> {
        self.inner.lock().map_err(|_| Error::OperationFailed {
            operation: "store_lock".to_string(),
            cause: "canonical store mutex poisoned".to_string(),
        })
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CanonicalStore for InMemoryStore {
    fn get(&self, id: &TokenId) -> Result<Option<MemoryToken>> {
        Ok(self.lock()?.latest.get(id).cloned())
    }

    fn get_version(&self, id: &TokenId, version: u64) -> Result<Option<MemoryToken>> {
        Ok(self
            .lock()?
            .history
            .get(id)
            .and_then(|h| h.iter().rev().find(|t| t.version == version))
            .cloned())
    }

    fn put(&self, token: &MemoryToken, expected_version: Option<u64>) -> Result<()> {
        let mut inner = self.lock()?;
        check_put(token, inner.latest.get(&token.id), expected_version)?;

        inner
            .history
            .entry(token.id.clone())
            .or_default()
            .push(token.clone());
        inner.latest.insert(token.id.clone(), token.clone());
        Ok(())
    }

    fn history(&self, id: &TokenId) -> Result<Vec<MemoryToken>> {
        Ok(self.lock()?.history.get(id).cloned().unwrap_or_default())
    }

    fn list_ids(&self) -> Result<Vec<TokenId>> {
        let mut ids: Vec<TokenId> = self.lock()?.latest.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
