//! `SQLite`-based canonical store backend.
//!
//! Durable storage using `SQLite` as the authoritative source of truth.
//! The latest record per id lives in `tokens`; every accepted write is also
//! appended to `token_history`, which answers `get_version(id, version)`.
//!
//! # Concurrency Model
//!
//! Uses a `Mutex<Connection>` because `rusqlite::Connection` is not `Sync`.
//! WAL mode and `busy_timeout` mitigate contention, and the guarded version
//! check plus insert run inside one transaction so `put` is atomic per id.

use super::{CanonicalStore, check_put};
use crate::models::{MemoryToken, TokenId};
use crate::{Error, Result};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::PathBuf;
use std::sync::Mutex;

/// `SQLite`-backed canonical store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    /// Path to the database (None for in-memory).
    db_path: Option<PathBuf>,
}

impl SqliteStore {
    /// Opens (or creates) a canonical store at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn new(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        let conn = Connection::open(&db_path).map_err(|e| Error::OperationFailed {
            operation: "open_sqlite".to_string(),
            cause: e.to_string(),
        })?;

        let store = Self {
            conn: Mutex::new(conn),
            db_path: Some(db_path),
        };
        store.initialize()?;
        Ok(store)
    }

    /// Creates an in-memory canonical store (useful for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::OperationFailed {
            operation: "open_sqlite_in_memory".to_string(),
            cause: e.to_string(),
        })?;

        let store = Self {
            conn: Mutex::new(conn),
            db_path: None,
        };
        store.initialize()?;
        Ok(store)
    }

    /// Returns the database path (None for in-memory).
    #[must_use]
    pub const fn db_path(&self) -> Option<&PathBuf> {
        self.db_path.as_ref()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| Error::OperationFailed {
            operation: "sqlite_lock".to_string(),
            cause: "sqlite connection mutex poisoned".to_string(),
        })
    }

    fn initialize(&self) -> Result<()> {
        let conn = self.lock()?;

        // WAL allows concurrent readers with a single writer; ignored where
        // unsupported (in-memory databases).
        let _ = conn.pragma_update(None, "journal_mode", "WAL");
        let _ = conn.pragma_update(None, "synchronous", "NORMAL");
        let _ = conn.pragma_update(None, "busy_timeout", 5000);

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tokens (
                id TEXT PRIMARY KEY,
                version INTEGER NOT NULL,
                content_hash TEXT NOT NULL,
                origin_id TEXT NOT NULL,
                text TEXT NOT NULL,
                metadata TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                modified_at INTEGER NOT NULL,
                relevance_score REAL,
                visibility TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS token_history (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL,
                version INTEGER NOT NULL,
                content_hash TEXT NOT NULL,
                origin_id TEXT NOT NULL,
                text TEXT NOT NULL,
                metadata TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                modified_at INTEGER NOT NULL,
                relevance_score REAL,
                visibility TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_history_id_version
                ON token_history(id, version);",
        )
        .map_err(|e| Error::OperationFailed {
            operation: "create_token_tables".to_string(),
            cause: e.to_string(),
        })
    }

    const TOKEN_COLUMNS: &'static str = "id, version, content_hash, origin_id, text, metadata, \
                                         created_at, modified_at, relevance_score, visibility";

    /// `SQLite` stores integers as `i64`; token counters are `u64` in the
    /// model, so columns convert at this boundary.
    fn column_u64(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
        let value: i64 = row.get(idx)?;
        u64::try_from(value).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                rusqlite::types::Type::Integer,
                Box::new(e),
            )
        })
    }

    fn to_db_i64(value: u64, field: &str) -> Result<i64> {
        i64::try_from(value).map_err(|_| {
            Error::InvalidInput(format!("{field} {value} exceeds the storable range"))
        })
    }

    fn row_to_token(row: &Row<'_>) -> rusqlite::Result<MemoryToken> {
        let id: String = row.get(0)?;
        let version = Self::column_u64(row, 1)?;
        let content_hash: String = row.get(2)?;
        let origin_id: String = row.get(3)?;
        let text: String = row.get(4)?;
        let metadata_json: String = row.get(5)?;
        let created_at = Self::column_u64(row, 6)?;
        let modified_at = Self::column_u64(row, 7)?;
        let relevance_score: Option<f64> = row.get(8)?;
        let visibility_json: String = row.get(9)?;

        let metadata = serde_json::from_str(&metadata_json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
        })?;
        let visibility = serde_json::from_str(&visibility_json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, Box::new(e))
        })?;

        Ok(MemoryToken {
            id: TokenId::from(id),
            content: crate::models::TokenContent { text, metadata },
            content_hash,
            origin_id: crate::models::OriginId::new(origin_id),
            version,
            created_at,
            modified_at,
            relevance_score,
            visibility,
        })
    }

    fn token_params(token: &MemoryToken) -> Result<(String, String)> {
        let metadata = serde_json::to_string(&token.content.metadata).map_err(|e| {
            Error::OperationFailed {
                operation: "serialize_token_metadata".to_string(),
                cause: e.to_string(),
            }
        })?;
        let visibility =
            serde_json::to_string(&token.visibility).map_err(|e| Error::OperationFailed {
                operation: "serialize_token_visibility".to_string(),
                cause: e.to_string(),
            })?;
        Ok((metadata, visibility))
    }
}

impl CanonicalStore for SqliteStore {
    fn get(&self, id: &TokenId) -> Result<Option<MemoryToken>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {} FROM tokens WHERE id = ?1", Self::TOKEN_COLUMNS),
            params![id.as_str()],
            Self::row_to_token,
        )
        .optional()
        .map_err(|e| Error::OperationFailed {
            operation: "get_token".to_string(),
            cause: e.to_string(),
        })
    }

    fn get_version(&self, id: &TokenId, version: u64) -> Result<Option<MemoryToken>> {
        let Ok(version) = i64::try_from(version) else {
            // Versions beyond i64 were never stored.
            return Ok(None);
        };
        let conn = self.lock()?;
        conn.query_row(
            &format!(
                "SELECT {} FROM token_history WHERE id = ?1 AND version = ?2 \
                 ORDER BY seq DESC LIMIT 1",
                Self::TOKEN_COLUMNS
            ),
            params![id.as_str(), version],
            Self::row_to_token,
        )
        .optional()
        .map_err(|e| Error::OperationFailed {
            operation: "get_token_version".to_string(),
            cause: e.to_string(),
        })
    }

    fn put(&self, token: &MemoryToken, expected_version: Option<u64>) -> Result<()> {
        let (metadata, visibility) = Self::token_params(token)?;
        let version = Self::to_db_i64(token.version, "version")?;
        let created_at = Self::to_db_i64(token.created_at, "created_at")?;
        let modified_at = Self::to_db_i64(token.modified_at, "modified_at")?;
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(|e| Error::OperationFailed {
            operation: "begin_put_token".to_string(),
            cause: e.to_string(),
        })?;

        let current = tx
            .query_row(
                &format!("SELECT {} FROM tokens WHERE id = ?1", Self::TOKEN_COLUMNS),
                params![token.id.as_str()],
                Self::row_to_token,
            )
            .optional()
            .map_err(|e| Error::OperationFailed {
                operation: "check_token_version".to_string(),
                cause: e.to_string(),
            })?;
        check_put(token, current.as_ref(), expected_version)?;

        let fields = params![
            token.id.as_str(),
            version,
            token.content_hash,
            token.origin_id.as_str(),
            token.content.text,
            metadata,
            created_at,
            modified_at,
            token.relevance_score,
            visibility,
        ];
        tx.execute(
            "INSERT OR REPLACE INTO tokens (id, version, content_hash, origin_id, text, \
             metadata, created_at, modified_at, relevance_score, visibility) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            fields,
        )
        .map_err(|e| Error::OperationFailed {
            operation: "put_token".to_string(),
            cause: e.to_string(),
        })?;
        tx.execute(
            "INSERT INTO token_history (id, version, content_hash, origin_id, text, \
             metadata, created_at, modified_at, relevance_score, visibility) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            fields,
        )
        .map_err(|e| Error::OperationFailed {
            operation: "put_token_history".to_string(),
            cause: e.to_string(),
        })?;

        tx.commit().map_err(|e| Error::OperationFailed {
            operation: "commit_put_token".to_string(),
            cause: e.to_string(),
        })
    }

    fn history(&self, id: &TokenId) -> Result<Vec<MemoryToken>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM token_history WHERE id = ?1 ORDER BY seq ASC",
                Self::TOKEN_COLUMNS
            ))
            .map_err(|e| Error::OperationFailed {
                operation: "prepare_history".to_string(),
                cause: e.to_string(),
            })?;
        let rows = stmt
            .query_map(params![id.as_str()], Self::row_to_token)
            .map_err(|e| Error::OperationFailed {
                operation: "query_history".to_string(),
                cause: e.to_string(),
            })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::OperationFailed {
                operation: "read_history".to_string(),
                cause: e.to_string(),
            })
    }

    fn list_ids(&self) -> Result<Vec<TokenId>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT id FROM tokens ORDER BY id ASC")
            .map_err(|e| Error::OperationFailed {
                operation: "prepare_list_ids".to_string(),
                cause: e.to_string(),
            })?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| Error::OperationFailed {
                operation: "query_list_ids".to_string(),
                cause: e.to_string(),
            })?;
        rows.map(|r| r.map(TokenId::from))
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::OperationFailed {
                operation: "read_list_ids".to_string(),
                cause: e.to_string(),
            })
    }

    fn count(&self) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM tokens", [], |row| row.get(0))
            .map_err(|e| Error::OperationFailed {
                operation: "count_tokens".to_string(),
                cause: e.to_string(),
            })?;
        usize::try_from(count).map_err(|e| Error::OperationFailed {
            operation: "count_tokens".to_string(),
            cause: e.to_string(),
        })
    }
}
