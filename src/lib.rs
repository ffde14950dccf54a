//! # Memsync
//!
//! A synchronization and merge engine for memory records.
//!
//! Memsync reconciles memory tokens captured at disconnected origins
//! (offline devices, exported archives, secondary sessions) with a canonical
//! store: it queues tokens durably per origin, transports them in batches,
//! deduplicates by content hash, classifies each incoming token against the
//! canonical record, and commits the result atomically per token id with a
//! full audit trail.
//!
//! ## Guarantees
//!
//! - At-least-once delivery with idempotent merge (duplicates absorbed,
//!   never silently dropped)
//! - Per-id linearizable commits via optimistic concurrency
//! - Content-addressed deduplication (SHA-256)
//! - Encrypted-at-rest local queues, one key per origin
//! - Append-only audit log of every sync, merge, export, and import
//!
//! ## Example
//!
//! ```rust,ignore
//! use memsync::{MemsyncConfig, MemsyncEngine, OriginId, OriginKey, SyncTrigger};
//!
//! let engine = MemsyncEngine::open(MemsyncConfig::load_default())?;
//! let origin = OriginId::from("laptop");
//! engine.register_origin(origin.clone(), &OriginKey::generate())?;
//! engine.enqueue(token)?;
//! let report = engine.sync(&origin, SyncTrigger::Manual)?;
//! tracing::info!("{}", report.summary());
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

use thiserror::Error as ThisError;

// Module declarations
pub mod audit;
pub mod authz;
pub mod config;
pub mod engine;
pub mod io;
pub mod merge;
pub mod models;
pub mod observability;
pub mod queue;
pub mod storage;
pub mod sync;
pub mod transport;

// Re-exports for convenience
pub use audit::{AuditEntry, AuditLog, AuditOperation, AuditOutcome};
pub use authz::{AllowAll, AuthzDecision, Authorizer};
pub use config::MemsyncConfig;
pub use engine::MemsyncEngine;
pub use io::{ArchiveService, ExportArchive, ExportFilter};
pub use merge::{MergeEngine, QuarantineStore, ResolutionPolicy};
pub use models::{
    BatchReport, ConflictDecision, ConflictRecord, ConflictResolution, IdempotencyKey,
    MemoryToken, MergeOutcome, OriginId, QuarantineBatch, QueueEntry, TokenContent, TokenId,
    Visibility,
};
pub use queue::{LocalQueueStore, OriginKey};
pub use storage::{CanonicalStore, InMemoryStore, SqliteStore};
pub use sync::{SyncCoordinator, SyncReport, SyncState, SyncTrigger};
pub use transport::{FlakyTransport, InMemoryTransport, TransportChannel};

/// Error type for memsync operations.
///
/// Uses `thiserror` for automatic `Display` and `Error` trait implementations.
///
/// # Error Variant Triggers
///
/// | Variant | Raised When |
/// |---------|-------------|
/// | `Transient` | Transport push/pull fails, timeouts — retried with backoff |
/// | `CorruptToken` | Declared content hash does not match the recomputed hash |
/// | `VersionConflict` | Optimistic per-id write loses a race against a concurrent commit |
/// | `PolicyUnavailable` | Resolution policy cannot be evaluated for a conflict |
/// | `AuthorizationRejected` | Authorization collaborator denies a commit |
/// | `EncryptionKeyUnavailable` | Origin queue key missing or invalid |
/// | `InvalidInput` | Malformed archives, bad configuration values |
/// | `OperationFailed` | Queue/store I/O errors, database failures |
#[derive(Debug, ThisError)]
pub enum Error {
    /// A transport-level failure that is expected to succeed on retry.
    ///
    /// Raised when:
    /// - A transport push or pull fails (network error, timeout)
    /// - The remote end is temporarily unreachable
    ///
    /// The sync coordinator retries these with exponential backoff.
    #[error("transient failure in '{operation}': {cause}")]
    Transient {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },

    /// A token's declared content hash does not match its content.
    ///
    /// Rejects the single token; never aborts the containing batch.
    #[error("corrupt token '{id}': declared hash {declared}, computed {computed}")]
    CorruptToken {
        /// The token id.
        id: String,
        /// The hash declared by the producer.
        declared: String,
        /// The hash recomputed from the content.
        computed: String,
    },

    /// An optimistic-concurrency write lost a race.
    ///
    /// Triggers bounded re-evaluation against the refreshed canonical state.
    #[error("version conflict on '{id}': expected {expected}, found {found}")]
    VersionConflict {
        /// The token id.
        id: String,
        /// The version the writer expected to replace.
        expected: u64,
        /// The version actually present in the canonical store.
        found: u64,
    },

    /// The resolution policy could not be evaluated.
    ///
    /// The conflicting id is deferred to manual resolution, never guessed.
    #[error("resolution policy unavailable: {0}")]
    PolicyUnavailable(String),

    /// The authorization collaborator denied the operation for a token.
    ///
    /// Terminal for that token, audited; the rest of the batch is unaffected.
    #[error("authorization rejected for '{id}' during {operation}")]
    AuthorizationRejected {
        /// The token id.
        id: String,
        /// The operation that was denied.
        operation: String,
    },

    /// The origin-scoped encryption key is missing or invalid.
    ///
    /// Fatal to that origin's queue operations until resolved; other origins
    /// are unaffected. Reads never fall back to plaintext.
    #[error("encryption key unavailable: {0}")]
    EncryptionKeyUnavailable(String),

    /// Invalid input was provided.
    ///
    /// Raised when:
    /// - An archive fails to parse or declares an unknown format version
    /// - A configuration value is out of range
    /// - A conflict decision references an unknown conflict
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An operation failed.
    ///
    /// Raised when:
    /// - Queue log I/O errors occur
    /// - `SQLite` canonical store operations fail
    /// - Audit log writes fail
    #[error("operation '{operation}' failed: {cause}")]
    OperationFailed {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },
}

impl Error {
    /// Returns `true` if the error is transient and worth retrying.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Result type alias for memsync operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Returns the current Unix timestamp in seconds.
///
/// Centralized utility to avoid duplicate implementations across the
/// codebase. Uses `SystemTime::now()` with fallback to 0 if the system
/// clock is before the Unix epoch.
#[must_use]
pub fn current_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
