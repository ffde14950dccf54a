//! Export and import of token archives.
//!
//! Exports produce a self-describing JSON archive of filtered canonical
//! tokens. Imports validate the archive, then feed every record through the
//! same merge pipeline a synced batch takes, so idempotency, conflict
//! handling, and auditing behave identically for archives and live syncs.

use crate::audit::{AuditEntry, AuditLog, AuditOperation};
use crate::merge::MergeEngine;
use crate::models::{BatchReport, MemoryToken, OriginId, QueueEntry, TokenId, Visibility};
use crate::storage::CanonicalStore;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::instrument;

/// Archive format marker.
pub const ARCHIVE_FORMAT: &str = "memsync-archive";
/// Highest archive version this build reads and writes.
pub const ARCHIVE_VERSION: u32 = 1;

/// Self-describing token archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportArchive {
    /// Format marker; always [`ARCHIVE_FORMAT`].
    pub format: String,
    /// Archive schema version.
    pub format_version: u32,
    /// When the export ran (Unix epoch seconds).
    pub exported_at: u64,
    /// Exported tokens with verified content hashes.
    pub tokens: Vec<MemoryToken>,
}

/// Selects which canonical tokens an export covers. Empty fields match
/// everything.
#[derive(Debug, Clone, Default)]
pub struct ExportFilter {
    /// Restrict to tokens written by these origins.
    pub origins: Vec<OriginId>,
    /// Restrict to these token ids.
    pub ids: Vec<TokenId>,
    /// Restrict to one visibility level.
    pub visibility: Option<Visibility>,
}

impl ExportFilter {
    fn matches(&self, token: &MemoryToken) -> bool {
        if !self.origins.is_empty() && !self.origins.contains(&token.origin_id) {
            return false;
        }
        if !self.ids.is_empty() && !self.ids.contains(&token.id) {
            return false;
        }
        if let Some(ref visibility) = self.visibility {
            if token.visibility != *visibility {
                return false;
            }
        }
        true
    }
}

/// Archive service over a canonical store and merge engine.
pub struct ArchiveService {
    store: Arc<dyn CanonicalStore>,
    engine: Arc<MergeEngine>,
    audit: Arc<AuditLog>,
}

impl ArchiveService {
    /// Creates an archive service sharing the given components.
    #[must_use]
    pub fn new(
        store: Arc<dyn CanonicalStore>,
        engine: Arc<MergeEngine>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            store,
            engine,
            audit,
        }
    }

    /// Exports the filtered canonical tokens as an archive.
    ///
    /// Every exported token's hash is re-verified against its content, so an
    /// archive never propagates silent canonical-store corruption.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptToken`] if a canonical record fails hash
    /// verification, and propagates store errors.
    #[instrument(skip(self, filter))]
    pub fn export(&self, filter: &ExportFilter) -> Result<ExportArchive> {
        let mut tokens = Vec::new();
        for id in self.store.list_ids()? {
            let Some(token) = self.store.get(&id)? else {
                continue;
            };
            if !filter.matches(&token) {
                continue;
            }
            token.verify_hash()?;
            tokens.push(token);
        }
        tokens.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));

        self.audit.append(
            AuditEntry::new(AuditOperation::Export, "export")
                .with_note(format!("{} tokens exported", tokens.len())),
        )?;
        metrics::counter!("memsync_exported_tokens_total").increment(tokens.len() as u64);

        Ok(ExportArchive {
            format: ARCHIVE_FORMAT.to_string(),
            format_version: ARCHIVE_VERSION,
            exported_at: crate::current_timestamp(),
            tokens,
        })
    }

    /// Exports the filtered tokens as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Propagates [`ArchiveService::export`] errors and serialization
    /// failures.
    pub fn export_json(&self, filter: &ExportFilter) -> Result<String> {
        let archive = self.export(filter)?;
        serde_json::to_string_pretty(&archive).map_err(|e| Error::OperationFailed {
            operation: "serialize_archive".to_string(),
            cause: e.to_string(),
        })
    }

    /// Imports an archive through the merge pipeline.
    ///
    /// Tokens keep the origins and versions they were exported with, so
    /// re-importing an archive (or importing overlapping archives) drains as
    /// duplicates and already-applied rather than double-writing. Records
    /// that fail hash verification are rejected individually; the rest of
    /// the archive still lands.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for an unrecognized format or an
    /// unsupported version, and propagates merge-pipeline failures.
    #[instrument(skip(self, archive), fields(tokens = archive.tokens.len()))]
    pub fn import(&self, archive: &ExportArchive, actor: &str) -> Result<BatchReport> {
        if archive.format != ARCHIVE_FORMAT {
            return Err(Error::InvalidInput(format!(
                "unrecognized archive format '{}'",
                archive.format
            )));
        }
        if archive.format_version > ARCHIVE_VERSION {
            return Err(Error::InvalidInput(format!(
                "archive version {} is newer than supported version {ARCHIVE_VERSION}",
                archive.format_version
            )));
        }

        let entries: Vec<QueueEntry> = archive
            .tokens
            .iter()
            .cloned()
            .map(QueueEntry::new)
            .collect();
        let report = self
            .engine
            .stage_and_merge(&OriginId::from(actor), entries)?;

        self.audit.append(
            AuditEntry::new(AuditOperation::Import, actor).with_note(report.summary()),
        )?;
        metrics::counter!("memsync_imported_tokens_total").increment(report.total() as u64);
        Ok(report)
    }

    /// Imports an archive from its JSON form.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the JSON does not parse as an
    /// archive, plus everything [`ArchiveService::import`] returns.
    pub fn import_json(&self, json: &str, actor: &str) -> Result<BatchReport> {
        let archive: ExportArchive = serde_json::from_str(json)
            .map_err(|e| Error::InvalidInput(format!("malformed archive: {e}")))?;
        self.import(&archive, actor)
    }
}
