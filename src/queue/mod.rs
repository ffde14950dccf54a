//! Durable, encrypted per-origin local queue.
//!
//! Each origin owns an append-only log of pending memory tokens captured
//! while disconnected. Entries are persisted (and fsynced) before `enqueue`
//! returns, survive process restart, and are removed only after the owning
//! sync coordinator receives a terminal verdict for their idempotency key.
//! Order within an origin is FIFO; cross-origin ordering is not guaranteed.
//!
//! Records are AES-256-GCM encrypted with an origin-scoped key and
//! base64-armored one-per-line. A missing or invalid key fails all reads
//! with `EncryptionKeyUnavailable`; plaintext fallback does not exist.

pub mod encryption;

pub use encryption::{OriginKey, QueueEncryptor};

use crate::models::{IdempotencyKey, MemoryToken, OriginId, QueueEntry};
use crate::{Error, Result};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Ack records accumulated before the log is compacted in place.
const COMPACT_THRESHOLD: usize = 128;

/// One record in the queue log.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
enum LogRecord {
    /// A token entered the queue.
    Enqueue {
        /// The queued entry.
        entry: QueueEntry,
    },
    /// A terminal verdict arrived; the entry left the queue.
    Ack {
        /// The acknowledged key.
        key: IdempotencyKey,
    },
    /// A stale verdict arrived; the entry stays queued with a bumped counter.
    Stale {
        /// The affected key.
        key: IdempotencyKey,
    },
}

struct QueueInner {
    file: File,
    pending: Vec<QueueEntry>,
    acks_since_compact: usize,
}

/// Durable encrypted FIFO queue for one origin.
pub struct LocalQueueStore {
    origin: OriginId,
    path: PathBuf,
    encryptor: QueueEncryptor,
    inner: Mutex<QueueInner>,
}

impl std::fmt::Debug for LocalQueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalQueueStore")
            .field("origin", &self.origin)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl LocalQueueStore {
    /// Opens (or creates) the queue log for an origin under `dir`.
    ///
    /// Existing records are decrypted and replayed to rebuild the pending
    /// set, so entries enqueued before a crash are still delivered.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EncryptionKeyUnavailable`] if existing records do
    /// not authenticate under `key`, or an I/O error if the log cannot be
    /// opened.
    pub fn open(dir: &Path, origin: OriginId, key: &OriginKey) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(|e| Error::OperationFailed {
            operation: "create_queue_dir".to_string(),
            cause: e.to_string(),
        })?;
        let path = dir.join(format!("{origin}.qlog"));
        let encryptor = QueueEncryptor::new(key);

        let pending = if path.exists() {
            Self::replay(&path, &encryptor)?
        } else {
            Vec::new()
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::OperationFailed {
                operation: "open_queue_log".to_string(),
                cause: e.to_string(),
            })?;

        Ok(Self {
            origin,
            path,
            encryptor,
            inner: Mutex::new(QueueInner {
                file,
                pending,
                acks_since_compact: 0,
            }),
        })
    }

    /// Replays a queue log into the pending entry set.
    fn replay(path: &Path, encryptor: &QueueEncryptor) -> Result<Vec<QueueEntry>> {
        let file = File::open(path).map_err(|e| Error::OperationFailed {
            operation: "open_queue_log".to_string(),
            cause: e.to_string(),
        })?;

        let mut pending: Vec<QueueEntry> = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| Error::OperationFailed {
                operation: "read_queue_log".to_string(),
                cause: e.to_string(),
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let record = Self::decode_record(&line, encryptor)?;
            match record {
                LogRecord::Enqueue { entry } => {
                    if !pending.iter().any(|p| p.idempotency_key == entry.idempotency_key) {
                        pending.push(entry);
                    }
                },
                LogRecord::Ack { key } => {
                    pending.retain(|p| p.idempotency_key != key);
                },
                LogRecord::Stale { key } => {
                    if let Some(entry) =
                        pending.iter_mut().find(|p| p.idempotency_key == key)
                    {
                        entry.stale_deliveries += 1;
                    }
                },
            }
        }
        Ok(pending)
    }

    fn decode_record(line: &str, encryptor: &QueueEncryptor) -> Result<LogRecord> {
        let ciphertext = base64::engine::general_purpose::STANDARD
            .decode(line.trim())
            .map_err(|e| Error::OperationFailed {
                operation: "decode_queue_record".to_string(),
                cause: e.to_string(),
            })?;
        let plaintext = encryptor.decrypt(&ciphertext)?;
        serde_json::from_slice(&plaintext).map_err(|e| Error::OperationFailed {
            operation: "parse_queue_record".to_string(),
            cause: e.to_string(),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, QueueInner>> {
        self.inner.lock().map_err(|_| Error::OperationFailed {
            operation: "queue_lock".to_string(),
            cause: "queue mutex poisoned".to_string(),
        })
    }

    /// Appends one encrypted record and syncs it to disk.
    fn append_record(&self, inner: &mut QueueInner, record: &LogRecord) -> Result<()> {
        let plaintext = serde_json::to_vec(record).map_err(|e| Error::OperationFailed {
            operation: "serialize_queue_record".to_string(),
            cause: e.to_string(),
        })?;
        let ciphertext = self.encryptor.encrypt(&plaintext)?;
        let armored = base64::engine::general_purpose::STANDARD.encode(ciphertext);
        writeln!(inner.file, "{armored}").map_err(|e| Error::OperationFailed {
            operation: "write_queue_log".to_string(),
            cause: e.to_string(),
        })?;
        // Durability before enqueue/ack returns.
        inner.file.sync_all().map_err(|e| Error::OperationFailed {
            operation: "sync_queue_log".to_string(),
            cause: e.to_string(),
        })
    }

    /// The origin this queue belongs to.
    #[must_use]
    pub const fn origin(&self) -> &OriginId {
        &self.origin
    }

    /// Enqueues a token, persisting it before returning.
    ///
    /// Re-enqueueing the same logical write (same idempotency key) is a
    /// no-op returning the existing key.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be persisted.
    pub fn enqueue(&self, token: MemoryToken) -> Result<IdempotencyKey> {
        let entry = QueueEntry::new(token);
        let key = entry.idempotency_key.clone();
        let mut inner = self.lock()?;

        if inner
            .pending
            .iter()
            .any(|p| p.idempotency_key == key)
        {
            tracing::debug!(origin = %self.origin, key = %key, "Duplicate enqueue absorbed");
            return Ok(key);
        }

        self.append_record(&mut inner, &LogRecord::Enqueue {
            entry: entry.clone(),
        })?;
        inner.pending.push(entry);
        tracing::debug!(origin = %self.origin, key = %key, "Token enqueued");
        Ok(key)
    }

    /// Returns up to `max_n` pending entries in FIFO order without
    /// removing them.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue is unavailable.
    pub fn drain(&self, max_n: usize) -> Result<Vec<QueueEntry>> {
        let inner = self.lock()?;
        Ok(inner.pending.iter().take(max_n).cloned().collect())
    }

    /// Removes an entry after a confirmed terminal outcome.
    ///
    /// Returns `true` if the entry was present. Compacts the log in place
    /// once enough acknowledgements accumulate.
    ///
    /// # Errors
    ///
    /// Returns an error if the ack record cannot be persisted.
    pub fn acknowledge(&self, key: &IdempotencyKey) -> Result<bool> {
        let mut inner = self.lock()?;
        let before = inner.pending.len();
        inner.pending.retain(|p| &p.idempotency_key != key);
        if inner.pending.len() == before {
            return Ok(false);
        }

        self.append_record(&mut inner, &LogRecord::Ack { key: key.clone() })?;
        inner.acks_since_compact += 1;
        if inner.acks_since_compact >= COMPACT_THRESHOLD {
            self.compact_locked(&mut inner)?;
        }
        Ok(true)
    }

    /// Records a `Stale` verdict for an entry, returning its new
    /// consecutive-stale count. The entry stays queued.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be persisted.
    pub fn record_stale(&self, key: &IdempotencyKey) -> Result<u32> {
        let mut inner = self.lock()?;
        self.append_record(&mut inner, &LogRecord::Stale { key: key.clone() })?;
        let count = inner
            .pending
            .iter_mut()
            .find(|p| &p.idempotency_key == key)
            .map_or(0, |entry| {
                entry.stale_deliveries += 1;
                entry.stale_deliveries
            });
        Ok(count)
    }

    /// Number of pending entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue is unavailable.
    pub fn pending_len(&self) -> Result<usize> {
        Ok(self.lock()?.pending.len())
    }

    /// Rewrites the log to contain only pending entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the rewrite fails.
    pub fn compact(&self) -> Result<()> {
        let mut inner = self.lock()?;
        self.compact_locked(&mut inner)
    }

    fn compact_locked(&self, inner: &mut QueueInner) -> Result<()> {
        let tmp_path = self.path.with_extension("qlog.tmp");
        {
            let mut tmp = File::create(&tmp_path).map_err(|e| Error::OperationFailed {
                operation: "compact_queue_log".to_string(),
                cause: e.to_string(),
            })?;
            for entry in &inner.pending {
                let plaintext = serde_json::to_vec(&LogRecord::Enqueue {
                    entry: entry.clone(),
                })
                .map_err(|e| Error::OperationFailed {
                    operation: "serialize_queue_record".to_string(),
                    cause: e.to_string(),
                })?;
                let ciphertext = self.encryptor.encrypt(&plaintext)?;
                let armored = base64::engine::general_purpose::STANDARD.encode(ciphertext);
                writeln!(tmp, "{armored}").map_err(|e| Error::OperationFailed {
                    operation: "compact_queue_log".to_string(),
                    cause: e.to_string(),
                })?;
            }
            tmp.sync_all().map_err(|e| Error::OperationFailed {
                operation: "compact_queue_log".to_string(),
                cause: e.to_string(),
            })?;
        }
        std::fs::rename(&tmp_path, &self.path).map_err(|e| Error::OperationFailed {
            operation: "compact_queue_log".to_string(),
            cause: e.to_string(),
        })?;

        inner.file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| Error::OperationFailed {
                operation: "reopen_queue_log".to_string(),
                cause: e.to_string(),
            })?;
        inner.acks_since_compact = 0;
        tracing::debug!(origin = %self.origin, pending = inner.pending.len(), "Queue log compacted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TokenContent;

    fn token(id: &str, version: u64) -> MemoryToken {
        MemoryToken::new(id, TokenContent::new(format!("note {id} v{version}")), "dev-1")
            .with_version(version)
    }

    #[test]
    fn test_enqueue_drain_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let key = OriginKey::generate();
        let queue = LocalQueueStore::open(dir.path(), OriginId::from("dev-1"), &key).unwrap();

        queue.enqueue(token("a", 1)).unwrap();
        queue.enqueue(token("b", 1)).unwrap();
        queue.enqueue(token("c", 1)).unwrap();

        let drained = queue.drain(2).unwrap();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].token.id.as_str(), "a");
        assert_eq!(drained[1].token.id.as_str(), "b");
        // Drain does not remove entries.
        assert_eq!(queue.pending_len().unwrap(), 3);
    }

    #[test]
    fn test_duplicate_enqueue_is_absorbed() {
        let dir = tempfile::tempdir().unwrap();
        let key = OriginKey::generate();
        let queue = LocalQueueStore::open(dir.path(), OriginId::from("dev-1"), &key).unwrap();

        let k1 = queue.enqueue(token("a", 1)).unwrap();
        let k2 = queue.enqueue(token("a", 1)).unwrap();
        assert_eq!(k1, k2);
        assert_eq!(queue.pending_len().unwrap(), 1);
    }

    #[test]
    fn test_acknowledge_removes_entry() {
        let dir = tempfile::tempdir().unwrap();
        let key = OriginKey::generate();
        let queue = LocalQueueStore::open(dir.path(), OriginId::from("dev-1"), &key).unwrap();

        let k = queue.enqueue(token("a", 1)).unwrap();
        assert!(queue.acknowledge(&k).unwrap());
        assert!(!queue.acknowledge(&k).unwrap());
        assert_eq!(queue.pending_len().unwrap(), 0);
    }

    #[test]
    fn test_entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let key = OriginKey::generate();
        let origin = OriginId::from("dev-1");

        let acked;
        {
            let queue = LocalQueueStore::open(dir.path(), origin.clone(), &key).unwrap();
            queue.enqueue(token("a", 1)).unwrap();
            acked = queue.enqueue(token("b", 1)).unwrap();
            queue.enqueue(token("c", 1)).unwrap();
            queue.acknowledge(&acked).unwrap();
        }

        let reopened = LocalQueueStore::open(dir.path(), origin, &key).unwrap();
        assert_eq!(reopened.pending_len().unwrap(), 2);
        let drained = reopened.drain(10).unwrap();
        assert_eq!(drained[0].token.id.as_str(), "a");
        assert_eq!(drained[1].token.id.as_str(), "c");
    }

    #[test]
    fn test_wrong_key_fails_reads() {
        let dir = tempfile::tempdir().unwrap();
        let origin = OriginId::from("dev-1");
        {
            let queue =
                LocalQueueStore::open(dir.path(), origin.clone(), &OriginKey::generate()).unwrap();
            queue.enqueue(token("a", 1)).unwrap();
        }

        let err = LocalQueueStore::open(dir.path(), origin, &OriginKey::generate()).unwrap_err();
        assert!(matches!(err, Error::EncryptionKeyUnavailable(_)));
    }

    #[test]
    fn test_log_is_not_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let key = OriginKey::generate();
        let queue = LocalQueueStore::open(dir.path(), OriginId::from("dev-1"), &key).unwrap();
        queue.enqueue(token("a", 1)).unwrap();

        let raw = std::fs::read_to_string(dir.path().join("dev-1.qlog")).unwrap();
        assert!(!raw.contains("note a"));
        assert!(!raw.contains("idempotency_key"));
    }

    #[test]
    fn test_stale_counter_persists() {
        let dir = tempfile::tempdir().unwrap();
        let key = OriginKey::generate();
        let origin = OriginId::from("dev-1");
        let k;
        {
            let queue = LocalQueueStore::open(dir.path(), origin.clone(), &key).unwrap();
            k = queue.enqueue(token("a", 1)).unwrap();
            assert_eq!(queue.record_stale(&k).unwrap(), 1);
            assert_eq!(queue.record_stale(&k).unwrap(), 2);
        }

        let reopened = LocalQueueStore::open(dir.path(), origin, &key).unwrap();
        let drained = reopened.drain(1).unwrap();
        assert_eq!(drained[0].stale_deliveries, 2);
    }

    #[test]
    fn test_compact_preserves_pending() {
        let dir = tempfile::tempdir().unwrap();
        let key = OriginKey::generate();
        let queue = LocalQueueStore::open(dir.path(), OriginId::from("dev-1"), &key).unwrap();

        queue.enqueue(token("a", 1)).unwrap();
        let k = queue.enqueue(token("b", 1)).unwrap();
        queue.acknowledge(&k).unwrap();
        queue.compact().unwrap();

        assert_eq!(queue.pending_len().unwrap(), 1);
        queue.enqueue(token("c", 1)).unwrap();
        assert_eq!(queue.pending_len().unwrap(), 2);
    }
}
