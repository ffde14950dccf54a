//! Data models for memsync.
//!
//! This module contains all the core data structures moved through the
//! sync and merge pipeline.

mod batch;
mod conflict;
mod queue;
mod token;

pub use batch::{BatchId, BatchReport, BatchState, MergeOutcome, MergeVerdict, QuarantineBatch};
pub use conflict::{ConflictDecision, ConflictRecord, ConflictResolution};
pub use queue::{IdempotencyKey, QueueEntry};
pub use token::{MemoryToken, MetadataValue, OriginId, TokenContent, TokenId, Visibility};
