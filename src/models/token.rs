//! Memory token types and content hashing.
//!
//! The token is the canonical unit of data moved through the engine. Its
//! `content_hash` is a pure function of the content: SHA-256 over a canonical
//! rendition (text, then metadata entries in key order), hex-encoded. Any
//! token whose declared hash does not reproduce from its content is corrupt
//! and rejected.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Stable logical identifier for a memory token, unique across all origins.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenId(String);

impl TokenId {
    /// Creates a new token ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TokenId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TokenId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of the device or session that created or last modified a token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OriginId(String);

impl OriginId {
    /// Creates a new origin ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OriginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for OriginId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A metadata value attached to token content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    /// String value.
    String(String),
    /// Numeric value.
    Number(f64),
    /// Boolean value.
    Bool(bool),
}

impl MetadataValue {
    /// Renders the value for the canonical hash input.
    fn canonical(&self) -> String {
        match self {
            Self::String(s) => format!("s:{s}"),
            Self::Number(n) => format!("n:{n}"),
            Self::Bool(b) => format!("b:{b}"),
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<f64> for MetadataValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<bool> for MetadataValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

/// Opaque token payload: text plus a metadata mapping.
///
/// Metadata uses a `BTreeMap` so the canonical hash input has a
/// deterministic key order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TokenContent {
    /// The memory text.
    pub text: String,
    /// Metadata mapping (string keys to string/number/boolean values).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, MetadataValue>,
}

impl TokenContent {
    /// Creates content with text only.
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Builds the canonical string the content hash is computed over.
    ///
    /// Format: the text, then one `\x1f`-separated `key=value` unit per
    /// metadata entry in key order. The unit separator cannot appear in
    /// rendered values, so distinct contents never collide structurally.
    #[must_use]
    pub fn canonical_string(&self) -> String {
        let mut out = self.text.clone();
        for (key, value) in &self.metadata {
            out.push('\u{1f}');
            out.push_str(key);
            out.push('=');
            out.push_str(&value.canonical());
        }
        out
    }

    /// Computes the lowercase hex SHA-256 hash of the canonical content.
    #[must_use]
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Visibility policy tag, carried opaquely for audit context.
///
/// Enforcement belongs to the authorization collaborator, not this core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    /// Visible to the owning user only.
    #[default]
    Private,
    /// Visible to the owning team.
    Team,
    /// Shared beyond the team.
    Shared,
    /// A policy tag this core does not interpret.
    Other(String),
}

/// The canonical unit of data moved through the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryToken {
    /// Stable logical identifier, unique per logical memory across origins.
    pub id: TokenId,
    /// Opaque payload.
    pub content: TokenContent,
    /// Deterministic digest of `content`, used for deduplication.
    pub content_hash: String,
    /// Origin that created or last modified the token.
    pub origin_id: OriginId,
    /// Monotonically increasing counter per `id`.
    pub version: u64,
    /// Capture timestamp (Unix epoch seconds), not sync time.
    pub created_at: u64,
    /// Last-modification timestamp (Unix epoch seconds).
    pub modified_at: u64,
    /// Relevance score produced by an external collaborator, carried opaquely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relevance_score: Option<f64>,
    /// Visibility policy tag, consumed only for audit context.
    #[serde(default)]
    pub visibility: Visibility,
}

impl MemoryToken {
    /// Creates a token at version 1 with its hash computed from the content.
    #[must_use]
    pub fn new(id: impl Into<TokenId>, content: TokenContent, origin: impl Into<OriginId>) -> Self {
        let now = crate::current_timestamp();
        let content_hash = content.hash();
        Self {
            id: id.into(),
            content,
            content_hash,
            origin_id: origin.into(),
            version: 1,
            created_at: now,
            modified_at: now,
            relevance_score: None,
            visibility: Visibility::default(),
        }
    }

    /// Sets the version.
    #[must_use]
    pub const fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Sets the relevance score.
    #[must_use]
    pub const fn with_relevance_score(mut self, score: f64) -> Self {
        self.relevance_score = Some(score);
        self
    }

    /// Sets the visibility tag.
    #[must_use]
    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    /// Replaces the content, bumping the version and recomputing the hash.
    #[must_use]
    pub fn updated(mut self, content: TokenContent, origin: impl Into<OriginId>) -> Self {
        self.content_hash = content.hash();
        self.content = content;
        self.origin_id = origin.into();
        self.version += 1;
        self.modified_at = crate::current_timestamp();
        self
    }

    /// Verifies the declared hash against the recomputed content hash.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::CorruptToken`] on mismatch.
    pub fn verify_hash(&self) -> crate::Result<()> {
        let computed = self.content.hash();
        if computed == self.content_hash {
            Ok(())
        } else {
            Err(crate::Error::CorruptToken {
                id: self.id.to_string(),
                declared: self.content_hash.clone(),
                computed,
            })
        }
    }
}
