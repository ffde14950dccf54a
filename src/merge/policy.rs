//! Conflict resolution policies.
//!
//! A closed set of named policy variants selected by configuration, each
//! implementing the same decision contract. The merge engine consults the
//! policy in exactly two situations: an incoming token with a strictly newer
//! version, and an equal-version concurrent-write collision.

use crate::models::MemoryToken;
use crate::{Error, Result};

/// External relevance-scoring collaborator.
///
/// Consumed only by [`ResolutionPolicy::RelevanceWeighted`]; scores are
/// produced elsewhere and treated as opaque numbers here.
pub trait RelevanceScorer: Send + Sync {
    /// Scores a token. Higher wins.
    fn score(&self, token: &MemoryToken) -> Result<f64>;
}

/// What the policy decided for a conflicting pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    /// Commit the incoming token.
    KeepIncoming {
        /// Audit note explaining the rule that fired.
        note: String,
    },
    /// Keep the canonical token; the incoming write loses.
    KeepCanonical {
        /// Audit note explaining the rule that fired.
        note: String,
    },
    /// Defer to manual resolution.
    Manual,
}

/// Pluggable conflict resolution policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResolutionPolicy {
    /// A strictly higher version wins automatically; equal-version
    /// collisions fall back to the hash tie-break.
    VersionWins,
    /// Like `VersionWins`, named for its collision rule: deterministic
    /// lexicographic content-hash tie-break. The default.
    #[default]
    HashTiebreak,
    /// Every conflict goes to manual resolution.
    ManualOnly,
    /// Collisions prefer the higher relevance score, falling back to the
    /// hash tie-break when scores are missing or equal.
    RelevanceWeighted,
}

impl ResolutionPolicy {
    /// Parses a policy name. Unknown names fall back to the default.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "version-wins" | "version_wins" => Self::VersionWins,
            "manual-only" | "manual_only" => Self::ManualOnly,
            "relevance-weighted" | "relevance_weighted" => Self::RelevanceWeighted,
            _ => Self::HashTiebreak,
        }
    }

    /// Configuration name of the policy.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::VersionWins => "version-wins",
            Self::HashTiebreak => "hash-tiebreak",
            Self::ManualOnly => "manual-only",
            Self::RelevanceWeighted => "relevance-weighted",
        }
    }

    /// Decides whether an incoming token with a strictly newer version may
    /// supersede the canonical record automatically.
    #[must_use]
    pub fn decide_newer(self, incoming: &MemoryToken, canonical: &MemoryToken) -> PolicyDecision {
        match self {
            Self::ManualOnly => PolicyDecision::Manual,
            Self::VersionWins | Self::HashTiebreak | Self::RelevanceWeighted => {
                PolicyDecision::KeepIncoming {
                    note: format!(
                        "version {} supersedes canonical {}",
                        incoming.version, canonical.version
                    ),
                }
            },
        }
    }

    /// Decides an equal-version concurrent-write collision.
    ///
    /// Version alone cannot order the writes, so the decision must be
    /// deterministic and reproducible for the same pair regardless of
    /// arrival order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PolicyUnavailable`] if the policy needs relevance
    /// scores that cannot be obtained; the caller defers the id to manual
    /// resolution rather than guessing.
    pub fn decide_collision(
        self,
        incoming: &MemoryToken,
        canonical: &MemoryToken,
        scorer: Option<&dyn RelevanceScorer>,
    ) -> Result<PolicyDecision> {
        match self {
            Self::ManualOnly => Ok(PolicyDecision::Manual),
            Self::VersionWins | Self::HashTiebreak => {
                Ok(Self::hash_tiebreak(incoming, canonical))
            },
            Self::RelevanceWeighted => {
                let incoming_score = Self::relevance(incoming, scorer)?;
                let canonical_score = Self::relevance(canonical, scorer)?;
                if (incoming_score - canonical_score).abs() < f64::EPSILON {
                    return Ok(Self::hash_tiebreak(incoming, canonical));
                }
                if incoming_score > canonical_score {
                    Ok(PolicyDecision::KeepIncoming {
                        note: format!(
                            "relevance tie-break: {incoming_score:.4} > {canonical_score:.4}"
                        ),
                    })
                } else {
                    Ok(PolicyDecision::KeepCanonical {
                        note: format!(
                            "relevance tie-break: {canonical_score:.4} >= {incoming_score:.4}"
                        ),
                    })
                }
            },
        }
    }

    /// Deterministic tie-break: the lexicographically larger content hash
    /// wins. Reproducible across repeated runs with the same inputs.
    fn hash_tiebreak(incoming: &MemoryToken, canonical: &MemoryToken) -> PolicyDecision {
        if incoming.content_hash > canonical.content_hash {
            PolicyDecision::KeepIncoming {
                note: format!(
                    "hash tie-break at version {}: {} > {}",
                    incoming.version, incoming.content_hash, canonical.content_hash
                ),
            }
        } else {
            PolicyDecision::KeepCanonical {
                note: format!(
                    "hash tie-break at version {}: {} >= {}",
                    incoming.version, canonical.content_hash, incoming.content_hash
                ),
            }
        }
    }

    fn relevance(token: &MemoryToken, scorer: Option<&dyn RelevanceScorer>) -> Result<f64> {
        if let Some(scorer) = scorer {
            return scorer.score(token);
        }
        token.relevance_score.ok_or_else(|| {
            Error::PolicyUnavailable(format!(
                "relevance-weighted policy needs a score for '{}'",
                token.id
            ))
        })
    }
}
