//! Authorization seam.
//!
//! Visibility and ACL enforcement belongs to an external collaborator; this
//! core consults it with a single `authorize` call before any commit becomes
//! externally visible. A `Deny` becomes an `AuthorizationRejected` terminal
//! outcome for that token; the rest of the batch is unaffected.

use crate::models::TokenId;

/// Decision returned by the authorization collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthzDecision {
    /// The operation may proceed.
    Allow,
    /// The operation is denied for this token.
    Deny,
}

/// Authorization collaborator consulted before commits.
pub trait Authorizer: Send + Sync {
    /// Authorizes `actor` to perform `operation` on `token_id`.
    fn authorize(&self, actor: &str, operation: &str, token_id: &TokenId) -> AuthzDecision;
}

/// Default authorizer that allows every operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _actor: &str, _operation: &str, _token_id: &TokenId) -> AuthzDecision {
        AuthzDecision::Allow
    }
}

/// Denies tokens whose id is in a fixed list. Test and policy-experiment aid.
#[derive(Debug, Clone, Default)]
pub struct DenyList {
    denied: Vec<TokenId>,
}

impl DenyList {
    /// Creates a deny list over the given token ids.
    #[must_use]
    pub const fn new(denied: Vec<TokenId>) -> Self {
        Self { denied }
    }
}

impl Authorizer for DenyList {
    fn authorize(&self, _actor: &str, _operation: &str, token_id: &TokenId) -> AuthzDecision {
        if self.denied.contains(token_id) {
            AuthzDecision::Deny
        } else {
            AuthzDecision::Allow
        }
    }
}
