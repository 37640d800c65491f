//! Security identities derived from identity-relevant labels
//!
//! A [`SecurityIdentity`] is a cluster-wide, reference-counted object shared
//! between all endpoints carrying the same identity-relevant label set. The
//! identity service owns allocation; an endpoint holds a single reference and
//! releases it exactly once on teardown.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::labels::{labels_sha256, Labels};

/// Numeric security identity, unique cluster-wide for a label set.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct NumericIdentity(pub u64);

impl NumericIdentity {
    /// Sentinel for an endpoint whose identity has not been resolved.
    pub const INVALID: NumericIdentity = NumericIdentity(0);
}

impl std::fmt::Display for NumericIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A resolved security identity: the numeric ID, the label set it was derived
/// from, and a SHA256 hash over those labels.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityIdentity {
    /// The numeric identity
    pub id: NumericIdentity,
    /// The identity-relevant labels this identity was resolved from
    pub labels: Labels,
    /// SHA256 hex digest over `labels`
    pub labels_sha256: String,
}

impl SecurityIdentity {
    /// Build an identity for the given label set, computing the label hash.
    pub fn new(id: NumericIdentity, labels: Labels) -> Self {
        let labels_sha256 = labels_sha256(&labels);
        Self {
            id,
            labels,
            labels_sha256,
        }
    }
}

/// Identity service collaborator.
///
/// Resolution is asynchronous and may be superseded: a caller applying a
/// resolution result must discard it if the endpoint's identity revision has
/// advanced past the revision that triggered the request.
#[async_trait]
pub trait IdentityAllocator: Send + Sync {
    /// Resolve (allocating if necessary) the identity for a label set.
    async fn resolve(&self, labels: Labels) -> Result<Arc<SecurityIdentity>>;

    /// Release one reference to a previously resolved identity.
    fn release(&self, identity: &SecurityIdentity) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::{Label, SOURCE_ORCHESTRATION};

    #[test]
    fn identity_hash_matches_label_set() {
        let labels: Labels = [Label::new("app", "web", SOURCE_ORCHESTRATION)]
            .into_iter()
            .collect();
        let identity = SecurityIdentity::new(NumericIdentity(4021), labels.clone());
        assert_eq!(identity.labels_sha256, labels_sha256(&labels));
        assert_ne!(identity.id, NumericIdentity::INVALID);
    }
}
