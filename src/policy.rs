//! Computed-policy value objects and the policy engine boundary
//!
//! The cluster-wide policy computation engine is an external collaborator.
//! This module defines the objects it hands to the endpoint (identity-scoped
//! policy decisions, L4 and CIDR rule sets), the handle to the kernel policy
//! table, and the traits the endpoint drives them through. The matching
//! algorithm itself lives behind [`PolicyEngine`].

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::identity::{NumericIdentity, SecurityIdentity};

/// The security-identity-scoped policy decision object for an endpoint.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Consumable {
    /// Identity this decision set was computed for
    pub identity: NumericIdentity,
    /// Identities allowed to send to this endpoint
    pub allowed_ingress: BTreeSet<NumericIdentity>,
}

impl Consumable {
    /// Whether traffic from the given identity is allowed in.
    pub fn allows_ingress(&self, id: NumericIdentity) -> bool {
        self.allowed_ingress.contains(&id)
    }
}

/// A single L4 rule with an optional L7 parser attached.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct L4Filter {
    /// Destination port
    pub port: u16,
    /// L4 protocol name ("TCP", "UDP")
    pub protocol: String,
    /// L7 parser enforcing higher-layer policy through a proxy redirect
    pub l7_parser: Option<String>,
}

/// L4 policy in effect for an endpoint.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct L4Policy {
    /// Rules applied to ingress traffic
    pub ingress: Vec<L4Filter>,
    /// Rules applied to egress traffic
    pub egress: Vec<L4Filter>,
}

/// CIDR based policy, kept outside the [`Consumable`] because it is not
/// identity-scoped.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CidrPolicy {
    /// Allowed ingress prefixes
    pub ingress: Vec<String>,
    /// Allowed egress prefixes
    pub egress: Vec<String>,
}

/// Result of one policy recomputation.
#[derive(Clone, Debug, Default)]
pub struct ComputedPolicy {
    /// Identity-scoped decision object
    pub consumable: Consumable,
    /// L4 rules, if any apply
    pub l4_policy: Option<L4Policy>,
    /// CIDR rules, if any apply
    pub cidr_policy: Option<CidrPolicy>,
    /// Whether applying this result requires a full datapath regeneration
    pub needs_regeneration: bool,
}

/// The cluster-wide policy computation engine.
pub trait PolicyEngine: Send + Sync {
    /// Compute the policy objects for an endpoint given its current identity.
    /// `options_changed` reports whether endpoint options changed since the
    /// last computation.
    fn compute_policy(
        &self,
        endpoint_id: u16,
        identity: Option<&Arc<SecurityIdentity>>,
        options_changed: bool,
    ) -> Result<ComputedPolicy>;
}

/// Exclusive handle to the per-endpoint kernel policy table. Closed exactly
/// once on teardown.
pub trait PolicyMapHandle: Send + Sync {
    /// Close the table. Failure is reported but does not block the rest of
    /// teardown.
    fn close(&mut self) -> Result<()>;

    /// Identifier of the table, used in error reports.
    fn path(&self) -> String;
}

/// The datapath program builder. Compilation of the kernel program is out of
/// scope for this crate; regeneration drives it through this seam.
#[async_trait]
pub trait DatapathBuilder: Send + Sync {
    /// Rebuild the endpoint's datapath program.
    async fn build(&self, endpoint_id: u16, reason: &str) -> Result<()>;
}
