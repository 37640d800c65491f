//! Endpoint lifecycle states and the legal transition table
//!
//! Every state change goes through the endpoint's guarded transition
//! operation, which consults [`can_transition`]. The table is explicit and
//! fail-closed: a pair not listed below is rejected, including transitions to
//! the current state.
//!
//! | From                 | To                                                        |
//! |----------------------|-----------------------------------------------------------|
//! | WaitingForIdentity   | WaitingToRegenerate, Disconnecting                        |
//! | WaitingToRegenerate  | Regenerating, WaitingForIdentity, Disconnecting           |
//! | Regenerating         | Ready, WaitingToRegenerate, Disconnecting                 |
//! | Ready                | WaitingForIdentity, WaitingToRegenerate, Disconnecting    |
//! | Restoring            | WaitingForIdentity, WaitingToRegenerate, Disconnecting    |
//! | Disconnecting        | Disconnected                                              |
//! | Disconnected         | (none)                                                    |

use serde::{Deserialize, Serialize};

/// Lifecycle phase of an endpoint.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum EndpointState {
    /// Labels changed; waiting for the identity service to resolve them
    WaitingForIdentity,
    /// A regeneration is required and queued
    WaitingToRegenerate,
    /// The datapath program is being rebuilt
    Regenerating,
    /// Policy applied, datapath up to date
    Ready,
    /// Teardown has begun
    Disconnecting,
    /// Terminal state; the endpoint must not be reused
    Disconnected,
    /// Restored from a persisted record, pending reconciliation
    Restoring,
}

impl std::fmt::Display for EndpointState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EndpointState::WaitingForIdentity => "waiting-for-identity",
            EndpointState::WaitingToRegenerate => "waiting-to-regenerate",
            EndpointState::Regenerating => "regenerating",
            EndpointState::Ready => "ready",
            EndpointState::Disconnecting => "disconnecting",
            EndpointState::Disconnected => "disconnected",
            EndpointState::Restoring => "restoring",
        };
        write!(f, "{s}")
    }
}

/// Whether the transition `from` -> `to` is legal.
pub fn can_transition(from: EndpointState, to: EndpointState) -> bool {
    use EndpointState::*;
    matches!(
        (from, to),
        (WaitingForIdentity, WaitingToRegenerate)
            | (WaitingForIdentity, Disconnecting)
            | (WaitingToRegenerate, Regenerating)
            | (WaitingToRegenerate, WaitingForIdentity)
            | (WaitingToRegenerate, Disconnecting)
            | (Regenerating, Ready)
            | (Regenerating, WaitingToRegenerate)
            | (Regenerating, Disconnecting)
            | (Ready, WaitingForIdentity)
            | (Ready, WaitingToRegenerate)
            | (Ready, Disconnecting)
            | (Restoring, WaitingForIdentity)
            | (Restoring, WaitingToRegenerate)
            | (Restoring, Disconnecting)
            | (Disconnecting, Disconnected)
    )
}
