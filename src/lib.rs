//! Meshpoint Endpoint: per-workload network endpoint lifecycle management
//!
//! This crate provides the endpoint core of a node agent: the concurrent
//! lifecycle state machine, label and security-identity reconciliation,
//! policy regeneration orchestration, the bounded status log, and persistence
//! of endpoints across agent restarts.

pub mod completion;
pub mod controller;
pub mod endpoint;
pub mod error;
pub mod identity;
pub mod labels;
pub mod option;
pub mod policy;
pub mod proxy;
pub mod state;
pub mod status;

pub use crate::endpoint::{
    parse_endpoint, Endpoint, EndpointConfigurationSpec, EndpointServices, MacAddr, Owner,
    PersistedEndpoint, PolicyRevisionWait, UpdateTimeouts, PERSIST_PREFIX,
};
pub use crate::error::{Error, Result};
pub use crate::state::EndpointState;
pub use crate::status::{StatusCode, StatusType};
