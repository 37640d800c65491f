//! Error types for endpoint lifecycle management

use thiserror::Error;

/// Errors surfaced by endpoint operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Rejected configuration options
    #[error("invalid configuration: {0}")]
    Validation(String),

    /// Policy or datapath program build failure
    #[error("compilation failed: {0}")]
    Compilation(String),

    /// The endpoint could not reach the required state within the deadline
    #[error("unable to change state of endpoint {id}: {reason}")]
    StateChange { id: u16, reason: String },

    /// A label edit referenced a key not tracked in any label category
    #[error("label {0} not found")]
    NotFound(String),

    /// Endpoint directory create/remove failure
    #[error("resource error: {0}")]
    Resource(#[from] std::io::Error),

    /// Kernel policy table failure
    #[error("policy map error: {0}")]
    Map(String),

    /// Identity resolution or release failure
    #[error("identity error: {0}")]
    Identity(String),

    /// Outstanding proxy state changes did not settle
    #[error("proxy state changes failed: {0}")]
    Proxy(String),

    /// A persisted endpoint record could not be parsed
    #[error("invalid endpoint record: {0}")]
    Parse(String),
}

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
