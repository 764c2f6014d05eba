//! Error types for the kiln state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("cluster name {name} is already taken in namespace {namespace}")]
    NameTaken { namespace: String, name: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    /// The namespace metadata backend (e.g. the remote API) failed.
    #[error("metadata backend error: {0}")]
    Backend(String),
}
