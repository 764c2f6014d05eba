//! Remote API and remote execution errors.

use thiserror::Error;

pub type RemoteResult<T> = Result<T, RemoteError>;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("API returned HTTP {status}: {body}")]
    Api { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("could not decode API response: {0}")]
    Decode(String),

    /// A command ran to completion with a non-zero exit code.
    #[error("command failed on {instance_name} ({instance}): `{command}` exited with {exit_code}")]
    CommandFailed {
        instance: String,
        instance_name: String,
        command: String,
        exit_code: i64,
        stdout: String,
        stderr: String,
    },

    /// A file fetch ended in the error state.
    #[error("fetch of {path} failed: {message}")]
    FetchFailed { path: String, message: String },

    /// An agent operation ended in the error state without a command result.
    #[error("agent operation {operation} on instance {instance} failed")]
    OperationFailed { operation: String, instance: String },

    #[error("timed out after {waited_secs}s waiting for {what}")]
    Timeout { what: String, waited_secs: u64 },

    /// The cluster record lacks something the operation needs.
    #[error("cluster {cluster} has no {field}")]
    MissingField { cluster: String, field: &'static str },

    #[error("state store error: {0}")]
    State(#[from] kiln_state::StateError),
}

impl RemoteError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::NotFound(_))
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            RemoteError::Decode(e.to_string())
        } else {
            RemoteError::Transport(e.to_string())
        }
    }
}
