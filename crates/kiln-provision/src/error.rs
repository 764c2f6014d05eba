//! Provisioning workflow errors.

use std::path::PathBuf;

use thiserror::Error;

use kiln_release::ReleaseError;
use kiln_remote::RemoteError;
use kiln_state::StateError;

pub type ProvisionResult<T> = Result<T, ProvisionError>;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("cluster {name} not found in namespace {namespace}")]
    ClusterNotFound { namespace: String, name: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("network {0} does not exist")]
    NetworkNotFound(String),

    /// A step ran before the field it depends on was populated.
    #[error("cluster {cluster} has no {field}")]
    MissingField { cluster: String, field: &'static str },

    #[error("kubeconfig error: {0}")]
    Kubeconfig(String),

    #[error("unable to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Release(#[from] ReleaseError),
}

impl ProvisionError {
    pub fn missing(cluster: &str, field: &'static str) -> Self {
        ProvisionError::MissingField {
            cluster: cluster.to_string(),
            field,
        }
    }
}
