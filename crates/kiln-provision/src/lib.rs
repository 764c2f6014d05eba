//! kiln-provision — cluster provisioning workflows.
//!
//! Each workflow is straight-line async code over a [`WorkflowContext`]:
//! the operation tracker turns remote asynchronous operations into waits,
//! and the cluster record is persisted after every step a later step
//! depends on.
//!
//! # Components
//!
//! - **`create`** — the forward provisioning sequence
//! - **`teardown`** — idempotent removal of a cluster
//! - **`expand`** — adding workers or addresses, patching nodes
//! - **`inspect`** — list, show, kubeconfig and version queries
//! - **`kubeconfig`** — kubeconfig rewriting and the local kubeconfig file
//! - **`scripts`** — the commands run on nodes

pub mod context;
pub mod create;
pub mod error;
pub mod expand;
pub mod inspect;
pub mod kubeconfig;
pub mod scripts;
pub mod steps;
pub mod teardown;

pub use context::WorkflowContext;
pub use create::{create_cluster, read_ssh_key, CreateRequest};
pub use error::{ProvisionError, ProvisionResult};
pub use expand::{expand_addresses, expand_workers, update_os};
pub use inspect::{get_kubeconfig, list_clusters, query_version, show_cluster};
pub use kubeconfig::{rewrite_kubeconfig, KubeconfigFile};
pub use teardown::delete_cluster;
