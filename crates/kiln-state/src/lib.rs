//! kiln-state — persisted cluster state for kiln.
//!
//! Cluster records, the per-namespace cluster name index and release version
//! caches all live as items in a namespace-scoped key/value space. That space
//! is reached through the [`MetadataStore`] trait: the remote API's namespace
//! metadata in production, or a local [redb](https://docs.rs/redb) file.
//!
//! # Architecture
//!
//! ```text
//! ClusterStore
//!   ├── get / put / delete            orchestrated_k3s_cluster_{name}
//!   ├── list_names / register_name    orchestrated_k3s_clusters
//!   └── serial ledger                 orchestrated_k3s_cluster_serials
//!         │
//!         ▼
//!   dyn MetadataStore  (RedbMetadataStore | remote API client)
//! ```
//!
//! Every mutation is written through immediately; nothing is buffered, so a
//! restarted process observes exactly what was persisted before it stopped.

pub mod error;
pub mod metadata;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use metadata::{MetadataStore, RedbMetadataStore};
pub use store::ClusterStore;
pub use types::*;
