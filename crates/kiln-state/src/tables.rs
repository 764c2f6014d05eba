//! redb table definitions for the local metadata backend.
//!
//! Keys follow the pattern `{namespace}/{item}`; values are JSON documents.

use redb::TableDefinition;

/// Namespace metadata items keyed by `{namespace}/{item}`.
pub const METADATA: TableDefinition<&str, &[u8]> = TableDefinition::new("namespace_metadata");

pub fn item_key(namespace: &str, item: &str) -> String {
    format!("{namespace}/{item}")
}
