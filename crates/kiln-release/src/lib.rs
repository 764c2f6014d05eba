//! kiln-release — "latest version for a channel" lookups.
//!
//! Release listings are cached per namespace and per family in namespace
//! metadata, and refreshed when older than the configured TTL or when the
//! caller forces it.

pub mod error;
pub mod feed;
pub mod resolver;

pub use error::{ReleaseError, ReleaseResult};
pub use feed::{ChannelRelease, HttpReleaseFeed, ReleaseFamily, ReleaseFeed, ReleaseListing, TaggedRelease};
pub use resolver::ReleaseResolver;
