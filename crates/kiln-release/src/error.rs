//! Release resolution errors.

use thiserror::Error;

use crate::feed::ReleaseFamily;

pub type ReleaseResult<T> = Result<T, ReleaseError>;

#[derive(Debug, Error)]
pub enum ReleaseError {
    #[error("{family} release channel {channel} not found")]
    UnknownChannel {
        family: ReleaseFamily,
        channel: String,
    },

    #[error("{0} release feed lists no stable releases")]
    NoReleases(ReleaseFamily),

    #[error("unable to fetch {family} releases: {message}")]
    Feed {
        family: ReleaseFamily,
        message: String,
    },

    #[error("state store error: {0}")]
    State(#[from] kiln_state::StateError),
}
