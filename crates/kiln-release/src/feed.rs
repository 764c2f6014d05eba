//! Release feeds — where upstream release listings come from.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use kiln_core::config::ReleasesConfig;

use crate::error::{ReleaseError, ReleaseResult};

/// Metadata item caching the k3s channel listing.
pub const K3S_CACHE_KEY: &str = "orchestrated_k3s_cluster_k3s_version_cache";

/// Metadata item caching the longhorn release listing.
pub const LONGHORN_CACHE_KEY: &str = "orchestrated_k3s_cluster_longhorn_version_cache";

/// Independently cached streams of upstream versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReleaseFamily {
    /// Cluster software, resolved by named channel.
    K3s,
    /// Storage layer, resolved by semantic-version ordering.
    Longhorn,
}

impl ReleaseFamily {
    /// Media type the family's feed answers with.
    pub fn accept(self) -> &'static str {
        match self {
            ReleaseFamily::K3s => "application/json",
            ReleaseFamily::Longhorn => "application/vnd.github+json",
        }
    }

    pub fn cache_key(self) -> &'static str {
        match self {
            ReleaseFamily::K3s => K3S_CACHE_KEY,
            ReleaseFamily::Longhorn => LONGHORN_CACHE_KEY,
        }
    }
}

impl fmt::Display for ReleaseFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReleaseFamily::K3s => f.write_str("k3s"),
            ReleaseFamily::Longhorn => f.write_str("longhorn"),
        }
    }
}

/// One entry of a channel listing.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChannelRelease {
    pub name: String,
    pub latest: String,
}

/// One entry of a tagged release listing.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TaggedRelease {
    pub tag_name: String,
    #[serde(default)]
    pub prerelease: bool,
    #[serde(default)]
    pub tarball_url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReleaseListing {
    Channels(Vec<ChannelRelease>),
    Tagged(Vec<TaggedRelease>),
}

#[async_trait]
pub trait ReleaseFeed: Send + Sync {
    /// Fetch the full, current listing for a family.
    async fn fetch(&self, family: ReleaseFamily) -> ReleaseResult<ReleaseListing>;
}

#[derive(Deserialize)]
struct ChannelDocument {
    data: Vec<ChannelRelease>,
}

/// Release feed over HTTPS.
pub struct HttpReleaseFeed {
    http: reqwest::Client,
    config: ReleasesConfig,
}

impl HttpReleaseFeed {
    pub fn new(config: ReleasesConfig) -> ReleaseResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| ReleaseError::Feed {
                family: ReleaseFamily::K3s,
                message: e.to_string(),
            })?;
        Ok(Self { http, config })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        family: ReleaseFamily,
        url: &str,
    ) -> ReleaseResult<T> {
        let feed_err = |e: reqwest::Error| ReleaseError::Feed {
            family,
            message: e.to_string(),
        };
        debug!(%family, %url, "fetching release listing");
        self.http
            .get(url)
            .header(reqwest::header::ACCEPT, family.accept())
            .send()
            .await
            .map_err(feed_err)?
            .error_for_status()
            .map_err(feed_err)?
            .json()
            .await
            .map_err(feed_err)
    }
}

#[async_trait]
impl ReleaseFeed for HttpReleaseFeed {
    async fn fetch(&self, family: ReleaseFamily) -> ReleaseResult<ReleaseListing> {
        match family {
            ReleaseFamily::K3s => {
                let doc: ChannelDocument = self
                    .get_json(family, &self.config.k3s_channels_url)
                    .await?;
                Ok(ReleaseListing::Channels(doc.data))
            }
            ReleaseFamily::Longhorn => {
                let mut releases = Vec::new();
                for page in 0..self.config.longhorn_pages {
                    let url = format!("{}?page={page}", self.config.longhorn_releases_url);
                    let batch: Vec<TaggedRelease> = self.get_json(family, &url).await?;
                    if batch.is_empty() {
                        break;
                    }
                    releases.extend(batch);
                }
                Ok(ReleaseListing::Tagged(releases))
            }
        }
    }
}
