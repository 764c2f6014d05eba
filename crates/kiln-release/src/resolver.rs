//! ReleaseResolver — TTL-cached channel → version lookup.

use std::collections::BTreeMap;
use std::sync::Arc;

use semver::Version;
use tracing::{debug, info};

use kiln_core::Clock;
use kiln_state::{ClusterStore, VersionCache};

use crate::error::{ReleaseError, ReleaseResult};
use crate::feed::{ReleaseFamily, ReleaseFeed, ReleaseListing};

/// Channel that resolves to the highest stable version of an ordered family.
pub const LATEST_CHANNEL: &str = "latest";

pub struct ReleaseResolver {
    store: ClusterStore,
    feed: Arc<dyn ReleaseFeed>,
    clock: Arc<dyn Clock>,
    ttl_secs: u64,
}

impl ReleaseResolver {
    pub fn new(
        store: ClusterStore,
        feed: Arc<dyn ReleaseFeed>,
        clock: Arc<dyn Clock>,
        ttl_secs: u64,
    ) -> Self {
        Self {
            store,
            feed,
            clock,
            ttl_secs,
        }
    }

    /// Resolve `channel` for `family`, refreshing the namespace's cache
    /// first when forced or stale.
    ///
    /// A fresh cache that lacks the channel is not refreshed.
    pub async fn resolve(
        &self,
        namespace: &str,
        family: ReleaseFamily,
        channel: &str,
        force_refresh: bool,
    ) -> ReleaseResult<String> {
        let key = family.cache_key();
        let mut cache = self.store.get_version_cache(namespace, key).await?;
        let now = self.clock.now_secs();
        debug!(
            %family,
            updated = cache.updated,
            releases = cache.releases.len(),
            "cached release information"
        );

        if force_refresh || cache.is_stale(now, self.ttl_secs) {
            info!(%family, force_refresh, "refreshing release version cache");
            let listing = self.feed.fetch(family).await?;
            cache = build_cache(family, listing, now)?;
            self.store.put_version_cache(namespace, key, &cache).await?;
        }

        let version = lookup(&cache, family, channel).ok_or_else(|| {
            ReleaseError::UnknownChannel {
                family,
                channel: channel.to_string(),
            }
        })?;
        info!(%family, %channel, %version, "release selected");
        Ok(version)
    }
}

fn build_cache(
    family: ReleaseFamily,
    listing: ReleaseListing,
    now: u64,
) -> ReleaseResult<VersionCache> {
    match listing {
        ReleaseListing::Channels(channels) => Ok(VersionCache {
            updated: now,
            releases: channels.into_iter().map(|c| (c.name, c.latest)).collect(),
            latest: None,
        }),
        ReleaseListing::Tagged(tagged) => {
            let releases: BTreeMap<String, String> = tagged
                .into_iter()
                .filter(|r| !r.prerelease)
                .map(|r| {
                    let tag = r.tag_name.strip_prefix('v').unwrap_or(&r.tag_name).to_string();
                    (tag, r.tarball_url)
                })
                .collect();

            let latest = releases
                .keys()
                .filter_map(|tag| match Version::parse(tag) {
                    Ok(v) => Some(v),
                    Err(e) => {
                        debug!(%family, %tag, error = %e, "ignoring unparseable release tag");
                        None
                    }
                })
                .max()
                .ok_or(ReleaseError::NoReleases(family))?;

            Ok(VersionCache {
                updated: now,
                releases,
                latest: Some(latest.to_string()),
            })
        }
    }
}

fn lookup(cache: &VersionCache, family: ReleaseFamily, channel: &str) -> Option<String> {
    match family {
        ReleaseFamily::K3s => cache.releases.get(channel).cloned(),
        ReleaseFamily::Longhorn => {
            if channel == LATEST_CHANNEL {
                return cache.latest.clone();
            }
            let tag = channel.strip_prefix('v').unwrap_or(channel);
            cache.releases.contains_key(tag).then(|| tag.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use kiln_core::FixedClock;
    use kiln_state::RedbMetadataStore;

    use crate::feed::{ChannelRelease, TaggedRelease};

    const NOW: u64 = 1_700_000_000;
    const DAY: u64 = 24 * 3600;

    #[derive(Default)]
    struct CountingFeed {
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl ReleaseFeed for CountingFeed {
        async fn fetch(&self, family: ReleaseFamily) -> ReleaseResult<ReleaseListing> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(match family {
                ReleaseFamily::K3s => ReleaseListing::Channels(vec![
                    ChannelRelease {
                        name: "stable".into(),
                        latest: "v1.30.4+k3s1".into(),
                    },
                    ChannelRelease {
                        name: "v1.29".into(),
                        latest: "v1.29.8+k3s1".into(),
                    },
                ]),
                ReleaseFamily::Longhorn => ReleaseListing::Tagged(vec![
                    tagged("v1.6.2", false),
                    tagged("v1.10.0-rc1", true),
                    tagged("v1.7.1", false),
                    tagged("v1.9.0", false),
                ]),
            })
        }
    }

    fn tagged(tag: &str, prerelease: bool) -> TaggedRelease {
        TaggedRelease {
            tag_name: tag.into(),
            prerelease,
            tarball_url: format!("https://example.invalid/{tag}.tar.gz"),
        }
    }

    struct Harness {
        store: ClusterStore,
        feed: Arc<CountingFeed>,
        resolver: ReleaseResolver,
    }

    fn harness() -> Harness {
        let store = ClusterStore::new(Arc::new(RedbMetadataStore::open_in_memory().unwrap()));
        let feed = Arc::new(CountingFeed::default());
        let resolver = ReleaseResolver::new(
            store.clone(),
            feed.clone(),
            Arc::new(FixedClock::new(NOW)),
            DAY,
        );
        Harness {
            store,
            feed,
            resolver,
        }
    }

    async fn seed(h: &Harness, age: u64, releases: &[(&str, &str)]) {
        let cache = VersionCache {
            updated: NOW - age,
            releases: releases
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            latest: None,
        };
        h.store
            .put_version_cache("team1", ReleaseFamily::K3s.cache_key(), &cache)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn stale_cache_is_refreshed() {
        let h = harness();
        seed(&h, 25 * 3600, &[("stable", "v1.28.0+k3s1")]).await;

        let v = h
            .resolver
            .resolve("team1", ReleaseFamily::K3s, "stable", false)
            .await
            .unwrap();

        assert_eq!(v, "v1.30.4+k3s1");
        assert_eq!(h.feed.fetches.load(Ordering::SeqCst), 1);
        let cache = h
            .store
            .get_version_cache("team1", ReleaseFamily::K3s.cache_key())
            .await
            .unwrap();
        assert_eq!(cache.updated, NOW);
    }

    #[tokio::test]
    async fn fresh_cache_miss_fails_without_refresh() {
        let h = harness();
        seed(&h, 3600, &[("stable", "v1.28.0+k3s1")]).await;

        let err = h
            .resolver
            .resolve("team1", ReleaseFamily::K3s, "v1.29", false)
            .await
            .unwrap_err();

        assert!(matches!(err, ReleaseError::UnknownChannel { .. }));
        assert_eq!(h.feed.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fresh_cache_hit_uses_cached_value() {
        let h = harness();
        seed(&h, 3600, &[("stable", "v1.28.0+k3s1")]).await;

        let v = h
            .resolver
            .resolve("team1", ReleaseFamily::K3s, "stable", false)
            .await
            .unwrap();
        assert_eq!(v, "v1.28.0+k3s1");
        assert_eq!(h.feed.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn forced_refresh_ignores_fresh_cache() {
        let h = harness();
        seed(&h, 60, &[("stable", "v1.28.0+k3s1")]).await;

        let v = h
            .resolver
            .resolve("team1", ReleaseFamily::K3s, "stable", true)
            .await
            .unwrap();
        assert_eq!(v, "v1.30.4+k3s1");
        assert_eq!(h.feed.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_namespace_fetches_once() {
        let h = harness();
        for _ in 0..3 {
            h.resolver
                .resolve("team1", ReleaseFamily::K3s, "stable", false)
                .await
                .unwrap();
        }
        assert_eq!(h.feed.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ordered_family_takes_semver_max_of_stable_releases() {
        let h = harness();

        let latest = h
            .resolver
            .resolve("team1", ReleaseFamily::Longhorn, LATEST_CHANNEL, false)
            .await
            .unwrap();
        assert_eq!(latest, "1.9.0");

        let pinned = h
            .resolver
            .resolve("team1", ReleaseFamily::Longhorn, "v1.7.1", false)
            .await
            .unwrap();
        assert_eq!(pinned, "1.7.1");

        let err = h
            .resolver
            .resolve("team1", ReleaseFamily::Longhorn, "1.10.0-rc1", false)
            .await
            .unwrap_err();
        assert!(matches!(err, ReleaseError::UnknownChannel { .. }));
    }

    #[test]
    fn tagged_listing_without_stable_releases_is_an_error() {
        let err = build_cache(
            ReleaseFamily::Longhorn,
            ReleaseListing::Tagged(vec![tagged("v2.0.0-rc1", true)]),
            NOW,
        )
        .unwrap_err();
        assert!(matches!(err, ReleaseError::NoReleases(ReleaseFamily::Longhorn)));
    }
}
