//! Seed and purge: the bulk management operations.
//!
//! Seed pushes resolved keys through the same fetch-then-store path a
//! pipeline miss uses; purge scans the stored entries and removes the
//! ones a request selects. Both support dry runs that report what
//! would happen without touching the stores or the real counters.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};
use url::Url;

use super::classify::{asset_class, is_allowed_domain, is_blacklisted, is_static_asset};
use super::config::EngineConfig;
use super::fetch::{AssetFetcher, resolve_network_target};
use super::key::{derive_key, strip_accept_param};
use super::metrics::MetricsRegistry;
use super::resolver::{BulkRequest, glob_to_regex};
use super::store::StoreManager;
use crate::util::ring::RingLog;

const INELIGIBLE_REASON: &str = "not-static-or-not-allowed";

fn is_false(value: &bool) -> bool {
    !*value
}

// ============================================================================
// Reports
// ============================================================================

#[derive(Debug, Serialize)]
pub struct SeedEntry {
    pub key: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "is_false")]
    pub dry: bool,
}

#[derive(Debug, Serialize)]
pub struct SeedReport {
    pub ok: bool,
    pub seeded: Vec<SeedEntry>,
    pub count: usize,
    pub dry: bool,
}

#[derive(Debug, Serialize)]
pub struct PurgeEntry {
    pub key: String,
    pub removed: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "is_false")]
    pub dry: bool,
}

#[derive(Debug, Serialize)]
pub struct PurgeReport {
    pub ok: bool,
    pub purged: Vec<PurgeEntry>,
    pub count: usize,
    pub dry: bool,
}

// ============================================================================
// Engine
// ============================================================================

pub struct SeedPurgeEngine {
    config: Arc<EngineConfig>,
    stores: StoreManager,
    fetcher: Arc<dyn AssetFetcher>,
    metrics: Arc<MetricsRegistry>,
    ring: Arc<RingLog>,
}

impl SeedPurgeEngine {
    pub fn new(
        config: Arc<EngineConfig>,
        stores: StoreManager,
        fetcher: Arc<dyn AssetFetcher>,
        metrics: Arc<MetricsRegistry>,
        ring: Arc<RingLog>,
    ) -> Self {
        Self {
            config,
            stores,
            fetcher,
            metrics,
            ring,
        }
    }

    /// Seed the given resolved keys. Ineligible keys are reported, not
    /// dropped; a dry run tallies would-succeed entries without any
    /// I/O or counter movement.
    pub async fn seed(&self, resolved_keys: &[String], dry: bool) -> SeedReport {
        let mut seeded = Vec::with_capacity(resolved_keys.len());
        let mut count = 0;

        for key in resolved_keys {
            let entry = self.seed_one(key, dry).await;
            if entry.ok {
                count += 1;
            }
            seeded.push(entry);
        }

        info!(
            target = "engine.ops",
            requested = resolved_keys.len(),
            seeded = count,
            dry,
            "Seed finished"
        );
        self.ring
            .push(format!("SEED {count}/{} dry={dry}", resolved_keys.len()));
        SeedReport {
            ok: true,
            seeded,
            count,
            dry,
        }
    }

    async fn seed_one(&self, key: &str, dry: bool) -> SeedEntry {
        let Ok(url) = Url::parse(key) else {
            if !dry {
                self.metrics.record_seed_fail();
            }
            return SeedEntry {
                key: key.to_string(),
                ok: false,
                reason: None,
                error: Some("invalid URL".to_string()),
                dry,
            };
        };

        let eligible = is_static_asset(&url)
            && is_allowed_domain(&url, &self.config.domain_whitelist)
            && !is_blacklisted(&url, self.config.blacklist_patterns());
        if !eligible {
            return SeedEntry {
                key: key.to_string(),
                ok: false,
                reason: Some(INELIGIBLE_REASON),
                error: None,
                dry,
            };
        }
        if dry {
            return SeedEntry {
                key: key.to_string(),
                ok: true,
                reason: None,
                error: None,
                dry: true,
            };
        }

        // Same storage path as a pipeline miss, without the trim.
        let Some(class) = asset_class(&url) else {
            self.metrics.record_seed_fail();
            return SeedEntry {
                key: key.to_string(),
                ok: false,
                reason: Some(INELIGIBLE_REASON),
                error: None,
                dry: false,
            };
        };
        let keyed = derive_key(&url, None, &self.config).to_string();
        let cross_origin = url.origin() != self.config.public_origin.origin();
        let target = resolve_network_target(&url, None, &self.config);

        match self.fetcher.fetch(&target, cross_origin).await {
            Ok(asset) if asset.is_storable() => {
                self.stores.put_if_storable(class, &keyed, &asset).await;
                self.metrics.record_seed_ok();
                debug!(target = "engine.ops", key, "Seeded");
                SeedEntry {
                    key: key.to_string(),
                    ok: true,
                    reason: None,
                    error: None,
                    dry: false,
                }
            }
            Ok(asset) => {
                self.metrics.record_seed_fail();
                SeedEntry {
                    key: key.to_string(),
                    ok: false,
                    reason: None,
                    error: Some(format!("http-{}", asset.status)),
                    dry: false,
                }
            }
            Err(error) => {
                self.metrics.record_seed_fail();
                SeedEntry {
                    key: key.to_string(),
                    ok: false,
                    reason: None,
                    error: Some(error.to_string()),
                    dry: false,
                }
            }
        }
    }

    /// Purge stored entries selected by explicit keys, a path prefix,
    /// or a glob. Selection runs against what is actually stored, so
    /// purge needs no manifest.
    pub async fn purge(&self, request: &BulkRequest, dry: bool) -> PurgeReport {
        let stored = self.stores.all_entries().await;
        let targets = self.select_targets(request, &stored);

        let mut purged = Vec::with_capacity(targets.len());
        let mut count = 0;

        for (namespace, key) in targets {
            if dry {
                purged.push(PurgeEntry {
                    key,
                    removed: 0,
                    error: None,
                    dry: true,
                });
                continue;
            }
            match self.stores.delete_in(&namespace, &key).await {
                Ok(true) => {
                    self.metrics.record_purge_ok();
                    count += 1;
                    purged.push(PurgeEntry {
                        key,
                        removed: 1,
                        error: None,
                        dry: false,
                    });
                }
                Ok(false) => {
                    purged.push(PurgeEntry {
                        key,
                        removed: 0,
                        error: None,
                        dry: false,
                    });
                }
                Err(error) => {
                    self.metrics.record_purge_fail();
                    purged.push(PurgeEntry {
                        key,
                        removed: 0,
                        error: Some(error.to_string()),
                        dry: false,
                    });
                }
            }
        }

        info!(
            target = "engine.ops",
            selected = purged.len(),
            removed = count,
            dry,
            "Purge finished"
        );
        self.ring.push(format!("PURGE {count} dry={dry}"));
        PurgeReport {
            ok: true,
            purged,
            count,
            dry,
        }
    }

    /// Stored entries a purge request selects, in store order.
    fn select_targets(
        &self,
        request: &BulkRequest,
        stored: &[(String, String)],
    ) -> Vec<(String, String)> {
        if !request.keys.is_empty() {
            // Explicit keys are full derived keys (as listed by the
            // management API); comparison ignores the Accept
            // fingerprint component on both sides.
            let wanted: Vec<String> = request
                .keys
                .iter()
                .map(|key| match self.config.public_origin.join(key) {
                    Ok(url) => strip_accept_param(url.as_str()),
                    Err(_) => strip_accept_param(key),
                })
                .collect();
            return stored
                .iter()
                .filter(|(_, key)| wanted.iter().any(|w| *w == strip_accept_param(key)))
                .cloned()
                .collect();
        }

        let glob_re = request.glob.as_deref().and_then(glob_to_regex);
        stored
            .iter()
            .filter(|(_, key)| {
                let Ok(url) = Url::parse(key) else {
                    return false;
                };
                let path = url.path();
                let prefix_hit = request
                    .prefix
                    .as_deref()
                    .is_some_and(|prefix| path.starts_with(prefix));
                let glob_hit = glob_re.as_ref().is_some_and(|re| re.is_match(path));
                prefix_hit || glob_hit
            })
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use bytes::Bytes;

    use super::*;
    use crate::engine::classify::AssetClass;
    use crate::engine::config::test_config;
    use crate::engine::fetch::FetchError;
    use crate::engine::store::{CachedAsset, MemoryBlobStore};

    struct CannedFetcher {
        status: u16,
    }

    #[async_trait]
    impl AssetFetcher for CannedFetcher {
        async fn fetch(&self, _url: &Url, opaque: bool) -> Result<CachedAsset, FetchError> {
            if opaque {
                return Ok(CachedAsset {
                    status: 0,
                    headers: Vec::new(),
                    body: Bytes::from_static(b"opaque-bytes"),
                    opaque: true,
                });
            }
            Ok(CachedAsset {
                status: self.status,
                headers: Vec::new(),
                body: Bytes::from_static(b"bytes"),
                opaque: false,
            })
        }
    }

    struct Fixture {
        engine: SeedPurgeEngine,
        stores: StoreManager,
        metrics: Arc<MetricsRegistry>,
        config: Arc<EngineConfig>,
    }

    fn fixture(status: u16) -> Fixture {
        let config = Arc::new(test_config());
        let stores = StoreManager::new(Arc::new(MemoryBlobStore::new()), &config);
        let metrics = Arc::new(MetricsRegistry::new());
        let engine = SeedPurgeEngine::new(
            config.clone(),
            stores.clone(),
            Arc::new(CannedFetcher { status }),
            metrics.clone(),
            Arc::new(RingLog::new()),
        );
        Fixture {
            engine,
            stores,
            metrics,
            config,
        }
    }

    fn counter(metrics: &MetricsRegistry, name: &str) -> u64 {
        metrics
            .snapshot()
            .into_iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v)
            .unwrap()
    }

    #[tokio::test]
    async fn seed_stores_eligible_keys() {
        let f = fixture(200);
        let report = f
            .engine
            .seed(&["https://a.test/img/a.png".to_string()], false)
            .await;

        assert!(report.ok);
        assert_eq!(report.count, 1);
        assert!(report.seeded[0].ok);
        assert_eq!(counter(&f.metrics, "seed_ok"), 1);

        let keyed = derive_key(
            &Url::parse("https://a.test/img/a.png").unwrap(),
            None,
            &f.config,
        );
        assert!(f.stores.get(AssetClass::Image, keyed.as_str()).await.is_some());
    }

    #[tokio::test]
    async fn seed_reports_ineligible_keys_with_reason() {
        let f = fixture(200);
        let report = f
            .engine
            .seed(&["https://a.test/page.html".to_string()], false)
            .await;

        assert_eq!(report.count, 0);
        assert!(!report.seeded[0].ok);
        assert_eq!(report.seeded[0].reason, Some(INELIGIBLE_REASON));
        // Classification rejection is not a seed failure.
        assert_eq!(counter(&f.metrics, "seed_fail"), 0);
    }

    #[tokio::test]
    async fn seed_dry_run_touches_nothing() {
        let f = fixture(200);
        let report = f
            .engine
            .seed(&["https://a.test/img/a.png".to_string()], true)
            .await;

        assert_eq!(report.count, 1);
        assert!(report.seeded[0].dry);
        assert_eq!(counter(&f.metrics, "seed_ok"), 0);
        assert!(f.stores.all_entries().await.is_empty());
    }

    #[tokio::test]
    async fn seed_counts_upstream_failures() {
        let f = fixture(503);
        let report = f
            .engine
            .seed(&["https://a.test/img/a.png".to_string()], false)
            .await;

        assert_eq!(report.count, 0);
        assert_eq!(report.seeded[0].error.as_deref(), Some("http-503"));
        assert_eq!(counter(&f.metrics, "seed_fail"), 1);
    }

    #[tokio::test]
    async fn seed_cross_origin_stores_opaque() {
        let f = fixture(200);
        let report = f
            .engine
            .seed(&["https://cdn.other.test/img/a.png".to_string()], false)
            .await;

        assert_eq!(report.count, 1);
        let keyed = derive_key(
            &Url::parse("https://cdn.other.test/img/a.png").unwrap(),
            None,
            &f.config,
        );
        let stored = f
            .stores
            .get(AssetClass::Image, keyed.as_str())
            .await
            .unwrap();
        assert!(stored.opaque);
        assert_eq!(stored.status, 0);
    }

    #[tokio::test]
    async fn purge_by_prefix_removes_matching_entries() {
        let f = fixture(200);
        f.engine
            .seed(
                &[
                    "https://a.test/img/a.png".to_string(),
                    "https://a.test/fonts/b.woff2".to_string(),
                ],
                false,
            )
            .await;

        let request = BulkRequest {
            prefix: Some("/img/".to_string()),
            ..Default::default()
        };
        let report = f.engine.purge(&request, false).await;

        assert_eq!(report.count, 1);
        assert_eq!(report.purged[0].removed, 1);
        assert_eq!(counter(&f.metrics, "purge_ok"), 1);
        assert_eq!(f.stores.all_entries().await.len(), 1);
    }

    #[tokio::test]
    async fn purge_by_explicit_key_ignores_accept_fingerprint() {
        let f = fixture(200);
        f.engine
            .seed(&["https://a.test/img/a.png".to_string()], false)
            .await;

        // The caller quotes the stored key without its fingerprint.
        let request = BulkRequest {
            keys: vec!["https://a.test/img/a.png?__seed=seed-0001".to_string()],
            ..Default::default()
        };
        let report = f.engine.purge(&request, false).await;

        assert_eq!(report.count, 1);
        assert!(f.stores.all_entries().await.is_empty());
    }

    #[tokio::test]
    async fn purge_dry_run_removes_nothing() {
        let f = fixture(200);
        f.engine
            .seed(&["https://a.test/img/a.png".to_string()], false)
            .await;

        let request = BulkRequest {
            prefix: Some("/img/".to_string()),
            ..Default::default()
        };
        let report = f.engine.purge(&request, true).await;

        assert_eq!(report.count, 0);
        assert_eq!(report.purged.len(), 1);
        assert!(report.purged[0].dry);
        assert_eq!(report.purged[0].removed, 0);
        assert_eq!(f.stores.all_entries().await.len(), 1);
        assert_eq!(counter(&f.metrics, "purge_ok"), 0);
    }

    #[tokio::test]
    async fn purge_by_glob_matches_stored_paths() {
        let f = fixture(200);
        f.engine
            .seed(
                &[
                    "https://a.test/img/a.png".to_string(),
                    "https://a.test/img/b.webp".to_string(),
                ],
                false,
            )
            .await;

        let request = BulkRequest {
            glob: Some("/img/*.png".to_string()),
            ..Default::default()
        };
        let report = f.engine.purge(&request, false).await;

        assert_eq!(report.count, 1);
        assert!(report.purged[0].key.contains("a.png"));
    }
}
