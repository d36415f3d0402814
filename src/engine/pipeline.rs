//! The request interception pipeline.
//!
//! One entry point, [`Pipeline::handle`], classifies an intercepted
//! request and either bypasses it or produces a reply from cache or
//! network. Hits return immediately and schedule a revalidation in the
//! background; nothing that happens after the reply is produced can
//! delay or fail it.

use std::sync::Arc;

use bytes::Bytes;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};
use url::Url;

use super::classify::{
    AssetClass, asset_class, is_allowed_domain, is_blacklisted, is_html_navigation,
    is_static_asset,
};
use super::config::EngineConfig;
use super::fetch::{AssetFetcher, resolve_network_target};
use super::key::derive_key;
use super::metrics::MetricsRegistry;
use super::store::{CachedAsset, StoreManager};
use crate::util::ring::RingLog;

// ============================================================================
// Decisions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "HIT",
            Self::Miss => "MISS",
        }
    }
}

/// Metadata the HTTP layer turns into annotation headers. Absent for
/// opaque replies and fallback/error replies.
#[derive(Debug, Clone)]
pub struct CacheAnnotation {
    pub status: CacheStatus,
    pub seed: String,
    pub version: String,
}

#[derive(Debug)]
pub struct ProxyReply {
    pub asset: CachedAsset,
    pub annotation: Option<CacheAnnotation>,
}

/// What to do with an intercepted request.
#[derive(Debug)]
pub enum Decision {
    /// Not ours: pass the request through untouched.
    Bypass,
    /// Serve this reply.
    Reply(ProxyReply),
}

// ============================================================================
// Pipeline
// ============================================================================

pub struct Pipeline {
    config: Arc<EngineConfig>,
    stores: StoreManager,
    fetcher: Arc<dyn AssetFetcher>,
    metrics: Arc<MetricsRegistry>,
    ring: Arc<RingLog>,
    tasks: TaskTracker,
}

impl Pipeline {
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
            tasks: TaskTracker::new(),
        }
    }

    /// Tracker for background revalidation tasks. Shutdown closes and
    /// awaits it so in-flight revalidations finish writing.
    pub fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    pub async fn handle(&self, method: &str, url: &Url, accept: Option<&str>) -> Decision {
        if !method.eq_ignore_ascii_case("GET")
            || is_html_navigation(accept)
            || !is_static_asset(url)
            || !is_allowed_domain(url, &self.config.domain_whitelist)
            || is_blacklisted(url, self.config.blacklist_patterns())
        {
            return Decision::Bypass;
        }
        let Some(class) = asset_class(url) else {
            return Decision::Bypass;
        };

        let keyed = derive_key(url, accept, &self.config).to_string();
        if let Some(asset) = self.stores.get(class, &keyed).await {
            self.metrics.record_hit();
            self.ring.push(format!("HIT {}", url.path()));
            self.schedule_revalidation(class, keyed, url.clone(), accept.map(str::to_string));
            let annotation = self.annotation_for(CacheStatus::Hit, &asset);
            return Decision::Reply(ProxyReply { asset, annotation });
        }

        self.miss(class, &keyed, url, accept).await
    }

    async fn miss(
        &self,
        class: AssetClass,
        keyed: &str,
        url: &Url,
        accept: Option<&str>,
    ) -> Decision {
        let cross_origin = url.origin() != self.config.public_origin.origin();
        let target = resolve_network_target(url, accept, &self.config);

        match self.fetcher.fetch(&target, cross_origin).await {
            Ok(asset) => {
                self.stores.put_if_storable(class, keyed, &asset).await;
                self.metrics.record_miss();
                self.ring.push(format!("MISS {}", url.path()));
                self.stores.trim(class).await;
                let annotation = self.annotation_for(CacheStatus::Miss, &asset);
                Decision::Reply(ProxyReply { asset, annotation })
            }
            Err(error) => {
                warn!(target = "engine.pipeline", url = %url, %error, "Miss fetch failed");
                self.ring.push(format!("ERR {}", url.path()));
                self.network_error_reply().await
            }
        }
    }

    /// A miss with no reachable network serves the configured fallback
    /// when there is one, otherwise an empty bad-gateway reply. Neither
    /// carries cache annotations.
    async fn network_error_reply(&self) -> Decision {
        if let Some(fallback) = &self.config.fallback_url {
            match self.fetcher.fetch(fallback, false).await {
                Ok(asset) if asset.is_success() => {
                    return Decision::Reply(ProxyReply {
                        asset,
                        annotation: None,
                    });
                }
                Ok(asset) => {
                    debug!(
                        target = "engine.pipeline",
                        status = asset.status,
                        "Fallback fetch returned non-success"
                    );
                }
                Err(error) => {
                    warn!(target = "engine.pipeline", %error, "Fallback fetch failed");
                }
            }
        }
        Decision::Reply(ProxyReply {
            asset: CachedAsset {
                status: 502,
                headers: Vec::new(),
                body: Bytes::new(),
                opaque: false,
            },
            annotation: None,
        })
    }

    /// Refresh a hit entry in the background. Failures only move the
    /// failure counter; the stale entry stays serveable.
    fn schedule_revalidation(
        &self,
        class: AssetClass,
        keyed: String,
        url: Url,
        accept: Option<String>,
    ) {
        let config = self.config.clone();
        let stores = self.stores.clone();
        let fetcher = self.fetcher.clone();
        let metrics = self.metrics.clone();
        self.tasks.spawn(async move {
            let cross_origin = url.origin() != config.public_origin.origin();
            let target = resolve_network_target(&url, accept.as_deref(), &config);
            match fetcher.fetch(&target, cross_origin).await {
                Ok(asset) => {
                    stores.put_if_storable(class, &keyed, &asset).await;
                    metrics.record_revalidate_ok();
                    stores.trim(class).await;
                }
                Err(error) => {
                    debug!(target = "engine.pipeline", url = %url, %error, "Revalidation failed");
                    metrics.record_revalidate_fail();
                }
            }
        });
    }

    fn annotation_for(&self, status: CacheStatus, asset: &CachedAsset) -> Option<CacheAnnotation> {
        if asset.opaque {
            return None;
        }
        Some(CacheAnnotation {
            status,
            seed: self.config.seed_epoch.clone(),
            version: self.config.version_tag.clone(),
        })
    }
}
