//! End-to-end interception flows through the router fallback.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header::ACCEPT},
};
use bytes::Bytes;
use tokio::sync::Semaphore;
use tower::ServiceExt;
use url::Url;

use scudo::config::EngineSettings;
use scudo::engine::config::EngineConfig;
use scudo::engine::fetch::{AssetFetcher, FetchError};
use scudo::engine::metrics::MetricsRegistry;
use scudo::engine::ops::SeedPurgeEngine;
use scudo::engine::pipeline::Pipeline;
use scudo::engine::resolver::KeyResolver;
use scudo::engine::store::{CachedAsset, MemoryBlobStore, StoreManager};
use scudo::infra::http::{EngineState, build_router};
use scudo::util::ring::RingLog;

/// Stub upstream: optionally fails, optionally parks fetches beyond a
/// threshold behind a semaphore so tests can hold a revalidation open.
struct GatedFetcher {
    fetches: AtomicUsize,
    fail: AtomicBool,
    gate: Arc<Semaphore>,
    gate_after: usize,
}

impl GatedFetcher {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            fetches: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            gate: Arc::new(Semaphore::new(0)),
            gate_after: usize::MAX,
        })
    }

    fn gated_after(threshold: usize) -> Arc<Self> {
        Arc::new(Self {
            fetches: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            gate: Arc::new(Semaphore::new(0)),
            gate_after: threshold,
        })
    }
}

#[async_trait]
impl AssetFetcher for GatedFetcher {
    async fn fetch(&self, url: &Url, _opaque: bool) -> Result<CachedAsset, FetchError> {
        let index = self.fetches.fetch_add(1, Ordering::SeqCst);
        if index >= self.gate_after {
            let _permit = self.gate.acquire().await.expect("gate open");
        }
        if self.fail.load(Ordering::SeqCst) && url.path() != "/offline.png" {
            return Err(FetchError::transport("connection refused"));
        }
        Ok(CachedAsset {
            status: 200,
            headers: vec![("content-type".to_string(), "image/png".to_string())],
            body: Bytes::from(url.path().to_string()),
            opaque: false,
        })
    }
}

struct App {
    router: Router,
    pipeline: Arc<Pipeline>,
    metrics: Arc<MetricsRegistry>,
}

fn engine_settings() -> EngineSettings {
    EngineSettings {
        seed_epoch: "seed-0001".to_string(),
        domain_whitelist: Vec::new(),
        blacklist: vec!["^/private/".to_string()],
        apply_seed_to_network: false,
        fallback_url: None,
        accept_in_key: true,
        img_store_base: "img-cache".to_string(),
        font_store_base: "font-cache".to_string(),
        lru_cap: 3000,
        manifest: None,
        preload: Vec::new(),
        version_tag: "vtest".to_string(),
        public_origin: "http://a.test".to_string(),
        upstream_origin: "http://upstream.test".to_string(),
    }
}

fn build_app(fetcher: Arc<GatedFetcher>, settings: EngineSettings) -> App {
    let config = Arc::new(EngineConfig::from_settings(&settings).expect("valid settings"));
    let fetcher: Arc<dyn AssetFetcher> = fetcher;
    let stores = StoreManager::new(Arc::new(MemoryBlobStore::new()), &config);
    let metrics = Arc::new(MetricsRegistry::new());
    let ring = Arc::new(RingLog::new());
    let pipeline = Arc::new(Pipeline::new(
        config.clone(),
        stores.clone(),
        fetcher.clone(),
        metrics.clone(),
        ring.clone(),
    ));
    let resolver = Arc::new(KeyResolver::new(config.clone(), fetcher.clone()));
    let ops = Arc::new(SeedPurgeEngine::new(
        config.clone(),
        stores.clone(),
        fetcher,
        metrics.clone(),
        ring.clone(),
    ));

    let router = build_router(EngineState {
        config,
        stores,
        pipeline: pipeline.clone(),
        resolver,
        ops,
        metrics: metrics.clone(),
        ring,
        secret: None,
        client: reqwest::Client::new(),
    });

    App {
        router,
        pipeline,
        metrics,
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

async fn get_asset(router: &Router, path: &str) -> axum::response::Response {
    router
        .clone()
        .oneshot(
            Request::get(path)
                .header(ACCEPT, "image/webp,*/*")
                .body(Body::empty())
                .expect("valid request"),
        )
        .await
        .expect("router response")
}

#[tokio::test]
async fn miss_then_hit_with_annotation_headers() {
    let app = build_app(GatedFetcher::new(), engine_settings());

    let first = get_asset(&app.router, "/img/logo.png").await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.headers().get("x-cache").unwrap(), "MISS");
    assert_eq!(first.headers().get("x-cache-source").unwrap(), "network");
    assert_eq!(first.headers().get("x-cache-seed").unwrap(), "seed-0001");
    assert_eq!(first.headers().get("x-cache-version").unwrap(), "vtest");

    let second = get_asset(&app.router, "/img/logo.png").await;
    assert_eq!(second.headers().get("x-cache").unwrap(), "HIT");
    assert_eq!(second.headers().get("x-cache-source").unwrap(), "cache");

    let body = to_bytes(second.into_body(), usize::MAX).await.unwrap();
    assert_eq!(body, Bytes::from_static(b"/img/logo.png"));
    assert_eq!(counter(&app.metrics, "miss"), 1);
    assert_eq!(counter(&app.metrics, "hit"), 1);
}

#[tokio::test]
async fn hit_is_served_while_revalidation_is_still_in_flight() {
    // Fetch 0 (the miss) passes; fetch 1 (the revalidation) parks on
    // the gate until the test releases it.
    let fetcher = GatedFetcher::gated_after(1);
    let app = build_app(fetcher.clone(), engine_settings());

    get_asset(&app.router, "/img/logo.png").await;

    let hit = tokio::time::timeout(
        Duration::from_secs(1),
        get_asset(&app.router, "/img/logo.png"),
    )
    .await
    .expect("hit must not wait for revalidation");
    assert_eq!(hit.headers().get("x-cache").unwrap(), "HIT");
    assert_eq!(counter(&app.metrics, "revalidate_ok"), 0);

    fetcher.gate.add_permits(1);
    app.pipeline.tasks().close();
    app.pipeline.tasks().wait().await;
    assert_eq!(counter(&app.metrics, "revalidate_ok"), 1);
}

#[tokio::test]
async fn network_failure_without_fallback_is_bad_gateway() {
    let fetcher = GatedFetcher::new();
    fetcher.fail.store(true, Ordering::SeqCst);
    let app = build_app(fetcher, engine_settings());

    let response = get_asset(&app.router, "/img/logo.png").await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert!(response.headers().get("x-cache").is_none());
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert!(body.is_empty());
}

#[tokio::test]
async fn network_failure_with_fallback_serves_the_fallback_asset() {
    let fetcher = GatedFetcher::new();
    fetcher.fail.store(true, Ordering::SeqCst);
    let mut settings = engine_settings();
    settings.fallback_url = Some("http://a.test/offline.png".to_string());
    let app = build_app(fetcher, settings);

    let response = get_asset(&app.router, "/img/logo.png").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("x-cache").is_none());
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(body, Bytes::from_static(b"/offline.png"));
}

#[tokio::test]
async fn blacklisted_paths_are_not_cached() {
    let app = build_app(GatedFetcher::new(), engine_settings());

    // The blacklist sends this through the bypass proxy, which cannot
    // reach the fake upstream origin from a test.
    let response = get_asset(&app.router, "/private/logo.png").await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(counter(&app.metrics, "miss"), 0);
    assert_eq!(counter(&app.metrics, "hit"), 0);
}

#[tokio::test]
async fn failed_revalidation_keeps_serving_the_stale_entry() {
    let fetcher = GatedFetcher::new();
    let app = build_app(fetcher.clone(), engine_settings());

    get_asset(&app.router, "/img/logo.png").await;
    fetcher.fail.store(true, Ordering::SeqCst);

    let hit = get_asset(&app.router, "/img/logo.png").await;
    assert_eq!(hit.headers().get("x-cache").unwrap(), "HIT");

    app.pipeline.tasks().close();
    app.pipeline.tasks().wait().await;
    assert_eq!(counter(&app.metrics, "revalidate_fail"), 1);

    let again = get_asset(&app.router, "/img/logo.png").await;
    assert_eq!(again.headers().get("x-cache").unwrap(), "HIT");
    let body = to_bytes(again.into_body(), usize::MAX).await.unwrap();
    assert_eq!(body, Bytes::from_static(b"/img/logo.png"));
}
