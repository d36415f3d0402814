//! HTTP surface: the management API under `/__cache-api/` and the
//! catch-all interception route that feeds everything else through the
//! engine pipeline.

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};

use crate::engine::config::EngineConfig;
use crate::engine::metrics::MetricsRegistry;
use crate::engine::ops::SeedPurgeEngine;
use crate::engine::pipeline::Pipeline;
use crate::engine::resolver::KeyResolver;
use crate::engine::store::StoreManager;
use crate::util::ring::RingLog;

mod api;
mod intercept;
mod middleware;
mod openapi;

pub const API_PREFIX: &str = "/__cache-api";

#[derive(Clone)]
pub struct EngineState {
    pub config: Arc<EngineConfig>,
    pub stores: StoreManager,
    pub pipeline: Arc<Pipeline>,
    pub resolver: Arc<KeyResolver>,
    pub ops: Arc<SeedPurgeEngine>,
    pub metrics: Arc<MetricsRegistry>,
    pub ring: Arc<RingLog>,
    pub secret: Option<Arc<str>>,
    pub client: reqwest::Client,
}

pub fn build_router(state: EngineState) -> Router {
    let api = Router::new()
        .route("/status", get(api::status))
        .route("/list", get(api::list))
        .route("/seed", post(api::seed))
        .route("/purge", post(api::purge))
        .route("/metrics", get(api::metrics))
        .route("/openapi.json", get(api::openapi))
        .route("/debug", get(api::debug_page))
        .fallback(api::not_found);

    Router::new()
        .nest(API_PREFIX, api)
        .fallback(intercept::intercept)
        .with_state(state)
        .layer(axum::middleware::from_fn(middleware::log_responses))
}
