//! Management endpoints.
//!
//! Mutating endpoints (seed, purge) require the shared secret when one
//! is configured; the read-only endpoints are open. Request bodies are
//! lenient: a missing or malformed JSON body behaves like `{}`.

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode, header::CONTENT_TYPE},
    response::{Html, IntoResponse, Json, Response},
};
use serde::Deserialize;
use serde_json::{Value, json};
use subtle::ConstantTimeEq;
use tracing::warn;

use super::{EngineState, openapi};
use crate::engine::resolver::BulkRequest;

const SECRET_HEADER: &str = "x-cache-secret";
const PROM_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(super) struct DryQuery {
    dry: Option<String>,
}

impl DryQuery {
    fn is_dry(&self) -> bool {
        matches!(self.dry.as_deref(), Some("1") | Some("true"))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(super) struct MetricsQuery {
    format: Option<String>,
}

fn authorized(state: &EngineState, headers: &HeaderMap) -> bool {
    let Some(secret) = state.secret.as_deref() else {
        return true;
    };
    let presented = headers
        .get(SECRET_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    presented.len() == secret.len()
        && bool::from(presented.as_bytes().ct_eq(secret.as_bytes()))
}

fn forbidden() -> Response {
    (StatusCode::FORBIDDEN, "forbidden").into_response()
}

pub(super) async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "not found").into_response()
}

fn lenient_body(body: &Bytes) -> BulkRequest {
    if body.is_empty() {
        return BulkRequest::default();
    }
    serde_json::from_slice(body).unwrap_or_else(|error| {
        warn!(target = "http.api", %error, "Ignoring malformed request body");
        BulkRequest::default()
    })
}

pub(super) async fn status(State(state): State<EngineState>) -> Json<Value> {
    let entries = state.stores.all_entries().await;
    Json(json!({
        "ok": true,
        "version": state.config.version_tag,
        "seed": state.config.seed_epoch,
        "allowlist": state.config.domain_whitelist,
        "apply_seed_to_network": state.config.apply_seed_to_network,
        "fallback": state.config.fallback_url.as_ref().map(|url| url.as_str()),
        "accept_key": state.config.accept_in_key,
        "img_cache_name": state.config.img_store_base,
        "font_cache_name": state.config.font_store_base,
        "lru_max": state.config.lru_cap,
        "manifest": state.config.default_manifest.as_ref().map(|url| url.as_str()),
        "preload": state.config.preload,
        "blacklist": state.config.blacklist,
        "stores": state.stores.current_namespaces(),
        "entries": entries.len(),
    }))
}

pub(super) async fn list(State(state): State<EngineState>) -> Json<Value> {
    let entries = state.stores.all_entries().await;
    let caches: Vec<Value> = state
        .stores
        .current_namespaces()
        .into_iter()
        .map(|namespace| {
            let keys: Vec<&str> = entries
                .iter()
                .filter(|(ns, _)| ns.as_str() == namespace)
                .map(|(_, key)| key.as_str())
                .collect();
            json!({ "cache": namespace, "count": keys.len(), "keys": keys })
        })
        .collect();
    Json(json!({ "ok": true, "caches": caches }))
}

pub(super) async fn seed(
    State(state): State<EngineState>,
    Query(query): Query<DryQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !authorized(&state, &headers) {
        return forbidden();
    }
    let request = lenient_body(&body);
    let keys = state.resolver.resolve(&request).await;
    let report = state.ops.seed(&keys, query.is_dry()).await;
    Json(report).into_response()
}

pub(super) async fn purge(
    State(state): State<EngineState>,
    Query(query): Query<DryQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !authorized(&state, &headers) {
        return forbidden();
    }
    let request = lenient_body(&body);
    let report = state.ops.purge(&request, query.is_dry()).await;
    Json(report).into_response()
}

pub(super) async fn metrics(
    State(state): State<EngineState>,
    Query(query): Query<MetricsQuery>,
) -> Response {
    match query.format.as_deref() {
        Some("json") => Json(state.metrics.render_json()).into_response(),
        Some("pretty") => Html(state.metrics.render_html()).into_response(),
        _ => (
            [(CONTENT_TYPE, PROM_CONTENT_TYPE)],
            state.metrics.render_prom(),
        )
            .into_response(),
    }
}

pub(super) async fn openapi() -> Json<Value> {
    Json(openapi::document())
}

pub(super) async fn debug_page(State(state): State<EngineState>) -> Html<String> {
    let mut events = String::new();
    for entry in state.ring.entries() {
        events.push_str("<li><code>");
        events.push_str(&escape(&entry));
        events.push_str("</code></li>");
    }
    let counters = state
        .metrics
        .snapshot()
        .into_iter()
        .map(|(name, value)| format!("<tr><td>{name}</td><td>{value}</td></tr>"))
        .collect::<String>();

    Html(format!(
        "<!doctype html><html><head><title>scudo debug</title></head><body>\
         <h1>scudo</h1><p>seed: <code>{seed}</code> · version: <code>{version}</code></p>\
         <h2>Counters</h2><table border=\"1\">\
         <tr><th>counter</th><th>value</th></tr>{counters}</table>\
         <h2>Recent events</h2><ul>{events}</ul></body></html>",
        seed = escape(&state.config.seed_epoch),
        version = escape(&state.config.version_tag),
    ))
}

fn escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
