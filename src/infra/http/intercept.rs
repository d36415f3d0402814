//! The catch-all route: every request that is not management traffic
//! goes through the engine pipeline. Bypassed requests are proxied to
//! the upstream origin unmodified; everything else is answered from
//! the pipeline's reply.

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode, header::ACCEPT},
    response::{IntoResponse, Response},
};
use tracing::warn;

use super::EngineState;
use crate::engine::pipeline::{CacheStatus, Decision, ProxyReply};

const HEADER_CACHE: &str = "x-cache";
const HEADER_SOURCE: &str = "x-cache-source";
const HEADER_SEED: &str = "x-cache-seed";
const HEADER_VERSION: &str = "x-cache-version";

// Not forwarded in either direction.
const HOP_BY_HOP: [&str; 5] = [
    "connection",
    "keep-alive",
    "transfer-encoding",
    "content-length",
    "host",
];

pub(super) async fn intercept(
    State(state): State<EngineState>,
    request: Request<Body>,
) -> Response {
    let method = request.method().as_str().to_string();
    let accept = request
        .headers()
        .get(ACCEPT)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let mut url = state.config.public_origin.clone();
    url.set_path(request.uri().path());
    url.set_query(request.uri().query());

    match state.pipeline.handle(&method, &url, accept.as_deref()).await {
        Decision::Bypass => proxy_upstream(&state, request).await,
        Decision::Reply(reply) => render_reply(reply),
    }
}

fn render_reply(reply: ProxyReply) -> Response {
    // Opaque bodies have no transmissible status; serve them plainly.
    let status = if reply.asset.opaque {
        StatusCode::OK
    } else {
        StatusCode::from_u16(reply.asset.status).unwrap_or(StatusCode::BAD_GATEWAY)
    };

    let mut builder = Response::builder().status(status);
    for (name, value) in &reply.asset.headers {
        builder = builder.header(name, value);
    }
    if let Some(annotation) = reply.annotation {
        let source = match annotation.status {
            CacheStatus::Hit => "cache",
            CacheStatus::Miss => "network",
        };
        builder = builder
            .header(HEADER_CACHE, annotation.status.as_str())
            .header(HEADER_SOURCE, source)
            .header(HEADER_SEED, annotation.seed)
            .header(HEADER_VERSION, annotation.version);
    }

    builder
        .body(Body::from(reply.asset.body))
        .unwrap_or_else(|error| {
            warn!(target = "http.intercept", %error, "Stored entry produced an unbuildable response");
            StatusCode::BAD_GATEWAY.into_response()
        })
}

/// Transparent pass-through for requests the engine does not handle.
async fn proxy_upstream(state: &EngineState, request: Request<Body>) -> Response {
    let (parts, body) = request.into_parts();

    let mut target = state.config.upstream_origin.clone();
    target.set_path(parts.uri.path());
    target.set_query(parts.uri.query());

    let Ok(method) = reqwest::Method::from_bytes(parts.method.as_str().as_bytes()) else {
        return StatusCode::BAD_GATEWAY.into_response();
    };
    let body_bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(error) => {
            warn!(target = "http.intercept", %error, "Failed to read request body");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    let mut outbound = state.client.request(method, target.as_str());
    for (name, value) in parts.headers.iter() {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        if let Ok(value) = value.to_str() {
            outbound = outbound.header(name.as_str(), value);
        }
    }

    let upstream = match outbound.body(body_bytes).send().await {
        Ok(response) => response,
        Err(error) => {
            warn!(target = "http.intercept", url = %target, %error, "Upstream proxy failed");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    let status =
        StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);
    for (name, value) in upstream.headers().iter() {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        if let Ok(value) = value.to_str() {
            builder = builder.header(name.as_str(), value);
        }
    }

    let body = match upstream.bytes().await {
        Ok(bytes) => bytes,
        Err(error) => {
            warn!(target = "http.intercept", url = %target, %error, "Upstream body read failed");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    builder
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}
