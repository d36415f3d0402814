//! Outbound asset fetching.
//!
//! `AssetFetcher` is the network seam: the pipeline, the seed engine,
//! and the manifest resolver all fetch through it, so tests swap in a
//! stub and never open a socket.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use url::Url;

use super::config::EngineConfig;
use super::key::derive_key;
use super::store::CachedAsset;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network transport failed: {message}")]
    Transport { message: String },

    #[error("fetch target rejected: {message}")]
    Target { message: String },
}

impl FetchError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn target(message: impl Into<String>) -> Self {
        Self::Target {
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait AssetFetcher: Send + Sync {
    /// Fetch a URL. In `opaque` mode (cross-origin assets) the result
    /// carries no status or headers and is marked opaque whatever the
    /// upstream said; otherwise status and headers are captured.
    async fn fetch(&self, url: &Url, opaque: bool) -> Result<CachedAsset, FetchError>;
}

// ============================================================================
// reqwest implementation
// ============================================================================

// Transport-level headers that must not be replayed from a stored entry.
const HOP_BY_HOP: [&str; 4] = ["connection", "keep-alive", "transfer-encoding", "content-length"];

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AssetFetcher for HttpFetcher {
    async fn fetch(&self, url: &Url, opaque: bool) -> Result<CachedAsset, FetchError> {
        let response = self
            .client
            .get(url.as_str())
            .send()
            .await
            .map_err(|e| FetchError::transport(e.to_string()))?;

        if opaque {
            let body = response
                .bytes()
                .await
                .map_err(|e| FetchError::transport(e.to_string()))?;
            return Ok(CachedAsset {
                status: 0,
                headers: Vec::new(),
                body,
                opaque: true,
            });
        }

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter(|(name, _)| !HOP_BY_HOP.contains(&name.as_str()))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body: Bytes = response
            .bytes()
            .await
            .map_err(|e| FetchError::transport(e.to_string()))?;

        Ok(CachedAsset {
            status,
            headers,
            body,
            opaque: false,
        })
    }
}

// ============================================================================
// Target resolution
// ============================================================================

/// The URL actually fetched for an intercepted request: optionally the
/// seeded key instead of the bare URL, and always rewritten onto the
/// upstream origin when the request targets this instance's own origin.
pub fn resolve_network_target(
    url: &Url,
    accept: Option<&str>,
    config: &EngineConfig,
) -> Url {
    let outbound = if config.apply_seed_to_network {
        derive_key(url, accept, config)
    } else {
        url.clone()
    };
    if outbound.origin() == config.public_origin.origin() {
        let mut rewritten = config.upstream_origin.clone();
        rewritten.set_path(outbound.path());
        rewritten.set_query(outbound.query());
        rewritten
    } else {
        outbound
    }
}
