//! Bulk key resolution for seed and purge.
//!
//! A management request names its targets one of three ways, in
//! priority order: explicit keys, a prefix/glob expanded against an
//! asset manifest, or the manifest alone. Everything resolves to
//! absolute URL strings against the public origin.

use std::sync::Arc;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;
use url::Url;

use super::config::EngineConfig;
use super::fetch::AssetFetcher;

/// Body accepted by the seed and purge endpoints.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct BulkRequest {
    pub keys: Vec<String>,
    pub prefix: Option<String>,
    pub glob: Option<String>,
    pub manifest: Option<String>,
    pub max: Option<usize>,
}

impl BulkRequest {
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
            && self.prefix.is_none()
            && self.glob.is_none()
            && self.manifest.is_none()
    }
}

pub struct KeyResolver {
    config: Arc<EngineConfig>,
    fetcher: Arc<dyn AssetFetcher>,
}

impl KeyResolver {
    pub fn new(config: Arc<EngineConfig>, fetcher: Arc<dyn AssetFetcher>) -> Self {
        Self { config, fetcher }
    }

    /// Resolve a bulk request to absolute URL strings. Explicit keys
    /// are used verbatim and in full; `max` only caps the manifest
    /// expansion. Unparseable explicit keys are passed through so the
    /// caller can report a per-key failure instead of dropping them
    /// silently.
    pub async fn resolve(&self, request: &BulkRequest) -> Vec<String> {
        if !request.keys.is_empty() {
            return request
                .keys
                .iter()
                .map(|key| self.absolutize(key))
                .collect();
        }
        let mut resolved = self.expand_from_manifest(request).await;
        if let Some(max) = request.max {
            resolved.truncate(max);
        }
        resolved
    }

    fn absolutize(&self, key: &str) -> String {
        match self.config.public_origin.join(key) {
            Ok(url) => url.to_string(),
            Err(_) => key.to_string(),
        }
    }

    async fn expand_from_manifest(&self, request: &BulkRequest) -> Vec<String> {
        let manifest_url = match &request.manifest {
            Some(raw) => match self.config.public_origin.join(raw) {
                Ok(url) => url,
                Err(error) => {
                    warn!(target = "engine.resolver", manifest = %raw, %error, "Bad manifest URL");
                    return Vec::new();
                }
            },
            None => match &self.config.default_manifest {
                Some(url) => url.clone(),
                None => return Vec::new(),
            },
        };

        let entries = self.fetch_manifest(&manifest_url).await;
        let glob_re = request.glob.as_deref().and_then(glob_to_regex);

        // Prefix and glob apply to the entries as the manifest spells
        // them; relative entries are only absolutized afterwards.
        entries
            .into_iter()
            .filter(|entry| {
                request
                    .prefix
                    .as_deref()
                    .is_none_or(|prefix| entry.starts_with(prefix))
            })
            .filter(|entry| glob_re.as_ref().is_none_or(|re| re.is_match(entry)))
            .filter_map(|entry| self.config.public_origin.join(&entry).ok())
            .map(|url| url.to_string())
            .collect()
    }

    /// Fetch and flatten a manifest. Entries are strings or objects
    /// with a `path` (or `url`) field; anything else is skipped. Any
    /// fetch or parse failure yields an empty set, never an error.
    async fn fetch_manifest(&self, manifest_url: &Url) -> Vec<String> {
        let asset = match self.fetcher.fetch(manifest_url, false).await {
            Ok(asset) if asset.is_success() => asset,
            Ok(asset) => {
                warn!(
                    target = "engine.resolver",
                    manifest = %manifest_url,
                    status = asset.status,
                    "Manifest fetch returned non-success"
                );
                return Vec::new();
            }
            Err(error) => {
                warn!(target = "engine.resolver", manifest = %manifest_url, %error, "Manifest fetch failed");
                return Vec::new();
            }
        };

        let Ok(Value::Array(items)) = serde_json::from_slice::<Value>(&asset.body) else {
            warn!(target = "engine.resolver", manifest = %manifest_url, "Manifest is not a JSON array");
            return Vec::new();
        };
        items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(path) => Some(path),
                Value::Object(map) => map
                    .get("path")
                    .or_else(|| map.get("url"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
                _ => None,
            })
            .collect()
    }
}

/// Compile a limited glob into an anchored regex: `**` crosses path
/// segments, `*` stays within one, everything else is literal. Returns
/// `None` for patterns that still fail to compile.
pub fn glob_to_regex(glob: &str) -> Option<Regex> {
    let mut pattern = String::with_capacity(glob.len() + 8);
    pattern.push('^');
    let chars: Vec<char> = glob.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '*' {
            if chars.get(i + 1) == Some(&'*') {
                pattern.push_str(".*");
                i += 2;
            } else {
                pattern.push_str("[^/]*");
                i += 1;
            }
        } else {
            pattern.push_str(&regex::escape(&chars[i].to_string()));
            i += 1;
        }
    }
    pattern.push('$');
    Regex::new(&pattern).ok()
}
