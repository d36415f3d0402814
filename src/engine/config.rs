//! Immutable engine configuration snapshot.
//!
//! Built once at startup from the layered settings (after the optional
//! remote overlay has been applied) and shared read-only by every
//! component. Mutating runtime behavior means building a new snapshot
//! and restarting, which keeps key derivation and classification free
//! of locks.

use regex::Regex;
use tracing::warn;
use url::Url;

use crate::config::{EngineSettings, LoadError};

/// Trim never shrinks a store below this many entries.
pub const MIN_LRU_CAP: usize = 100;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Current seed epoch, embedded in every cache key.
    pub seed_epoch: String,
    /// Hosts the engine will cache for. Empty allows all.
    pub domain_whitelist: Vec<String>,
    /// Original blacklist pattern sources, kept for the status report.
    pub blacklist: Vec<String>,
    /// Whether outbound fetches use the keyed URL instead of the bare one.
    pub apply_seed_to_network: bool,
    /// Served when a miss cannot reach the network.
    pub fallback_url: Option<Url>,
    /// Whether the Accept fingerprint participates in keys.
    pub accept_in_key: bool,
    /// Base name of the image store; versioned at runtime.
    pub img_store_base: String,
    /// Base name of the font store; versioned at runtime.
    pub font_store_base: String,
    /// Per-store entry cap, clamped to [`MIN_LRU_CAP`].
    pub lru_cap: usize,
    /// Manifest consulted by seed/purge when no explicit source is given.
    pub default_manifest: Option<Url>,
    /// URLs seeded once at startup.
    pub preload: Vec<String>,
    /// Version tag namespacing the stores.
    pub version_tag: String,
    /// Origin this instance serves; relative bulk keys resolve against it.
    pub public_origin: Url,
    /// Origin intercepted same-origin requests are fetched from.
    pub upstream_origin: Url,

    blacklist_patterns: Vec<Regex>,
}

impl EngineConfig {
    pub fn from_settings(settings: &EngineSettings) -> Result<Self, LoadError> {
        let public_origin = parse_origin("engine.public_origin", &settings.public_origin)?;
        let upstream_origin = parse_origin("engine.upstream_origin", &settings.upstream_origin)?;
        let fallback_url = settings
            .fallback_url
            .as_deref()
            .map(|raw| parse_origin("engine.fallback_url", raw))
            .transpose()?;
        let default_manifest = settings
            .manifest
            .as_deref()
            .map(|raw| parse_origin("engine.manifest", raw))
            .transpose()?;

        // A pattern that fails to compile disables itself, not the engine.
        let blacklist_patterns = settings
            .blacklist
            .iter()
            .filter_map(|source| match Regex::new(source) {
                Ok(re) => Some(re),
                Err(error) => {
                    warn!(
                        target = "engine.config",
                        pattern = %source,
                        %error,
                        "Skipping malformed blacklist pattern"
                    );
                    None
                }
            })
            .collect();

        Ok(Self {
            seed_epoch: settings.seed_epoch.clone(),
            domain_whitelist: settings.domain_whitelist.clone(),
            blacklist: settings.blacklist.clone(),
            apply_seed_to_network: settings.apply_seed_to_network,
            fallback_url,
            accept_in_key: settings.accept_in_key,
            img_store_base: settings.img_store_base.clone(),
            font_store_base: settings.font_store_base.clone(),
            lru_cap: (settings.lru_cap as usize).max(MIN_LRU_CAP),
            default_manifest,
            preload: settings.preload.clone(),
            version_tag: settings.version_tag.clone(),
            public_origin,
            upstream_origin,
            blacklist_patterns,
        })
    }

    pub fn blacklist_patterns(&self) -> &[Regex] {
        &self.blacklist_patterns
    }
}

fn parse_origin(key: &'static str, raw: &str) -> Result<Url, LoadError> {
    Url::parse(raw)
        .map_err(|error| LoadError::invalid(key, format!("not a valid absolute URL: {error}")))
}

#[cfg(test)]
pub fn test_config() -> EngineConfig {
    EngineConfig {
        seed_epoch: "seed-0001".to_string(),
        domain_whitelist: Vec::new(),
        blacklist: Vec::new(),
        apply_seed_to_network: false,
        fallback_url: None,
        accept_in_key: true,
        img_store_base: "img-cache".to_string(),
        font_store_base: "font-cache".to_string(),
        lru_cap: MIN_LRU_CAP,
        default_manifest: None,
        preload: Vec::new(),
        version_tag: "vtest".to_string(),
        public_origin: Url::parse("https://a.test").expect("static test origin"),
        upstream_origin: Url::parse("https://upstream.test").expect("static test origin"),
        blacklist_patterns: Vec::new(),
    }
}
