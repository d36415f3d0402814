//! Versioned blob stores and the manager that fronts them.
//!
//! `KeyValueBlobStore` is the capability seam: the engine only needs
//! namespaced get/put/delete plus insertion-ordered key listing. The
//! in-memory implementation is the production default; tests inject it
//! directly and pre-populate it through the same trait.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, warn};

use super::classify::AssetClass;
use super::config::EngineConfig;
use crate::util::lock::{rw_read, rw_write};

const SOURCE: &str = "engine::store";

// ============================================================================
// Cached asset
// ============================================================================

/// A stored response body plus the metadata needed to replay it.
///
/// Opaque entries come from cross-origin fetches where status and
/// headers are unreadable; they carry `status: 0` and no headers, and
/// are replayed as a plain success with the stored body.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedAsset {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub opaque: bool,
}

impl CachedAsset {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Storage eligibility: successful, or opaque (decorative assets
    /// still render even when the response is unreadable).
    pub fn is_storable(&self) -> bool {
        self.is_success() || self.opaque
    }
}

// ============================================================================
// Store errors
// ============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store quota exceeded")]
    QuotaExceeded,

    #[error("entry serialization failed: {message}")]
    Serialization { message: String },

    #[error("store backend failure: {message}")]
    Backend { message: String },
}

impl StoreError {
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }
}

// ============================================================================
// Blob store seam
// ============================================================================

#[async_trait]
pub trait KeyValueBlobStore: Send + Sync {
    async fn get(&self, namespace: &str, key: &str) -> Option<CachedAsset>;

    /// Store an entry, creating the namespace on first use. Overwrites
    /// keep the key's original insertion position.
    async fn put(&self, namespace: &str, key: &str, asset: CachedAsset) -> Result<(), StoreError>;

    /// Remove an entry; `Ok(true)` when something was actually deleted.
    async fn delete(&self, namespace: &str, key: &str) -> Result<bool, StoreError>;

    /// Keys in insertion order, oldest first.
    async fn keys(&self, namespace: &str) -> Vec<String>;

    async fn namespaces(&self) -> Vec<String>;

    async fn drop_namespace(&self, namespace: &str) -> Result<bool, StoreError>;
}

// ============================================================================
// In-memory implementation
// ============================================================================

#[derive(Default)]
struct Namespace {
    order: Vec<String>,
    entries: HashMap<String, CachedAsset>,
}

#[derive(Default)]
pub struct MemoryBlobStore {
    namespaces: RwLock<HashMap<String, Namespace>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueBlobStore for MemoryBlobStore {
    async fn get(&self, namespace: &str, key: &str) -> Option<CachedAsset> {
        let namespaces = rw_read(&self.namespaces, SOURCE, "get");
        namespaces
            .get(namespace)
            .and_then(|ns| ns.entries.get(key))
            .cloned()
    }

    async fn put(&self, namespace: &str, key: &str, asset: CachedAsset) -> Result<(), StoreError> {
        let mut namespaces = rw_write(&self.namespaces, SOURCE, "put");
        let ns = namespaces.entry(namespace.to_string()).or_default();
        if ns.entries.insert(key.to_string(), asset).is_none() {
            ns.order.push(key.to_string());
        }
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<bool, StoreError> {
        let mut namespaces = rw_write(&self.namespaces, SOURCE, "delete");
        let Some(ns) = namespaces.get_mut(namespace) else {
            return Ok(false);
        };
        if ns.entries.remove(key).is_some() {
            ns.order.retain(|k| k != key);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn keys(&self, namespace: &str) -> Vec<String> {
        let namespaces = rw_read(&self.namespaces, SOURCE, "keys");
        namespaces
            .get(namespace)
            .map(|ns| ns.order.clone())
            .unwrap_or_default()
    }

    async fn namespaces(&self) -> Vec<String> {
        let namespaces = rw_read(&self.namespaces, SOURCE, "namespaces");
        namespaces.keys().cloned().collect()
    }

    async fn drop_namespace(&self, namespace: &str) -> Result<bool, StoreError> {
        let mut namespaces = rw_write(&self.namespaces, SOURCE, "drop_namespace");
        Ok(namespaces.remove(namespace).is_some())
    }
}

// ============================================================================
// Store manager
// ============================================================================

/// Fronts the blob store with the versioned namespace scheme, the FIFO
/// entry cap, and failure-swallowing writes.
#[derive(Clone)]
pub struct StoreManager {
    store: Arc<dyn KeyValueBlobStore>,
    img_namespace: String,
    font_namespace: String,
    lru_cap: usize,
}

impl StoreManager {
    pub fn new(store: Arc<dyn KeyValueBlobStore>, config: &EngineConfig) -> Self {
        Self {
            store,
            img_namespace: format!("{}-{}", config.img_store_base, config.version_tag),
            font_namespace: format!("{}-{}", config.font_store_base, config.version_tag),
            lru_cap: config.lru_cap,
        }
    }

    pub fn namespace_for(&self, class: AssetClass) -> &str {
        match class {
            AssetClass::Image => &self.img_namespace,
            AssetClass::Font => &self.font_namespace,
        }
    }

    pub fn current_namespaces(&self) -> [&str; 2] {
        [&self.img_namespace, &self.font_namespace]
    }

    pub async fn get(&self, class: AssetClass, key: &str) -> Option<CachedAsset> {
        self.store.get(self.namespace_for(class), key).await
    }

    /// Store an asset when it is eligible. Storage failures are logged
    /// and swallowed: the caller already holds the response it needs.
    /// Returns whether the entry was written.
    pub async fn put_if_storable(&self, class: AssetClass, key: &str, asset: &CachedAsset) -> bool {
        if !asset.is_storable() {
            debug!(
                target = "engine.store",
                key,
                status = asset.status,
                "Skipping non-storable response"
            );
            return false;
        }
        let namespace = self.namespace_for(class);
        match self.store.put(namespace, key, asset.clone()).await {
            Ok(()) => true,
            Err(error) => {
                warn!(target = "engine.store", key, namespace, %error, "Store write failed");
                false
            }
        }
    }

    /// Evict oldest entries past the cap. Returns how many were removed;
    /// delete failures stop the pass but are not surfaced.
    pub async fn trim(&self, class: AssetClass) -> usize {
        let namespace = self.namespace_for(class).to_string();
        let keys = self.store.keys(&namespace).await;
        if keys.len() <= self.lru_cap {
            return 0;
        }
        let excess = keys.len() - self.lru_cap;
        let mut removed = 0;
        for key in keys.iter().take(excess) {
            match self.store.delete(&namespace, key).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(error) => {
                    warn!(target = "engine.store", key, namespace, %error, "Trim delete failed");
                    break;
                }
            }
        }
        if removed > 0 {
            debug!(target = "engine.store", namespace, removed, "Trimmed store");
        }
        removed
    }

    /// Drop every namespace that is not one of the current versioned
    /// pair. Run once at startup so stale-version stores do not leak.
    pub async fn reconcile_namespaces(&self) -> usize {
        let mut dropped = 0;
        for namespace in self.store.namespaces().await {
            if namespace == self.img_namespace || namespace == self.font_namespace {
                continue;
            }
            match self.store.drop_namespace(&namespace).await {
                Ok(true) => {
                    debug!(target = "engine.store", namespace, "Dropped stale namespace");
                    dropped += 1;
                }
                Ok(false) => {}
                Err(error) => {
                    warn!(target = "engine.store", namespace, %error, "Namespace drop failed");
                }
            }
        }
        dropped
    }

    /// Every stored key across the current namespaces, as
    /// `(namespace, key)` pairs in insertion order per namespace.
    pub async fn all_entries(&self) -> Vec<(String, String)> {
        let mut entries = Vec::new();
        for namespace in self.current_namespaces() {
            for key in self.store.keys(namespace).await {
                entries.push((namespace.to_string(), key));
            }
        }
        entries
    }

    pub async fn delete_in(&self, namespace: &str, key: &str) -> Result<bool, StoreError> {
        self.store.delete(namespace, key).await
    }
}
