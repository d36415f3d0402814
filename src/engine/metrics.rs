//! Fixed-counter metrics registry.
//!
//! The engine exposes exactly eight counters. They live in plain
//! atomics so the management endpoint can render a consistent snapshot
//! without touching the recorder; every increment is also mirrored to
//! the `metrics` facade so an installed exporter sees the same series.

use std::sync::atomic::{AtomicU64, Ordering};

use metrics::counter;
use serde_json::{Value, json};

/// Counter names in their fixed exposition order.
pub const COUNTER_NAMES: [&str; 8] = [
    "hit",
    "miss",
    "revalidate_ok",
    "revalidate_fail",
    "seed_ok",
    "seed_fail",
    "purge_ok",
    "purge_fail",
];

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    hit: AtomicU64,
    miss: AtomicU64,
    revalidate_ok: AtomicU64,
    revalidate_fail: AtomicU64,
    seed_ok: AtomicU64,
    seed_fail: AtomicU64,
    purge_ok: AtomicU64,
    purge_fail: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hit.fetch_add(1, Ordering::Relaxed);
        counter!("scudo_cache_hit_total").increment(1);
    }

    pub fn record_miss(&self) {
        self.miss.fetch_add(1, Ordering::Relaxed);
        counter!("scudo_cache_miss_total").increment(1);
    }

    pub fn record_revalidate_ok(&self) {
        self.revalidate_ok.fetch_add(1, Ordering::Relaxed);
        counter!("scudo_cache_revalidate_ok_total").increment(1);
    }

    pub fn record_revalidate_fail(&self) {
        self.revalidate_fail.fetch_add(1, Ordering::Relaxed);
        counter!("scudo_cache_revalidate_fail_total").increment(1);
    }

    pub fn record_seed_ok(&self) {
        self.seed_ok.fetch_add(1, Ordering::Relaxed);
        counter!("scudo_cache_seed_ok_total").increment(1);
    }

    pub fn record_seed_fail(&self) {
        self.seed_fail.fetch_add(1, Ordering::Relaxed);
        counter!("scudo_cache_seed_fail_total").increment(1);
    }

    pub fn record_purge_ok(&self) {
        self.purge_ok.fetch_add(1, Ordering::Relaxed);
        counter!("scudo_cache_purge_ok_total").increment(1);
    }

    pub fn record_purge_fail(&self) {
        self.purge_fail.fetch_add(1, Ordering::Relaxed);
        counter!("scudo_cache_purge_fail_total").increment(1);
    }

    /// Point-in-time values in the fixed [`COUNTER_NAMES`] order.
    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("hit", self.hit.load(Ordering::Relaxed)),
            ("miss", self.miss.load(Ordering::Relaxed)),
            ("revalidate_ok", self.revalidate_ok.load(Ordering::Relaxed)),
            ("revalidate_fail", self.revalidate_fail.load(Ordering::Relaxed)),
            ("seed_ok", self.seed_ok.load(Ordering::Relaxed)),
            ("seed_fail", self.seed_fail.load(Ordering::Relaxed)),
            ("purge_ok", self.purge_ok.load(Ordering::Relaxed)),
            ("purge_fail", self.purge_fail.load(Ordering::Relaxed)),
        ]
    }

    /// Flat text exposition, one `sw_<name> <value>` line per counter.
    pub fn render_prom(&self) -> String {
        let mut out = String::new();
        for (name, value) in self.snapshot() {
            out.push_str("sw_");
            out.push_str(name);
            out.push(' ');
            out.push_str(&value.to_string());
            out.push('\n');
        }
        out
    }

    pub fn render_json(&self) -> Value {
        let mut map = serde_json::Map::new();
        for (name, value) in self.snapshot() {
            map.insert(name.to_string(), json!(value));
        }
        Value::Object(map)
    }

    /// Minimal HTML table for eyeball inspection.
    pub fn render_html(&self) -> String {
        let mut rows = String::new();
        for (name, value) in self.snapshot() {
            rows.push_str(&format!("<tr><td>{name}</td><td>{value}</td></tr>"));
        }
        format!(
            "<!doctype html><html><head><title>cache metrics</title></head>\
             <body><h1>Cache metrics</h1><table border=\"1\">\
             <tr><th>counter</th><th>value</th></tr>{rows}</table></body></html>"
        )
    }
}
