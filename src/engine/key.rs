//! Cache-key derivation.
//!
//! A key is the request URL with the current seed epoch appended as a
//! query parameter, plus (when enabled) a compact fingerprint of the
//! `Accept` header. Derivation is fully deterministic: original
//! parameters keep their order, engine parameters are appended in a
//! fixed order, and the fingerprint is a pure function of the header
//! value.

use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

use super::config::EngineConfig;

/// Query parameter carrying the seed epoch.
pub const SEED_PARAM: &str = "__seed";
/// Query parameter carrying the Accept-header fingerprint.
pub const ACCEPT_PARAM: &str = "__accept";

static ACCEPT_SUFFIX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"&__accept=\d+").expect("accept suffix pattern compiles"));

/// Derive the canonical cache key for a request URL.
///
/// Existing `__seed`/`__accept` parameters on the incoming URL are
/// discarded so a re-derivation over an already-keyed URL is stable.
pub fn derive_key(url: &Url, accept: Option<&str>, config: &EngineConfig) -> Url {
    let mut keyed = url.clone();
    let retained: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(name, _)| name != SEED_PARAM && name != ACCEPT_PARAM)
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();

    keyed.set_query(None);
    {
        let mut pairs = keyed.query_pairs_mut();
        for (name, value) in &retained {
            pairs.append_pair(name, value);
        }
        pairs.append_pair(SEED_PARAM, &config.seed_epoch);
        if config.accept_in_key {
            pairs.append_pair(ACCEPT_PARAM, &accept_fingerprint(accept.unwrap_or("")));
        }
    }
    keyed
}

/// Stable, non-cryptographic fingerprint of an Accept header value.
///
/// 31-multiply rolling hash over UTF-16-ish code points (chars fit for
/// header values), wrapped at 32 bits and rendered as the unsigned
/// decimal form. Collisions are acceptable: this only partitions cache
/// entries, it never authenticates anything.
pub fn accept_fingerprint(accept: &str) -> String {
    let mut h: i32 = 0;
    for c in accept.chars() {
        h = h.wrapping_mul(31).wrapping_add(c as i32);
    }
    (h as u32).to_string()
}

/// Remove the fingerprint component from a stored key for comparison
/// against keys derived without an Accept header. Assumes the fixed
/// `&__accept=<digits>` shape produced by [`derive_key`].
pub fn strip_accept_param(key: &str) -> String {
    ACCEPT_SUFFIX_RE.replace_all(key, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::config::test_config;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn derivation_is_deterministic() {
        let config = test_config();
        let u = url("https://a.test/logo.png?v=2");
        let k1 = derive_key(&u, Some("image/webp"), &config);
        let k2 = derive_key(&u, Some("image/webp"), &config);
        assert_eq!(k1, k2);
        assert!(k1.query().unwrap().starts_with("v=2&__seed="));
    }

    #[test]
    fn seed_epoch_changes_the_key() {
        let mut a = test_config();
        let mut b = test_config();
        a.seed_epoch = "seed-0001".into();
        b.seed_epoch = "seed-0002".into();
        let u = url("https://a.test/logo.png");
        assert_ne!(derive_key(&u, None, &a), derive_key(&u, None, &b));
    }

    #[test]
    fn accept_param_only_when_enabled() {
        let mut config = test_config();
        config.accept_in_key = false;
        let u = url("https://a.test/logo.png");
        let without = derive_key(&u, Some("image/avif"), &config);
        assert!(!without.query().unwrap().contains(ACCEPT_PARAM));

        config.accept_in_key = true;
        let with = derive_key(&u, Some("image/avif"), &config);
        assert!(with.query().unwrap().contains(ACCEPT_PARAM));
    }

    #[test]
    fn missing_accept_hashes_the_empty_string() {
        let config = test_config();
        let u = url("https://a.test/logo.png");
        let key = derive_key(&u, None, &config);
        assert!(key.query().unwrap().ends_with("&__accept=0"));
    }

    #[test]
    fn rederiving_a_keyed_url_is_stable() {
        let config = test_config();
        let u = url("https://a.test/logo.png?v=2");
        let once = derive_key(&u, Some("*/*"), &config);
        let twice = derive_key(&once, Some("*/*"), &config);
        assert_eq!(once, twice);
    }

    #[test]
    fn fingerprint_matches_reference_values() {
        // h = (h * 31 + code_point) mod 2^32, rendered unsigned.
        assert_eq!(accept_fingerprint(""), "0");
        assert_eq!(accept_fingerprint("a"), "97");
        assert_eq!(accept_fingerprint("ab"), "3105");
        // Long enough to wrap negative in i32 space.
        let long = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";
        let fp = accept_fingerprint(long);
        assert!(fp.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(accept_fingerprint(long), fp);
    }

    #[test]
    fn strip_accept_param_removes_fingerprint_component() {
        let stored = "https://a.test/logo.png?v=2&__seed=seed-0001&__accept=12345";
        assert_eq!(
            strip_accept_param(stored),
            "https://a.test/logo.png?v=2&__seed=seed-0001"
        );
        // Keys without the param pass through unchanged.
        let bare = "https://a.test/logo.png?__seed=seed-0001";
        assert_eq!(strip_accept_param(bare), bare);
    }
}
