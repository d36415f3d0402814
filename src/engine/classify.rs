//! Request classification: which requests the engine handles at all,
//! and which of the versioned stores an asset belongs in.

use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

// ============================================================================
// Extension predicates
// ============================================================================

static STATIC_EXT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\.(png|jpe?g|webp|avif|gif|svg|ico|woff2?|ttf|otf|eot)$")
        .expect("static extension pattern compiles")
});

static IMG_EXT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\.(png|jpe?g|webp|avif|gif|svg|ico)$")
        .expect("image extension pattern compiles")
});

static FONT_EXT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\.(woff2?|ttf|otf|eot)$").expect("font extension pattern compiles")
});

/// Asset classes the engine caches, each with its own versioned store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetClass {
    Image,
    Font,
}

/// True when the URL path ends in a recognized static-asset extension.
/// Query strings are not part of the path here, so `/a.png?v=2` matches.
pub fn is_static_asset(url: &Url) -> bool {
    STATIC_EXT_RE.is_match(url.path())
}

/// Class of a static asset. Fonts win over images so a hypothetical
/// overlap resolves to the font store.
pub fn asset_class(url: &Url) -> Option<AssetClass> {
    let path = url.path();
    if FONT_EXT_RE.is_match(path) {
        Some(AssetClass::Font)
    } else if IMG_EXT_RE.is_match(path) {
        Some(AssetClass::Image)
    } else {
        None
    }
}

// ============================================================================
// Request-level gates
// ============================================================================

/// HTML navigations are never intercepted, regardless of path shape.
pub fn is_html_navigation(accept: Option<&str>) -> bool {
    accept.is_some_and(|value| value.contains("text/html"))
}

/// Domain allow-list check. An empty list allows every host. Each
/// entry is compared case-insensitively against the URL's full host
/// form: `host:port` when the URL carries a non-default port, bare
/// host otherwise. A bare entry therefore never matches an explicit
/// non-default port.
pub fn is_allowed_domain(url: &Url, whitelist: &[String]) -> bool {
    if whitelist.is_empty() {
        return true;
    }
    let Some(host) = url.host_str() else {
        return false;
    };
    let host_with_port = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    whitelist
        .iter()
        .any(|allowed| allowed.eq_ignore_ascii_case(&host_with_port))
}

/// True when any blacklist pattern matches the URL path.
pub fn is_blacklisted(url: &Url, patterns: &[Regex]) -> bool {
    patterns.iter().any(|re| re.is_match(url.path()))
}
