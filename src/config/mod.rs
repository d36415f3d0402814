//! Configuration layer: typed settings with layered precedence (file → env → CLI),
//! plus the optional remote JSON overlay fetched once at startup.

use std::{net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use clap::{Args, Parser, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "scudo";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_SEED_EPOCH: &str = "seed-0001";
const DEFAULT_LRU_CAP: u64 = 3000;
const DEFAULT_IMG_STORE_BASE: &str = "img-cache";
const DEFAULT_FONT_STORE_BASE: &str = "font-cache";

/// Command-line arguments for the scudo binary.
#[derive(Debug, Parser)]
#[command(name = "scudo", version, about = "Static-asset interception cache")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "SCUDO_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: Overrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct Overrides {
    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the seed epoch embedded in cache keys.
    #[arg(long = "seed-epoch", value_name = "EPOCH")]
    pub seed_epoch: Option<String>,

    /// Override the origin assets are fetched from.
    #[arg(long = "upstream-origin", value_name = "URL")]
    pub upstream_origin: Option<String>,

    /// Override the origin this instance serves.
    #[arg(long = "public-origin", value_name = "URL")]
    pub public_origin: Option<String>,

    /// Override the fallback asset served when the network is down.
    #[arg(long = "fallback-url", value_name = "URL")]
    pub fallback_url: Option<String>,

    /// Override the per-store entry cap.
    #[arg(long = "lru-cap", value_name = "COUNT")]
    pub lru_cap: Option<u64>,

    /// Toggle the Accept-header fingerprint in cache keys.
    #[arg(
        long = "accept-in-key",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub accept_in_key: Option<bool>,

    /// Toggle seeding of outbound fetch URLs.
    #[arg(
        long = "apply-seed-to-network",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub apply_seed_to_network: Option<bool>,

    /// Override the default asset manifest URL.
    #[arg(long = "manifest", value_name = "URL")]
    pub manifest: Option<String>,

    /// Override the version tag namespacing the stores.
    #[arg(long = "version-tag", value_name = "TAG")]
    pub version_tag: Option<String>,

    /// Override the management API shared secret.
    #[arg(long = "admin-secret", value_name = "SECRET", env = "SCUDO_ADMIN_SECRET")]
    pub admin_secret: Option<String>,

    /// Override the remote configuration document URL.
    #[arg(long = "remote-config-url", value_name = "URL")]
    pub remote_config_url: Option<String>,
}

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub engine: EngineSettings,
    pub admin: AdminSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

/// Engine inputs as plain values; `EngineConfig` parses and compiles
/// them into the runtime snapshot.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub seed_epoch: String,
    pub domain_whitelist: Vec<String>,
    pub blacklist: Vec<String>,
    pub apply_seed_to_network: bool,
    pub fallback_url: Option<String>,
    pub accept_in_key: bool,
    pub img_store_base: String,
    pub font_store_base: String,
    pub lru_cap: u64,
    pub manifest: Option<String>,
    pub preload: Vec<String>,
    pub version_tag: String,
    pub public_origin: String,
    pub upstream_origin: String,
}

#[derive(Debug, Clone)]
pub struct AdminSettings {
    pub secret: Option<String>,
    pub remote_config_url: Option<String>,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    pub(crate) fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("SCUDO").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_overrides(&cli.overrides);
    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    engine: RawEngineSettings,
    admin: RawAdminSettings,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(seed) = overrides.seed_epoch.as_ref() {
            self.engine.seed_epoch = Some(seed.clone());
        }
        if let Some(origin) = overrides.upstream_origin.as_ref() {
            self.engine.upstream_origin = Some(origin.clone());
        }
        if let Some(origin) = overrides.public_origin.as_ref() {
            self.engine.public_origin = Some(origin.clone());
        }
        if let Some(url) = overrides.fallback_url.as_ref() {
            self.engine.fallback_url = Some(url.clone());
        }
        if let Some(cap) = overrides.lru_cap {
            self.engine.lru_cap = Some(cap);
        }
        if let Some(flag) = overrides.accept_in_key {
            self.engine.accept_in_key = Some(flag);
        }
        if let Some(flag) = overrides.apply_seed_to_network {
            self.engine.apply_seed_to_network = Some(flag);
        }
        if let Some(url) = overrides.manifest.as_ref() {
            self.engine.manifest = Some(url.clone());
        }
        if let Some(tag) = overrides.version_tag.as_ref() {
            self.engine.version_tag = Some(tag.clone());
        }
        if let Some(secret) = overrides.admin_secret.as_ref() {
            self.admin.secret = Some(secret.clone());
        }
        if let Some(url) = overrides.remote_config_url.as_ref() {
            self.admin.remote_config_url = Some(url.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            engine,
            admin,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let engine = build_engine_settings(engine, &server)?;
        let admin = build_admin_settings(admin);

        Ok(Self {
            server,
            logging,
            engine,
            admin,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_engine_settings(
    engine: RawEngineSettings,
    server: &ServerSettings,
) -> Result<EngineSettings, LoadError> {
    let upstream_origin = engine
        .upstream_origin
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            LoadError::invalid("engine.upstream_origin", "an upstream origin is required")
        })?;

    let public_origin = engine
        .public_origin
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| format!("http://{}", server.addr));

    let version_tag = engine
        .version_tag
        .unwrap_or_else(|| format!("v{}", env!("CARGO_PKG_VERSION")));

    Ok(EngineSettings {
        seed_epoch: engine
            .seed_epoch
            .unwrap_or_else(|| DEFAULT_SEED_EPOCH.to_string()),
        domain_whitelist: engine.domain_whitelist.unwrap_or_default(),
        blacklist: engine.blacklist.unwrap_or_default(),
        apply_seed_to_network: engine.apply_seed_to_network.unwrap_or(false),
        fallback_url: engine.fallback_url,
        accept_in_key: engine.accept_in_key.unwrap_or(true),
        img_store_base: engine
            .img_store_base
            .unwrap_or_else(|| DEFAULT_IMG_STORE_BASE.to_string()),
        font_store_base: engine
            .font_store_base
            .unwrap_or_else(|| DEFAULT_FONT_STORE_BASE.to_string()),
        lru_cap: engine.lru_cap.unwrap_or(DEFAULT_LRU_CAP),
        manifest: engine.manifest,
        preload: engine.preload.unwrap_or_default(),
        version_tag,
        public_origin,
        upstream_origin,
    })
}

fn build_admin_settings(admin: RawAdminSettings) -> AdminSettings {
    AdminSettings {
        secret: admin.secret.and_then(|value| {
            let trimmed = value.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }),
        remote_config_url: admin.remote_config_url,
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawEngineSettings {
    seed_epoch: Option<String>,
    domain_whitelist: Option<Vec<String>>,
    blacklist: Option<Vec<String>>,
    apply_seed_to_network: Option<bool>,
    fallback_url: Option<String>,
    accept_in_key: Option<bool>,
    img_store_base: Option<String>,
    font_store_base: Option<String>,
    lru_cap: Option<u64>,
    manifest: Option<String>,
    preload: Option<Vec<String>>,
    version_tag: Option<String>,
    public_origin: Option<String>,
    upstream_origin: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawAdminSettings {
    secret: Option<String>,
    remote_config_url: Option<String>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

// ============================================================================
// Remote overlay
// ============================================================================

/// Externally-hosted configuration document. Field names follow the
/// document format this engine inherited, hence the camelCase.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct RemoteConfigDoc {
    pub cache_seed: Option<String>,
    pub domain_whitelist: Option<Vec<String>>,
    pub apply_seed_to_network: Option<bool>,
    pub fallback: Option<String>,
    pub accept_key: Option<bool>,
    pub img_cache_name: Option<String>,
    pub font_cache_name: Option<String>,
    pub lru_max: Option<u64>,
    pub manifest: Option<String>,
    pub preload: Option<Vec<String>>,
    pub blacklist: Option<Vec<String>>,
}

impl RemoteConfigDoc {
    /// Apply the document on top of the resolved engine settings.
    /// Absent fields leave the local values alone.
    pub fn overlay(&self, engine: &mut EngineSettings) {
        if let Some(seed) = self.cache_seed.as_ref() {
            engine.seed_epoch = seed.clone();
        }
        if let Some(whitelist) = self.domain_whitelist.as_ref() {
            engine.domain_whitelist = whitelist.clone();
        }
        if let Some(flag) = self.apply_seed_to_network {
            engine.apply_seed_to_network = flag;
        }
        if let Some(url) = self.fallback.as_ref() {
            engine.fallback_url = Some(url.clone());
        }
        if let Some(flag) = self.accept_key {
            engine.accept_in_key = flag;
        }
        if let Some(name) = self.img_cache_name.as_ref() {
            engine.img_store_base = name.clone();
        }
        if let Some(name) = self.font_cache_name.as_ref() {
            engine.font_store_base = name.clone();
        }
        if let Some(cap) = self.lru_max {
            engine.lru_cap = cap;
        }
        if let Some(url) = self.manifest.as_ref() {
            engine.manifest = Some(url.clone());
        }
        if let Some(preload) = self.preload.as_ref() {
            engine.preload = preload.clone();
        }
        if let Some(blacklist) = self.blacklist.as_ref() {
            engine.blacklist = blacklist.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_with_upstream() -> RawSettings {
        let mut raw = RawSettings::default();
        raw.engine.upstream_origin = Some("https://upstream.test".to_string());
        raw
    }

    #[test]
    fn cli_overrides_take_highest_precedence() {
        let mut raw = raw_with_upstream();
        raw.server.port = Some(4000);
        raw.engine.seed_epoch = Some("seed-0009".to_string());

        let overrides = Overrides {
            server_port: Some(4321),
            seed_epoch: Some("seed-0010".to_string()),
            log_level: Some("debug".to_string()),
            ..Default::default()
        };

        raw.apply_overrides(&overrides);
        let settings = Settings::from_raw(raw).expect("valid settings");

        assert_eq!(settings.server.addr.port(), 4321);
        assert_eq!(settings.engine.seed_epoch, "seed-0010");
        assert_eq!(settings.logging.level, LevelFilter::DEBUG);
    }

    #[test]
    fn upstream_origin_is_required() {
        let raw = RawSettings::default();
        assert!(matches!(
            Settings::from_raw(raw),
            Err(LoadError::Invalid { key, .. }) if key == "engine.upstream_origin"
        ));
    }

    #[test]
    fn public_origin_defaults_to_the_listen_address() {
        let settings = Settings::from_raw(raw_with_upstream()).expect("valid settings");
        assert_eq!(settings.engine.public_origin, "http://127.0.0.1:8080");
    }

    #[test]
    fn engine_defaults_match_the_documented_values() {
        let settings = Settings::from_raw(raw_with_upstream()).expect("valid settings");
        assert_eq!(settings.engine.seed_epoch, DEFAULT_SEED_EPOCH);
        assert_eq!(settings.engine.lru_cap, DEFAULT_LRU_CAP);
        assert!(settings.engine.accept_in_key);
        assert!(!settings.engine.apply_seed_to_network);
        assert_eq!(settings.engine.img_store_base, DEFAULT_IMG_STORE_BASE);
    }

    #[test]
    fn cli_json_logging_enforces_format() {
        let mut raw = raw_with_upstream();
        let overrides = Overrides {
            log_json: Some(true),
            ..Default::default()
        };

        raw.apply_overrides(&overrides);
        let settings = Settings::from_raw(raw).expect("valid settings");
        assert!(matches!(settings.logging.format, LogFormat::Json));
    }

    #[test]
    fn blank_admin_secret_counts_as_absent() {
        let mut raw = raw_with_upstream();
        raw.admin.secret = Some("   ".to_string());
        let settings = Settings::from_raw(raw).expect("valid settings");
        assert!(settings.admin.secret.is_none());
    }

    #[test]
    fn parse_cli_overrides() {
        let args = CliArgs::parse_from([
            "scudo",
            "--upstream-origin",
            "https://upstream.test",
            "--seed-epoch",
            "seed-0042",
            "--lru-cap",
            "500",
        ]);

        assert_eq!(
            args.overrides.upstream_origin.as_deref(),
            Some("https://upstream.test")
        );
        assert_eq!(args.overrides.seed_epoch.as_deref(), Some("seed-0042"));
        assert_eq!(args.overrides.lru_cap, Some(500));
    }

    #[test]
    fn documented_toml_keys_are_honored() {
        let raw: RawSettings = Config::builder()
            .add_source(config::File::from_str(
                r#"
                [server]
                graceful_shutdown_seconds = 5

                [logging]
                json = true

                [engine]
                upstream_origin = "https://upstream.test"
                "#,
                config::FileFormat::Toml,
            ))
            .build()
            .expect("valid toml")
            .try_deserialize()
            .expect("raw settings");
        let settings = Settings::from_raw(raw).expect("valid settings");

        assert_eq!(settings.server.graceful_shutdown, Duration::from_secs(5));
        assert!(matches!(settings.logging.format, LogFormat::Json));
    }

    #[test]
    fn remote_overlay_replaces_only_present_fields() {
        let mut settings = Settings::from_raw(raw_with_upstream())
            .expect("valid settings")
            .engine;
        let doc: RemoteConfigDoc = serde_json::from_str(
            r#"{"cacheSeed": "seed-0100", "lruMax": 900, "blacklist": ["^/private/"]}"#,
        )
        .expect("valid document");

        doc.overlay(&mut settings);

        assert_eq!(settings.seed_epoch, "seed-0100");
        assert_eq!(settings.lru_cap, 900);
        assert_eq!(settings.blacklist, vec!["^/private/"]);
        // Untouched fields keep their defaults.
        assert!(settings.accept_in_key);
        assert_eq!(settings.upstream_origin, "https://upstream.test");
    }
}
