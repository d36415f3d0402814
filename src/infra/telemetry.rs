use std::sync::Once;

use metrics::{Unit, describe_counter};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "scudo_cache_hit_total",
            Unit::Count,
            "Total number of intercepted requests served from cache."
        );
        describe_counter!(
            "scudo_cache_miss_total",
            Unit::Count,
            "Total number of intercepted requests fetched from the network."
        );
        describe_counter!(
            "scudo_cache_revalidate_ok_total",
            Unit::Count,
            "Total number of background revalidations that completed."
        );
        describe_counter!(
            "scudo_cache_revalidate_fail_total",
            Unit::Count,
            "Total number of background revalidations that failed."
        );
        describe_counter!(
            "scudo_cache_seed_ok_total",
            Unit::Count,
            "Total number of keys seeded into the stores."
        );
        describe_counter!(
            "scudo_cache_seed_fail_total",
            Unit::Count,
            "Total number of seed attempts that failed."
        );
        describe_counter!(
            "scudo_cache_purge_ok_total",
            Unit::Count,
            "Total number of entries purged from the stores."
        );
        describe_counter!(
            "scudo_cache_purge_fail_total",
            Unit::Count,
            "Total number of purge attempts that failed."
        );
    });
}
