use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
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
            "whisper_cache_hit_total",
            Unit::Count,
            "Total number of cache hits, labelled by module."
        );
        describe_counter!(
            "whisper_cache_miss_total",
            Unit::Count,
            "Total number of cache misses, labelled by module."
        );
        describe_histogram!(
            "whisper_cache_get_ms",
            Unit::Milliseconds,
            "Cache read latency in milliseconds."
        );
        describe_counter!(
            "whisper_cache_fetch_total",
            Unit::Count,
            "Source fetches on a miss, labelled populate or direct."
        );
        describe_counter!(
            "whisper_cache_refresh_total",
            Unit::Count,
            "Refresh decisions, labelled by outcome."
        );
        describe_histogram!(
            "whisper_cache_refresh_cycle_ms",
            Unit::Milliseconds,
            "Refresh cycle duration in milliseconds."
        );
        describe_gauge!(
            "whisper_cache_fetchers",
            Unit::Count,
            "Registered fetchers available to the refresh scheduler."
        );
    });
}
