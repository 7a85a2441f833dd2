use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
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
            "stampa_render_jobs_total",
            Unit::Count,
            "Total number of render jobs dispatched."
        );
        describe_counter!(
            "stampa_render_failure_total",
            Unit::Count,
            "Total number of render jobs dropped after a failed request."
        );
        describe_counter!(
            "stampa_fetch_failure_total",
            Unit::Count,
            "Total number of artifacts dropped after a failed fetch."
        );
        describe_histogram!(
            "stampa_render_ms",
            Unit::Milliseconds,
            "Render request latency in milliseconds."
        );
        describe_histogram!(
            "stampa_archive_bytes",
            Unit::Bytes,
            "Assembled archive size in bytes."
        );
    });
}
