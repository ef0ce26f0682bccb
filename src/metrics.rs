//! Metrics initialization for the Prometheus exporter.

use metrics_exporter_prometheus::PrometheusBuilder;

use crate::config::MetricsSettings;
use crate::error::{Error, Result};

/// Initialize the metrics system from the `metrics` settings section.
///
/// When enabled, this starts an HTTP listener that serves `/metrics`. When
/// disabled it does nothing and the `metrics` macros become no-ops.
pub fn init(settings: &MetricsSettings) -> Result<()> {
    if !settings.enabled {
        return Ok(());
    }

    PrometheusBuilder::new()
        .with_http_listener(settings.listen)
        .install()
        .map_err(|err| Error::Metrics(err.to_string()))?;

    Ok(())
}
