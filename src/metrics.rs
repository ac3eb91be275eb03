//! Pipeline metrics.
//!
//! Counters are emitted through the `metrics` facade; without an installed
//! recorder they are no-ops, so library users pay nothing unless the binary
//! calls [`init_metrics`].

use std::net::SocketAddr;
use std::sync::Once;
use tracing::{info, warn};

pub const SOURCES_DOWNLOADED: &str = "aggregator_sources_downloaded_total";
pub const SOURCES_FAILED: &str = "aggregator_sources_failed_total";
pub const VALUES_NORMALIZED: &str = "aggregator_values_normalized_total";
pub const CHUNKS_WRITTEN: &str = "aggregator_chunks_written_total";
pub const VALUES_DEDUPED: &str = "aggregator_values_deduped_total";
pub const VALUES_EXPORTED: &str = "aggregator_values_exported_total";
pub const STAGE_DURATION: &str = "aggregator_stage_duration_seconds";

static INIT: Once = Once::new();

/// Installs the Prometheus exporter when `AGGREGATOR_METRICS_ADDR` is set. Idempotent.
pub fn init_metrics() {
    INIT.call_once(|| {
        let Ok(addr_str) = std::env::var("AGGREGATOR_METRICS_ADDR") else {
            return;
        };
        let addr: SocketAddr = match addr_str.parse() {
            Ok(addr) => addr,
            Err(e) => {
                warn!("Invalid metrics addr '{}': {}", addr_str, e);
                return;
            }
        };
        let builder = metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(addr);
        match builder.install() {
            Ok(()) => info!("Prometheus exporter listening on http://{}/metrics", addr),
            Err(e) => warn!("Prometheus exporter install failed: {}", e),
        }
    });
}

pub fn record_download(success: bool) {
    if success {
        metrics::counter!(SOURCES_DOWNLOADED).increment(1);
    } else {
        metrics::counter!(SOURCES_FAILED).increment(1);
    }
}

pub fn record_normalized(values: u64) {
    metrics::counter!(VALUES_NORMALIZED).increment(values);
}

pub fn record_chunks(chunks: u64) {
    metrics::counter!(CHUNKS_WRITTEN).increment(chunks);
}

pub fn record_deduped(values: u64) {
    metrics::counter!(VALUES_DEDUPED).increment(values);
}

pub fn record_exported(values: u64) {
    metrics::counter!(VALUES_EXPORTED).increment(values);
}

pub fn record_stage_duration(stage: &'static str, seconds: f64) {
    metrics::histogram!(STAGE_DURATION, "stage" => stage).record(seconds);
}
