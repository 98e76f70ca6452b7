//! Prometheus metrics recorder and `/metrics` endpoint handler.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the handle used to render `/metrics`. Call once at startup; a
/// second install fails, in which case a detached recorder is returned so
/// embedded test servers keep working.
pub fn install_recorder() -> PrometheusHandle {
    let builder = PrometheusBuilder::new();
    match builder.install_recorder() {
        Ok(handle) => {
            info!("prometheus metrics recorder installed");
            handle
        }
        Err(_) => PrometheusBuilder::new().build_recorder().handle(),
    }
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants to avoid typos across modules.

/// Stream requests accepted (counter, labels: model).
pub const RELAY_REQUESTS_TOTAL: &str = "relay_requests_total";
/// Relay sessions currently streaming (gauge).
pub const RELAY_SESSIONS_ACTIVE: &str = "relay_sessions_active";
/// Upstream chunks processed (counter).
pub const RELAY_CHUNKS_TOTAL: &str = "relay_chunks_total";
/// Malformed upstream chunks skipped (counter).
pub const RELAY_MALFORMED_CHUNKS_TOTAL: &str = "relay_malformed_chunks_total";
/// Sessions aborted mid-stream (counter).
pub const RELAY_ABORTS_TOTAL: &str = "relay_aborts_total";
/// Pre-stream request rejections (counter, labels: reason).
pub const RELAY_REJECTIONS_TOTAL: &str = "relay_rejections_total";
/// Telemetry batches forwarded to the topic (counter).
pub const TELEMETRY_PUBLISHED_TOTAL: &str = "telemetry_published_total";
/// Telemetry batches dropped on a full queue (counter).
pub const TELEMETRY_DROPPED_TOTAL: &str = "telemetry_dropped_total";
