//! `/health` endpoint.

use serde::Serialize;
use std::time::Instant;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Sessions currently streaming.
    pub active_sessions: usize,
    /// Models in the directory that passed their last health probe.
    pub active_models: usize,
}

/// Build a health response from live counters.
pub fn health_check(
    start_time: Instant,
    active_sessions: usize,
    active_models: usize,
) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        active_sessions,
        active_models,
    }
}
