//! Relay server configuration.
//!
//! Defaults first, then `MOECHAT_*` environment overrides. Invalid override
//! values are logged and ignored rather than failing startup.

use std::collections::HashMap;

use moechat_core::model::ModelRecord;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Configuration for the relay server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `3000`; `0` auto-assigns).
    pub port: u16,
    /// Model requested when a client omits `model_id`.
    pub default_model: String,
    /// Service URL used for models without an explicit mapping.
    pub default_service_url: String,
    /// `model=url` mappings seeded into the directory at startup.
    pub model_service_urls: HashMap<String, String>,
    /// Models that emit a thinking preamble.
    pub thinking_models: Vec<String>,
    /// Abort a session when no upstream chunk arrives within this window.
    pub chunk_idle_timeout_secs: u64,
    /// Whole-request timeout for non-streaming upstream calls.
    pub request_timeout_secs: u64,
    /// Client-facing frame channel capacity per session.
    pub frame_buffer: usize,
    /// Telemetry hand-off queue capacity (drop-newest on overflow).
    pub telemetry_buffer: usize,
    /// Seconds between model service health probes.
    pub heartbeat_interval_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 3000,
            default_model: "deepseek-moe-16b".into(),
            default_service_url: "http://localhost:8000".into(),
            model_service_urls: HashMap::new(),
            thinking_models: Vec::new(),
            chunk_idle_timeout_secs: 60,
            request_timeout_secs: 60,
            frame_buffer: 64,
            telemetry_buffer: 256,
            heartbeat_interval_secs: 15,
        }
    }
}

impl RelayConfig {
    /// Defaults plus `MOECHAT_*` process environment overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Apply overrides from a key lookup. Split out for testability.
    pub fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(host) = get("MOECHAT_HOST") {
            self.host = host;
        }
        read_parsed(&get, "MOECHAT_PORT", &mut self.port);
        if let Some(model) = get("MOECHAT_DEFAULT_MODEL") {
            self.default_model = model;
        }
        if let Some(url) = get("MOECHAT_DEFAULT_SERVICE_URL") {
            self.default_service_url = url;
        }
        if let Some(raw) = get("MOECHAT_MODEL_SERVICE_URLS") {
            self.model_service_urls = parse_model_urls(&raw);
        }
        if let Some(raw) = get("MOECHAT_THINKING_MODELS") {
            self.thinking_models = parse_list(&raw);
        }
        read_parsed(
            &get,
            "MOECHAT_CHUNK_IDLE_TIMEOUT_SECS",
            &mut self.chunk_idle_timeout_secs,
        );
        read_parsed(
            &get,
            "MOECHAT_REQUEST_TIMEOUT_SECS",
            &mut self.request_timeout_secs,
        );
        read_parsed(&get, "MOECHAT_FRAME_BUFFER", &mut self.frame_buffer);
        read_parsed(&get, "MOECHAT_TELEMETRY_BUFFER", &mut self.telemetry_buffer);
        read_parsed(
            &get,
            "MOECHAT_HEARTBEAT_INTERVAL_SECS",
            &mut self.heartbeat_interval_secs,
        );
    }

    /// Model records seeded into the directory at startup.
    ///
    /// Every mapped model gets a record; the default model gets one even
    /// without a mapping, pointed at the default service URL.
    pub fn seed_models(&self) -> Vec<ModelRecord> {
        let mut records: Vec<ModelRecord> = Vec::new();

        for (id, url) in &self.model_service_urls {
            records.push(ModelRecord::new(id.clone(), url.clone()));
        }
        if !self.model_service_urls.contains_key(&self.default_model) {
            records.push(ModelRecord::new(
                self.default_model.clone(),
                self.default_service_url.clone(),
            ));
        }

        for record in &mut records {
            record.has_thinking = self.thinking_models.iter().any(|m| m == &record.id);
        }
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }
}

/// Parse an override into `target`, keeping the old value on failure.
fn read_parsed<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) {
    if let Some(raw) = get(key) {
        match raw.trim().parse::<T>() {
            Ok(value) => *target = value,
            Err(_) => warn!(key, value = %raw, "ignoring unparseable override"),
        }
    }
}

/// Parse `model=url,model=url` mappings. Malformed entries are skipped.
fn parse_model_urls(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|entry| {
            let (model, url) = entry.split_once('=')?;
            let (model, url) = (model.trim(), url.trim());
            if model.is_empty() || url.is_empty() {
                return None;
            }
            Some((model.to_string(), url.to_string()))
        })
        .collect()
}

/// Parse a comma-separated list, trimming blanks.
fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
