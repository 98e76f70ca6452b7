//! Model directory contract and in-memory implementation.
//!
//! Relay sessions consult the directory exactly once, at open. Activity
//! flags are refreshed out-of-band by a heartbeat task; "model became
//! inactive mid-stream" is deliberately not detected.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::info;

use moechat_core::model::ModelRecord;

use crate::client::UpstreamClient;

/// Read-only model lookup used by relay sessions.
#[async_trait]
pub trait ModelDirectory: Send + Sync {
    /// Fetch one record; `None` for unknown ids.
    async fn get_model(&self, model_id: &str) -> Option<ModelRecord>;

    /// Snapshot of all records.
    async fn list_models(&self) -> Vec<ModelRecord>;
}

/// Directory backed by an in-process map, refreshed by health probes.
#[derive(Debug, Default)]
pub struct InMemoryModelDirectory {
    models: RwLock<HashMap<String, ModelRecord>>,
}

impl InMemoryModelDirectory {
    /// Empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory pre-seeded with records.
    pub fn with_models(records: impl IntoIterator<Item = ModelRecord>) -> Self {
        let directory = Self::new();
        for record in records {
            directory.upsert(record);
        }
        directory
    }

    /// Insert or replace a record.
    pub fn upsert(&self, record: ModelRecord) {
        let _ = self.models.write().insert(record.id.clone(), record);
    }

    /// Flip the activity flag for one model. No-op for unknown ids.
    pub fn set_active(&self, model_id: &str, is_active: bool) {
        if let Some(record) = self.models.write().get_mut(model_id) {
            record.is_active = is_active;
        }
    }

    /// Number of known models.
    pub fn len(&self) -> usize {
        self.models.read().len()
    }

    /// Whether the directory is empty.
    pub fn is_empty(&self) -> bool {
        self.models.read().is_empty()
    }

    /// Probe every distinct service URL and update activity flags.
    ///
    /// One probe per URL, shared by all models it hosts.
    pub async fn probe_services(&self, client: &UpstreamClient) {
        let urls: HashSet<String> = self
            .models
            .read()
            .values()
            .map(|m| m.service_url.clone())
            .collect();

        for url in urls {
            let healthy = client.check_health(&url).await;
            let mut models = self.models.write();
            for record in models.values_mut() {
                if record.service_url == url && record.is_active != healthy {
                    info!(
                        model = %record.id,
                        healthy,
                        "model activity changed"
                    );
                    record.is_active = healthy;
                }
            }
        }
    }
}

#[async_trait]
impl ModelDirectory for InMemoryModelDirectory {
    async fn get_model(&self, model_id: &str) -> Option<ModelRecord> {
        self.models.read().get(model_id).cloned()
    }

    async fn list_models(&self) -> Vec<ModelRecord> {
        let mut records: Vec<ModelRecord> = self.models.read().values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }
}
