//! Expert-activation telemetry types.
//!
//! Samples are extracted from upstream chunks, published to the telemetry
//! channel, and never persisted. A dropped batch is invisible to the client.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One per-layer expert routing observation from a mixture-of-experts model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExpertActivationSample {
    /// Correlation id of the relay session that observed the sample.
    pub request_id: String,
    /// Model that produced the routing metadata.
    pub model_id: String,
    /// MoE layer ordinal the routing decision came from.
    pub layer_index: u32,
    /// Expert index within the layer.
    pub expert_id: u32,
    /// Activation count (or weight) reported upstream for this expert.
    pub activation_count: f64,
    /// When the sample was extracted.
    pub timestamp: DateTime<Utc>,
}

/// Samples extracted from one upstream chunk, published as a unit.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivationBatch {
    /// Samples in extraction order. Ordering across batches is not
    /// guaranteed to downstream subscribers.
    pub samples: Vec<ExpertActivationSample>,
}

impl ActivationBatch {
    /// Whether the batch carries any samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Number of samples in the batch.
    pub fn len(&self) -> usize {
        self.samples.len()
    }
}
