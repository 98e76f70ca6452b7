//! Expert-activation extraction from upstream routing metadata.
//!
//! Instrumented MoE backends attach an `expert_info` object to chunks and
//! completions:
//!
//! ```json
//! {
//!   "total_hooks": 24,
//!   "details": [{"module": "...", "hook_call": 3,
//!                "experts": [[1, 5], [5, 9]], "shape": [2, 2]}],
//!   "usage": {"5": 12, "9": 4}
//! }
//! ```
//!
//! Extraction is pure and best-effort: any missing or oddly shaped field
//! yields fewer samples, never an error.

use chrono::Utc;
use moechat_core::telemetry::ExpertActivationSample;
use serde_json::Value;
use std::collections::BTreeMap;

/// Extract activation samples from one `expert_info` payload.
///
/// Per-layer samples come from `details` (one entry per gate hook call);
/// when only the aggregate `usage` map is present, samples carry layer 0.
/// Anything unrecognized yields an empty vector.
pub fn extract_samples(
    request_id: &str,
    model_id: &str,
    expert_info: &Value,
) -> Vec<ExpertActivationSample> {
    let timestamp = Utc::now();
    let mut samples = Vec::new();

    if let Some(details) = expert_info.get("details").and_then(Value::as_array) {
        for (ordinal, detail) in details.iter().enumerate() {
            let layer_index = detail
                .get("hook_call")
                .and_then(Value::as_u64)
                .unwrap_or(ordinal as u64) as u32;

            let mut counts: BTreeMap<u32, u64> = BTreeMap::new();
            if let Some(experts) = detail.get("experts") {
                collect_expert_ids(experts, &mut counts);
            }
            for (expert_id, count) in counts {
                samples.push(ExpertActivationSample {
                    request_id: request_id.to_string(),
                    model_id: model_id.to_string(),
                    layer_index,
                    expert_id,
                    activation_count: count as f64,
                    timestamp,
                });
            }
        }
    }

    if samples.is_empty() {
        if let Some(usage) = expert_info.get("usage").and_then(Value::as_object) {
            for (key, value) in usage {
                let Ok(expert_id) = key.parse::<u32>() else {
                    continue;
                };
                let Some(count) = value.as_f64() else {
                    continue;
                };
                samples.push(ExpertActivationSample {
                    request_id: request_id.to_string(),
                    model_id: model_id.to_string(),
                    layer_index: 0,
                    expert_id,
                    activation_count: count,
                    timestamp,
                });
            }
        }
    }

    samples
}

/// Count expert ids in an arbitrarily nested array of indices.
fn collect_expert_ids(value: &Value, counts: &mut BTreeMap<u32, u64>) {
    match value {
        Value::Number(n) => {
            if let Some(id) = n.as_u64() {
                if let Ok(id) = u32::try_from(id) {
                    *counts.entry(id).or_insert(0) += 1;
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_expert_ids(item, counts);
            }
        }
        _ => {}
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn extract(info: Value) -> Vec<ExpertActivationSample> {
        extract_samples("req-1", "deepseek-moe-16b", &info)
    }

    #[test]
    fn details_produce_per_layer_samples() {
        let samples = extract(json!({
            "total_hooks": 2,
            "details": [
                {"module": "layers.3.mlp.gate", "hook_call": 3,
                 "experts": [[1, 5], [5, 9]], "shape": [2, 2]},
                {"module": "layers.7.mlp.gate", "hook_call": 7,
                 "experts": [[2]], "shape": [1, 1]},
            ],
            "usage": {"1": 1, "2": 1, "5": 2, "9": 1}
        }));

        // Layer 3: expert 1 once, expert 5 twice, expert 9 once.
        let layer3: Vec<_> = samples.iter().filter(|s| s.layer_index == 3).collect();
        assert_eq!(layer3.len(), 3);
        let five = layer3.iter().find(|s| s.expert_id == 5).unwrap();
        assert_eq!(five.activation_count, 2.0);

        let layer7: Vec<_> = samples.iter().filter(|s| s.layer_index == 7).collect();
        assert_eq!(layer7.len(), 1);
        assert_eq!(layer7[0].expert_id, 2);
    }

    #[test]
    fn usage_only_maps_to_layer_zero() {
        let samples = extract(json!({"usage": {"0": 4, "13": 1.5}}));
        assert_eq!(samples.len(), 2);
        assert!(samples.iter().all(|s| s.layer_index == 0));
        let thirteen = samples.iter().find(|s| s.expert_id == 13).unwrap();
        assert_eq!(thirteen.activation_count, 1.5);
    }

    #[test]
    fn details_take_precedence_over_usage() {
        let samples = extract(json!({
            "details": [{"hook_call": 1, "experts": [0]}],
            "usage": {"0": 99}
        }));
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].layer_index, 1);
        assert_eq!(samples[0].activation_count, 1.0);
    }

    #[test]
    fn missing_hook_call_uses_ordinal() {
        let samples = extract(json!({
            "details": [
                {"experts": [4]},
                {"experts": [6]},
            ]
        }));
        assert_eq!(samples[0].layer_index, 0);
        assert_eq!(samples[1].layer_index, 1);
    }

    #[test]
    fn absent_fields_yield_empty() {
        assert!(extract(json!({})).is_empty());
        assert!(extract(json!(null)).is_empty());
        assert!(extract(json!({"total_hooks": 24})).is_empty());
        assert!(extract(json!({"details": []})).is_empty());
        assert!(extract(json!({"usage": {}})).is_empty());
    }

    #[test]
    fn unparseable_usage_keys_skipped() {
        let samples = extract(json!({"usage": {"not-a-number": 3, "7": 1}}));
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].expert_id, 7);
    }

    #[test]
    fn non_numeric_expert_entries_ignored() {
        let samples = extract(json!({
            "details": [{"hook_call": 0, "experts": [[1, "x", null], 2]}]
        }));
        let ids: Vec<u32> = samples.iter().map(|s| s.expert_id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn correlation_fields_carried() {
        let samples = extract(json!({"usage": {"3": 1}}));
        assert_eq!(samples[0].request_id, "req-1");
        assert_eq!(samples[0].model_id, "deepseek-moe-16b");
    }
}
