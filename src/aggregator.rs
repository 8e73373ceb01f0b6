//! # Aggregator — Sample-Weighted Federated Averaging
//!
//! Takes the frozen submission set of a round, decodes every delta blob,
//! and folds them into a new global model:
//!
//! ```text
//! Δ̄_l  = Σ_i (n_i · Δ_{i,l}) / Σ_i n_i        (n_i = submission samples)
//! W'_l = W_l + Δ̄_l
//! ```
//!
//! Numerical policy: accumulate in f64, emit f32. Submissions are folded in
//! device-id order so replicas aggregating the same round produce the same
//! bytes (and therefore the same content address).
//!
//! Blob decoding is CPU-bound and runs on the rayon pool; the async wrapper
//! offloads the whole pass through `spawn_blocking`.

use crate::model_store::ModelStore;
use crate::weights::{Layer, LayerTable};
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// One accepted round submission, as handed over by the coordinator.
#[derive(Clone, Debug)]
pub struct SubmissionInput {
    pub device_id: Uuid,
    pub blob: Vec<u8>,
    pub num_samples: u64,
    /// Training metrics reported by the worker (`loss`, `accuracy`, ...).
    pub metrics: HashMap<String, f64>,
}

/// Result of aggregating one round.
#[derive(Clone, Debug)]
pub struct AggregateOutcome {
    /// Content id of the new global model in the store.
    pub model_id: String,
    /// Devices whose deltas were folded in, in fold order.
    pub contributors: Vec<Uuid>,
    /// Devices rejected during decode/validation, with reasons.
    pub rejected: Vec<(Uuid, String)>,
    /// Sample-weighted mean of reported `loss`, if any worker reported it.
    pub avg_loss: Option<f64>,
    /// Sample-weighted mean of reported `accuracy`, if any.
    pub avg_accuracy: Option<f64>,
    /// L2 norm of the concatenated mean delta.
    pub delta_norm: f64,
    pub total_samples: u64,
}

#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("global model {0} not found in store")]
    ModelNotFound(String),
    #[error("global model blob is corrupt: {0}")]
    CorruptModel(String),
    #[error("no usable submissions ({rejected} rejected)")]
    NoUsableSubmissions { rejected: usize },
    #[error("total sample count is zero across {0} submissions")]
    ZeroSamples(usize),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Decoded and validated submission ready for folding.
struct Decoded {
    device_id: Uuid,
    delta: LayerTable,
    num_samples: u64,
    metrics: HashMap<String, f64>,
}

/// Pure aggregation over an in-memory global model. Exposed for tests; the
/// coordinator goes through [`aggregate_round`].
pub fn aggregate(
    global: &LayerTable,
    submissions: Vec<SubmissionInput>,
) -> Result<(LayerTable, AggregateStats), AggregateError> {
    let total = submissions.len();

    // Decode in parallel; collect per-device verdicts.
    let mut decoded: Vec<Decoded> = Vec::with_capacity(total);
    let mut rejected: Vec<(Uuid, String)> = Vec::new();
    let results: Vec<(SubmissionInput, Result<LayerTable, String>)> = submissions
        .into_par_iter()
        .map(|s| {
            let parsed = LayerTable::decode(&s.blob).map_err(|e| e.to_string());
            (s, parsed)
        })
        .collect();
    for (sub, parsed) in results {
        match parsed {
            Ok(delta) if delta.same_shape(global) => decoded.push(Decoded {
                device_id: sub.device_id,
                delta,
                num_samples: sub.num_samples,
                metrics: sub.metrics,
            }),
            Ok(_) => {
                tracing::warn!(device_id = %sub.device_id, "delta layer set mismatch, rejecting");
                rejected.push((sub.device_id, "layer set mismatch".to_string()));
            }
            Err(reason) => {
                tracing::warn!(device_id = %sub.device_id, reason = %reason, "delta decode failed");
                rejected.push((sub.device_id, reason));
            }
        }
    }

    if decoded.is_empty() {
        return Err(AggregateError::NoUsableSubmissions {
            rejected: rejected.len(),
        });
    }

    // Deterministic fold order across replicas.
    decoded.sort_by_key(|d| d.device_id);

    let total_samples: u64 = decoded.iter().map(|d| d.num_samples).sum();
    if total_samples == 0 {
        return Err(AggregateError::ZeroSamples(decoded.len()));
    }

    // Weighted mean per layer, f64 accumulators.
    let mut mean: Vec<Vec<f64>> = global
        .layers
        .iter()
        .map(|l| vec![0.0f64; l.values.len()])
        .collect();
    for d in &decoded {
        let w = d.num_samples as f64;
        for (acc, layer) in mean.iter_mut().zip(&d.delta.layers) {
            for (a, v) in acc.iter_mut().zip(&layer.values) {
                *a += w * (*v as f64);
            }
        }
    }
    let divisor = total_samples as f64;
    let mut delta_sq = 0.0f64;
    for acc in &mut mean {
        for a in acc.iter_mut() {
            *a /= divisor;
            delta_sq += *a * *a;
        }
    }

    // Apply to the global model.
    let layers = global
        .layers
        .iter()
        .zip(&mean)
        .map(|(l, m)| Layer {
            name: l.name.clone(),
            values: l
                .values
                .iter()
                .zip(m)
                .map(|(w, d)| (*w as f64 + d) as f32)
                .collect(),
        })
        .collect();

    let weighted_metric = |key: &str| -> Option<f64> {
        let mut sum = 0.0f64;
        let mut weight = 0.0f64;
        for d in &decoded {
            if let Some(v) = d.metrics.get(key) {
                sum += v * d.num_samples as f64;
                weight += d.num_samples as f64;
            }
        }
        (weight > 0.0).then(|| sum / weight)
    };

    let stats = AggregateStats {
        contributors: decoded.iter().map(|d| d.device_id).collect(),
        rejected,
        avg_loss: weighted_metric("loss"),
        avg_accuracy: weighted_metric("accuracy"),
        delta_norm: delta_sq.sqrt(),
        total_samples,
    };
    Ok((LayerTable::new(layers), stats))
}

/// Everything about an aggregation pass except the model itself.
#[derive(Clone, Debug)]
pub struct AggregateStats {
    pub contributors: Vec<Uuid>,
    pub rejected: Vec<(Uuid, String)>,
    pub avg_loss: Option<f64>,
    pub avg_accuracy: Option<f64>,
    pub delta_norm: f64,
    pub total_samples: u64,
}

/// Load the round's global model, aggregate the submissions, and store the
/// result. Runs on a blocking thread; the round state machine awaits it.
pub async fn aggregate_round(
    store: Arc<ModelStore>,
    global_model_id: String,
    submissions: Vec<SubmissionInput>,
) -> Result<AggregateOutcome, AggregateError> {
    tokio::task::spawn_blocking(move || {
        let bytes = store
            .get(&global_model_id)
            .map_err(|e| AggregateError::Storage(e.to_string()))?
            .ok_or_else(|| AggregateError::ModelNotFound(global_model_id.clone()))?;
        let global =
            LayerTable::decode(&bytes).map_err(|e| AggregateError::CorruptModel(e.to_string()))?;
        let (next, stats) = aggregate(&global, submissions)?;
        let model_id = store
            .put(&next.encode_f32())
            .map_err(|e| AggregateError::Storage(e.to_string()))?;
        Ok(AggregateOutcome {
            model_id,
            contributors: stats.contributors,
            rejected: stats.rejected,
            avg_loss: stats.avg_loss,
            avg_accuracy: stats.avg_accuracy,
            delta_norm: stats.delta_norm,
            total_samples: stats.total_samples,
        })
    })
    .await
    .unwrap_or_else(|e| Err(AggregateError::Storage(format!("aggregation task: {}", e))))
}
