use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::backend::Backend;
use crate::error::{Result, ServiceError};
use crate::labels::{resolve_labels, LabelMap, LabelPolicy};
use crate::preprocess::{decode, Preprocessor};

pub const MODEL_CONFIG_FILE: &str = "config.json";

/// The only part of the model config this service reads.
#[derive(Debug, Default, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    id2label: Option<Value>,
}

impl ModelConfig {
    pub fn from_model_dir(model_dir: &Path) -> Result<Self> {
        let path = model_dir.join(MODEL_CONFIG_FILE);
        let raw = std::fs::read_to_string(&path).map_err(|e| {
            ServiceError::ModelLoad(format!("cannot read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            ServiceError::ModelLoad(format!("cannot parse {}: {}", path.display(), e))
        })
    }

    pub fn id2label(&self) -> Option<&Map<String, Value>> {
        self.id2label.as_ref().and_then(Value::as_object)
    }

    pub fn labels(&self, policy: &LabelPolicy) -> LabelMap {
        resolve_labels(self.id2label(), policy)
    }
}

/// Class probabilities for one image, indexed by class.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbabilityVector(Vec<f64>);

impl ProbabilityVector {
    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub label: String,
    pub score: f64,
}

/// Numerically stable softmax over raw logits.
pub fn softmax(logits: &[f32]) -> ProbabilityVector {
    let max = logits
        .iter()
        .copied()
        .fold(f32::NEG_INFINITY, f32::max) as f64;
    let exps: Vec<f64> = logits.iter().map(|&l| (l as f64 - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    ProbabilityVector(exps.into_iter().map(|e| e / sum).collect())
}

/// The `k` most probable classes, best first.
///
/// `k` is clamped to `1..=probs.len()`. Equal scores keep class-index order.
pub fn top_k(probs: &ProbabilityVector, k: i64, labels: &LabelMap) -> Vec<Prediction> {
    let k = k.clamp(1, probs.len().max(1) as i64) as usize;
    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_by(|&a, &b| probs.0[b].total_cmp(&probs.0[a]));
    order
        .into_iter()
        .take(k)
        .map(|index| Prediction {
            label: labels.label_for(index),
            score: probs.0[index],
        })
        .collect()
}

/// decode -> preprocess -> forward -> softmax for uploaded images.
pub struct InferencePipeline {
    preprocessor: Preprocessor,
    backend: Arc<dyn Backend>,
}

impl InferencePipeline {
    pub fn new(preprocessor: Preprocessor, backend: Arc<dyn Backend>) -> Self {
        Self {
            preprocessor,
            backend,
        }
    }

    /// Blocking; run it off the async executor.
    pub fn probabilities(&self, bytes: &[u8]) -> Result<ProbabilityVector> {
        let started = Instant::now();
        let image = decode(bytes)?;
        let input = self.preprocessor.preprocess(&image);
        let logits = self.backend.forward(&input)?;
        if logits.is_empty() {
            return Err(ServiceError::Inference("model returned no logits".into()));
        }
        tracing::debug!(
            width = image.width(),
            height = image.height(),
            classes = logits.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Forward pass complete"
        );
        Ok(softmax(&logits))
    }
}
