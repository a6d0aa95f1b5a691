use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value};

/// Class names for the OCT 2017 retina dataset, in class-index order.
pub const OCT_LABELS: [&str; 4] = ["CNV", "DME", "DRUSEN", "NORMAL"];

const PLACEHOLDER_PREFIX: &str = "LABEL_";

/// Immutable class-index to label mapping.
///
/// Serializes as a JSON object keyed by the stringified index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct LabelMap(BTreeMap<usize, String>);

impl LabelMap {
    pub fn from_labels<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(labels.into_iter().map(Into::into).enumerate().collect())
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.0.get(&index).map(String::as_str)
    }

    /// Label for `index`, or the index itself when the model declares no name for it.
    pub fn label_for(&self, index: usize) -> String {
        self.get(index)
            .map(str::to_string)
            .unwrap_or_else(|| index.to_string())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &str)> {
        self.0.iter().map(|(k, v)| (*k, v.as_str()))
    }
}

impl FromIterator<(usize, String)> for LabelMap {
    fn from_iter<T: IntoIterator<Item = (usize, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Decides when the labels declared in model metadata are replaced by a
/// known label set.
#[derive(Debug, Clone)]
pub struct LabelPolicy {
    fallback: Vec<String>,
    replace_placeholders: bool,
}

impl Default for LabelPolicy {
    fn default() -> Self {
        Self::new(OCT_LABELS.iter().map(|s| s.to_string()).collect(), true)
    }
}

impl LabelPolicy {
    /// An empty `fallback` falls back to [`OCT_LABELS`].
    pub fn new(fallback: Vec<String>, replace_placeholders: bool) -> Self {
        let fallback = if fallback.is_empty() {
            OCT_LABELS.iter().map(|s| s.to_string()).collect()
        } else {
            fallback
        };
        Self {
            fallback,
            replace_placeholders,
        }
    }

    pub fn fallback(&self) -> LabelMap {
        LabelMap::from_labels(self.fallback.iter().cloned())
    }

    /// True when `labels` look like the `LABEL_<n>` names a training library
    /// writes when no names were given, for a model with as many classes as
    /// the fallback set.
    pub fn is_placeholder(&self, labels: &LabelMap) -> bool {
        self.replace_placeholders
            && labels.len() == self.fallback.len()
            && labels.iter().all(|(_, label)| {
                label
                    .get(..PLACEHOLDER_PREFIX.len())
                    .is_some_and(|head| head.eq_ignore_ascii_case(PLACEHOLDER_PREFIX))
            })
    }
}

/// Builds the final label map from a model config's `id2label` object.
///
/// Never fails: anything that is not a complete, integer-keyed mapping
/// resolves to the policy's fallback labels.
pub fn resolve_labels(id2label: Option<&Map<String, Value>>, policy: &LabelPolicy) -> LabelMap {
    let Some(raw) = id2label.filter(|m| !m.is_empty()) else {
        return policy.fallback();
    };

    let normalized: LabelMap = raw
        .iter()
        .filter_map(|(key, value)| {
            let index = key.trim().parse::<usize>().ok()?;
            let label = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            Some((index, label))
        })
        .collect();

    // Dropped or colliding keys leave fewer entries than declared.
    if normalized.len() != raw.len() {
        return policy.fallback();
    }

    if policy.is_placeholder(&normalized) {
        tracing::info!(
            classes = normalized.len(),
            "Model declares placeholder labels, using fallback label set"
        );
        return policy.fallback();
    }

    normalized
}
