use serde::{Deserialize, Serialize};

/// A candidate field produced by the extractor. Ephemeral: consumed by
/// the reconciler in the same request, never persisted standalone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedField {
    pub field_name: String,
    pub value: serde_json::Value,
    pub confidence: f64,
    pub source_turn_index: u64,
}

impl ExtractedField {
    pub fn new(
        field_name: impl Into<String>,
        value: serde_json::Value,
        confidence: f64,
        source_turn_index: u64,
    ) -> Self {
        Self {
            field_name: field_name.into(),
            value,
            confidence: confidence.clamp(0.0, 1.0),
            source_turn_index,
        }
    }
}
