use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Stored state of one field in a patient record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldState {
    pub value: serde_json::Value,
    pub confidence: f64,
    pub last_updated_turn_index: u64,
}

/// Canonical structured record, one per patient id. Mutated only by the
/// reconciler through compare-and-swap; `version` is the optimistic
/// concurrency token and increments on every applied merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatientRecord {
    pub patient_id: String,
    pub fields: BTreeMap<String, FieldState>,
    pub version: u64,
}

impl PatientRecord {
    /// Empty record at version 0, as handed to the reconciler when no
    /// record exists yet for this patient.
    pub fn empty(patient_id: impl Into<String>) -> Self {
        Self {
            patient_id: patient_id.into(),
            fields: BTreeMap::new(),
            version: 0,
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldState> {
        self.fields.get(name)
    }
}
