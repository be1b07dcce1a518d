//! Record Reconciler — merges extracted candidates into the canonical
//! patient record under the confidence/conflict policy, with optimistic
//! concurrency against the record store.
//!
//! The merge itself is a pure function over an in-memory record copy;
//! persistence happens through a bounded compare-and-swap retry loop.
//! Candidates are evaluated in descending confidence order, but the
//! audit log lists applied changes in schema declaration order so two
//! runs over the same input produce byte-identical events.

use chrono::Utc;
use std::cmp::Ordering;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{AnamnesisError, Result};
use crate::models::{
    AppliedChange, ExtractedField, FieldState, PatientRecord, ReconciliationEvent,
};
use crate::schema::{dedupe_preserving_order, ExtractionSchema, MergePolicy};
use crate::store::RecordStore;

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    /// Minimum confidence required to overwrite an existing value
    /// under the default policy. First writes are exempt.
    pub acceptance_threshold: f64,
    pub max_cas_retries: u32,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            acceptance_threshold: 0.5,
            max_cas_retries: 3,
        }
    }
}

pub struct Reconciler {
    store: Arc<dyn RecordStore>,
    schema: ExtractionSchema,
    settings: ReconcilerSettings,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn RecordStore>,
        schema: ExtractionSchema,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            store,
            schema,
            settings,
        }
    }

    /// Merge `extracted` into the record for `patient_id`, retrying on
    /// concurrent updates. Returns the resulting record and the audit
    /// event when at least one change was applied; the event is only
    /// appended after its record write committed.
    pub async fn reconcile(
        &self,
        patient_id: &str,
        extracted: &[ExtractedField],
        turn_index: u64,
        conversation_id: &str,
    ) -> Result<(PatientRecord, Option<ReconciliationEvent>)> {
        let attempts = self.settings.max_cas_retries + 1;

        for attempt in 0..attempts {
            let current = self
                .store
                .get(patient_id)
                .await?
                .unwrap_or_else(|| PatientRecord::empty(patient_id));
            let expected_version = current.version;

            let Some((updated, event)) = merge(
                &current,
                extracted,
                &self.schema,
                self.settings.acceptance_threshold,
                turn_index,
                conversation_id,
            ) else {
                // Nothing to apply against the latest state.
                return Ok((current, None));
            };

            if self
                .store
                .compare_and_swap(patient_id, expected_version, &updated)
                .await?
            {
                self.store.append_event(&event).await?;
                tracing::info!(
                    patient_id = %patient_id,
                    turn_index,
                    changes = event.applied_changes.len(),
                    version = updated.version,
                    "Reconciled turn into patient record"
                );
                return Ok((updated, Some(event)));
            }

            tracing::debug!(
                patient_id = %patient_id,
                attempt,
                "Record version advanced concurrently; retrying against latest"
            );
        }

        Err(AnamnesisError::Conflict {
            patient_id: patient_id.to_string(),
            attempts,
        })
    }
}

/// Pure merge. Returns the updated record (version incremented exactly
/// once) and its audit event, or `None` when no candidate was accepted.
pub fn merge(
    record: &PatientRecord,
    extracted: &[ExtractedField],
    schema: &ExtractionSchema,
    acceptance_threshold: f64,
    turn_index: u64,
    conversation_id: &str,
) -> Option<(PatientRecord, ReconciliationEvent)> {
    let mut ordered: Vec<&ExtractedField> = extracted.iter().collect();
    // Stable sort: equal confidences keep extractor order.
    ordered.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(Ordering::Equal)
    });

    let mut updated = record.clone();
    let mut changes: Vec<AppliedChange> = Vec::new();

    for candidate in ordered {
        let Some(spec) = schema.get(&candidate.field_name) else {
            // The extractor already filters; this guards other callers.
            tracing::warn!(field = %candidate.field_name, "Candidate not in schema; skipped");
            continue;
        };

        let current = updated.fields.get(&candidate.field_name);

        let decision: Option<(serde_json::Value, f64)> = match (current, spec.policy) {
            (None, _) => Some((candidate.value.clone(), candidate.confidence)),
            (Some(state), MergePolicy::Overwrite) => {
                // Replace unconditionally, but an identical value is
                // not a change.
                (state.value != candidate.value)
                    .then(|| (candidate.value.clone(), candidate.confidence))
            }
            (Some(state), MergePolicy::Accumulate) => {
                merge_lists(&state.value, &candidate.value).map(|merged| {
                    (merged, state.confidence.max(candidate.confidence))
                })
            }
            (Some(state), MergePolicy::Confidence) => {
                // Ties resolve in favor of the stored value; overwrites
                // additionally require the acceptance threshold.
                (candidate.confidence > state.confidence
                    && candidate.confidence >= acceptance_threshold)
                    .then(|| (candidate.value.clone(), candidate.confidence))
            }
        };

        if let Some((value, confidence)) = decision {
            changes.push(AppliedChange {
                field_name: candidate.field_name.clone(),
                old_value: current.map(|s| s.value.clone()),
                new_value: value.clone(),
            });
            updated.fields.insert(
                candidate.field_name.clone(),
                FieldState {
                    value,
                    confidence,
                    last_updated_turn_index: turn_index,
                },
            );
        }
    }

    if changes.is_empty() {
        return None;
    }

    // Audit order is schema declaration order, not confidence order.
    changes.sort_by_key(|c| schema.position(&c.field_name).unwrap_or(usize::MAX));

    updated.version = record.version + 1;
    let event = ReconciliationEvent {
        id: Uuid::new_v4(),
        patient_id: record.patient_id.clone(),
        conversation_id: conversation_id.to_string(),
        turn_index,
        applied_changes: changes,
        resulting_version: updated.version,
        created_at: Utc::now(),
    };

    Some((updated, event))
}

/// Union of two list values, order preserved, duplicates dropped.
/// Returns `None` when the union adds nothing over the current value.
fn merge_lists(current: &serde_json::Value, new: &serde_json::Value) -> Option<serde_json::Value> {
    let as_items = |v: &serde_json::Value| -> Vec<String> {
        match v {
            serde_json::Value::Array(items) => items
                .iter()
                .filter_map(|i| i.as_str())
                .map(|s| s.to_string())
                .collect(),
            serde_json::Value::String(s) => vec![s.clone()],
            _ => Vec::new(),
        }
    };

    let existing = as_items(current);
    let incoming = as_items(new);
    let before = existing.len();

    let merged = dedupe_preserving_order(existing.into_iter().chain(incoming).collect());
    (merged.len() > before).then(|| serde_json::Value::from(merged))
}
