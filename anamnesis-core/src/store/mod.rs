//! Storage contracts for the three logical collections: conversation
//! turns, patient records, and reconciliation events.
//!
//! Two backends implement them: `MemoryStore` (default, also the test
//! substrate) and `PgStore` (PostgreSQL via sqlx). Mutation of patient
//! records goes exclusively through `compare_and_swap`; everything else
//! is read-only or append-only.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::models::{ConversationTurn, PatientRecord, ReconciliationEvent, TurnDraft};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Append-only, ordered store of turns per conversation id.
#[async_trait]
pub trait ConversationLog: Send + Sync {
    /// Append a turn, assigning the next contiguous index (starting at
    /// 0). Conversations are created implicitly on first append. Fails
    /// with `OutOfOrder` when the draft pre-assigns an index that is
    /// not the next one.
    async fn append(&self, draft: TurnDraft) -> Result<ConversationTurn>;

    /// All turns of a conversation in ascending index order, optionally
    /// limited to indices below `before_index`. Unknown conversation
    /// ids yield an empty vec, not an error.
    async fn history(
        &self,
        conversation_id: &str,
        before_index: Option<u64>,
    ) -> Result<Vec<ConversationTurn>>;
}

/// Keyed store of canonical patient records plus the audit trail.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, patient_id: &str) -> Result<Option<PatientRecord>>;

    /// Sole mutation path. Writes `record` only if the stored version
    /// still equals `expected_version` (0 = no record yet). Returns
    /// `false` on version conflict; the caller reloads and retries.
    async fn compare_and_swap(
        &self,
        patient_id: &str,
        expected_version: u64,
        record: &PatientRecord,
    ) -> Result<bool>;

    /// Cross-patient lookup by field predicate. Best-effort linear
    /// scan; no secondary indexing.
    async fn find_by_field(&self, predicate: &FieldPredicate) -> Result<Vec<PatientRecord>>;

    async fn append_event(&self, event: &ReconciliationEvent) -> Result<()>;

    async fn events_for(&self, patient_id: &str) -> Result<Vec<ReconciliationEvent>>;
}

/// Predicate over record fields for `find_by_field`.
#[derive(Debug, Clone)]
pub struct FieldPredicate {
    pub field: String,
    pub matcher: ValueMatcher,
}

#[derive(Debug, Clone)]
pub enum ValueMatcher {
    /// Exact value match. For list fields, matches when any element
    /// equals the given value.
    Equals(Value),
    /// Case-insensitive substring match over string content. For list
    /// fields, matches when any element contains the needle.
    Contains(String),
}

impl FieldPredicate {
    pub fn equals(field: impl Into<String>, value: Value) -> Self {
        Self {
            field: field.into(),
            matcher: ValueMatcher::Equals(value),
        }
    }

    pub fn contains(field: impl Into<String>, needle: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            matcher: ValueMatcher::Contains(needle.into()),
        }
    }

    pub fn matches(&self, record: &PatientRecord) -> bool {
        let Some(state) = record.field(&self.field) else {
            return false;
        };
        match &self.matcher {
            ValueMatcher::Equals(expected) => match &state.value {
                Value::Array(items) => items.iter().any(|v| v == expected),
                other => other == expected,
            },
            ValueMatcher::Contains(needle) => {
                let needle = needle.to_lowercase();
                match &state.value {
                    Value::Array(items) => items
                        .iter()
                        .filter_map(|v| v.as_str())
                        .any(|s| s.to_lowercase().contains(&needle)),
                    Value::String(s) => s.to_lowercase().contains(&needle),
                    _ => false,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FieldState;
    use serde_json::json;

    fn record_with(field: &str, value: Value) -> PatientRecord {
        let mut record = PatientRecord::empty("p1");
        record.fields.insert(
            field.to_string(),
            FieldState {
                value,
                confidence: 0.9,
                last_updated_turn_index: 0,
            },
        );
        record
    }

    #[test]
    fn equals_matches_scalar_and_list_membership() {
        let scalar = record_with("age", json!(42));
        assert!(FieldPredicate::equals("age", json!(42)).matches(&scalar));
        assert!(!FieldPredicate::equals("age", json!(43)).matches(&scalar));

        let list = record_with("allergies", json!(["penicillin", "latex"]));
        assert!(FieldPredicate::equals("allergies", json!("latex")).matches(&list));
        assert!(!FieldPredicate::equals("allergies", json!("dust")).matches(&list));
    }

    #[test]
    fn contains_is_case_insensitive_over_lists() {
        let list = record_with("medications", json!(["Aspirin 81mg daily"]));
        assert!(FieldPredicate::contains("medications", "aspirin").matches(&list));
        assert!(!FieldPredicate::contains("medications", "statin").matches(&list));
    }

    #[test]
    fn missing_field_never_matches() {
        let record = PatientRecord::empty("p1");
        assert!(!FieldPredicate::contains("allergies", "latex").matches(&record));
    }
}
