use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One accepted change inside a reconciliation event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedChange {
    pub field_name: String,
    pub old_value: Option<serde_json::Value>,
    pub new_value: serde_json::Value,
}

/// Append-only audit entry: which turn changed which fields, and the
/// record version the merge produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationEvent {
    pub id: Uuid,
    pub patient_id: String,
    pub conversation_id: String,
    pub turn_index: u64,
    pub applied_changes: Vec<AppliedChange>,
    pub resulting_version: u64,
    pub created_at: DateTime<Utc>,
}
