//! In-memory backend. The default for development and the substrate
//! for the test suite; state lives only as long as the process.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::error::{AnamnesisError, Result};
use crate::models::{ConversationTurn, PatientRecord, ReconciliationEvent, TurnDraft};
use crate::store::{ConversationLog, FieldPredicate, RecordStore};

/// Shared-nothing maps behind RwLocks. The write lock on `turns` is the
/// per-conversation serialization point: index assignment and insertion
/// happen under one critical section, so appends to a conversation are
/// single-writer even when callers race.
#[derive(Default)]
pub struct MemoryStore {
    turns: RwLock<HashMap<String, Vec<ConversationTurn>>>,
    records: RwLock<HashMap<String, PatientRecord>>,
    events: RwLock<HashMap<String, Vec<ReconciliationEvent>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationLog for MemoryStore {
    async fn append(&self, draft: TurnDraft) -> Result<ConversationTurn> {
        let mut turns = self.turns.write().await;
        let log = turns.entry(draft.conversation_id.clone()).or_default();
        let next_index = log.len() as u64;

        if let Some(requested) = draft.turn_index {
            if requested != next_index {
                return Err(AnamnesisError::OutOfOrder {
                    conversation_id: draft.conversation_id,
                    expected: next_index,
                    got: requested,
                });
            }
        }

        let turn = ConversationTurn {
            conversation_id: draft.conversation_id,
            patient_id: draft.patient_id,
            turn_index: next_index,
            role: draft.role,
            text: draft.text,
            timestamp: draft.timestamp,
        };
        log.push(turn.clone());
        Ok(turn)
    }

    async fn history(
        &self,
        conversation_id: &str,
        before_index: Option<u64>,
    ) -> Result<Vec<ConversationTurn>> {
        let turns = self.turns.read().await;
        let log = match turns.get(conversation_id) {
            Some(log) => log,
            None => return Ok(Vec::new()),
        };
        Ok(log
            .iter()
            .filter(|t| before_index.map_or(true, |b| t.turn_index < b))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get(&self, patient_id: &str) -> Result<Option<PatientRecord>> {
        Ok(self.records.read().await.get(patient_id).cloned())
    }

    async fn compare_and_swap(
        &self,
        patient_id: &str,
        expected_version: u64,
        record: &PatientRecord,
    ) -> Result<bool> {
        let mut records = self.records.write().await;
        let current_version = records.get(patient_id).map(|r| r.version).unwrap_or(0);
        if current_version != expected_version {
            return Ok(false);
        }
        records.insert(patient_id.to_string(), record.clone());
        Ok(true)
    }

    async fn find_by_field(&self, predicate: &FieldPredicate) -> Result<Vec<PatientRecord>> {
        let records = self.records.read().await;
        Ok(records
            .values()
            .filter(|r| predicate.matches(r))
            .cloned()
            .collect())
    }

    async fn append_event(&self, event: &ReconciliationEvent) -> Result<()> {
        self.events
            .write()
            .await
            .entry(event.patient_id.clone())
            .or_default()
            .push(event.clone());
        Ok(())
    }

    async fn events_for(&self, patient_id: &str) -> Result<Vec<ReconciliationEvent>> {
        Ok(self
            .events
            .read()
            .await
            .get(patient_id)
            .cloned()
            .unwrap_or_default())
    }
}
