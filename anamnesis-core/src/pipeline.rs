//! Intake pipeline — the API the transport layer consumes.
//!
//! One `submit_turn` call runs the whole chain: validate, append to the
//! conversation log, extract, reconcile. The append is durable before
//! extraction starts, so an extraction failure (or a cancelled request)
//! never loses the turn; it only skips reconciliation for it.

use std::sync::Arc;

use crate::error::{AnamnesisError, Result};
use crate::extract::FieldExtractor;
use crate::models::{ConversationTurn, PatientRecord, ReconciliationEvent, Role, TurnDraft};
use crate::reconcile::Reconciler;
use crate::store::{ConversationLog, FieldPredicate, RecordStore};

/// Upper bound on a single utterance; anything longer is rejected
/// before it reaches the log.
const MAX_TURN_CHARS: usize = 8192;

/// Result of submitting one turn.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TurnOutcome {
    pub turn_index: u64,
    pub reconciliation_applied: bool,
    pub record_version: u64,
}

pub struct Anamnesis {
    log: Arc<dyn ConversationLog>,
    records: Arc<dyn RecordStore>,
    extractor: FieldExtractor,
    reconciler: Reconciler,
}

impl Anamnesis {
    pub fn new(
        log: Arc<dyn ConversationLog>,
        records: Arc<dyn RecordStore>,
        extractor: FieldExtractor,
        reconciler: Reconciler,
    ) -> Self {
        Self {
            log,
            records,
            extractor,
            reconciler,
        }
    }

    /// Process one utterance end to end.
    ///
    /// Extraction failures are absorbed (the turn stays logged and
    /// `reconciliation_applied` is false); store failures and CAS
    /// exhaustion surface verbatim.
    pub async fn submit_turn(
        &self,
        patient_id: &str,
        conversation_id: &str,
        role: Role,
        text: &str,
    ) -> Result<TurnOutcome> {
        validate_turn_input(patient_id, conversation_id, text)?;

        let draft = TurnDraft::new(conversation_id, patient_id, role, text);
        let turn = self.log.append(draft).await?;
        let context = self
            .log
            .history(conversation_id, Some(turn.turn_index))
            .await?;

        let extracted = self.extractor.extract(&context, &turn).await;

        if extracted.is_empty() {
            let version = self
                .records
                .get(patient_id)
                .await?
                .map(|r| r.version)
                .unwrap_or(0);
            return Ok(TurnOutcome {
                turn_index: turn.turn_index,
                reconciliation_applied: false,
                record_version: version,
            });
        }

        let (record, event) = self
            .reconciler
            .reconcile(patient_id, &extracted, turn.turn_index, conversation_id)
            .await?;

        Ok(TurnOutcome {
            turn_index: turn.turn_index,
            reconciliation_applied: event.is_some(),
            record_version: record.version,
        })
    }

    pub async fn get_patient_record(&self, patient_id: &str) -> Result<PatientRecord> {
        self.records
            .get(patient_id)
            .await?
            .ok_or_else(|| AnamnesisError::NotFound(patient_id.to_string()))
    }

    pub async fn get_conversation(&self, conversation_id: &str) -> Result<Vec<ConversationTurn>> {
        self.log.history(conversation_id, None).await
    }

    pub async fn get_events(&self, patient_id: &str) -> Result<Vec<ReconciliationEvent>> {
        self.records.events_for(patient_id).await
    }

    pub async fn find_patients(&self, predicate: &FieldPredicate) -> Result<Vec<PatientRecord>> {
        self.records.find_by_field(predicate).await
    }
}

fn validate_turn_input(patient_id: &str, conversation_id: &str, text: &str) -> Result<()> {
    if patient_id.trim().is_empty() {
        return Err(AnamnesisError::Validation("patient_id is required".into()));
    }
    if conversation_id.trim().is_empty() {
        return Err(AnamnesisError::Validation(
            "conversation_id is required".into(),
        ));
    }
    if text.trim().is_empty() {
        return Err(AnamnesisError::Validation("text must not be empty".into()));
    }
    if text.chars().count() > MAX_TURN_CHARS {
        return Err(AnamnesisError::Validation(format!(
            "text exceeds {} characters",
            MAX_TURN_CHARS
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::ExtractorSettings;
    use crate::inference::{InferenceError, InferenceService};
    use crate::reconcile::ReconcilerSettings;
    use crate::schema::ExtractionSchema;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    /// Inference stub that replays scripted responses in order.
    struct ScriptedService {
        responses:
            std::sync::Mutex<std::collections::VecDeque<std::result::Result<String, ()>>>,
    }

    impl ScriptedService {
        fn new(responses: Vec<std::result::Result<String, ()>>) -> Arc<Self> {
            Arc::new(Self {
                responses: std::sync::Mutex::new(responses.into_iter().collect()),
            })
        }
    }

    #[async_trait]
    impl InferenceService for ScriptedService {
        async fn generate(
            &self,
            _system: &str,
            _user: &str,
        ) -> std::result::Result<String, InferenceError> {
            let next = self.responses.lock().unwrap().pop_front();
            match next {
                Some(Ok(s)) => Ok(s),
                _ => Err(InferenceError::ServiceUnavailable("script exhausted".into())),
            }
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn fields_json(entries: &[(&str, serde_json::Value, f64)]) -> String {
        let fields: Vec<serde_json::Value> = entries
            .iter()
            .map(|(name, value, conf)| {
                json!({"name": name, "value": value, "confidence": conf})
            })
            .collect();
        json!({ "fields": fields }).to_string()
    }

    fn pipeline(service: Arc<dyn InferenceService>) -> (Anamnesis, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let schema = ExtractionSchema::medical_intake();
        let extractor = FieldExtractor::new(
            service,
            schema.clone(),
            ExtractorSettings {
                context_window_turns: 0,
                max_context_tokens: 4096,
                call_timeout: Duration::from_millis(500),
            },
        );
        let reconciler = Reconciler::new(store.clone(), schema, ReconcilerSettings::default());
        (
            Anamnesis::new(store.clone(), store.clone(), extractor, reconciler),
            store,
        )
    }

    #[tokio::test]
    async fn full_turn_applies_extraction() {
        let service = ScriptedService::new(vec![Ok(fields_json(&[(
            "allergies",
            json!(["penicillin"]),
            0.9,
        )]))]);
        let (pipeline, _store) = pipeline(service);

        let outcome = pipeline
            .submit_turn("p1", "c1", Role::Patient, "I'm allergic to penicillin")
            .await
            .unwrap();

        assert_eq!(outcome.turn_index, 0);
        assert!(outcome.reconciliation_applied);
        assert_eq!(outcome.record_version, 1);

        let record = pipeline.get_patient_record("p1").await.unwrap();
        assert_eq!(record.field("allergies").unwrap().value, json!(["penicillin"]));

        let events = pipeline.get_events("p1").await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].turn_index, 0);
    }

    #[tokio::test]
    async fn extraction_failure_still_logs_turn() {
        let service = ScriptedService::new(vec![Err(())]);
        let (pipeline, _store) = pipeline(service);

        let outcome = pipeline
            .submit_turn("p1", "c1", Role::Patient, "hello")
            .await
            .unwrap();

        assert!(!outcome.reconciliation_applied);
        assert_eq!(outcome.record_version, 0);

        // The turn made it into the conversation log.
        let turns = pipeline.get_conversation("c1").await.unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].text, "hello");

        // But the record store was never touched.
        assert!(matches!(
            pipeline.get_patient_record("p1").await,
            Err(AnamnesisError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn validation_rejects_before_logging() {
        let service = ScriptedService::new(vec![]);
        let (pipeline, _store) = pipeline(service);

        let err = pipeline
            .submit_turn("p1", "c1", Role::Patient, "   ")
            .await
            .unwrap_err();
        assert!(matches!(err, AnamnesisError::Validation(_)));

        // Nothing was logged.
        assert!(pipeline.get_conversation("c1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn turn_indices_accumulate_across_submissions() {
        let service = ScriptedService::new(vec![
            Ok(fields_json(&[("name", json!("Ada"), 0.9)])),
            Ok(fields_json(&[("age", json!(34), 0.8)])),
            Ok(json!({"fields": []}).to_string()),
        ]);
        let (pipeline, _store) = pipeline(service);

        let o1 = pipeline
            .submit_turn("p1", "c1", Role::Patient, "I'm Ada")
            .await
            .unwrap();
        let o2 = pipeline
            .submit_turn("p1", "c1", Role::Patient, "I'm 34")
            .await
            .unwrap();
        let o3 = pipeline
            .submit_turn("p1", "c1", Role::Clinician, "noted, thanks")
            .await
            .unwrap();

        assert_eq!((o1.turn_index, o2.turn_index, o3.turn_index), (0, 1, 2));
        assert_eq!(o2.record_version, 2);
        // No extraction on the third turn: version unchanged.
        assert!(!o3.reconciliation_applied);
        assert_eq!(o3.record_version, 2);

        let record = pipeline.get_patient_record("p1").await.unwrap();
        assert_eq!(record.version, 2);
        assert_eq!(record.field("name").unwrap().value, json!("Ada"));
        assert_eq!(record.field("age").unwrap().value, json!(34));
    }

    #[tokio::test]
    async fn find_patients_scans_by_field() {
        let service = ScriptedService::new(vec![
            Ok(fields_json(&[("allergies", json!(["latex"]), 0.9)])),
            Ok(fields_json(&[("allergies", json!(["pollen"]), 0.9)])),
        ]);
        let (pipeline, _store) = pipeline(service);

        pipeline
            .submit_turn("p1", "c1", Role::Patient, "allergic to latex")
            .await
            .unwrap();
        pipeline
            .submit_turn("p2", "c2", Role::Patient, "allergic to pollen")
            .await
            .unwrap();

        let hits = pipeline
            .find_patients(&FieldPredicate::equals("allergies", json!("latex")))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].patient_id, "p1");
    }

    #[tokio::test]
    async fn concurrent_turns_for_different_patients_are_independent() {
        let service = ScriptedService::new(vec![
            Ok(fields_json(&[("name", json!("Ada"), 0.9)])),
            Ok(fields_json(&[("name", json!("Grace"), 0.9)])),
        ]);
        let (pipeline, _store) = pipeline(service);
        let pipeline = Arc::new(pipeline);

        let a = {
            let p = pipeline.clone();
            tokio::spawn(async move { p.submit_turn("p1", "c1", Role::Patient, "I'm Ada").await })
        };
        let b = {
            let p = pipeline.clone();
            tokio::spawn(
                async move { p.submit_turn("p2", "c2", Role::Patient, "I'm Grace").await },
            )
        };

        let (ra, rb) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());
        assert_eq!(ra.record_version, 1);
        assert_eq!(rb.record_version, 1);

        // Each record got exactly one name (scripted responses raced,
        // but both patients converged at version 1).
        assert!(pipeline.get_patient_record("p1").await.is_ok());
        assert!(pipeline.get_patient_record("p2").await.is_ok());
    }
}
