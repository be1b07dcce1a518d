//! Field Extractor — one utterance plus context in, schema-valid
//! candidate fields out.
//!
//! Infallible by contract: inference errors, timeouts, and unparsable
//! model output all degrade to an empty candidate set ("no new
//! information") so the enclosing turn is never blocked. The schema is
//! applied to every candidate before it leaves this module; nothing
//! undeclared or invalid gets through.

use regex::Regex;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ExtractionConfig;
use crate::inference::InferenceService;
use crate::models::{ConversationTurn, ExtractedField};
use crate::schema::ExtractionSchema;

const SYSTEM_PROMPT: &str = "You are a medical information extraction assistant. \
     Respond only with valid JSON.";

/// Rough token estimate for budget enforcement (4 chars per token).
fn approx_tokens(text: &str) -> usize {
    text.chars().count() / 4 + 1
}

#[derive(Debug, Clone)]
pub struct ExtractorSettings {
    /// 0 = no turn-count limit (token budget still applies).
    pub context_window_turns: usize,
    pub max_context_tokens: usize,
    pub call_timeout: Duration,
}

impl ExtractorSettings {
    pub fn from_config(extraction: &ExtractionConfig, timeout_seconds: u64) -> Self {
        Self {
            context_window_turns: extraction.context_window_turns,
            max_context_tokens: extraction.max_context_tokens,
            call_timeout: Duration::from_secs(timeout_seconds),
        }
    }
}

pub struct FieldExtractor {
    service: Arc<dyn InferenceService>,
    schema: ExtractionSchema,
    settings: ExtractorSettings,
}

impl FieldExtractor {
    pub fn new(
        service: Arc<dyn InferenceService>,
        schema: ExtractionSchema,
        settings: ExtractorSettings,
    ) -> Self {
        Self {
            service,
            schema,
            settings,
        }
    }

    pub fn schema(&self) -> &ExtractionSchema {
        &self.schema
    }

    /// Extract candidate fields from `new_turn` given recent context.
    /// Never fails; the worst case is an empty vec.
    pub async fn extract(
        &self,
        context: &[ConversationTurn],
        new_turn: &ConversationTurn,
    ) -> Vec<ExtractedField> {
        let window = self.window_context(context, new_turn);
        let prompt = self.build_prompt(&window, new_turn);

        let raw = match tokio::time::timeout(
            self.settings.call_timeout,
            self.service.generate(SYSTEM_PROMPT, &prompt),
        )
        .await
        {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                tracing::warn!(
                    backend = self.service.name(),
                    turn_index = new_turn.turn_index,
                    error = %e,
                    "Extraction call failed; treating as no new information"
                );
                return Vec::new();
            }
            Err(_) => {
                tracing::warn!(
                    backend = self.service.name(),
                    turn_index = new_turn.turn_index,
                    timeout_s = self.settings.call_timeout.as_secs(),
                    "Extraction call timed out; treating as no new information"
                );
                return Vec::new();
            }
        };

        parse_candidates(&raw, &self.schema, new_turn.turn_index)
    }

    /// Apply the turn-count window and the token budget, dropping the
    /// oldest context turns first. The new turn is always included.
    fn window_context<'a>(
        &self,
        context: &'a [ConversationTurn],
        new_turn: &ConversationTurn,
    ) -> Vec<&'a ConversationTurn> {
        let limited: Vec<&ConversationTurn> = if self.settings.context_window_turns > 0
            && context.len() > self.settings.context_window_turns
        {
            context[context.len() - self.settings.context_window_turns..]
                .iter()
                .collect()
        } else {
            context.iter().collect()
        };

        let mut budget = self
            .settings
            .max_context_tokens
            .saturating_sub(approx_tokens(&new_turn.text));

        // Walk newest-to-oldest so the most recent context survives.
        let mut kept: Vec<&ConversationTurn> = Vec::new();
        for &turn in limited.iter().rev() {
            let cost = approx_tokens(&turn.text);
            if cost > budget {
                break;
            }
            budget -= cost;
            kept.push(turn);
        }
        kept.reverse();
        kept
    }

    fn build_prompt(&self, context: &[&ConversationTurn], new_turn: &ConversationTurn) -> String {
        let mut prompt = String::from(
            "Extract medical history fields from the latest utterance below.\n\
             Known fields (only these may be returned):\n",
        );
        for spec in self.schema.fields() {
            prompt.push_str(&format!("- {}: {}\n", spec.name, spec.prompt_hint));
        }

        if !context.is_empty() {
            prompt.push_str("\nConversation so far:\n");
            for turn in context {
                prompt.push_str(&format!("{}: {}\n", turn.role.as_str(), turn.text));
            }
        }

        prompt.push_str(&format!(
            "\nLatest utterance ({}): \"{}\"\n\n\
             Return a JSON object of the form\n\
             {{\"fields\": [{{\"name\": \"<field>\", \"value\": <value>, \"confidence\": <0.0-1.0>}}]}}\n\
             List only fields the latest utterance supports. Confidence reflects how \
             explicitly the utterance states the value. Return {{\"fields\": []}} when \
             nothing applies.",
            new_turn.role.as_str(),
            new_turn.text
        ));

        prompt
    }
}

#[derive(Debug, Deserialize)]
struct RawExtraction {
    #[serde(default)]
    fields: Vec<RawField>,
}

#[derive(Debug, Deserialize)]
struct RawField {
    name: String,
    value: serde_json::Value,
    confidence: Option<f64>,
}

/// Parse model output into schema-valid candidates. Model output is
/// untrusted: undeclared names, invalid values, and missing confidences
/// are dropped with a log line, never raised.
fn parse_candidates(
    raw: &str,
    schema: &ExtractionSchema,
    source_turn_index: u64,
) -> Vec<ExtractedField> {
    let cleaned = strip_code_fence(raw);

    let parsed: RawExtraction = match serde_json::from_str(cleaned.trim()) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(error = %e, "Unparsable extraction output; dropping");
            return Vec::new();
        }
    };

    let mut candidates = Vec::new();
    for field in parsed.fields {
        let Some(confidence) = field.confidence else {
            tracing::warn!(field = %field.name, "Candidate missing confidence; dropped");
            continue;
        };
        match schema.validate(&field.name, &field.value) {
            Some(value) => {
                candidates.push(ExtractedField::new(
                    field.name,
                    value,
                    confidence,
                    source_turn_index,
                ));
            }
            None => {
                tracing::warn!(
                    field = %field.name,
                    "Candidate not in schema or failed validation; dropped"
                );
            }
        }
    }
    candidates
}

/// Models frequently wrap JSON in markdown fences; unwrap if present.
fn strip_code_fence(raw: &str) -> &str {
    let re = Regex::new(r"(?s)^\s*```(?:json)?\s*(.*?)\s*```\s*$").unwrap();
    match re.captures(raw) {
        Some(caps) => caps.get(1).map(|m| m.as_str()).unwrap_or(raw),
        None => raw.trim(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::{InferenceError, InferenceService};
    use crate::models::Role;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;

    struct CannedService {
        response: Result<String, InferenceError>,
        delay: Option<Duration>,
    }

    impl CannedService {
        fn ok(text: &str) -> Arc<Self> {
            Arc::new(Self {
                response: Ok(text.to_string()),
                delay: None,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                response: Err(InferenceError::ServiceUnavailable("down".into())),
                delay: None,
            })
        }

        fn slow(text: &str, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                response: Ok(text.to_string()),
                delay: Some(delay),
            })
        }
    }

    #[async_trait]
    impl InferenceService for CannedService {
        async fn generate(&self, _system: &str, _user: &str) -> Result<String, InferenceError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            match &self.response {
                Ok(s) => Ok(s.clone()),
                Err(_) => Err(InferenceError::ServiceUnavailable("down".into())),
            }
        }

        fn name(&self) -> &str {
            "canned"
        }
    }

    fn turn(index: u64, text: &str) -> ConversationTurn {
        ConversationTurn {
            conversation_id: "c1".to_string(),
            patient_id: "p1".to_string(),
            turn_index: index,
            role: Role::Patient,
            text: text.to_string(),
            timestamp: Utc::now(),
        }
    }

    fn settings() -> ExtractorSettings {
        ExtractorSettings {
            context_window_turns: 0,
            max_context_tokens: 4096,
            call_timeout: Duration::from_millis(200),
        }
    }

    fn extractor(service: Arc<dyn InferenceService>) -> FieldExtractor {
        FieldExtractor::new(service, ExtractionSchema::medical_intake(), settings())
    }

    #[tokio::test]
    async fn extracts_schema_valid_fields() {
        let service = CannedService::ok(
            r#"{"fields": [
                {"name": "allergies", "value": ["penicillin"], "confidence": 0.9},
                {"name": "age", "value": "34", "confidence": 0.8}
            ]}"#,
        );
        let ex = extractor(service);

        let fields = ex.extract(&[], &turn(0, "I'm 34 and allergic to penicillin")).await;
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].field_name, "allergies");
        assert_eq!(fields[0].value, json!(["penicillin"]));
        assert_eq!(fields[1].value, json!(34));
        assert_eq!(fields[1].source_turn_index, 0);
    }

    #[tokio::test]
    async fn unknown_and_invalid_fields_are_dropped() {
        let service = CannedService::ok(
            r#"{"fields": [
                {"name": "blood_type", "value": "O+", "confidence": 0.9},
                {"name": "age", "value": "not a number", "confidence": 0.9},
                {"name": "gender", "value": "female", "confidence": 0.7},
                {"name": "name", "value": "Ada", "confidence": null}
            ]}"#,
        );
        let ex = extractor(service);

        let fields = ex.extract(&[], &turn(0, "hi")).await;
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].field_name, "gender");
    }

    #[tokio::test]
    async fn code_fenced_json_is_unwrapped() {
        let service = CannedService::ok(
            "```json\n{\"fields\": [{\"name\": \"name\", \"value\": \"Ada\", \"confidence\": 0.95}]}\n```",
        );
        let ex = extractor(service);

        let fields = ex.extract(&[], &turn(2, "I'm Ada")).await;
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].value, json!("Ada"));
        assert_eq!(fields[0].source_turn_index, 2);
    }

    #[tokio::test]
    async fn service_failure_yields_empty_set() {
        let ex = extractor(CannedService::failing());
        assert!(ex.extract(&[], &turn(0, "hello")).await.is_empty());
    }

    #[tokio::test]
    async fn unparsable_output_yields_empty_set() {
        let ex = extractor(CannedService::ok("Sure! The patient is 34 years old."));
        assert!(ex.extract(&[], &turn(0, "hello")).await.is_empty());
    }

    #[tokio::test]
    async fn slow_service_times_out_to_empty_set() {
        let service = CannedService::slow(
            r#"{"fields": [{"name": "name", "value": "Ada", "confidence": 0.9}]}"#,
            Duration::from_secs(5),
        );
        let ex = extractor(service);
        assert!(ex.extract(&[], &turn(0, "hello")).await.is_empty());
    }

    #[tokio::test]
    async fn confidence_is_clamped() {
        let service = CannedService::ok(
            r#"{"fields": [{"name": "name", "value": "Ada", "confidence": 3.5}]}"#,
        );
        let ex = extractor(service);
        let fields = ex.extract(&[], &turn(0, "hi")).await;
        assert_eq!(fields[0].confidence, 1.0);
    }

    #[test]
    fn token_budget_drops_oldest_context_first() {
        let ex = extractor(CannedService::ok("{}"));
        let mut small = ex.settings.clone();
        small.max_context_tokens = 30;
        let ex = FieldExtractor::new(
            CannedService::ok("{}"),
            ExtractionSchema::medical_intake(),
            small,
        );

        let context: Vec<ConversationTurn> = (0..5)
            .map(|i| turn(i, "a sentence of reasonable length for counting"))
            .collect();
        let new = turn(5, "short");

        let kept = ex.window_context(&context, &new);
        assert!(kept.len() < context.len());
        // Newest context turns survive.
        if let Some(first) = kept.first() {
            assert!(first.turn_index > 0);
        }
        assert!(kept.windows(2).all(|w| w[0].turn_index < w[1].turn_index));
    }

    #[test]
    fn turn_window_limits_context_count() {
        let mut s = settings();
        s.context_window_turns = 2;
        let ex = FieldExtractor::new(
            CannedService::ok("{}"),
            ExtractionSchema::medical_intake(),
            s,
        );

        let context: Vec<ConversationTurn> = (0..6).map(|i| turn(i, "text")).collect();
        let kept = ex.window_context(&context, &turn(6, "new"));
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].turn_index, 4);
    }
}
