//! HTTP surface over the intake pipeline.
//!
//! Each endpoint has a thin axum handler delegating to a directly
//! testable inner function returning `(StatusCode, serde_json::Value)`.
//!
//! Endpoints:
//! - POST /chat/turns             — submit one utterance
//! - GET  /patients/{id}/record   — canonical structured record
//! - GET  /patients/{id}/events   — reconciliation audit trail
//! - GET  /patients/search        — cross-patient field lookup
//! - GET  /conversations/{id}     — ordered turn history
//! - GET  /health, GET /version
//!
//! Error mapping: Validation 400, NotFound 404, Conflict 409,
//! OutOfOrder 409, StoreUnavailable 503, anything else 500.

use std::sync::Arc;

use anamnesis_core::error::AnamnesisError;
use anamnesis_core::models::Role;
use anamnesis_core::pipeline::Anamnesis;
use anamnesis_core::store::FieldPredicate;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use sqlx::PgPool;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Shared state for all HTTP handlers.
pub struct HttpState {
    pub service: Arc<Anamnesis>,
    pub backend: &'static str,
    pub pool: Option<PgPool>,
}

pub fn build_router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/chat/turns", post(submit_turn_handler))
        .route("/patients/:id/record", get(record_handler))
        .route("/patients/:id/events", get(events_handler))
        .route("/patients/search", get(search_handler))
        .route("/conversations/:id", get(conversation_handler))
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .with_state(state)
}

/// Start the HTTP server; shuts down when the broadcast signal fires.
pub async fn start_http_server(
    state: Arc<HttpState>,
    host: &str,
    port: u16,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let addr = format!("{}:{}", host, port);
    let app = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Anamnesis HTTP API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            tracing::info!("HTTP server shutting down...");
        })
        .await?;

    Ok(())
}

// ============================================================================
// Request DTOs
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SubmitTurnRequest {
    pub patient_id: Option<String>,
    /// Minted (uuid v4) when absent; conversations are created
    /// implicitly on first turn.
    pub conversation_id: Option<String>,
    /// "patient" (default), "clinician", or "system".
    pub role: Option<String>,
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub field: Option<String>,
    pub equals: Option<String>,
    pub contains: Option<String>,
}

// ============================================================================
// Inner (directly testable) functions
// ============================================================================

fn error_response(e: &AnamnesisError) -> (StatusCode, serde_json::Value) {
    let status = match e {
        AnamnesisError::Validation(_) => StatusCode::BAD_REQUEST,
        AnamnesisError::NotFound(_) => StatusCode::NOT_FOUND,
        AnamnesisError::Conflict { .. } | AnamnesisError::OutOfOrder { .. } => {
            StatusCode::CONFLICT
        }
        AnamnesisError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        serde_json::json!({ "status": "error", "error": e.to_string() }),
    )
}

pub async fn submit_turn_inner(
    service: &Anamnesis,
    req: SubmitTurnRequest,
) -> (StatusCode, serde_json::Value) {
    let patient_id = req.patient_id.unwrap_or_default();
    let text = req.text.unwrap_or_default();
    let conversation_id = req
        .conversation_id
        .filter(|c| !c.trim().is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let role = match req.role.as_deref() {
        None | Some("") => Role::Patient,
        Some(r) => match r.parse::<Role>() {
            Ok(role) => role,
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    serde_json::json!({ "status": "error", "error": e }),
                );
            }
        },
    };

    match service
        .submit_turn(&patient_id, &conversation_id, role, &text)
        .await
    {
        Ok(outcome) => (
            StatusCode::OK,
            serde_json::json!({
                "conversation_id": conversation_id,
                "turn_index": outcome.turn_index,
                "reconciliation_applied": outcome.reconciliation_applied,
                "record_version": outcome.record_version,
            }),
        ),
        Err(e) => error_response(&e),
    }
}

pub async fn record_inner(
    service: &Anamnesis,
    patient_id: &str,
) -> (StatusCode, serde_json::Value) {
    match service.get_patient_record(patient_id).await {
        Ok(record) => (
            StatusCode::OK,
            serde_json::to_value(&record).unwrap_or_default(),
        ),
        Err(e) => error_response(&e),
    }
}

pub async fn events_inner(
    service: &Anamnesis,
    patient_id: &str,
) -> (StatusCode, serde_json::Value) {
    match service.get_events(patient_id).await {
        Ok(events) => (
            StatusCode::OK,
            serde_json::json!({
                "patient_id": patient_id,
                "count": events.len(),
                "events": events,
            }),
        ),
        Err(e) => error_response(&e),
    }
}

pub async fn conversation_inner(
    service: &Anamnesis,
    conversation_id: &str,
) -> (StatusCode, serde_json::Value) {
    match service.get_conversation(conversation_id).await {
        Ok(turns) => (
            StatusCode::OK,
            serde_json::json!({
                "conversation_id": conversation_id,
                "count": turns.len(),
                "turns": turns,
            }),
        ),
        Err(e) => error_response(&e),
    }
}

pub async fn search_inner(
    service: &Anamnesis,
    params: SearchParams,
) -> (StatusCode, serde_json::Value) {
    let Some(field) = params.field.filter(|f| !f.trim().is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            serde_json::json!({ "status": "error", "error": "field parameter is required" }),
        );
    };

    let predicate = match (params.equals, params.contains) {
        (Some(value), _) => FieldPredicate::equals(field, serde_json::Value::String(value)),
        (None, Some(needle)) => FieldPredicate::contains(field, needle),
        (None, None) => {
            return (
                StatusCode::BAD_REQUEST,
                serde_json::json!({
                    "status": "error",
                    "error": "either equals or contains is required"
                }),
            );
        }
    };

    match service.find_patients(&predicate).await {
        Ok(records) => (
            StatusCode::OK,
            serde_json::json!({ "count": records.len(), "patients": records }),
        ),
        Err(e) => error_response(&e),
    }
}

pub async fn health_inner(state: &HttpState) -> (StatusCode, serde_json::Value) {
    if let Some(pool) = &state.pool {
        if let Err(e) = anamnesis_core::db::health_check(pool).await {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::json!({
                    "status": "unhealthy",
                    "backend": state.backend,
                    "error": e.to_string(),
                }),
            );
        }
    }
    (
        StatusCode::OK,
        serde_json::json!({
            "status": "healthy",
            "version": env!("CARGO_PKG_VERSION"),
            "backend": state.backend,
        }),
    )
}

pub fn version_inner() -> serde_json::Value {
    serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": "anamnesis/1",
    })
}

// ============================================================================
// Axum handler wrappers (thin — delegate to inner functions)
// ============================================================================

async fn submit_turn_handler(
    State(state): State<Arc<HttpState>>,
    Json(req): Json<SubmitTurnRequest>,
) -> impl IntoResponse {
    let (status, body) = submit_turn_inner(&state.service, req).await;
    (status, Json(body))
}

async fn record_handler(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let (status, body) = record_inner(&state.service, &id).await;
    (status, Json(body))
}

async fn events_handler(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let (status, body) = events_inner(&state.service, &id).await;
    (status, Json(body))
}

async fn search_handler(
    State(state): State<Arc<HttpState>>,
    Query(params): Query<SearchParams>,
) -> impl IntoResponse {
    let (status, body) = search_inner(&state.service, params).await;
    (status, Json(body))
}

async fn conversation_handler(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let (status, body) = conversation_inner(&state.service, &id).await;
    (status, Json(body))
}

async fn health_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = health_inner(&state).await;
    (status, Json(body))
}

async fn version_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(version_inner()))
}

// ============================================================================
// Unit tests — inner functions over the in-memory backend
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use anamnesis_core::extract::{ExtractorSettings, FieldExtractor};
    use anamnesis_core::inference::{InferenceError, InferenceService};
    use anamnesis_core::reconcile::{Reconciler, ReconcilerSettings};
    use anamnesis_core::schema::ExtractionSchema;
    use anamnesis_core::store::MemoryStore;
    use async_trait::async_trait;
    use std::time::Duration;

    /// Always returns the same canned extraction payload.
    struct FixedService(String);

    #[async_trait]
    impl InferenceService for FixedService {
        async fn generate(&self, _system: &str, _user: &str) -> Result<String, InferenceError> {
            Ok(self.0.clone())
        }

        fn name(&self) -> &str {
            "fixed"
        }
    }

    fn service_with(response: &str) -> Anamnesis {
        let store = Arc::new(MemoryStore::new());
        let schema = ExtractionSchema::medical_intake();
        let extractor = FieldExtractor::new(
            Arc::new(FixedService(response.to_string())),
            schema.clone(),
            ExtractorSettings {
                context_window_turns: 0,
                max_context_tokens: 4096,
                call_timeout: Duration::from_millis(500),
            },
        );
        let reconciler = Reconciler::new(store.clone(), schema, ReconcilerSettings::default());
        Anamnesis::new(store.clone(), store, extractor, reconciler)
    }

    fn allergy_payload() -> &'static str {
        r#"{"fields": [{"name": "allergies", "value": ["penicillin"], "confidence": 0.9}]}"#
    }

    #[test]
    fn version_inner_is_pure() {
        let v = version_inner();
        assert!(v["version"].is_string());
        assert_eq!(v["protocol"], "anamnesis/1");
    }

    #[tokio::test]
    async fn submit_turn_returns_outcome_and_mints_conversation_id() {
        let service = service_with(allergy_payload());

        let req = SubmitTurnRequest {
            patient_id: Some("p1".to_string()),
            conversation_id: None,
            role: None,
            text: Some("I'm allergic to penicillin".to_string()),
        };

        let (status, body) = submit_turn_inner(&service, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["turn_index"], 0);
        assert_eq!(body["reconciliation_applied"], true);
        assert_eq!(body["record_version"], 1);
        assert!(body["conversation_id"].is_string());
    }

    #[tokio::test]
    async fn submit_turn_missing_text_is_bad_request() {
        let service = service_with(allergy_payload());

        let req = SubmitTurnRequest {
            patient_id: Some("p1".to_string()),
            conversation_id: Some("c1".to_string()),
            role: None,
            text: None,
        };

        let (status, body) = submit_turn_inner(&service, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "error");
    }

    #[tokio::test]
    async fn submit_turn_unknown_role_is_bad_request() {
        let service = service_with(allergy_payload());

        let req = SubmitTurnRequest {
            patient_id: Some("p1".to_string()),
            conversation_id: Some("c1".to_string()),
            role: Some("doctor".to_string()),
            text: Some("hello".to_string()),
        };

        let (status, _) = submit_turn_inner(&service, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn record_lookup_maps_not_found_to_404() {
        let service = service_with(allergy_payload());
        let (status, body) = record_inner(&service, "nobody").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["status"], "error");
    }

    #[tokio::test]
    async fn unknown_conversation_is_200_with_empty_turns() {
        let service = service_with(allergy_payload());
        let (status, body) = conversation_inner(&service, "nope").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 0);
        assert!(body["turns"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn search_requires_field_and_matcher() {
        let service = service_with(allergy_payload());

        let (status, _) = search_inner(
            &service,
            SearchParams {
                field: None,
                equals: None,
                contains: Some("x".to_string()),
            },
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = search_inner(
            &service,
            SearchParams {
                field: Some("allergies".to_string()),
                equals: None,
                contains: None,
            },
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn search_finds_patients_by_field() {
        let service = service_with(allergy_payload());

        let req = SubmitTurnRequest {
            patient_id: Some("p1".to_string()),
            conversation_id: Some("c1".to_string()),
            role: None,
            text: Some("I'm allergic to penicillin".to_string()),
        };
        let (status, _) = submit_turn_inner(&service, req).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = search_inner(
            &service,
            SearchParams {
                field: Some("allergies".to_string()),
                equals: None,
                contains: Some("penicillin".to_string()),
            },
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert_eq!(body["patients"][0]["patient_id"], "p1");
    }

    #[tokio::test]
    async fn events_endpoint_lists_audit_trail() {
        let service = service_with(allergy_payload());

        let req = SubmitTurnRequest {
            patient_id: Some("p1".to_string()),
            conversation_id: Some("c1".to_string()),
            role: Some("patient".to_string()),
            text: Some("I'm allergic to penicillin".to_string()),
        };
        submit_turn_inner(&service, req).await;

        let (status, body) = events_inner(&service, "p1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert_eq!(body["events"][0]["resulting_version"], 1);
        assert_eq!(body["events"][0]["turn_index"], 0);
    }

    #[tokio::test]
    async fn health_is_ok_for_memory_backend() {
        let state = HttpState {
            service: Arc::new(service_with(allergy_payload())),
            backend: "memory",
            pool: None,
        };
        let (status, body) = health_inner(&state).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["backend"], "memory");
    }
}
