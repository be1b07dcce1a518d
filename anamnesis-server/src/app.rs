//! Service assembly: config in, wired `Anamnesis` pipeline out.

use std::sync::Arc;
use std::time::Duration;

use anamnesis_core::config::AnamnesisConfig;
use anamnesis_core::extract::{ExtractorSettings, FieldExtractor};
use anamnesis_core::inference::{ChatCompletionClient, ChatCompletionConfig, InferenceService};
use anamnesis_core::pipeline::Anamnesis;
use anamnesis_core::reconcile::{Reconciler, ReconcilerSettings};
use anamnesis_core::schema::ExtractionSchema;
use anamnesis_core::store::{ConversationLog, MemoryStore, PgStore, RecordStore};
use sqlx::PgPool;

pub struct App {
    pub service: Arc<Anamnesis>,
    pub backend: &'static str,
    /// Present only for the postgres backend; used by the health check.
    pub pool: Option<PgPool>,
}

/// Build the pipeline from config: storage backend, inference client,
/// extractor, reconciler.
pub async fn build(config: &AnamnesisConfig) -> anyhow::Result<App> {
    let (log, records, backend, pool): (
        Arc<dyn ConversationLog>,
        Arc<dyn RecordStore>,
        &'static str,
        Option<PgPool>,
    ) = match config.database.backend.as_str() {
        "memory" => {
            let store = Arc::new(MemoryStore::new());
            (store.clone(), store, "memory", None)
        }
        "postgres" => {
            let pool = anamnesis_core::db::create_pool(&config.database).await?;
            let store = Arc::new(PgStore::new(pool.clone()));
            store.init_schema().await?;
            (store.clone(), store, "postgres", Some(pool))
        }
        other => anyhow::bail!("unknown database backend: {}", other),
    };

    let inference = build_inference_client(config)?;
    let service = build_service(config, log, records, inference);

    Ok(App {
        service: Arc::new(service),
        backend,
        pool,
    })
}

pub fn build_inference_client(
    config: &AnamnesisConfig,
) -> anyhow::Result<Arc<dyn InferenceService>> {
    let inf = &config.inference;
    let mut client_config = ChatCompletionConfig::new(
        Some(inf.api_key.clone()).filter(|k| !k.is_empty()),
        inf.model.clone(),
    );
    client_config.timeout = Duration::from_secs(inf.timeout_seconds);
    client_config.max_retries = inf.max_retries;
    client_config.retry_delay_ms = inf.retry_delay_ms;
    client_config.max_tokens = inf.max_tokens;
    client_config.temperature = inf.temperature;

    let client = ChatCompletionClient::with_base_url(client_config, inf.base_url.clone())?;
    Ok(Arc::new(client))
}

/// Wire a pipeline over explicit stores and inference backend. Split
/// out from `build` so tests can inject stubs.
pub fn build_service(
    config: &AnamnesisConfig,
    log: Arc<dyn ConversationLog>,
    records: Arc<dyn RecordStore>,
    inference: Arc<dyn InferenceService>,
) -> Anamnesis {
    let schema = ExtractionSchema::medical_intake();

    let extractor = FieldExtractor::new(
        inference,
        schema.clone(),
        ExtractorSettings::from_config(&config.extraction, config.inference.timeout_seconds),
    );

    let reconciler = Reconciler::new(
        records.clone(),
        schema,
        ReconcilerSettings {
            acceptance_threshold: config.extraction.acceptance_threshold,
            max_cas_retries: config.reconciliation.max_cas_retries,
        },
    );

    Anamnesis::new(log, records, extractor, reconciler)
}
