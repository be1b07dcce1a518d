pub mod config;
pub mod db;
pub mod error;
pub mod extract;
pub mod inference;
pub mod models;
pub mod pipeline;
pub mod reconcile;
pub mod schema;
pub mod store;

pub use config::AnamnesisConfig;
pub use error::AnamnesisError;
pub use extract::{ExtractorSettings, FieldExtractor};
pub use inference::{
    ChatCompletionClient, ChatCompletionConfig, InferenceError, InferenceService,
};
pub use pipeline::{Anamnesis, TurnOutcome};
pub use reconcile::{Reconciler, ReconcilerSettings};
pub use schema::{ExtractionSchema, FieldKind, FieldSpec, MergePolicy};
pub use store::{ConversationLog, FieldPredicate, MemoryStore, PgStore, RecordStore};
