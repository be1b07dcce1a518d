//! PostgreSQL backend.
//!
//! Three tables, one per logical collection. Field maps and applied
//! changes are stored as JSONB; the exact on-disk layout is the
//! backend's concern, not part of the core contract.
//!
//! Per-conversation append ordering is enforced with a transaction-level
//! advisory lock keyed on the conversation id, so concurrent appends to
//! one conversation serialize while other conversations proceed freely.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::{AnamnesisError, Result};
use crate::models::{ConversationTurn, PatientRecord, ReconciliationEvent, Role, TurnDraft};
use crate::store::{ConversationLog, FieldPredicate, RecordStore};

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the tables if they do not exist yet.
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversation_turns (
                conversation_id TEXT        NOT NULL,
                turn_index      BIGINT      NOT NULL,
                patient_id      TEXT        NOT NULL,
                role            TEXT        NOT NULL,
                text            TEXT        NOT NULL,
                timestamp       TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (conversation_id, turn_index)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS patient_records (
                patient_id TEXT   PRIMARY KEY,
                fields     JSONB  NOT NULL,
                version    BIGINT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS reconciliation_events (
                id                UUID        PRIMARY KEY,
                patient_id        TEXT        NOT NULL,
                conversation_id   TEXT        NOT NULL,
                turn_index        BIGINT      NOT NULL,
                applied_changes   JSONB       NOT NULL,
                resulting_version BIGINT      NOT NULL,
                created_at        TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_reconciliation_events_patient \
             ON reconciliation_events (patient_id, created_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn turn_from_row(row: &sqlx::postgres::PgRow) -> Result<ConversationTurn> {
    let role_str: String = row.get("role");
    let role: Role = role_str
        .parse()
        .map_err(AnamnesisError::StoreUnavailable)?;
    Ok(ConversationTurn {
        conversation_id: row.get("conversation_id"),
        patient_id: row.get("patient_id"),
        turn_index: row.get::<i64, _>("turn_index") as u64,
        role,
        text: row.get("text"),
        timestamp: row.get::<DateTime<Utc>, _>("timestamp"),
    })
}

fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<PatientRecord> {
    let fields: serde_json::Value = row.get("fields");
    let fields = serde_json::from_value(fields)
        .map_err(|e| AnamnesisError::StoreUnavailable(format!("corrupt field map: {}", e)))?;
    Ok(PatientRecord {
        patient_id: row.get("patient_id"),
        fields,
        version: row.get::<i64, _>("version") as u64,
    })
}

fn event_from_row(row: &sqlx::postgres::PgRow) -> Result<ReconciliationEvent> {
    let changes: serde_json::Value = row.get("applied_changes");
    let applied_changes = serde_json::from_value(changes)
        .map_err(|e| AnamnesisError::StoreUnavailable(format!("corrupt event: {}", e)))?;
    Ok(ReconciliationEvent {
        id: row.get::<Uuid, _>("id"),
        patient_id: row.get("patient_id"),
        conversation_id: row.get("conversation_id"),
        turn_index: row.get::<i64, _>("turn_index") as u64,
        applied_changes,
        resulting_version: row.get::<i64, _>("resulting_version") as u64,
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
    })
}

#[async_trait]
impl ConversationLog for PgStore {
    async fn append(&self, draft: TurnDraft) -> Result<ConversationTurn> {
        let mut tx = self.pool.begin().await?;

        // Serialize appends per conversation for the duration of the
        // transaction; released automatically at commit/rollback.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(&draft.conversation_id)
            .execute(&mut *tx)
            .await?;

        let next_index: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(turn_index) + 1, 0) FROM conversation_turns \
             WHERE conversation_id = $1",
        )
        .bind(&draft.conversation_id)
        .fetch_one(&mut *tx)
        .await?;

        if let Some(requested) = draft.turn_index {
            if requested != next_index as u64 {
                return Err(AnamnesisError::OutOfOrder {
                    conversation_id: draft.conversation_id,
                    expected: next_index as u64,
                    got: requested,
                });
            }
        }

        sqlx::query(
            "INSERT INTO conversation_turns \
             (conversation_id, turn_index, patient_id, role, text, timestamp) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&draft.conversation_id)
        .bind(next_index)
        .bind(&draft.patient_id)
        .bind(draft.role.as_str())
        .bind(&draft.text)
        .bind(draft.timestamp)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(ConversationTurn {
            conversation_id: draft.conversation_id,
            patient_id: draft.patient_id,
            turn_index: next_index as u64,
            role: draft.role,
            text: draft.text,
            timestamp: draft.timestamp,
        })
    }

    async fn history(
        &self,
        conversation_id: &str,
        before_index: Option<u64>,
    ) -> Result<Vec<ConversationTurn>> {
        let rows = match before_index {
            Some(before) => {
                sqlx::query(
                    "SELECT conversation_id, turn_index, patient_id, role, text, timestamp \
                     FROM conversation_turns \
                     WHERE conversation_id = $1 AND turn_index < $2 \
                     ORDER BY turn_index ASC",
                )
                .bind(conversation_id)
                .bind(before as i64)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT conversation_id, turn_index, patient_id, role, text, timestamp \
                     FROM conversation_turns \
                     WHERE conversation_id = $1 \
                     ORDER BY turn_index ASC",
                )
                .bind(conversation_id)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter().map(turn_from_row).collect()
    }
}

#[async_trait]
impl RecordStore for PgStore {
    async fn get(&self, patient_id: &str) -> Result<Option<PatientRecord>> {
        let row = sqlx::query(
            "SELECT patient_id, fields, version FROM patient_records WHERE patient_id = $1",
        )
        .bind(patient_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    async fn compare_and_swap(
        &self,
        patient_id: &str,
        expected_version: u64,
        record: &PatientRecord,
    ) -> Result<bool> {
        let fields = serde_json::to_value(&record.fields)
            .map_err(|e| AnamnesisError::StoreUnavailable(e.to_string()))?;

        let affected = if expected_version == 0 {
            // First write: succeeds only if no row exists yet.
            sqlx::query(
                "INSERT INTO patient_records (patient_id, fields, version) \
                 VALUES ($1, $2, $3) ON CONFLICT (patient_id) DO NOTHING",
            )
            .bind(patient_id)
            .bind(&fields)
            .bind(record.version as i64)
            .execute(&self.pool)
            .await?
            .rows_affected()
        } else {
            sqlx::query(
                "UPDATE patient_records SET fields = $2, version = $3 \
                 WHERE patient_id = $1 AND version = $4",
            )
            .bind(patient_id)
            .bind(&fields)
            .bind(record.version as i64)
            .bind(expected_version as i64)
            .execute(&self.pool)
            .await?
            .rows_affected()
        };

        Ok(affected == 1)
    }

    async fn find_by_field(&self, predicate: &FieldPredicate) -> Result<Vec<PatientRecord>> {
        // Best-effort linear scan over all records.
        let rows = sqlx::query("SELECT patient_id, fields, version FROM patient_records")
            .fetch_all(&self.pool)
            .await?;

        let mut matches = Vec::new();
        for row in &rows {
            let record = record_from_row(row)?;
            if predicate.matches(&record) {
                matches.push(record);
            }
        }
        Ok(matches)
    }

    async fn append_event(&self, event: &ReconciliationEvent) -> Result<()> {
        let changes = serde_json::to_value(&event.applied_changes)
            .map_err(|e| AnamnesisError::StoreUnavailable(e.to_string()))?;

        sqlx::query(
            "INSERT INTO reconciliation_events \
             (id, patient_id, conversation_id, turn_index, applied_changes, \
              resulting_version, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(event.id)
        .bind(&event.patient_id)
        .bind(&event.conversation_id)
        .bind(event.turn_index as i64)
        .bind(&changes)
        .bind(event.resulting_version as i64)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn events_for(&self, patient_id: &str) -> Result<Vec<ReconciliationEvent>> {
        let rows = sqlx::query(
            "SELECT id, patient_id, conversation_id, turn_index, applied_changes, \
                    resulting_version, created_at \
             FROM reconciliation_events WHERE patient_id = $1 \
             ORDER BY created_at ASC, resulting_version ASC",
        )
        .bind(patient_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(event_from_row).collect()
    }
}
