use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{Executor, FromRow, Postgres};
use uuid::Uuid;

use crate::generation::models::{
    GenerationParameters, GenerationPatch, GenerationRecord, GenerationStatus, GenerationType,
    InputImage, OutputImage,
};

#[derive(Debug, FromRow)]
pub struct GenerationRow {
    id: Uuid,
    subscriber_id: Uuid,
    generation_type: String,
    status: String,
    prompt: String,
    parameters: Json<GenerationParameters>,
    input_references: Json<Vec<InputImage>>,
    output_images: Json<Vec<OutputImage>>,
    cost: i64,
    quota_period: Option<DateTime<Utc>>,
    processing_time_ms: Option<i64>,
    error_message: Option<String>,
    backend_metadata: Option<Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<GenerationRow> for GenerationRecord {
    type Error = sqlx::Error;

    fn try_from(row: GenerationRow) -> Result<Self, Self::Error> {
        let generation_type = GenerationType::parse(&row.generation_type).ok_or_else(|| {
            sqlx::Error::Decode(format!("unknown generation type `{}`", row.generation_type).into())
        })?;
        let status = GenerationStatus::parse(&row.status).ok_or_else(|| {
            sqlx::Error::Decode(format!("unknown generation status `{}`", row.status).into())
        })?;
        Ok(GenerationRecord {
            id: row.id,
            subscriber_id: row.subscriber_id,
            generation_type,
            status,
            prompt: row.prompt,
            parameters: row.parameters.0,
            input_references: row.input_references.0,
            output_images: row.output_images.0,
            cost: row.cost,
            quota_period: row.quota_period,
            processing_time_ms: row.processing_time_ms,
            error_message: row.error_message,
            backend_metadata: row.backend_metadata,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

// key: generation-db -> lifecycle rows
pub async fn insert_record<'c, E>(executor: E, record: &GenerationRecord) -> Result<Uuid, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_scalar(
        r#"
        INSERT INTO generation_records (
            id,
            subscriber_id,
            generation_type,
            status,
            prompt,
            parameters,
            input_references,
            output_images,
            cost,
            quota_period,
            processing_time_ms,
            error_message,
            backend_metadata,
            created_at,
            updated_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        RETURNING id
        "#,
    )
    .bind(record.id)
    .bind(record.subscriber_id)
    .bind(record.generation_type.as_str())
    .bind(record.status.as_str())
    .bind(&record.prompt)
    .bind(Json(&record.parameters))
    .bind(Json(&record.input_references))
    .bind(Json(&record.output_images))
    .bind(record.cost)
    .bind(record.quota_period)
    .bind(record.processing_time_ms)
    .bind(&record.error_message)
    .bind(&record.backend_metadata)
    .bind(record.created_at)
    .bind(record.updated_at)
    .fetch_one(executor)
    .await
}

/// Applies `patch` only while the row still carries `patch.expected_status`.
pub async fn apply_patch<'c, E>(
    executor: E,
    id: Uuid,
    patch: &GenerationPatch,
) -> Result<bool, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(
        r#"
        UPDATE generation_records
        SET
            status = $3,
            output_images = COALESCE($4, output_images),
            processing_time_ms = COALESCE($5, processing_time_ms),
            error_message = COALESCE($6, error_message),
            backend_metadata = COALESCE($7, backend_metadata),
            updated_at = $8,
            quota_period = COALESCE($9, quota_period)
        WHERE id = $1
          AND status = $2
        RETURNING id
        "#,
    )
    .bind(id)
    .bind(patch.expected_status.as_str())
    .bind(patch.status.as_str())
    .bind(patch.output_images.as_ref().map(Json))
    .bind(patch.processing_time_ms)
    .bind(&patch.error_message)
    .bind(&patch.backend_metadata)
    .bind(patch.updated_at)
    .bind(patch.quota_period)
    .fetch_optional(executor)
    .await?;

    Ok(row.is_some())
}

pub async fn fetch_status<'c, E>(executor: E, id: Uuid) -> Result<Option<String>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_scalar("SELECT status FROM generation_records WHERE id = $1")
        .bind(id)
        .fetch_optional(executor)
        .await
}

pub async fn fetch_record<'c, E>(executor: E, id: Uuid) -> Result<Option<GenerationRow>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, GenerationRow>("SELECT * FROM generation_records WHERE id = $1")
        .bind(id)
        .fetch_optional(executor)
        .await
}

pub async fn list_for_subscriber<'c, E>(
    executor: E,
    subscriber_id: Uuid,
    limit: i64,
    offset: i64,
) -> Result<Vec<GenerationRow>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, GenerationRow>(
        r#"
        SELECT * FROM generation_records
        WHERE subscriber_id = $1
        ORDER BY created_at DESC
        LIMIT $2 OFFSET $3
        "#,
    )
    .bind(subscriber_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(executor)
    .await
}

pub async fn prune_terminal_before<'c, E>(
    executor: E,
    cutoff: DateTime<Utc>,
) -> Result<u64, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let result = sqlx::query(
        r#"
        DELETE FROM generation_records
        WHERE updated_at < $1
          AND status IN ('completed', 'failed', 'canceled')
        "#,
    )
    .bind(cutoff)
    .execute(executor)
    .await?;
    Ok(result.rows_affected())
}
