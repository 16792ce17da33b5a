use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use crate::db::generation_records as db;

use super::models::{GenerationPatch, GenerationRecord, GenerationStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("generation record {0} not found")]
    NotFound(Uuid),
    #[error("generation record {id} is {actual}, expected {expected}")]
    StaleStatus {
        id: Uuid,
        expected: GenerationStatus,
        actual: String,
    },
}

/// key: generation-store -> lifecycle persistence
#[async_trait]
pub trait GenerationStore: Send + Sync {
    async fn create(&self, record: &GenerationRecord) -> Result<Uuid, StoreError>;
    async fn update(&self, id: Uuid, patch: &GenerationPatch) -> Result<(), StoreError>;
    async fn get(&self, id: Uuid) -> Result<Option<GenerationRecord>, StoreError>;
    async fn list_for_subscriber(
        &self,
        subscriber_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<GenerationRecord>, StoreError>;
    async fn prune_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[derive(Clone)]
pub struct PgGenerationStore {
    pool: PgPool,
}

impl PgGenerationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl GenerationStore for PgGenerationStore {
    async fn create(&self, record: &GenerationRecord) -> Result<Uuid, StoreError> {
        Ok(db::insert_record(&self.pool, record).await?)
    }

    async fn update(&self, id: Uuid, patch: &GenerationPatch) -> Result<(), StoreError> {
        if db::apply_patch(&self.pool, id, patch).await? {
            return Ok(());
        }
        match db::fetch_status(&self.pool, id).await? {
            Some(actual) => Err(StoreError::StaleStatus {
                id,
                expected: patch.expected_status,
                actual,
            }),
            None => Err(StoreError::NotFound(id)),
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<GenerationRecord>, StoreError> {
        match db::fetch_record(&self.pool, id).await? {
            Some(row) => Ok(Some(GenerationRecord::try_from(row)?)),
            None => Ok(None),
        }
    }

    async fn list_for_subscriber(
        &self,
        subscriber_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<GenerationRecord>, StoreError> {
        let rows = db::list_for_subscriber(&self.pool, subscriber_id, limit, offset).await?;
        rows.into_iter()
            .map(|row| GenerationRecord::try_from(row).map_err(StoreError::from))
            .collect()
    }

    async fn prune_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        Ok(db::prune_terminal_before(&self.pool, cutoff).await?)
    }
}

/// key: generation-store-memory -> process-local records
#[derive(Clone, Default)]
pub struct InMemoryGenerationStore {
    records: Arc<DashMap<Uuid, GenerationRecord>>,
}

impl InMemoryGenerationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn all(&self) -> Vec<GenerationRecord> {
        self.records.iter().map(|entry| entry.value().clone()).collect()
    }
}

#[async_trait]
impl GenerationStore for InMemoryGenerationStore {
    async fn create(&self, record: &GenerationRecord) -> Result<Uuid, StoreError> {
        self.records.insert(record.id, record.clone());
        Ok(record.id)
    }

    async fn update(&self, id: Uuid, patch: &GenerationPatch) -> Result<(), StoreError> {
        let mut entry = self.records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if entry.status != patch.expected_status {
            return Err(StoreError::StaleStatus {
                id,
                expected: patch.expected_status,
                actual: entry.status.as_str().to_string(),
            });
        }
        patch.apply_to(entry.value_mut());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<GenerationRecord>, StoreError> {
        Ok(self.records.get(&id).map(|entry| entry.value().clone()))
    }

    async fn list_for_subscriber(
        &self,
        subscriber_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<GenerationRecord>, StoreError> {
        let mut records: Vec<GenerationRecord> = self
            .records
            .iter()
            .filter(|entry| entry.subscriber_id == subscriber_id)
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn prune_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let before = self.records.len();
        self.records
            .retain(|_, record| !(record.status.is_terminal() && record.updated_at < cutoff));
        Ok((before - self.records.len()) as u64)
    }
}
