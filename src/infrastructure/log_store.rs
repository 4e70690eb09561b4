//! Exchange record persistence and the pull query path

use crate::domain::{ExchangeRecord, MappingCode};
use crate::infrastructure::StoreError;
use async_trait::async_trait;
use parking_lot::RwLock;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use std::collections::HashMap;

#[async_trait]
pub trait LogStore: Send + Sync {
    async fn append(&self, record: &ExchangeRecord) -> Result<(), StoreError>;

    /// Records for `code`, newest first
    async fn query(
        &self,
        code: &MappingCode,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ExchangeRecord>, StoreError>;
}

/// Process-local store; records are kept per code in arrival order
#[derive(Debug, Default)]
pub struct InMemoryLogStore {
    records: RwLock<HashMap<MappingCode, Vec<ExchangeRecord>>>,
    /// Oldest records are discarded beyond this many per code
    retain_per_code: Option<usize>,
}

impl InMemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retain_per_code: usize) -> Self {
        Self {
            records: RwLock::default(),
            retain_per_code: Some(retain_per_code),
        }
    }

    pub fn count(&self, code: &MappingCode) -> usize {
        self.records.read().get(code).map_or(0, Vec::len)
    }
}

#[async_trait]
impl LogStore for InMemoryLogStore {
    async fn append(&self, record: &ExchangeRecord) -> Result<(), StoreError> {
        let mut records = self.records.write();
        let entries = records.entry(record.mapping_code.clone()).or_default();
        entries.push(record.clone());

        if let Some(retain) = self.retain_per_code {
            if entries.len() > retain {
                let excess = entries.len() - retain;
                entries.drain(..excess);
            }
        }
        Ok(())
    }

    async fn query(
        &self,
        code: &MappingCode,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ExchangeRecord>, StoreError> {
        let records = self.records.read();
        let Some(entries) = records.get(code) else {
            return Ok(Vec::new());
        };

        let mut newest_first: Vec<&ExchangeRecord> = entries.iter().collect();
        newest_first.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| b.id.as_ref().cmp(a.id.as_ref()))
        });

        Ok(newest_first
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }
}

/// Records stored as JSON documents with indexed lookup columns
#[derive(Debug, Clone)]
pub struct PostgresLogStore {
    pool: PgPool,
}

impl PostgresLogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LogStore for PostgresLogStore {
    async fn append(&self, record: &ExchangeRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO exchange_records (id, request_id, mapping_code, status, recorded_at, record) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(*record.id.as_ref())
        .bind(*record.request_id.as_ref())
        .bind(record.mapping_code.as_ref())
        .bind(i32::from(record.status))
        .bind(record.timestamp)
        .bind(Json(record))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn query(
        &self,
        code: &MappingCode,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ExchangeRecord>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let offset = i64::try_from(offset).unwrap_or(i64::MAX);

        let rows = sqlx::query(
            "SELECT record FROM exchange_records \
             WHERE mapping_code = $1 \
             ORDER BY recorded_at DESC, id DESC \
             LIMIT $2 OFFSET $3",
        )
        .bind(code.as_ref())
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let Json(record): Json<ExchangeRecord> = row.try_get("record")?;
                Ok(record)
            })
            .collect()
    }
}
